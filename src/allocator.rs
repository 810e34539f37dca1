//! Channel allocation
//!
//! Creates the endpoints a child inherits in place of stdout and stderr.
//! The primary channel is always a pseudo-terminal so the child's I/O
//! library line-buffers it exactly as it would on a real terminal.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pty::{configure_slave, set_nonblocking, Pty, TerminalTemplate};

/// How the child's stderr is bound
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryMode {
    /// A second pseudo-terminal; both channels look like terminals
    ///
    /// Keeps channel identity, but two devices carry no ordering between
    /// them: output that is pending on both at once is read channel by
    /// channel.
    Pty,
    /// A plain pipe; stderr is unbuffered whatever device it is on
    Pipe,
    /// The primary pseudo-terminal; one kernel stream, no channel identity
    ///
    /// The only mode whose output order matches a direct terminal run for
    /// every interleaving.
    #[default]
    Merged,
}

impl std::str::FromStr for SecondaryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pty" => Ok(SecondaryMode::Pty),
            "pipe" => Ok(SecondaryMode::Pipe),
            "merged" => Ok(SecondaryMode::Merged),
            other => Err(format!("unknown secondary mode '{other}' (expected pty, pipe or merged)")),
        }
    }
}

/// The parent side of a channel
#[derive(Debug)]
pub enum Endpoint {
    /// Master side of a pseudo-terminal
    Pty(Pty),
    /// Read end of a pipe
    Pipe(OwnedFd),
}

impl Endpoint {
    /// One non-blocking read
    pub fn read(&self, buf: &mut [u8]) -> nix::Result<usize> {
        match self {
            Endpoint::Pty(pty) => pty.read(buf),
            Endpoint::Pipe(fd) => unistd::read(fd.as_raw_fd(), buf),
        }
    }

    pub fn as_pty(&self) -> Option<&Pty> {
        match self {
            Endpoint::Pty(pty) => Some(pty),
            Endpoint::Pipe(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Endpoint::Pty(_))
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Endpoint::Pty(pty) => pty.as_fd(),
            Endpoint::Pipe(fd) => fd.as_fd(),
        }
    }
}

/// Child-side descriptors, consumed by the spawn
#[derive(Debug)]
pub struct ChildStdio {
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Everything allocated for one child
#[derive(Debug)]
pub struct Channels {
    /// Parent side of the child's stdout
    pub primary: Endpoint,
    /// Parent side of the child's stderr; `None` when merged into primary
    pub secondary: Option<Endpoint>,
    /// Descriptors to install as the child's stdout and stderr
    pub child: ChildStdio,
}

/// Builds [`Channels`] for a child that has not been spawned yet
#[derive(Debug, Clone)]
pub struct Allocator {
    secondary: SecondaryMode,
    template: TerminalTemplate,
    post_process: bool,
}

impl Allocator {
    pub fn new(secondary: SecondaryMode, template: TerminalTemplate) -> Self {
        Self {
            secondary,
            template,
            post_process: false,
        }
    }

    /// Keep the slave's output post-processing (e.g. `\n` to `\r\n`)
    pub fn post_process(mut self, post_process: bool) -> Self {
        self.post_process = post_process;
        self
    }

    pub fn secondary_mode(&self) -> SecondaryMode {
        self.secondary
    }

    /// Allocate both channels
    ///
    /// On error nothing is leaked and the child must not be spawned.
    pub fn allocate(&self) -> Result<Channels> {
        let (primary, stdout) = self.allocate_pty()?;

        let (secondary, stderr) = match self.secondary {
            SecondaryMode::Pty => {
                let (pty, slave) = self.allocate_pty()?;
                (Some(Endpoint::Pty(pty)), slave)
            },
            SecondaryMode::Pipe => {
                let (read, write) = allocate_pipe()?;
                (Some(Endpoint::Pipe(read)), write)
            },
            SecondaryMode::Merged => (None, dup_cloexec(&stdout)?),
        };

        tracing::debug!(mode = ?self.secondary, "allocated channels");
        Ok(Channels {
            primary: Endpoint::Pty(primary),
            secondary,
            child: ChildStdio { stdout, stderr },
        })
    }

    fn allocate_pty(&self) -> Result<(Pty, OwnedFd)> {
        let pty = Pty::open()?;
        pty.set_window_size(self.template.size)?;
        let slave = pty.open_slave()?;
        configure_slave(slave.as_fd(), &self.template, self.post_process)?;
        pty.set_nonblocking(true)?;
        Ok((pty, slave))
    }
}

/// A close-on-exec pipe with a non-blocking read end
fn allocate_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) =
        unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::allocation("create pipe", e))?;
    // SAFETY: pipe2 returned two fresh descriptors owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
    set_nonblocking(read.as_raw_fd(), true).map_err(|e| Error::allocation("set non-blocking", e))?;
    Ok((read, write))
}

fn dup_cloexec(fd: &OwnedFd) -> Result<OwnedFd> {
    let dup = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))
        .map_err(|e| Error::allocation("duplicate slave", e))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
