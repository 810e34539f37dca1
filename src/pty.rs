//! PTY (pseudoterminal) management
//!
//! Handles creation of the master/slave pair a child writes into, and the
//! terminal attributes copied onto the slave so the child's I/O library
//! picks the same buffering policy it would pick on a real terminal.

use std::ffi::CString;
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::termios::{self, OutputFlags, SetArg, Termios};
use nix::unistd;

use crate::error::{Error, Result};
use crate::size::WindowSize;

/// A pseudoterminal master
pub struct Pty {
    /// The PTY master file descriptor
    master: PtyMaster,
    /// Path to the slave PTY
    slave_path: String,
}

impl Pty {
    /// Open a new master/slave pair
    ///
    /// The master is close-on-exec so no spawned child ever holds it.
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(|e| Error::allocation("open master", e))?;
        grantpt(&master).map_err(|e| Error::allocation("grant slave", e))?;
        unlockpt(&master).map_err(|e| Error::allocation("unlock slave", e))?;
        let slave_path = slave_name(&master)?;
        tracing::debug!(slave = %slave_path, "allocated pseudo-terminal");
        Ok(Self { master, slave_path })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Open the slave side
    ///
    /// The returned descriptor is close-on-exec; it only survives into the
    /// child through an explicit dup onto a standard descriptor.
    pub fn open_slave(&self) -> Result<OwnedFd> {
        let path =
            CString::new(self.slave_path.as_str()).map_err(|_| Error::allocation("open slave", Errno::EINVAL))?;
        // SAFETY: path is a valid NUL-terminated string
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::allocation("open slave", Errno::last()));
        }
        // SAFETY: fd was just returned by open and is owned by nobody else
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        set_nonblocking(self.master.as_raw_fd(), nonblocking)
            .map_err(|e| Error::allocation("set non-blocking", e))
    }

    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        size.apply(self.master.as_raw_fd())
            .map_err(|e| Error::allocation("set window size", e))
    }

    pub fn get_window_size(&self) -> Option<WindowSize> {
        WindowSize::query(self.master.as_raw_fd())
    }

    /// Read from the master side
    ///
    /// Returns the raw errno so the caller can tell a hangup (`EIO`) from
    /// a spurious wakeup (`EAGAIN`).
    pub fn read(&self, buf: &mut [u8]) -> nix::Result<usize> {
        unistd::read(self.master.as_raw_fd(), buf)
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the master descriptor lives as long as self
        unsafe { BorrowedFd::borrow_raw(self.master.as_raw_fd()) }
    }
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("fd", &self.master.as_raw_fd())
            .field("slave_path", &self.slave_path)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> Result<String> {
    nix::pty::ptsname_r(master).map_err(|e| Error::allocation("resolve slave name", e))
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out immediately
    unsafe { nix::pty::ptsname(master) }.map_err(|e| Error::allocation("resolve slave name", e))
}

/// Terminal attributes applied to every slave before the child starts
#[derive(Clone)]
pub struct TerminalTemplate {
    /// Line discipline settings; `None` keeps the slave's defaults
    pub termios: Option<Termios>,
    /// Initial window size
    pub size: WindowSize,
}

impl TerminalTemplate {
    /// A template that keeps the slave's default line discipline
    pub fn detached(size: WindowSize) -> Self {
        Self { termios: None, size }
    }

    /// Copy the attributes of the terminal this process is attached to
    ///
    /// Looks at stdin, stdout and stderr in turn and uses the first one that
    /// is a terminal. Falls back to `fallback` when none is.
    pub fn inherit(fallback: WindowSize) -> Self {
        let candidates = [
            (libc::STDIN_FILENO, io::stdin().is_terminal()),
            (libc::STDOUT_FILENO, io::stdout().is_terminal()),
            (libc::STDERR_FILENO, io::stderr().is_terminal()),
        ];
        for (fd, is_terminal) in candidates {
            if !is_terminal {
                continue;
            }
            // SAFETY: the standard descriptors stay open for the whole process
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let termios = match termios::tcgetattr(borrowed) {
                Ok(termios) => termios,
                Err(e) => {
                    tracing::debug!(fd, error = %e, "tcgetattr failed, trying next descriptor");
                    continue;
                },
            };
            let size = WindowSize::query(fd)
                .filter(WindowSize::is_set)
                .unwrap_or(fallback);
            tracing::debug!(fd, cols = size.cols, rows = size.rows, "inherited terminal attributes");
            return Self {
                termios: Some(termios),
                size,
            };
        }
        Self::detached(fallback)
    }
}

impl std::fmt::Debug for TerminalTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalTemplate")
            .field("inherited", &self.termios.is_some())
            .field("size", &self.size)
            .finish()
    }
}

/// Apply a template to a freshly opened slave
///
/// With `post_process` off, `OPOST` is cleared so bytes reach the master
/// exactly as the child wrote them.
pub fn configure_slave(slave: BorrowedFd<'_>, template: &TerminalTemplate, post_process: bool) -> Result<()> {
    let mut attrs = match &template.termios {
        Some(termios) => termios.clone(),
        None => termios::tcgetattr(slave).map_err(|e| Error::allocation("read slave attributes", e))?,
    };
    if !post_process {
        attrs.output_flags.remove(OutputFlags::OPOST);
    }
    termios::tcsetattr(slave, SetArg::TCSANOW, &attrs)
        .map_err(|e| Error::allocation("configure slave", e))
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let new_flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(new_flags))?;
    Ok(())
}
