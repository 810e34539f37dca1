//! Error types for running a child under prun
//!
//! `Error` is what the wrapper itself failed to do. A child that ran and
//! failed is not an error; it is an [`crate::ExitStatus`].

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Exit code for internal I/O or bookkeeping failures
pub const EXIT_INTERNAL: u8 = 124;
/// Exit code for channel allocation or configuration failures
pub const EXIT_ALLOCATION: u8 = 125;
/// Exit code when the program exists but cannot be executed
pub const EXIT_NOT_EXECUTABLE: u8 = 126;
/// Exit code when the program cannot be found
pub const EXIT_NOT_FOUND: u8 = 127;

/// Why a pseudo-terminal or pipe could not be allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// The host ran out of pseudo-terminals or descriptors
    ResourceExhausted,
    /// Device creation was refused
    PermissionDenied,
    /// Anything else
    Other,
}

impl AllocationKind {
    /// Classify an errno returned while creating a channel device
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EAGAIN | Errno::ENOSPC | Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM => {
                AllocationKind::ResourceExhausted
            },
            Errno::EACCES | Errno::EPERM => AllocationKind::PermissionDenied,
            _ => AllocationKind::Other,
        }
    }
}

impl std::fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AllocationKind::ResourceExhausted => "resource exhausted",
            AllocationKind::PermissionDenied => "permission denied",
            AllocationKind::Other => "failed",
        };
        f.write_str(name)
    }
}

/// Errors raised by the wrapper
#[derive(Error, Debug)]
pub enum Error {
    /// A channel device could not be created; the child was not spawned
    #[error("channel allocation {kind} during {stage}: {source}")]
    Allocation {
        kind: AllocationKind,
        stage: &'static str,
        #[source]
        source: Errno,
    },

    /// The program could not be started
    ///
    /// Covers the fork, the session setup in the child and the exec itself;
    /// [`Error::exit_code`] tells them apart by errno.
    #[error("failed to execute '{}': {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The child disappeared from the process table before it was reaped
    #[error("child process {0} vanished before its status was collected")]
    ChildVanished(Pid),

    /// Waiting for readiness failed
    #[error("failed to poll channels: {0}")]
    Poll(#[source] Errno),

    /// Collecting the child's status failed
    #[error("failed to wait for child: {0}")]
    Wait(#[source] Errno),

    /// Installing or servicing signal forwarding failed
    #[error("signal forwarding failed: {0}")]
    Signal(#[source] Errno),

    /// The sink rejected a chunk
    #[error("failed to deliver output: {0}")]
    Sink(#[source] io::Error),
}

impl Error {
    pub(crate) fn allocation(stage: &'static str, source: Errno) -> Self {
        Error::Allocation {
            kind: AllocationKind::from_errno(source),
            stage,
            source,
        }
    }

    /// Exit code the wrapper reports for this failure
    ///
    /// Always in 124..=127, the range reserved for wrapper failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Allocation { .. } => EXIT_ALLOCATION,
            Error::Spawn { source, .. } => spawn_exit_code(source),
            Error::ChildVanished(_)
            | Error::Poll(_)
            | Error::Wait(_)
            | Error::Signal(_)
            | Error::Sink(_) => EXIT_INTERNAL,
        }
    }
}

/// Only errnos `execve(2)` reports for the program itself are 126 or 127.
/// `setsid` or `TIOCSCTTY` failing in the child (`ENOTTY`, `EINVAL`) and a
/// failed fork (`EAGAIN`, `ENOMEM`) are internal. `EPERM` is shared by exec
/// and `TIOCSCTTY`, and counts as not executable.
fn spawn_exit_code(source: &io::Error) -> u8 {
    let Some(errno) = source.raw_os_error().map(Errno::from_i32) else {
        return match source.kind() {
            io::ErrorKind::NotFound => EXIT_NOT_FOUND,
            _ => EXIT_NOT_EXECUTABLE,
        };
    };
    match errno {
        Errno::ENOENT | Errno::ENOTDIR => EXIT_NOT_FOUND,
        Errno::EACCES
        | Errno::EPERM
        | Errno::ENOEXEC
        | Errno::EISDIR
        | Errno::ETXTBSY
        | Errno::ELOOP
        | Errno::ENAMETOOLONG
        | Errno::E2BIG
        | Errno::ELIBBAD => EXIT_NOT_EXECUTABLE,
        _ => EXIT_INTERNAL,
    }
}

/// Result type for prun operations
pub type Result<T> = std::result::Result<T, Error>;
