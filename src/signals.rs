//! Signal forwarding
//!
//! Signals delivered to the wrapper are written into a self-pipe by an
//! async-signal-safe handler. The read end is polled by the drain loop next
//! to the channels, so forwarding happens on the loop's own thread.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use crate::error::{Error, Result};
use crate::pty::set_nonblocking;

/// Signals that terminate or interrupt the wrapper and must reach the child
pub const FORWARDED: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Write end of the active self-pipe, -1 when no forwarder is installed
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe; errno is restored below
        unsafe {
            let saved = *errno_location();
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            *errno_location() = saved;
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(not(target_os = "linux"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Installed handlers for a set of signals, restored on drop
///
/// Only one forwarder can be installed per process at a time.
pub struct SignalForwarder {
    read: OwnedFd,
    write: OwnedFd,
    previous: Vec<(Signal, SigAction)>,
}

impl SignalForwarder {
    /// Install handlers for `FORWARDED` plus `SIGWINCH`
    pub fn install() -> Result<Self> {
        let mut signals = FORWARDED.to_vec();
        signals.push(Signal::SIGWINCH);
        Self::install_for(&signals)
    }

    pub fn install_for(signals: &[Signal]) -> Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(Error::Signal)?;
        // SAFETY: pipe2 returned two fresh descriptors owned by nobody else
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
        set_nonblocking(read.as_raw_fd(), true).map_err(Error::Signal)?;
        set_nonblocking(write.as_raw_fd(), true).map_err(Error::Signal)?;

        if PIPE_WRITE_FD
            .compare_exchange(-1, write.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Signal(Errno::EBUSY));
        }

        let mut forwarder = Self {
            read,
            write,
            previous: Vec::with_capacity(signals.len()),
        };
        // No SA_RESTART: a blocking wait must return EINTR so it can forward
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for &sig in signals {
            // SAFETY: the handler only touches an atomic and calls write(2)
            let previous = unsafe { sigaction(sig, &action) }.map_err(Error::Signal)?;
            forwarder.previous.push((sig, previous));
        }
        tracing::debug!(?signals, "installed signal forwarding");
        Ok(forwarder)
    }

    /// Drain the self-pipe and return the signals received since last call
    pub fn pending(&self) -> Vec<Signal> {
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend(
                    buf[..n]
                        .iter()
                        .filter_map(|&signo| Signal::try_from(signo as i32).ok()),
                ),
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        received
    }
}

impl AsFd for SignalForwarder {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for (sig, previous) in self.previous.drain(..).rev() {
            // SAFETY: restoring the disposition that was in place before
            let _ = unsafe { sigaction(sig, &previous) };
        }
        let _ = PIPE_WRITE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl std::fmt::Debug for SignalForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalForwarder")
            .field("read", &self.read.as_raw_fd())
            .field("signals", &self.previous.iter().map(|(s, _)| *s).collect::<Vec<_>>())
            .finish()
    }
}

/// Terminate the current process with `sig`, as if it had been delivered
///
/// Used to mirror a child's signal death to our own parent.
pub fn reraise(sig: Signal) -> ! {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: installing the default disposition is always sound
    let _ = unsafe { sigaction(sig, &default) };
    let mut mask = SigSet::empty();
    mask.add(sig);
    let _ = mask.thread_unblock();
    let _ = nix::sys::signal::raise(sig);
    // Signals whose default action is not to terminate end up here
    std::process::exit(128 + sig as i32)
}
