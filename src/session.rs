//! One complete run of a child under the wrapper
//!
//! allocate → spawn → drain → reap. Draining and reaping are awaited
//! independently; the outcome is only final once both are done.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;

use crate::allocator::{Allocator, SecondaryMode};
use crate::error::{Error, Result};
use crate::mux::{DrainReport, Multiplexer, Wakeup, DEFAULT_CHUNK_SIZE};
use crate::pty::{Pty, TerminalTemplate};
use crate::signals::SignalForwarder;
use crate::sink::Sink;
use crate::size::WindowSize;
use crate::supervisor::{ChildProcess, Command, ExitStatus};

/// How long the signal pipe is polled between reap attempts
const REAP_INTERVAL_MS: i32 = 50;
/// How long an abandoned child gets to exit after SIGHUP before SIGKILL
const ABANDON_GRACE: Duration = Duration::from_millis(500);

/// Knobs for a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// How the child's stderr is bound
    pub secondary: SecondaryMode,
    /// Upper bound for one read
    pub chunk_size: usize,
    /// Window size when no terminal is inherited
    pub window: WindowSize,
    /// Copy termios and window size from the wrapper's own terminal
    pub inherit_terminal: bool,
    /// Keep output post-processing on the slaves
    pub post_process: bool,
    /// Install handlers that forward signals to the child
    pub forward_signals: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            secondary: SecondaryMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: WindowSize::default(),
            inherit_terminal: true,
            post_process: false,
            forward_signals: true,
        }
    }
}

impl RunOptions {
    fn template(&self) -> TerminalTemplate {
        if self.inherit_terminal {
            TerminalTemplate::inherit(self.window)
        } else {
            TerminalTemplate::detached(self.window)
        }
    }
}

/// Result of a run in which the child was spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ExitStatus,
    pub report: DrainReport,
}

impl Outcome {
    /// The code the wrapper exits with
    pub fn exit_code(&self) -> u8 {
        self.status.wrapper_code()
    }
}

/// Runs commands with the configured options
#[derive(Debug, Clone, Default)]
pub struct Session {
    options: RunOptions,
}

impl Session {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `command` to completion, delivering its output to `sink`
    ///
    /// `Ok` means the child ran, whatever its exit status. Any `Err` after the
    /// spawn leaves the child hung up and reaped.
    pub fn run<S: Sink + ?Sized>(&self, command: &Command, sink: &mut S) -> Result<Outcome> {
        let channels = Allocator::new(self.options.secondary, self.options.template())
            .post_process(self.options.post_process)
            .allocate()?;
        let (mut mux, stdio) = Multiplexer::from_channels(channels, self.options.chunk_size);

        // Installed before the spawn so nothing sent in between is lost
        let forwarder = if self.options.forward_signals {
            Some(SignalForwarder::install()?)
        } else {
            None
        };

        let mut child = ChildProcess::spawn(command, stdio)?;

        let drained = match &forwarder {
            Some(forwarder) => {
                let mut wakeup = Forwarding {
                    forwarder,
                    child: &child,
                };
                mux.drain_with(sink, Some(&mut wakeup))
            },
            None => mux.drain(sink),
        };
        let report = match drained {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!(error = %e, "drain failed, abandoning child");
                drop(mux);
                abandon(&mut child);
                return Err(e);
            },
        };

        let status = match &forwarder {
            Some(forwarder) => reap_forwarding(&mut child, forwarder, &mux.terminals())?,
            None => child.wait()?,
        };
        drop(forwarder);

        sink.finish().map_err(Error::Sink)?;

        for error in report.drain_errors() {
            tracing::warn!(%error, "output may be incomplete");
        }
        Ok(Outcome { status, report })
    }
}

/// Services the signal pipe from inside the drain loop
struct Forwarding<'a> {
    forwarder: &'a SignalForwarder,
    child: &'a ChildProcess,
}

impl Wakeup for Forwarding<'_> {
    fn fd(&self) -> BorrowedFd<'_> {
        self.forwarder.as_fd()
    }

    fn wake(&mut self, terminals: &[&Pty]) -> Result<()> {
        for sig in self.forwarder.pending() {
            forward(sig, self.child, terminals)?;
        }
        Ok(())
    }
}

fn forward(sig: Signal, child: &ChildProcess, terminals: &[&Pty]) -> Result<()> {
    if sig == Signal::SIGWINCH {
        if let Some(size) = WindowSize::controlling() {
            for pty in terminals {
                if let Err(e) = pty.set_window_size(size) {
                    tracing::debug!(error = %e, "failed to resize pseudo-terminal");
                }
            }
        }
    }
    tracing::debug!(signal = %sig, pid = %child.pid(), "forwarding signal");
    child.signal(sig)
}

/// Wait for the child while still forwarding signals to it
fn reap_forwarding(
    child: &mut ChildProcess,
    forwarder: &SignalForwarder,
    terminals: &[&Pty],
) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        let mut fds = [PollFd::new(forwarder, PollFlags::POLLIN)];
        match poll(&mut fds, REAP_INTERVAL_MS) {
            Ok(_) | Err(Errno::EINTR) => {},
            Err(e) => return Err(Error::Poll(e)),
        }
        for sig in forwarder.pending() {
            forward(sig, child, terminals)?;
        }
    }
}

/// Hang up a child we no longer drain and reap it
fn abandon(child: &mut ChildProcess) {
    let _ = child.signal(Signal::SIGHUP);
    let deadline = Instant::now() + ABANDON_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    tracing::warn!(pid = %child.pid(), "child ignored SIGHUP, killing it");
    let _ = child.signal(Signal::SIGKILL);
    let _ = child.wait();
}
