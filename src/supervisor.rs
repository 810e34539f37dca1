//! Child process management
//!
//! Spawns the target program with its stdout and stderr bound to allocated
//! channels, forwards signals to it and reaps it exactly once.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};

use nix::errno::Errno;
use nix::libc::{self, c_int};
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::unistd::{setsid, Pid};

use crate::allocator::ChildStdio;
use crate::error::{Error, Result};

/// Signals whose caught dispositions are reset in the child
const RESET_SIGNALS: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGWINCH,
];

/// What to run
#[derive(Debug, Clone)]
pub struct Command {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    env_clear: bool,
    cwd: Option<PathBuf>,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: PathBuf::from(program.as_ref()),
            args: Vec::new(),
            env: Vec::new(),
            env_clear: false,
            cwd: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set or override one environment variable
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Start from an empty environment instead of inheriting ours
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    fn to_std(&self) -> process::Command {
        let mut cmd = process::Command::new(&self.program);
        cmd.args(&self.args);
        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// How the child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a code
    Exited(i32),
    /// Killed by a signal
    ///
    /// The raw number, since realtime signals have no [`Signal`] variant.
    Signaled { signal: c_int, core_dumped: bool },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled { .. } => None,
        }
    }

    /// Number of the signal that killed the child
    pub fn signal_number(&self) -> Option<c_int> {
        match self {
            ExitStatus::Signaled { signal, .. } => Some(*signal),
            ExitStatus::Exited(_) => None,
        }
    }

    /// The killing signal, if it is one of the standard signals
    pub fn signal(&self) -> Option<Signal> {
        self.signal_number().and_then(|n| Signal::try_from(n).ok())
    }

    /// Exit code the wrapper mirrors: the code itself, or 128 + signal
    pub fn wrapper_code(&self) -> u8 {
        match self {
            ExitStatus::Exited(code) => (*code & 0xff) as u8,
            ExitStatus::Signaled { signal, .. } => 128u8.wrapping_add(*signal as u8),
        }
    }

    /// Decode a `waitpid(2)` status word; `None` for stop and continue reports
    fn from_raw(status: c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ExitStatus::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(ExitStatus::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            })
        } else {
            None
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (signal, core_dumped) = match self {
            ExitStatus::Exited(code) => return write!(f, "exit code {code}"),
            ExitStatus::Signaled { signal, core_dumped } => (*signal, *core_dumped),
        };
        match Signal::try_from(signal) {
            Ok(name) => write!(f, "signal {name}")?,
            Err(_) => write!(f, "signal {signal}")?,
        }
        if core_dumped {
            f.write_str(" (core dumped)")?;
        }
        Ok(())
    }
}

/// A spawned child attached to allocated channels
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Spawn `command` with stdout and stderr replaced by `stdio`
    ///
    /// Stdin is inherited. The child leads a new session whose controlling
    /// terminal is its stdout. Exec failures are reported here, never as a
    /// child exit code.
    pub fn spawn(command: &Command, stdio: ChildStdio) -> Result<Self> {
        let mut cmd = command.to_std();
        let ChildStdio { stdout, stderr } = stdio;
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        // SAFETY: the hook only calls async-signal-safe functions
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                // The stdio descriptors are already in place when hooks run
                if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                for sig in RESET_SIGNALS {
                    let _ = signal::signal(sig, SigHandler::SigDfl);
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: command.program.clone(),
            source,
        })?;
        // Dropping the builder closes our copies of the slave descriptors
        drop(cmd);

        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(%pid, program = %command.program.display(), "spawned child");
        Ok(Self { pid, status: None })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Status, once reaped
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Send a signal to the child
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Signal(e)),
        }
    }

    /// Reap the child if it has exited (non-blocking)
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match wait_raw(self.pid, libc::WNOHANG) {
            Ok(None) => Ok(None),
            Ok(Some(status)) => Ok(self.record(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(Errno::ECHILD) => Err(Error::ChildVanished(self.pid)),
            Err(e) => Err(Error::Wait(e)),
        }
    }

    /// Wait for the child to exit (blocking)
    pub fn wait(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.status {
                return Ok(status);
            }
            match wait_raw(self.pid, 0) {
                Ok(Some(status)) => {
                    self.record(status);
                },
                Ok(None) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Err(Error::ChildVanished(self.pid)),
                Err(e) => return Err(Error::Wait(e)),
            }
        }
    }

    fn record(&mut self, status: c_int) -> Option<ExitStatus> {
        let status = ExitStatus::from_raw(status)?;
        tracing::debug!(pid = %self.pid, %status, "reaped child");
        self.status = Some(status);
        Some(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            // Abandoned before being reaped; hang up like a closing terminal
            let _ = kill(self.pid, Signal::SIGHUP);
            let _ = wait_raw(self.pid, libc::WNOHANG);
        }
    }
}

/// One `waitpid(2)` call, returning the undecoded status word
///
/// `Ok(None)` when `WNOHANG` found the child still running.
fn wait_raw(pid: Pid, flags: c_int) -> nix::Result<Option<c_int>> {
    let mut status: c_int = 0;
    // SAFETY: waitpid writes one int through the pointer
    let reaped = Errno::result(unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) })?;
    Ok((reaped != 0).then_some(status))
}
