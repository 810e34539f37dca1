//! prun: run a program with its stdout and stderr captured separately
//!
//! The child's output channels are bound to pseudo-terminals, so its I/O
//! library buffers them exactly as it would on a real terminal. A single
//! readiness loop drains both and hands sequence-numbered chunks to a sink,
//! which sees them in the order a terminal observer would.
//!
//! - `allocator`: pseudo-terminal and pipe endpoints for the child
//! - `supervisor`: spawning, signalling and reaping the child
//! - `signals`: self-pipe signal forwarding
//! - `mux`: the ordering multiplexer
//! - `sink`: chunk destinations
//! - `session`: one complete run
//! - `config`, `cli`: configuration layers for the `prun` binary

pub mod allocator;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod mux;
pub mod pty;
pub mod session;
pub mod signals;
pub mod sink;
pub mod size;
pub mod supervisor;

pub use allocator::{Allocator, SecondaryMode};
pub use channel::{Channel, Chunk};
pub use error::{Error, Result};
pub use mux::{DrainError, DrainReport, Multiplexer};
pub use session::{Outcome, RunOptions, Session};
pub use sink::Sink;
pub use size::WindowSize;
pub use supervisor::{ChildProcess, Command, ExitStatus};
