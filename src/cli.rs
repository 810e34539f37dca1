//! Command line arguments

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use crate::allocator::SecondaryMode;
use crate::supervisor::Command;

/// CLI arguments for prun
#[derive(Parser, Debug, Clone)]
#[command(name = "prun")]
#[command(version)]
#[command(
    about = "Run a program with stdout and stderr captured separately, interleaved as on a terminal",
    long_about = None
)]
pub struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// How the child's stderr is bound [default: merged]
    #[arg(long, value_enum, value_name = "MODE")]
    pub secondary: Option<SecondaryMode>,

    /// Upper bound in bytes for a single read
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Window columns when no terminal is inherited
    #[arg(long, value_name = "COLS")]
    pub cols: Option<u16>,

    /// Window rows when no terminal is inherited
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Do not copy terminal attributes from the wrapper's own terminal
    #[arg(long)]
    pub no_inherit_terminal: bool,

    /// Keep output post-processing (newline translation) on the child's terminals
    #[arg(long)]
    pub post_process: bool,

    /// Show stderr output in red
    #[arg(long)]
    pub highlight_secondary: bool,

    /// Do not forward INT, TERM, HUP, QUIT and WINCH to the child
    #[arg(long)]
    pub no_forward_signals: bool,

    /// When the child dies from a signal, die from the same signal
    #[arg(long)]
    pub reraise_signal: bool,

    /// Also write the interleaved output to FILE
    #[arg(long, value_name = "FILE")]
    pub transcript: Option<PathBuf>,

    /// Also write every chunk as a JSON line to FILE
    #[arg(long, value_name = "FILE")]
    pub chunk_log: Option<PathBuf>,

    /// Set an environment variable for the child
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Start the child with an empty environment
    #[arg(long)]
    pub clear_env: bool,

    /// Working directory for the child
    #[arg(short = 'C', long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Program to run, followed by its arguments
    #[arg(
        value_name = "PROGRAM",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

impl Cli {
    /// The child command described by the trailing arguments
    pub fn to_command(&self) -> Command {
        let mut parts = self.command.iter();
        let program = parts.next().cloned().unwrap_or_default();
        let mut command = Command::new(program).args(parts);
        if self.clear_env {
            command = command.env_clear();
        }
        for (key, value) in &self.env {
            command = command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command = command.current_dir(cwd);
        }
        command
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing variable name in '{s}'")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
