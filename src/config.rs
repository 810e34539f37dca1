//! Configuration for prun
//!
//! Precedence: CLI > environment > config file > defaults. The file is JSON,
//! looked up at `--config`, else `$XDG_CONFIG_HOME/prun/config.json`, else
//! `~/.config/prun/config.json`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::allocator::SecondaryMode;
use crate::cli::Cli;
use crate::mux::DEFAULT_CHUNK_SIZE;
use crate::session::RunOptions;
use crate::size::WindowSize;

/// Largest accepted `chunk_size`
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// What the wrapper does when the child was killed by a signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalExit {
    /// Exit with 128 + signal number
    #[default]
    Code,
    /// Kill the wrapper with the same signal
    Reraise,
}

/// Window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Columns when no terminal is inherited
    pub columns: u16,
    /// Rows when no terminal is inherited
    pub rows: u16,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let size = WindowSize::default();
        Self {
            columns: size.cols,
            rows: size.rows,
        }
    }
}

/// prun configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How the child's stderr is bound
    pub secondary: SecondaryMode,
    /// Upper bound for a single read
    pub chunk_size: usize,
    /// Window settings
    pub window: WindowConfig,
    /// Copy the wrapper terminal's attributes onto the child's terminals
    pub inherit_terminal: bool,
    /// Keep output post-processing on the child's terminals
    pub post_process: bool,
    /// Show stderr output in red
    pub highlight_secondary: bool,
    /// Forward INT, TERM, HUP, QUIT and WINCH to the child
    pub forward_signals: bool,
    /// Exit behavior after the child dies from a signal
    pub signal_exit: SignalExit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secondary: SecondaryMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: WindowConfig::default(),
            inherit_terminal: true,
            post_process: false,
            highlight_secondary: false,
            forward_signals: true,
            signal_exit: SignalExit::default(),
        }
    }
}

impl Config {
    /// Load configuration with full precedence
    pub fn load_with_args(args: &Cli) -> Result<Self, ConfigError> {
        Self::load_with(args, |key| env::var(key).ok())
    }

    fn load_with<F>(args: &Cli, var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &args.config {
            // An explicit file has to load
            Some(path) => Self::load_from_file(path)?,
            None => match default_config_path(&var) {
                Some(path) if path.exists() => Self::load_from_file(&path).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
                    Config::default()
                }),
                _ => Config::default(),
            },
        };

        config.apply_env(var);
        config.apply_cli_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `PRUN_*` environment variables
    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("PRUN_SECONDARY") {
            match val.parse() {
                Ok(mode) => self.secondary = mode,
                Err(e) => tracing::warn!(error = %e, "ignoring PRUN_SECONDARY"),
            }
        }
        if let Some(val) = var("PRUN_CHUNK_SIZE") {
            match val.parse() {
                Ok(size) => self.chunk_size = size,
                Err(e) => tracing::warn!(value = %val, error = %e, "ignoring PRUN_CHUNK_SIZE"),
            }
        }
        if let Some(val) = var("PRUN_HIGHLIGHT_SECONDARY") {
            self.highlight_secondary = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    /// Apply CLI arguments
    fn apply_cli_args(&mut self, args: &Cli) {
        if let Some(mode) = args.secondary {
            self.secondary = mode;
        }
        if let Some(size) = args.chunk_size {
            self.chunk_size = size;
        }
        if let Some(cols) = args.cols {
            self.window.columns = cols;
        }
        if let Some(rows) = args.rows {
            self.window.rows = rows;
        }
        if args.no_inherit_terminal {
            self.inherit_terminal = false;
        }
        if args.post_process {
            self.post_process = true;
        }
        if args.highlight_secondary {
            self.highlight_secondary = true;
        }
        if args.no_forward_signals {
            self.forward_signals = false;
        }
        if args.reraise_signal {
            self.signal_exit = SignalExit::Reraise;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                message: format!("must be between 1 and {MAX_CHUNK_SIZE}, got {}", self.chunk_size),
            });
        }
        if self.window.columns == 0 {
            return Err(ConfigError::Invalid {
                field: "window.columns",
                message: "must be at least 1".to_string(),
            });
        }
        if self.window.rows == 0 {
            return Err(ConfigError::Invalid {
                field: "window.rows",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Options for a [`crate::Session`]
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            secondary: self.secondary,
            chunk_size: self.chunk_size,
            window: WindowSize::new(self.window.columns, self.window.rows),
            inherit_terminal: self.inherit_terminal,
            post_process: self.post_process,
            forward_signals: self.forward_signals,
        }
    }
}

/// Default config file location
fn default_config_path<F>(var: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let base = var("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| var("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("prun").join("config.json"))
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}
