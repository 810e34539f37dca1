//! prun
//!
//! Runs a program with stdout and stderr captured separately, interleaved
//! exactly as a terminal would show them.

use std::fs::File;
use std::io::{self, BufWriter};
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prun::cli::Cli;
use prun::config::{Config, SignalExit};
use prun::error::EXIT_ALLOCATION;
use prun::signals;
use prun::sink::{Highlight, Interleaved, JsonLines, Sink, Split, Tee};
use prun::Session;

fn main() -> ExitCode {
    // Diagnostics go to stderr only; stdout belongs to the child
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("PRUN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        },
        Err(e) => {
            eprint!("prun: {e}");
            return ExitCode::from(EXIT_ALLOCATION);
        },
    };

    let config = match Config::load_with_args(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("prun: {e}");
            return ExitCode::from(EXIT_ALLOCATION);
        },
    };

    let mut sink = match build_sink(&cli, &config) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("prun: {e}");
            return ExitCode::from(EXIT_ALLOCATION);
        },
    };

    let command = cli.to_command();
    tracing::debug!(program = %command.program().display(), ?config, "starting");

    match Session::new(config.run_options()).run(&command, &mut sink) {
        Ok(outcome) => {
            drop(sink);
            tracing::debug!(status = %outcome.status, chunks = outcome.report.chunks, "child finished");
            if let (SignalExit::Reraise, Some(sig)) = (config.signal_exit, outcome.status.signal()) {
                signals::reraise(sig);
            }
            ExitCode::from(outcome.exit_code())
        },
        Err(e) => {
            tracing::debug!(error = ?e, "run failed");
            eprintln!("prun: {e}");
            ExitCode::from(e.exit_code())
        },
    }
}

/// Stdout/stderr split, optionally highlighted, plus any requested copies
fn build_sink(cli: &Cli, config: &Config) -> io::Result<Box<dyn Sink>> {
    let mut sink: Box<dyn Sink> = if config.highlight_secondary {
        Box::new(Highlight::new(Split::stdio()))
    } else {
        Box::new(Split::stdio())
    };

    if let Some(path) = &cli.transcript {
        let file = File::create(path).map_err(|e| annotate(e, "transcript", path))?;
        sink = Box::new(Tee::new(sink, Interleaved::new(file)));
    }
    if let Some(path) = &cli.chunk_log {
        let file = File::create(path).map_err(|e| annotate(e, "chunk log", path))?;
        sink = Box::new(Tee::new(sink, JsonLines::new(BufWriter::new(file))));
    }
    Ok(sink)
}

fn annotate(e: io::Error, what: &str, path: &std::path::Path) -> io::Error {
    io::Error::new(e.kind(), format!("cannot create {what} '{}': {e}", path.display()))
}
