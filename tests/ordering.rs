//! Ordering fidelity
//!
//! A wrapped run must show the same byte sequence a terminal shows when the
//! program is attached to it directly. The expected interleaving is never
//! hard-coded: each test produces it by running the probe on a fresh
//! pseudo-terminal.

use std::os::fd::AsFd;
use std::process::{Command as StdCommand, Stdio};

use nix::errno::Errno;

use prun::pty::{configure_slave, Pty, TerminalTemplate};
use prun::sink::Capture;
use prun::{Channel, Command, RunOptions, SecondaryMode, Session, WindowSize};

const PROBE: &str = env!("CARGO_BIN_EXE_interleave-probe");
const PRUN: &str = env!("CARGO_BIN_EXE_prun");

/// Run `cmd` with stdout and stderr on one pseudo-terminal and collect
/// everything the terminal receives
fn run_on_terminal(mut cmd: StdCommand, post_process: bool) -> Vec<u8> {
    let pty = Pty::open().unwrap();
    pty.set_window_size(WindowSize::new(80, 24)).unwrap();
    let slave = pty.open_slave().unwrap();
    configure_slave(
        slave.as_fd(),
        &TerminalTemplate::detached(WindowSize::new(80, 24)),
        post_process,
    )
    .unwrap();
    let slave_err = slave.try_clone().unwrap();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(slave))
        .stderr(Stdio::from(slave_err));
    let mut child = cmd.spawn().unwrap();
    drop(cmd);

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match pty.read(&mut buf) {
            Ok(0) | Err(Errno::EIO) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(Errno::EINTR) => continue,
            Err(e) => panic!("terminal read failed: {e}"),
        }
    }
    child.wait().unwrap();
    received
}

fn direct_probe(post_process: bool) -> Vec<u8> {
    run_on_terminal(StdCommand::new(PROBE), post_process)
}

fn options(secondary: SecondaryMode) -> RunOptions {
    RunOptions {
        secondary,
        inherit_terminal: false,
        forward_signals: false,
        ..RunOptions::default()
    }
}

#[test]
fn merged_session_matches_direct_terminal_run() {
    let direct = direct_probe(false);

    let mut sink = Capture::new();
    let outcome = Session::new(options(SecondaryMode::Merged))
        .run(&Command::new(PROBE), &mut sink)
        .unwrap();

    assert!(outcome.status.success());
    assert_eq!(sink.interleaved(), direct);
}

#[test]
fn wrapper_on_a_terminal_matches_direct_run() {
    let direct = direct_probe(true);

    let mut wrapped = StdCommand::new(PRUN);
    wrapped.args(["--secondary", "merged", "--", PROBE]);
    let wrapped = run_on_terminal(wrapped, true);

    assert_eq!(String::from_utf8_lossy(&wrapped), String::from_utf8_lossy(&direct));
}

#[test]
fn pipes_lose_the_terminal_interleaving() {
    let direct = direct_probe(false);

    let piped = StdCommand::new("/bin/sh")
        .args(["-c", &format!("'{PROBE}' 2>&1")])
        .output()
        .unwrap();

    // Same bytes, different order
    let mut direct_sorted = direct.clone();
    let mut piped_sorted = piped.stdout.clone();
    direct_sorted.sort_unstable();
    piped_sorted.sort_unstable();
    assert_eq!(direct_sorted, piped_sorted);
    assert_ne!(piped.stdout, direct);
}

#[test]
fn split_session_keeps_terminal_buffering_per_channel() {
    let direct = direct_probe(false);

    for secondary in [SecondaryMode::Pty, SecondaryMode::Pipe] {
        let mut sink = Capture::new();
        Session::new(options(secondary))
            .run(&Command::new(PROBE), &mut sink)
            .unwrap();

        let primary = sink.channel(Channel::Primary);
        let secondary_bytes = sink.channel(Channel::Secondary);
        assert_eq!(primary, b"1\n2\n3\n5\n", "{secondary:?}");
        assert_eq!(secondary_bytes, b"4\n", "{secondary:?}");

        // Nothing lost or invented relative to the terminal run
        let mut all = sink.interleaved();
        let mut expected = direct.clone();
        all.sort_unstable();
        expected.sort_unstable();
        assert_eq!(all, expected, "{secondary:?}");
    }
}

#[test]
fn sequence_numbers_cover_every_chunk() {
    let mut sink = Capture::new();
    let outcome = Session::new(options(SecondaryMode::Pty))
        .run(&Command::new(PROBE), &mut sink)
        .unwrap();

    let seqs: Vec<u64> = sink.chunks().iter().map(|c| c.seq()).collect();
    assert_eq!(seqs, (0..outcome.report.chunks).collect::<Vec<_>>());
    assert_eq!(
        outcome.report.total_bytes(),
        sink.interleaved().len() as u64
    );
}
