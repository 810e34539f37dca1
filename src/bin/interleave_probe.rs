//! Interleave probe
//!
//! Writes a fixed pattern to stdout and stderr without explicit flushes,
//! buffering stdout the way C stdio does: line-buffered on a terminal,
//! block-buffered otherwise. Stderr is unbuffered.
//!
//! On a terminal the result reads `1 2 3 4 5` with the `4` and `5` on one
//! line; through pipes stdout only appears at exit.

use std::io::{self, BufWriter, IsTerminal, Write};

fn main() -> io::Result<()> {
    let stdout = io::stdout();
    // Std's stdout is line-buffered already
    let mut out: Box<dyn Write> = if stdout.is_terminal() {
        Box::new(stdout.lock())
    } else {
        Box::new(BufWriter::new(stdout.lock()))
    };
    let mut err = io::stderr();

    out.write_all(b"1\n")?;
    out.write_all(b"2\n")?;
    out.write_all(b"3\n")?;
    err.write_all(b"4")?;
    out.write_all(b"5\n")?;
    err.write_all(b"\n")?;
    out.flush()
}
