//! Sinks receive the ordered chunk sequence
//!
//! A sink may render everything as one interleaved stream, or demultiplex by
//! channel; either way it must act on chunks in the order it receives them
//! and never reorder across channels.

use std::io::{self, Write};

use serde::Serialize;

use crate::channel::{Channel, Chunk};

/// SGR sequence opening a highlighted secondary chunk
pub const HIGHLIGHT_START: &[u8] = b"\x1b[31m";
/// SGR sequence closing a highlighted secondary chunk
pub const HIGHLIGHT_END: &[u8] = b"\x1b[0m";

/// Destination for multiplexed output
pub trait Sink {
    /// Deliver one chunk; chunks arrive in strictly increasing `seq` order
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()>;

    /// Called once after the last chunk
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        (**self).write_chunk(chunk)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        (**self).write_chunk(chunk)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Renders every chunk into one byte stream
#[derive(Debug)]
pub struct Interleaved<W: Write> {
    writer: W,
}

impl<W: Write> Interleaved<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for Interleaved<W> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.writer.write_all(chunk.data())?;
        self.writer.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Routes each channel to its own writer
///
/// Every chunk is flushed before the next is written, so an observer that
/// merges both writers sees the original cross-channel order.
#[derive(Debug)]
pub struct Split<P: Write, S: Write> {
    primary: P,
    secondary: S,
}

impl<P: Write, S: Write> Split<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    pub fn into_inner(self) -> (P, S) {
        (self.primary, self.secondary)
    }
}

impl Split<io::Stdout, io::Stderr> {
    /// The wrapper's own stdout and stderr
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<P: Write, S: Write> Sink for Split<P, S> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        match chunk.channel() {
            Channel::Primary => {
                self.primary.write_all(chunk.data())?;
                self.primary.flush()
            },
            Channel::Secondary => {
                self.secondary.write_all(chunk.data())?;
                self.secondary.flush()
            },
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

/// Keeps every chunk in memory
#[derive(Debug, Default, Clone)]
pub struct Capture {
    chunks: Vec<Chunk>,
    finished: bool,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// All bytes in arrival order, as an observer of one stream would see them
    pub fn interleaved(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|c| c.data().iter().copied())
            .collect()
    }

    /// The bytes of one channel, in arrival order
    pub fn channel(&self, channel: Channel) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|c| c.channel() == channel)
            .flat_map(|c| c.data().iter().copied())
            .collect()
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }
}

impl Sink for Capture {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        if let Some(last) = self.chunks.last() {
            if chunk.seq() <= last.seq() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("chunk {} delivered after chunk {}", chunk.seq(), last.seq()),
                ));
            }
        }
        self.chunks.push(chunk.clone());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Wraps secondary chunks in red before passing them on
#[derive(Debug)]
pub struct Highlight<S> {
    inner: S,
}

impl<S: Sink> Highlight<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Sink> Sink for Highlight<S> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        if chunk.channel() != Channel::Secondary {
            return self.inner.write_chunk(chunk);
        }
        let mut data = Vec::with_capacity(HIGHLIGHT_START.len() + chunk.len() + HIGHLIGHT_END.len());
        data.extend_from_slice(HIGHLIGHT_START);
        data.extend_from_slice(chunk.data());
        data.extend_from_slice(HIGHLIGHT_END);
        self.inner
            .write_chunk(&Chunk::new(chunk.seq(), chunk.channel(), data))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

#[derive(Serialize)]
struct ChunkRecord<'a> {
    seq: u64,
    channel: Channel,
    data: std::borrow::Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<&'a [u8]>,
}

/// Writes one JSON object per chunk
///
/// `data` holds the bytes as text; when they are not valid UTF-8 the raw
/// bytes are included as well under `bytes`.
#[derive(Debug)]
pub struct JsonLines<W: Write> {
    writer: W,
}

impl<W: Write> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for JsonLines<W> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        let (data, bytes) = match std::str::from_utf8(chunk.data()) {
            Ok(text) => (std::borrow::Cow::Borrowed(text), None),
            Err(_) => (String::from_utf8_lossy(chunk.data()), Some(chunk.data())),
        };
        let record = ChunkRecord {
            seq: chunk.seq(),
            channel: chunk.channel(),
            data,
            bytes,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Delivers every chunk to two sinks, `first` then `second`
#[derive(Debug)]
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Sink, B: Sink> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: Sink, B: Sink> Sink for Tee<A, B> {
    fn write_chunk(&mut self, chunk: &Chunk) -> io::Result<()> {
        self.first.write_chunk(chunk)?;
        self.second.write_chunk(chunk)
    }

    fn finish(&mut self) -> io::Result<()> {
        let first = self.first.finish();
        let second = self.second.finish();
        first.and(second)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn probe_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new(0, Channel::Primary, b"1\n2\n3\n".to_vec()),
            Chunk::new(1, Channel::Secondary, b"4".to_vec()),
            Chunk::new(2, Channel::Primary, b"5\n".to_vec()),
            Chunk::new(3, Channel::Secondary, b"\n".to_vec()),
        ]
    }

    fn feed<S: Sink>(sink: &mut S, chunks: &[Chunk]) {
        for chunk in chunks {
            sink.write_chunk(chunk).unwrap();
        }
        sink.finish().unwrap();
    }

    #[test]
    fn test_interleaved_keeps_arrival_order() {
        let mut sink = Interleaved::new(Vec::new());
        feed(&mut sink, &probe_chunks());
        assert_eq!(sink.into_inner(), b"1\n2\n3\n45\n\n");
    }

    #[test]
    fn test_split_routes_by_channel() {
        let mut sink = Split::new(Vec::new(), Vec::new());
        feed(&mut sink, &probe_chunks());
        let (primary, secondary) = sink.into_inner();
        assert_eq!(primary, b"1\n2\n3\n5\n");
        assert_eq!(secondary, b"4\n");
    }

    #[test]
    fn test_capture_rejects_out_of_order_chunks() {
        let mut sink = Capture::new();
        sink.write_chunk(&Chunk::new(5, Channel::Primary, b"a".to_vec()))
            .unwrap();
        let err = sink
            .write_chunk(&Chunk::new(5, Channel::Secondary, b"b".to_vec()))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_capture_demultiplexes() {
        let mut sink = Capture::new();
        feed(&mut sink, &probe_chunks());
        assert!(sink.is_finished());
        assert_eq!(sink.interleaved(), b"1\n2\n3\n45\n\n");
        assert_eq!(sink.channel(Channel::Primary), b"1\n2\n3\n5\n");
        assert_eq!(sink.channel(Channel::Secondary), b"4\n");
    }

    #[test]
    fn test_highlight_wraps_secondary_only() {
        let mut sink = Highlight::new(Interleaved::new(Vec::new()));
        feed(&mut sink, &probe_chunks());
        let out = sink.into_inner().into_inner();
        assert_eq!(out, b"1\n2\n3\n\x1b[31m4\x1b[0m5\n\x1b[31m\n\x1b[0m");
    }

    #[test]
    fn test_json_lines_records() {
        let mut sink = JsonLines::new(Vec::new());
        feed(
            &mut sink,
            &[
                Chunk::new(0, Channel::Primary, b"ok\n".to_vec()),
                Chunk::new(1, Channel::Secondary, vec![0xff, b'!']),
            ],
        );
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["seq"], 0);
        assert_eq!(lines[0]["channel"], "primary");
        assert_eq!(lines[0]["data"], "ok\n");
        assert!(lines[0].get("bytes").is_none());
        assert_eq!(lines[1]["channel"], "secondary");
        assert_eq!(lines[1]["bytes"], serde_json::json!([255, 33]));
    }

    #[test]
    fn test_tee_feeds_both() {
        let mut sink = Tee::new(Capture::new(), Interleaved::new(Vec::new()));
        feed(&mut sink, &probe_chunks());
        let (capture, interleaved) = sink.into_inner();
        assert_eq!(capture.interleaved(), interleaved.into_inner());
        assert!(capture.is_finished());
    }

    fn arb_chunks() -> impl Strategy<Value = Vec<(bool, Vec<u8>)>> {
        prop::collection::vec(
            (any::<bool>(), prop::collection::vec(any::<u8>(), 1..32)),
            0..40,
        )
    }

    proptest! {
        #[test]
        fn prop_split_preserves_per_channel_bytes(parts in arb_chunks()) {
            let chunks: Vec<Chunk> = parts
                .iter()
                .enumerate()
                .map(|(seq, (secondary, data))| {
                    let channel = if *secondary { Channel::Secondary } else { Channel::Primary };
                    Chunk::new(seq as u64, channel, data.clone())
                })
                .collect();

            let mut capture = Capture::new();
            let mut split = Split::new(Vec::new(), Vec::new());
            for chunk in &chunks {
                capture.write_chunk(chunk).unwrap();
                split.write_chunk(chunk).unwrap();
            }
            let (primary, secondary) = split.into_inner();
            prop_assert_eq!(primary, capture.channel(Channel::Primary));
            prop_assert_eq!(secondary, capture.channel(Channel::Secondary));

            let total: usize = chunks.iter().map(Chunk::len).sum();
            prop_assert_eq!(capture.interleaved().len(), total);
        }
    }
}
