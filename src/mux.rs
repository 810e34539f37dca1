//! Ordering multiplexer
//!
//! A single readiness-driven loop drains every channel with bounded,
//! non-blocking reads and hands each read to the sink as a sequence-numbered
//! chunk. The sequence counter lives in the loop, so readiness observation
//! and numbering can never be reordered.
//!
//! The loop only ends once every channel has reported end-of-stream on its
//! own; the child exiting first does not end it, since bytes can still be
//! pending in the kernel after the writer is gone.

use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::allocator::{ChildStdio, Channels, Endpoint};
use crate::channel::{Channel, Chunk};
use crate::error::{Error, Result};
use crate::pty::Pty;
use crate::sink::Sink;

/// Default upper bound for a single read
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// An extra readiness source polled alongside the channels
///
/// `wake` runs on the loop's thread whenever `fd` is readable; it gets the
/// pseudo-terminals still owned by the loop so it can e.g. resize them.
pub trait Wakeup {
    fn fd(&self) -> BorrowedFd<'_>;
    fn wake(&mut self, terminals: &[&Pty]) -> Result<()>;
}

/// A read error other than end-of-stream
///
/// The channel it happened on is closed; the other keeps draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("read from {channel} channel failed: {errno}")]
pub struct DrainError {
    pub channel: Channel,
    pub errno: Errno,
}

/// What was read from one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelReport {
    pub bytes: u64,
    pub chunks: u64,
    pub error: Option<DrainError>,
}

/// Result of a completed drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub primary: ChannelReport,
    pub secondary: ChannelReport,
    /// Total chunks emitted; also the next unused sequence number
    pub chunks: u64,
}

impl DrainReport {
    pub fn channel(&self, channel: Channel) -> &ChannelReport {
        match channel {
            Channel::Primary => &self.primary,
            Channel::Secondary => &self.secondary,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelReport {
        match channel {
            Channel::Primary => &mut self.primary,
            Channel::Secondary => &mut self.secondary,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.primary.bytes + self.secondary.bytes
    }

    pub fn drain_errors(&self) -> impl Iterator<Item = &DrainError> {
        self.primary.error.iter().chain(self.secondary.error.iter())
    }
}

struct Source {
    channel: Channel,
    endpoint: Endpoint,
    open: bool,
}

enum ReadOutcome {
    Data(usize),
    Closed,
    Spurious,
}

/// Drains a set of channels into a sink
pub struct Multiplexer {
    sources: Vec<Source>,
    chunk_size: usize,
    buf: Vec<u8>,
    next_seq: u64,
    /// Index of the source served first in the next iteration
    start: usize,
    report: DrainReport,
}

impl Multiplexer {
    pub fn new(primary: Endpoint, secondary: Option<Endpoint>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut sources = vec![Source {
            channel: Channel::Primary,
            endpoint: primary,
            open: true,
        }];
        if let Some(endpoint) = secondary {
            sources.push(Source {
                channel: Channel::Secondary,
                endpoint,
                open: true,
            });
        }
        Self {
            sources,
            chunk_size,
            buf: vec![0; chunk_size],
            next_seq: 0,
            start: 0,
            report: DrainReport::default(),
        }
    }

    /// Take the parent-side endpoints of an allocation
    ///
    /// The child-side descriptors are returned untouched for the spawn.
    pub fn from_channels(channels: Channels, chunk_size: usize) -> (Self, ChildStdio) {
        let Channels {
            primary,
            secondary,
            child,
        } = channels;
        (Self::new(primary, secondary, chunk_size), child)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Pseudo-terminals owned by the loop, open or not
    pub fn terminals(&self) -> Vec<&Pty> {
        self.sources
            .iter()
            .filter_map(|s| s.endpoint.as_pty())
            .collect()
    }

    pub fn is_drained(&self) -> bool {
        self.sources.iter().all(|s| !s.open)
    }

    /// Run until every channel reached end-of-stream
    pub fn drain<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<DrainReport> {
        self.drain_with(sink, None)
    }

    /// Like [`drain`](Self::drain), also servicing `wakeup` when it is ready
    pub fn drain_with<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        mut wakeup: Option<&mut dyn Wakeup>,
    ) -> Result<DrainReport> {
        while !self.is_drained() {
            let (ready, woke) = self.wait_ready(wakeup.as_deref())?;

            for index in ready {
                self.read_once(index, sink)?;
            }

            if woke {
                if let Some(wakeup) = wakeup.as_deref_mut() {
                    let terminals = self.terminals();
                    wakeup.wake(&terminals)?;
                }
            }
        }
        tracing::debug!(
            chunks = self.report.chunks,
            primary = self.report.primary.bytes,
            secondary = self.report.secondary.bytes,
            "channels drained"
        );
        Ok(self.report.clone())
    }

    /// Block until something is readable
    ///
    /// Returns the ready sources in round-robin order starting at `start`,
    /// and whether the wakeup source fired.
    fn wait_ready(&mut self, wakeup: Option<&dyn Wakeup>) -> Result<(Vec<usize>, bool)> {
        let open: Vec<usize> = (0..self.sources.len())
            .map(|i| (self.start + i) % self.sources.len())
            .filter(|&i| self.sources[i].open)
            .collect();
        self.start = (self.start + 1) % self.sources.len();

        let ready_flags =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;

        let endpoints: Vec<BorrowedFd<'_>> = open
            .iter()
            .map(|&i| self.sources[i].endpoint.as_fd())
            .collect();
        let wake_fd = wakeup.map(|w| w.fd());

        let mut fds: Vec<PollFd<'_>> = endpoints
            .iter()
            .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
            .collect();
        if let Some(fd) = wake_fd.as_ref() {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, -1) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Poll(e)),
            }
        }

        let is_ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| r.intersects(ready_flags));
        let ready = open
            .iter()
            .zip(fds.iter())
            .filter(|(_, fd)| is_ready(*fd))
            .map(|(&i, _)| i)
            .collect();
        let woke = wake_fd.is_some() && fds.last().is_some_and(is_ready);
        Ok((ready, woke))
    }

    /// One bounded read from a ready source
    fn read_once<S: Sink + ?Sized>(&mut self, index: usize, sink: &mut S) -> Result<()> {
        let outcome = {
            let source = &self.sources[index];
            match source.endpoint.read(&mut self.buf) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Data(n),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => ReadOutcome::Spurious,
                // A pseudo-terminal master reports EIO once every slave is closed
                Err(Errno::EIO) if source.endpoint.is_terminal() => ReadOutcome::Closed,
                Err(errno) => {
                    let error = DrainError {
                        channel: source.channel,
                        errno,
                    };
                    tracing::warn!(%error, "closing channel after read error");
                    self.report.channel_mut(source.channel).error = Some(error);
                    ReadOutcome::Closed
                },
            }
        };

        let channel = self.sources[index].channel;
        match outcome {
            ReadOutcome::Data(n) => {
                let chunk = Chunk::new(self.next_seq, channel, self.buf[..n].to_vec());
                self.next_seq += 1;
                self.report.chunks = self.next_seq;
                let stats = self.report.channel_mut(channel);
                stats.bytes += n as u64;
                stats.chunks += 1;
                sink.write_chunk(&chunk).map_err(Error::Sink)?;
            },
            ReadOutcome::Closed => {
                tracing::debug!(%channel, "end of stream");
                self.sources[index].open = false;
            },
            ReadOutcome::Spurious => {},
        }
        Ok(())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.sources.len())
            .field("chunk_size", &self.chunk_size)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use nix::fcntl::OFlag;
    use nix::unistd;

    use super::*;
    use crate::pty::set_nonblocking;
    use crate::sink::Capture;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
        set_nonblocking(read.as_raw_fd(), true).unwrap();
        (read, write)
    }

    fn write(fd: &OwnedFd, data: &[u8]) {
        assert_eq!(unistd::write(fd.as_raw_fd(), data).unwrap(), data.len());
    }

    #[test]
    fn test_drains_single_channel_until_eof() {
        let (read, write_end) = pipe();
        write(&write_end, b"hello ");
        write(&write_end, b"world");
        drop(write_end);

        let mut mux = Multiplexer::new(Endpoint::Pipe(read), None, DEFAULT_CHUNK_SIZE);
        let mut sink = Capture::new();
        let report = mux.drain(&mut sink).unwrap();

        assert_eq!(sink.interleaved(), b"hello world");
        assert_eq!(report.primary.bytes, 11);
        assert_eq!(report.secondary, ChannelReport::default());
        assert!(mux.is_drained());
    }

    #[test]
    fn test_reads_are_bounded() {
        let (read, write_end) = pipe();
        write(&write_end, &[b'x'; 10]);
        drop(write_end);

        let mut mux = Multiplexer::new(Endpoint::Pipe(read), None, 4);
        let mut sink = Capture::new();
        let report = mux.drain(&mut sink).unwrap();

        let sizes: Vec<usize> = sink.chunks().iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(report.primary.chunks, 3);
        assert_eq!(report.chunks, 3);
    }

    #[test]
    fn test_ready_channels_are_served_round_robin() {
        let (primary, primary_w) = pipe();
        let (secondary, secondary_w) = pipe();
        write(&primary_w, b"aaaaaaaa");
        write(&secondary_w, b"bbbbbbbb");
        drop(primary_w);
        drop(secondary_w);

        let mut mux = Multiplexer::new(Endpoint::Pipe(primary), Some(Endpoint::Pipe(secondary)), 2);
        let mut sink = Capture::new();
        mux.drain(&mut sink).unwrap();

        // Every iteration serves both ready channels, so neither runs ahead
        let channels: Vec<Channel> = sink.chunks().iter().map(Chunk::channel).collect();
        assert_eq!(channels.len(), 8);
        let mut balance = 0i32;
        for channel in &channels {
            balance += if *channel == Channel::Primary { 1 } else { -1 };
            assert!(balance.abs() <= 1, "{channels:?}");
        }
        assert_eq!(sink.channel(Channel::Primary), b"aaaaaaaa");
        assert_eq!(sink.channel(Channel::Secondary), b"bbbbbbbb");
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let (primary, primary_w) = pipe();
        let (secondary, secondary_w) = pipe();
        write(&primary_w, b"1\n2\n3\n");
        write(&secondary_w, b"4");
        drop(primary_w);
        drop(secondary_w);

        let mut mux = Multiplexer::new(Endpoint::Pipe(primary), Some(Endpoint::Pipe(secondary)), 3);
        let mut sink = Capture::new();
        let report = mux.drain(&mut sink).unwrap();

        let seqs: Vec<u64> = sink.chunks().iter().map(Chunk::seq).collect();
        assert_eq!(seqs, (0..report.chunks).collect::<Vec<_>>());
    }

    #[test]
    fn test_one_channel_closing_does_not_stop_the_other() {
        let (primary, primary_w) = pipe();
        let (secondary, secondary_w) = pipe();
        drop(primary_w);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            write(&secondary_w, b"late");
        });

        let mut mux = Multiplexer::new(Endpoint::Pipe(primary), Some(Endpoint::Pipe(secondary)), 64);
        let mut sink = Capture::new();
        mux.drain(&mut sink).unwrap();
        writer.join().unwrap();

        assert_eq!(sink.channel(Channel::Secondary), b"late");
    }

    #[test]
    fn test_read_error_closes_only_the_failing_channel() {
        // Directories poll readable but fail every read with EISDIR
        let dir = OwnedFd::from(std::fs::File::open("/").unwrap());
        let (secondary, secondary_w) = pipe();
        write(&secondary_w, b"still here");
        drop(secondary_w);

        let mut mux = Multiplexer::new(Endpoint::Pipe(dir), Some(Endpoint::Pipe(secondary)), 64);
        let mut sink = Capture::new();
        let report = mux.drain(&mut sink).unwrap();

        assert_eq!(
            report.primary.error,
            Some(DrainError {
                channel: Channel::Primary,
                errno: Errno::EISDIR,
            })
        );
        assert_eq!(report.drain_errors().count(), 1);
        assert_eq!(sink.channel(Channel::Secondary), b"still here");
        assert!(sink.channel(Channel::Primary).is_empty());
        assert!(mux.is_drained());
    }

    #[test]
    fn test_pty_hangup_is_end_of_stream() {
        let pty = Pty::open().unwrap();
        let slave = pty.open_slave().unwrap();
        pty.set_nonblocking(true).unwrap();
        write(&slave, b"bye");
        drop(slave);

        let mut mux = Multiplexer::new(Endpoint::Pty(pty), None, 64);
        let mut sink = Capture::new();
        let report = mux.drain(&mut sink).unwrap();

        assert!(report.primary.error.is_none());
        assert!(mux.is_drained());
    }

    #[test]
    fn test_sink_failure_aborts_drain() {
        struct Broken;
        impl Sink for Broken {
            fn write_chunk(&mut self, _chunk: &Chunk) -> std::io::Result<()> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
        }

        let (read, write_end) = pipe();
        write(&write_end, b"data");
        drop(write_end);

        let mut mux = Multiplexer::new(Endpoint::Pipe(read), None, 64);
        assert!(matches!(mux.drain(&mut Broken), Err(Error::Sink(_))));
    }

    #[test]
    fn test_wakeup_runs_on_loop_thread() {
        struct Counter {
            read: OwnedFd,
            hits: usize,
        }
        impl Wakeup for Counter {
            fn fd(&self) -> BorrowedFd<'_> {
                self.read.as_fd()
            }
            fn wake(&mut self, _terminals: &[&Pty]) -> Result<()> {
                let mut buf = [0u8; 8];
                let _ = unistd::read(self.read.as_raw_fd(), &mut buf);
                self.hits += 1;
                Ok(())
            }
        }

        let (wake_read, wake_write) = pipe();
        let (data, data_w) = pipe();
        write(&wake_write, b"!");

        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            write(&data_w, b"x");
        });

        let mut counter = Counter {
            read: wake_read,
            hits: 0,
        };
        let mut mux = Multiplexer::new(Endpoint::Pipe(data), None, 64);
        let mut sink = Capture::new();
        mux.drain_with(&mut sink, Some(&mut counter)).unwrap();
        writer.join().unwrap();

        assert_eq!(counter.hits, 1);
        assert_eq!(sink.interleaved(), b"x");
    }
}
