//! Channels and the chunks read from them

use serde::{Deserialize, Serialize};

/// One of the child's two output streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// The child's stdout
    Primary,
    /// The child's stderr
    Secondary,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Primary => "primary",
            Channel::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A tagged, sequence-numbered run of bytes read from one channel
///
/// Sequence numbers are assigned in the order readiness was observed and are
/// the only ordering authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    seq: u64,
    channel: Channel,
    data: Vec<u8>,
}

impl Chunk {
    pub fn new(seq: u64, channel: Channel, data: Vec<u8>) -> Self {
        Self { seq, channel, data }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
