//! Chunk reassembly for fragmented payloads.
//!
//! Devices announce a payload length up front, then deliver the payload as
//! a series of small notifications. The reassembler accumulates them until
//! the announced length is reached.

use crate::family::DEFAULT_MAX_PAYLOAD_LEN;
use crate::ProtocolError;
use serde::{Deserialize, Serialize};

/// Upper bound on the buffer reserved up front; larger payloads grow it.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// What to do when more bytes arrive than were announced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the chunk and report [`AppendResult::Overflow`].
    #[default]
    Reject,
    /// Keep bytes up to the announced length and complete.
    TrustDeclaredLength,
}

/// Result of appending a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    /// More bytes are needed.
    Incomplete {
        /// Bytes held so far.
        received: usize,
        /// Bytes announced.
        expected: usize,
    },
    /// The announced length was reached; the reassembly is finished.
    Complete(Vec<u8>),
    /// The chunk would exceed the announced length and was not appended.
    Overflow {
        /// Bytes announced.
        expected: usize,
        /// Bytes that would have been held with this chunk.
        received: usize,
    },
}

/// Accumulates chunks up to a declared length.
#[derive(Debug)]
pub struct ChunkReassembler {
    policy: OverflowPolicy,
    max_len: usize,
    expected: Option<usize>,
    buffer: Vec<u8>,
}

impl ChunkReassembler {
    /// Create an idle reassembler.
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            policy,
            max_len: DEFAULT_MAX_PAYLOAD_LEN,
            expected: None,
            buffer: Vec::new(),
        }
    }

    /// Refuse declarations longer than `max_len` bytes.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Start a reassembly of `expected` bytes.
    pub fn begin(&mut self, expected: usize) -> Result<(), ProtocolError> {
        if self.expected.is_some() {
            return Err(ProtocolError::AlreadyInProgress);
        }
        if expected > self.max_len {
            return Err(ProtocolError::PayloadTooLarge {
                declared: expected,
                max: self.max_len,
            });
        }
        self.expected = Some(expected);
        self.buffer = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
        Ok(())
    }

    /// Append a chunk.
    pub fn append(&mut self, chunk: &[u8]) -> Result<AppendResult, ProtocolError> {
        let expected = self.expected.ok_or(ProtocolError::NotInProgress)?;
        let total = self.buffer.len() + chunk.len();

        if total > expected {
            match self.policy {
                OverflowPolicy::Reject => {
                    return Ok(AppendResult::Overflow {
                        expected,
                        received: total,
                    });
                }
                OverflowPolicy::TrustDeclaredLength => {
                    let take = expected - self.buffer.len();
                    self.buffer.extend_from_slice(&chunk[..take]);
                }
            }
        } else {
            self.buffer.extend_from_slice(chunk);
        }

        if self.buffer.len() >= expected {
            self.expected = None;
            Ok(AppendResult::Complete(std::mem::take(&mut self.buffer)))
        } else {
            Ok(AppendResult::Incomplete {
                received: self.buffer.len(),
                expected,
            })
        }
    }

    /// Whether a reassembly is active.
    pub fn is_active(&self) -> bool {
        self.expected.is_some()
    }

    /// Bytes held by the active reassembly.
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Announced length of the active reassembly.
    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    /// Drop any partial reassembly.
    pub fn reset(&mut self) {
        self.expected = None;
        self.buffer.clear();
    }
}
