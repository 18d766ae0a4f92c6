//! Error types for wire decoding.

use thiserror::Error;

/// Errors that can occur while encoding or decoding device frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Frame shorter than its fixed layout requires
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum number of bytes required.
        needed: usize,
        /// Number of bytes available.
        got: usize,
    },

    /// Declared length does not match the received length
    #[error("invalid frame length: declared {declared}, actual {actual}")]
    InvalidLength {
        /// Length declared in the frame header.
        declared: usize,
        /// Length actually received.
        actual: usize,
    },

    /// Frame checksum does not match its contents
    #[error("bad checksum: frame carries {expected:#06x}, computed {computed:#06x}")]
    BadChecksum {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        computed: u32,
    },

    /// Unknown message type discriminator
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// Status or sub-status byte outside its enumeration
    #[error("invalid status code {code} for {field}")]
    InvalidStatus {
        /// Which status field was being decoded.
        field: &'static str,
        /// The raw code.
        code: u8,
    },

    /// Response tag or command byte the decoder does not recognize
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Calendar fields that do not form a valid instant
    #[error("invalid timestamp bytes: {0}")]
    InvalidTimestamp(String),
}
