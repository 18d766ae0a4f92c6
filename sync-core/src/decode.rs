//! Hand-off of verified payloads to sample decoders.

use crate::VerifiedPayload;
use std::time::Duration;
use sync_types::{DataKind, Timestamp};
use thiserror::Error;

/// Summary of a decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPayload {
    /// Number of samples handed off.
    pub samples: usize,
    /// Time covered by the samples, measured from the round's start timestamp.
    pub span: Duration,
}

/// Errors a decoder can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The decoder has no format for this kind
    #[error("no decoder for {0}")]
    UnsupportedKind(DataKind),

    /// Payload length does not divide into whole records
    #[error("payload of {len} bytes is not a whole number of {record_len}-byte records")]
    Misaligned {
        /// Payload length.
        len: usize,
        /// Record size.
        record_len: usize,
    },

    /// Record contents are invalid
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Turns verified payload bytes into domain samples.
///
/// The decoder owns what happens to the samples; the engine only needs to
/// know how many there were and how much time they cover.
pub trait SampleDecoder {
    /// Decode `payload` for `kind`, whose first sample is at `start`.
    fn decode(
        &mut self,
        kind: DataKind,
        payload: &VerifiedPayload,
        start: Timestamp,
    ) -> Result<DecodedPayload, DecodeError>;
}
