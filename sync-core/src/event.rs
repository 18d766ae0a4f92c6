//! Round outcomes and the events reported to callers.

use sync_types::{DataKind, Timestamp};
use thiserror::Error;

/// Why a round ended early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// The link failed
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A chunk counter was not the successor of the previous one
    #[error("sequence mismatch: expected counter {expected}, got {got}")]
    SequenceMismatch {
        /// Counter the guard expected.
        expected: u8,
        /// Counter received.
        got: u8,
    },

    /// The payload failed its checksum
    #[error("checksum mismatch (retained on device: {retained})")]
    ChecksumMismatch {
        /// Whether the device was told to keep the data.
        retained: bool,
    },

    /// The device sent something malformed or out of order
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The decoder rejected the payload
    #[error("decode error: {0}")]
    DecodeError(String),

    /// No response within the family's response timeout
    #[error("timed out waiting for the device")]
    Timeout,

    /// The caller aborted the round
    #[error("cancelled")]
    Cancelled,
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Data was verified and handed off.
    Success {
        /// Payload bytes transferred.
        bytes_transferred: usize,
        /// Watermark after this round.
        new_watermark: Timestamp,
    },
    /// The round ended without handing off data.
    Aborted(AbortReason),
    /// Data was handed off and another round for the same kind was queued.
    NeedsAnotherRound {
        /// Watermark after this round.
        new_watermark: Timestamp,
    },
}

impl RoundOutcome {
    /// Whether data was handed off.
    pub fn is_success(&self) -> bool {
        !matches!(self, RoundOutcome::Aborted(_))
    }

    /// Watermark reported by a successful outcome.
    pub fn new_watermark(&self) -> Option<Timestamp> {
        match self {
            RoundOutcome::Success { new_watermark, .. }
            | RoundOutcome::NeedsAnotherRound { new_watermark } => Some(*new_watermark),
            RoundOutcome::Aborted(_) => None,
        }
    }
}

/// Events emitted to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A round was started.
    RoundStarted {
        /// Kind being fetched.
        kind: DataKind,
        /// 1-based round number for this kind.
        round_index: u32,
        /// Watermark the round fetches from.
        since: Timestamp,
    },
    /// A chunk was accepted.
    RoundProgress {
        /// Kind being fetched.
        kind: DataKind,
        /// Payload bytes so far.
        bytes_so_far: usize,
        /// Payload bytes announced.
        bytes_expected: usize,
    },
    /// A round ended.
    RoundFinished {
        /// Kind fetched.
        kind: DataKind,
        /// Final outcome, after scheduling.
        outcome: RoundOutcome,
    },
    /// All queued rounds have ended.
    SyncFinished {
        /// Kinds whose last round succeeded, in sync order.
        data_kinds_completed: Vec<DataKind>,
    },
}
