//! Error types for the sync engine.

use sync_types::WireError;
use thiserror::Error;

/// Errors raised by the pure protocol components.
///
/// Inside a fetch round these never escape: the round folds them into a
/// [`RoundOutcome`](crate::RoundOutcome) or ignores the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A reassembly was started while another was still active
    #[error("reassembly already in progress")]
    AlreadyInProgress,

    /// Data arrived while no reassembly was active
    #[error("no reassembly in progress")]
    NotInProgress,

    /// Bytes could not be decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A well-formed message arrived that does not fit the current state
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// File data arrived before the device accepted the download
    #[error("download not started")]
    DownloadNotStarted,

    /// The device declared more data than the configured limit
    #[error("declared payload of {declared} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Length the device declared.
        declared: usize,
        /// Configured limit.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_errors_convert() {
        let err: ProtocolError = WireError::UnknownMessageType(1).into();
        assert_eq!(err.to_string(), "wire error: unknown message type: 1");
    }
}
