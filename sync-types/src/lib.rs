//! # sync-types
//!
//! Wire format types for wearable history sync.
//!
//! This crate provides the foundational types used across all wearsync crates:
//! - [`Timestamp`], [`DataKind`], [`EndpointId`] - Ordering and addressing types
//! - [`checksum`] - CRC-16 (Garmin/FIT) and CRC-32 (zlib) helpers
//! - [`huami`] - Huami / Zepp OS history fetch commands and responses
//! - [`gfdi`] - Garmin GFDI message framing
//! - [`StatusMessage`] - GFDI status (RESPONSE) messages and their sub-statuses
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
mod error;
pub mod gfdi;
pub mod huami;
mod ids;
mod status;

pub use error::WireError;
pub use gfdi::{Frame, MessageType, Status};
pub use ids::{DataKind, EndpointId, Timestamp};
pub use status::{
    CreateStatus, DownloadStatus, NotificationChunkStatus, ProtobufChunkStatus,
    ProtobufStatusCode, StatusDetail, StatusMessage, TransferStatus, UploadStatus,
};

/// Format bytes as a short hex dump for log lines.
///
/// Output is truncated after `max_len` bytes with the total length appended.
pub fn hex_dump(data: &[u8], max_len: usize) -> String {
    let len = data.len().min(max_len);
    let shown = hex::encode(&data[..len]);
    if data.len() > max_len {
        format!("{}... ({} bytes total)", shown, data.len())
    } else {
        format!("{} ({} bytes)", shown, data.len())
    }
}
