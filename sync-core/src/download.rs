//! GFDI file download.
//!
//! Garmin devices send files as FileTransferData chunks framed by offset
//! and a running CRC-16 instead of per-chunk counters. Every chunk is
//! answered with a transfer status telling the device where to continue.

use crate::integrity::VerifiedPayload;
use crate::reassembler::{AppendResult, ChunkReassembler, OverflowPolicy};
use crate::ProtocolError;
use sync_types::checksum::crc16_update;
use sync_types::gfdi::{DownloadRequest, FileTransferData};
use sync_types::{MessageType, Status, StatusDetail, StatusMessage, TransferStatus};
use tracing::{debug, warn};

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStep {
    /// Chunk accepted; more to come.
    Continue(StatusMessage),
    /// Chunk accepted and the file is complete.
    Complete {
        /// Reply to send.
        reply: StatusMessage,
        /// The whole file.
        payload: VerifiedPayload,
    },
    /// Chunk refused (offset or CRC mismatch); the device resends.
    Rejected(StatusMessage),
    /// Chunk would exceed the announced size; the transfer is over.
    Aborted(StatusMessage),
}

impl DownloadStep {
    /// The status to send back.
    pub fn reply(&self) -> &StatusMessage {
        match self {
            DownloadStep::Continue(reply)
            | DownloadStep::Rejected(reply)
            | DownloadStep::Aborted(reply)
            | DownloadStep::Complete { reply, .. } => reply,
        }
    }
}

/// One file download.
#[derive(Debug)]
pub struct FileDownload {
    file_index: u16,
    reassembler: ChunkReassembler,
    crc: u16,
    started: bool,
}

impl FileDownload {
    /// Prepare a download of `file_index`.
    pub fn new(file_index: u16) -> Self {
        Self {
            file_index,
            reassembler: ChunkReassembler::new(OverflowPolicy::Reject),
            crc: 0,
            started: false,
        }
    }

    /// Refuse files the device sizes above `max_len` bytes.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.reassembler = ChunkReassembler::new(OverflowPolicy::Reject).with_max_len(max_len);
        self
    }

    /// The DownloadRequest payload to send.
    pub fn request(&self) -> DownloadRequest {
        DownloadRequest::new_file(self.file_index)
    }

    /// File index being downloaded.
    pub fn file_index(&self) -> u16 {
        self.file_index
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.reassembler.received()
    }

    /// Handle the device's reply to the DownloadRequest.
    ///
    /// Returns the payload right away for an empty file.
    pub fn on_status(
        &mut self,
        status: &StatusMessage,
    ) -> Result<Option<VerifiedPayload>, ProtocolError> {
        let max_file_size = match status.detail {
            StatusDetail::Download { max_file_size, .. } if status.can_proceed() => max_file_size,
            _ => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "download of file {} refused: {:?}",
                    self.file_index, status
                )))
            }
        };

        self.reassembler.begin(max_file_size as usize)?;
        self.started = true;
        self.crc = 0;
        debug!(file = self.file_index, size = max_file_size, "download accepted");

        if max_file_size == 0 {
            self.reassembler.reset();
            self.started = false;
            return Ok(Some(VerifiedPayload {
                bytes: Vec::new(),
                checksum_valid: true,
            }));
        }
        Ok(None)
    }

    /// Handle one chunk.
    pub fn on_data(&mut self, chunk: &FileTransferData) -> Result<DownloadStep, ProtocolError> {
        if !self.started {
            return Err(ProtocolError::DownloadNotStarted);
        }

        let held = self.reassembler.received() as u32;
        if chunk.data_offset != held {
            warn!(file = self.file_index, expected = held, got = chunk.data_offset, "offset mismatch");
            return Ok(DownloadStep::Rejected(transfer_reply(
                TransferStatus::OffsetMismatch,
                held,
            )));
        }

        let crc = crc16_update(self.crc, &chunk.data);
        if crc != chunk.crc {
            warn!(file = self.file_index, offset = held, "chunk crc mismatch");
            return Ok(DownloadStep::Rejected(transfer_reply(
                TransferStatus::CrcMismatch,
                held,
            )));
        }

        match self.reassembler.append(&chunk.data)? {
            AppendResult::Incomplete { received, .. } => {
                self.crc = crc;
                Ok(DownloadStep::Continue(transfer_reply(
                    TransferStatus::Ok,
                    received as u32,
                )))
            }
            AppendResult::Complete(bytes) => {
                self.crc = crc;
                self.started = false;
                debug!(file = self.file_index, bytes = bytes.len(), "download complete");
                Ok(DownloadStep::Complete {
                    reply: transfer_reply(TransferStatus::Ok, bytes.len() as u32),
                    payload: VerifiedPayload {
                        bytes,
                        checksum_valid: true,
                    },
                })
            }
            AppendResult::Overflow { expected, received } => {
                warn!(file = self.file_index, expected, received, "chunk past end of file");
                self.reassembler.reset();
                self.started = false;
                Ok(DownloadStep::Aborted(transfer_reply(
                    TransferStatus::Abort,
                    held,
                )))
            }
        }
    }
}

fn transfer_reply(status: TransferStatus, data_offset: u32) -> StatusMessage {
    StatusMessage {
        original_type: MessageType::FileTransferData,
        status: Status::Ack,
        detail: StatusDetail::Transfer {
            status,
            data_offset,
        },
    }
}
