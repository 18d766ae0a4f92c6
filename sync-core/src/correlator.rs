//! Request/status correlation for GFDI-style protocols.
//!
//! Every request carries a message type and the device answers with a
//! RESPONSE frame naming that type. There are no request ids, so replies
//! are matched FIFO against the oldest pending request of the same type.

use crate::ProtocolError;
use std::collections::VecDeque;
use std::time::Duration;
use sync_types::{Frame, MessageType, StatusMessage, Timestamp};
use tracing::{debug, warn};

/// A request waiting for its status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Type of the request.
    pub message_type: MessageType,
    /// When it was sent.
    pub sent_at: Timestamp,
}

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A status reply.
    Status {
        /// The decoded status.
        status: StatusMessage,
        /// The request it answers, if one was pending.
        request: Option<PendingRequest>,
    },
    /// Any other message from the device.
    Message(Frame),
}

/// FIFO correlation of requests and status replies.
#[derive(Debug, Default)]
pub struct StatusMessageCorrelator {
    pending: VecDeque<PendingRequest>,
}

impl StatusMessageCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame a request and record it as pending. The caller transmits the bytes.
    ///
    /// A payload too large to frame is refused and nothing is recorded.
    pub fn send(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
        now: Timestamp,
    ) -> Result<Vec<u8>, ProtocolError> {
        let raw = Frame::new(message_type, payload).try_encode()?;
        self.pending.push_back(PendingRequest {
            message_type,
            sent_at: now,
        });
        debug!(%message_type, pending = self.pending.len(), "request sent");
        Ok(raw)
    }

    /// Decode a raw frame from the device.
    pub fn on_incoming(&mut self, raw: &[u8]) -> Result<Incoming, ProtocolError> {
        let frame = Frame::decode(raw)?;
        if frame.message_type != MessageType::Response {
            return Ok(Incoming::Message(frame));
        }

        let status = StatusMessage::from_frame(&frame)?;
        let request = self
            .pending
            .iter()
            .position(|p| p.message_type == status.original_type)
            .and_then(|idx| self.pending.remove(idx));

        if request.is_none() {
            warn!(original = %status.original_type, "status with no pending request");
        }
        Ok(Incoming::Status { status, request })
    }

    /// Frame a host-generated status reply.
    pub fn reply(&self, status: &StatusMessage) -> Vec<u8> {
        status.to_frame().encode()
    }

    /// Remove and return requests older than `timeout`.
    pub fn expire(&mut self, now: Timestamp, timeout: Duration) -> Vec<PendingRequest> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| now.duration_since(p.sent_at) >= timeout);
        self.pending = kept.into();
        for request in &expired {
            warn!(message_type = %request.message_type, "request expired");
        }
        expired
    }

    /// Drop all pending requests.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of pending requests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
