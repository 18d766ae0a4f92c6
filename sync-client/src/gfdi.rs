//! GFDI request/status channel.
//!
//! Garmin devices speak GFDI over a single characteristic pair: every
//! request is answered by a RESPONSE frame naming the request type, and
//! files arrive as FileTransferData frames that the host acknowledges one by
//! one. [`GfdiChannel`] wraps a [`Transport`] with the pure
//! [`StatusMessageCorrelator`] and [`FileDownload`] from sync-core.

use crate::transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::time::Duration;
use sync_core::family::{DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_RESPONSE_TIMEOUT};
use sync_core::{
    DownloadStep, FileDownload, Incoming, ProtocolError, StatusMessageCorrelator, VerifiedPayload,
};
use sync_types::gfdi::FileTransferData;
use sync_types::{hex_dump, EndpointId, Frame, MessageType, StatusMessage, Timestamp, WireError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// GFDI channel errors.
#[derive(Debug, Error)]
pub enum GfdiError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Device answered out of protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No status arrived in time.
    #[error("timed out waiting for {0} status")]
    Timeout(MessageType),

    /// The device aborted a file transfer.
    #[error("transfer of file {file_index} aborted after {received} bytes")]
    Aborted {
        /// File being downloaded.
        file_index: u16,
        /// Bytes received before the abort.
        received: usize,
    },
}

/// Request/status exchanges and file downloads over one transport.
pub struct GfdiChannel<T: Transport> {
    transport: T,
    correlator: StatusMessageCorrelator,
    response_timeout: Duration,
    max_file_len: usize,
    unsolicited: VecDeque<Frame>,
}

impl<T: Transport> GfdiChannel<T> {
    /// Wrap a connected transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            correlator: StatusMessageCorrelator::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_file_len: DEFAULT_MAX_PAYLOAD_LEN,
            unsolicited: VecDeque::new(),
        }
    }

    /// Time to wait for each device frame.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Largest file size the device may announce.
    pub fn with_max_file_len(mut self, max_file_len: usize) -> Self {
        self.max_file_len = max_file_len;
        self
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Requests still waiting for a status.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_len()
    }

    /// Device-initiated messages received while waiting for statuses.
    pub fn take_unsolicited(&mut self) -> Vec<Frame> {
        self.unsolicited.drain(..).collect()
    }

    /// Send a request and wait for its status.
    ///
    /// Returns whatever status the device sent; use
    /// [`StatusMessage::can_proceed`] to tell success from refusal.
    pub async fn request(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<StatusMessage, GfdiError> {
        let raw = self.correlator.send(message_type, payload, Timestamp::now())?;
        if let Err(e) = self.transport.send(EndpointId::Control, &raw).await {
            self.correlator.clear();
            return Err(e.into());
        }

        loop {
            match self.next_incoming(message_type).await? {
                Incoming::Status {
                    status,
                    request: Some(request),
                } if request.message_type == message_type => {
                    debug!(%message_type, status = status.status.name(), "status received");
                    return Ok(status);
                }
                Incoming::Status { status, .. } => {
                    warn!(original = %status.original_type, "ignoring status for another request");
                }
                Incoming::Message(frame) => self.unsolicited.push_back(frame),
            }
        }
    }

    /// Download file `file_index` in full.
    pub async fn download_file(&mut self, file_index: u16) -> Result<VerifiedPayload, GfdiError> {
        let mut download = FileDownload::new(file_index).with_max_len(self.max_file_len);
        let status = self
            .request(MessageType::DownloadRequest, download.request().encode())
            .await?;
        if let Some(payload) = download.on_status(&status)? {
            return Ok(payload);
        }
        info!(file = file_index, "downloading");

        loop {
            let frame = match self.next_incoming(MessageType::FileTransferData).await? {
                Incoming::Message(frame) if frame.message_type == MessageType::FileTransferData => {
                    frame
                }
                Incoming::Message(frame) => {
                    self.unsolicited.push_back(frame);
                    continue;
                }
                Incoming::Status { status, .. } => {
                    warn!(original = %status.original_type, "ignoring status during download");
                    continue;
                }
            };

            let chunk = FileTransferData::decode(&frame.payload)?;
            let step = download.on_data(&chunk)?;
            let reply = self.correlator.reply(step.reply());
            self.transport.send(EndpointId::Control, &reply).await?;

            match step {
                DownloadStep::Continue(_) | DownloadStep::Rejected(_) => {}
                DownloadStep::Complete { payload, .. } => {
                    info!(file = file_index, bytes = payload.bytes.len(), "download complete");
                    return Ok(payload);
                }
                DownloadStep::Aborted(_) => {
                    return Err(GfdiError::Aborted {
                        file_index,
                        received: download.received(),
                    })
                }
            }
        }
    }

    async fn next_incoming(&mut self, waiting_for: MessageType) -> Result<Incoming, GfdiError> {
        let (_, raw) = match tokio::time::timeout(self.response_timeout, self.transport.recv()).await
        {
            Ok(result) => result?,
            Err(_) => {
                // One exchange at a time: whatever was pending is dead.
                self.correlator.clear();
                return Err(GfdiError::Timeout(waiting_for));
            }
        };
        match self.correlator.on_incoming(&raw) {
            Ok(incoming) => Ok(incoming),
            Err(e) => {
                warn!(frame = %hex_dump(&raw, 16), error = %e, "bad frame");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use sync_types::checksum::crc16;
    use sync_types::{DownloadStatus, Status, StatusDetail, TransferStatus};

    async fn channel() -> (GfdiChannel<MockTransport>, MockTransport) {
        let transport = MockTransport::new();
        transport.connect("garmin").await.unwrap();
        (GfdiChannel::new(transport.clone()), transport)
    }

    fn status(original: MessageType, status: Status, detail: StatusDetail) -> Vec<u8> {
        StatusMessage {
            original_type: original,
            status,
            detail,
        }
        .to_frame()
        .encode()
    }

    fn data_frame(file: &[u8], from: usize, to: usize) -> Vec<u8> {
        let chunk = FileTransferData {
            flags: 0,
            crc: crc16(&file[..to]),
            data_offset: from as u32,
            data: file[from..to].to_vec(),
        };
        Frame::new(MessageType::FileTransferData, chunk.encode()).encode()
    }

    fn transfer_replies(transport: &MockTransport) -> Vec<(TransferStatus, u32)> {
        transport
            .sent_messages()
            .iter()
            .filter_map(|(_, raw)| {
                let frame = Frame::decode(raw).ok()?;
                let status = StatusMessage::from_frame(&frame).ok()?;
                match status.detail {
                    StatusDetail::Transfer {
                        status,
                        data_offset,
                    } => Some((status, data_offset)),
                    _ => None,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn request_returns_matching_status() {
        let (mut channel, transport) = channel().await;
        transport.queue_response(
            EndpointId::Control,
            Frame::new(MessageType::CurrentTimeRequest, vec![1]).encode(),
        );
        transport.queue_response(
            EndpointId::Control,
            status(MessageType::Synchronization, Status::Ack, StatusDetail::Generic),
        );

        let reply = channel
            .request(MessageType::Synchronization, vec![0x01])
            .await
            .unwrap();
        assert!(reply.can_proceed());
        assert_eq!(channel.pending_requests(), 0);

        let unsolicited = channel.take_unsolicited();
        assert_eq!(unsolicited.len(), 1);
        assert_eq!(unsolicited[0].message_type, MessageType::CurrentTimeRequest);
    }

    #[tokio::test]
    async fn downloads_file_and_acks_every_chunk() {
        let (mut channel, transport) = channel().await;
        let file: Vec<u8> = (0..50).collect();
        transport.queue_response(
            EndpointId::Control,
            status(
                MessageType::DownloadRequest,
                Status::Ack,
                StatusDetail::Download {
                    status: DownloadStatus::Ok,
                    max_file_size: 50,
                },
            ),
        );
        transport.queue_response(EndpointId::Control, data_frame(&file, 0, 20));
        transport.queue_response(EndpointId::Control, data_frame(&file, 30, 50));
        transport.queue_response(EndpointId::Control, data_frame(&file, 20, 50));

        let payload = channel.download_file(7).await.unwrap();
        assert_eq!(payload.bytes, file);
        assert_eq!(
            transfer_replies(&transport),
            vec![
                (TransferStatus::Ok, 20),
                (TransferStatus::OffsetMismatch, 20),
                (TransferStatus::Ok, 50),
            ]
        );
    }

    #[tokio::test]
    async fn refused_download_is_a_protocol_error() {
        let (mut channel, transport) = channel().await;
        transport.queue_response(
            EndpointId::Control,
            status(
                MessageType::DownloadRequest,
                Status::Ack,
                StatusDetail::Download {
                    status: DownloadStatus::NoSpaceLeft,
                    max_file_size: 0,
                },
            ),
        );

        assert!(matches!(
            channel.download_file(1).await,
            Err(GfdiError::Protocol(ProtocolError::UnexpectedMessage(_)))
        ));
    }

    #[tokio::test]
    async fn oversized_announcement_is_refused() {
        let (channel, transport) = channel().await;
        let mut channel = channel.with_max_file_len(1024);
        transport.queue_response(
            EndpointId::Control,
            status(
                MessageType::DownloadRequest,
                Status::Ack,
                StatusDetail::Download {
                    status: DownloadStatus::Ok,
                    max_file_size: u32::MAX,
                },
            ),
        );

        assert!(matches!(
            channel.download_file(5).await,
            Err(GfdiError::Protocol(ProtocolError::PayloadTooLarge {
                declared: 4_294_967_295,
                max: 1024
            }))
        ));
        assert!(transfer_replies(&transport).is_empty());
    }

    #[tokio::test]
    async fn oversized_chunk_aborts_download() {
        let (mut channel, transport) = channel().await;
        let file = vec![7u8; 40];
        transport.queue_response(
            EndpointId::Control,
            status(
                MessageType::DownloadRequest,
                Status::Ack,
                StatusDetail::Download {
                    status: DownloadStatus::Ok,
                    max_file_size: 30,
                },
            ),
        );
        transport.queue_response(EndpointId::Control, data_frame(&file, 0, 40));

        assert!(matches!(
            channel.download_file(2).await,
            Err(GfdiError::Aborted {
                file_index: 2,
                received: 0
            })
        ));
        assert_eq!(transfer_replies(&transport), vec![(TransferStatus::Abort, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (channel, transport) = channel().await;
        let mut channel = channel.with_response_timeout(Duration::from_secs(2));
        transport.hang_when_empty(true);

        assert!(matches!(
            channel.request(MessageType::Synchronization, vec![]).await,
            Err(GfdiError::Timeout(MessageType::Synchronization))
        ));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn send_failure_clears_pending() {
        let (mut channel, transport) = channel().await;
        transport.fail_next_send("gatt write rejected");

        assert!(matches!(
            channel.request(MessageType::Synchronization, vec![]).await,
            Err(GfdiError::Transport(TransportError::WriteFailed { .. }))
        ));
        assert_eq!(channel.pending_requests(), 0);
    }
}
