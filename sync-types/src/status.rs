//! GFDI status (RESPONSE) messages.
//!
//! A status message answers another message. Its payload is
//!
//! ```text
//! [original type u16le][status u8][type-specific fields ...]
//! ```
//!
//! where the trailing fields depend on the message being answered.

use crate::gfdi::{Frame, MessageType, Status};
use crate::WireError;

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $code ),+
        }

        impl $name {
            /// Decode a raw status byte.
            pub fn from_u8(code: u8) -> Result<Self, WireError> {
                match code {
                    $( $code => Ok($name::$variant), )+
                    code => Err(WireError::InvalidStatus { field: $field, code }),
                }
            }
        }
    };
}

status_enum! {
    /// Sub-status of a DownloadRequest reply.
    DownloadStatus, "download_status" {
        /// Download may begin.
        Ok = 0,
        /// No file at that index.
        IndexUnknown = 1,
        /// File exists but cannot be read.
        IndexNotReadable = 2,
        /// Device has no space to stage the file.
        NoSpaceLeft = 3,
        /// Request was malformed.
        Invalid = 4,
        /// Device is not ready.
        NotReady = 5,
        /// CRC seed did not match.
        CrcIncorrect = 6,
    }
}

status_enum! {
    /// Sub-status of an UploadRequest reply.
    UploadStatus, "upload_status" {
        /// Upload may begin.
        Ok = 0,
        /// No file at that index.
        IndexUnknown = 1,
        /// File cannot be written.
        IndexNotWritable = 2,
        /// Not enough space.
        NoSpaceLeft = 3,
        /// Request was malformed.
        Invalid = 4,
        /// Device is not ready.
        NotReady = 5,
        /// CRC seed did not match.
        CrcIncorrect = 6,
    }
}

status_enum! {
    /// Sub-status of a FileTransferData reply.
    TransferStatus, "transfer_status" {
        /// Chunk accepted.
        Ok = 0,
        /// Send the chunk again.
        Resend = 1,
        /// Abort the transfer.
        Abort = 2,
        /// Running CRC did not match.
        CrcMismatch = 3,
        /// Chunk offset did not match the bytes held.
        OffsetMismatch = 4,
        /// Transfer paused for sync.
        SyncPaused = 5,
    }
}

status_enum! {
    /// Sub-status of a CreateFile reply.
    CreateStatus, "create_status" {
        /// File created.
        Ok = 0,
        /// File already exists.
        Duplicate = 1,
        /// No space left.
        NoSpace = 2,
        /// File type not supported.
        Unsupported = 3,
        /// No free file slots.
        NoSlots = 4,
        /// No space left for this file type.
        NoSpaceForType = 5,
    }
}

status_enum! {
    /// Whether a protobuf chunk was kept.
    ProtobufChunkStatus, "protobuf_chunk_status" {
        /// Chunk kept.
        Kept = 0,
        /// Chunk discarded.
        Discarded = 1,
    }
}

status_enum! {
    /// Result code of a protobuf chunk.
    ProtobufStatusCode, "protobuf_status_code" {
        /// No error.
        NoError = 0,
        /// Request id not known to the receiver.
        UnknownRequestId = 100,
        /// Chunk already received.
        DuplicatePacket = 101,
        /// A previous chunk is missing.
        MissingPacket = 102,
        /// Chunk exceeds the announced total length.
        ExceededTotalProtobufLength = 103,
        /// Assembled protobuf did not parse.
        ProtobufParseError = 200,
        /// Protobuf message not understood.
        UnknownProtobufMessage = 201,
    }
}

status_enum! {
    /// Sub-status of a NotificationData reply.
    NotificationChunkStatus, "notification_chunk_status" {
        /// Chunk accepted.
        Ok = 0,
        /// Chunk rejected.
        Error = 1,
    }
}

/// Type-specific fields of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDetail {
    /// No extra fields.
    Generic,
    /// Reply to a DownloadRequest.
    Download {
        /// Sub-status.
        status: DownloadStatus,
        /// Size of the file about to be sent.
        max_file_size: u32,
    },
    /// Reply to an UploadRequest.
    Upload {
        /// Sub-status.
        status: UploadStatus,
        /// Offset the device expects next.
        data_offset: u32,
        /// Largest file the device accepts.
        max_file_size: u32,
        /// CRC seed for the upload.
        crc_seed: u16,
    },
    /// Reply to a FileTransferData chunk.
    Transfer {
        /// Sub-status.
        status: TransferStatus,
        /// Offset of the next expected byte.
        data_offset: u32,
    },
    /// Reply to a CreateFile request.
    CreateFile {
        /// Sub-status.
        status: CreateStatus,
        /// Index of the created file.
        file_index: u16,
        /// FIT data type.
        data_type: u8,
        /// FIT sub type.
        sub_type: u8,
        /// File number.
        file_number: u16,
    },
    /// Reply to a NotificationData chunk.
    Notification {
        /// Sub-status.
        status: NotificationChunkStatus,
    },
    /// Reply to a protobuf request or response chunk.
    Protobuf {
        /// Request the chunk belongs to.
        request_id: u16,
        /// Offset of the chunk.
        data_offset: u32,
        /// Whether the chunk was kept.
        chunk_status: ProtobufChunkStatus,
        /// Result code.
        status_code: ProtobufStatusCode,
    },
}

/// A decoded status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    /// Type of the message being answered.
    pub original_type: MessageType,
    /// Outer status.
    pub status: Status,
    /// Type-specific fields.
    pub detail: StatusDetail,
}

impl StatusMessage {
    /// Plain status with no type-specific fields.
    pub fn generic(original_type: MessageType, status: Status) -> Self {
        Self {
            original_type,
            status,
            detail: StatusDetail::Generic,
        }
    }

    /// Whether the answered operation may go on.
    ///
    /// Requires an outer ACK and a successful sub-status.
    pub fn can_proceed(&self) -> bool {
        if self.status != Status::Ack {
            return false;
        }
        match self.detail {
            StatusDetail::Generic => true,
            StatusDetail::Download { status, .. } => status == DownloadStatus::Ok,
            StatusDetail::Upload { status, .. } => status == UploadStatus::Ok,
            StatusDetail::Transfer { status, .. } => status == TransferStatus::Ok,
            StatusDetail::CreateFile { status, .. } => status == CreateStatus::Ok,
            StatusDetail::Notification { status } => status == NotificationChunkStatus::Ok,
            StatusDetail::Protobuf {
                chunk_status,
                status_code,
                ..
            } => {
                chunk_status == ProtobufChunkStatus::Kept
                    && status_code == ProtobufStatusCode::NoError
            }
        }
    }

    /// Decode the payload of a RESPONSE frame.
    ///
    /// A status with no trailing bytes decodes as [`StatusDetail::Generic`]
    /// whatever the original type; devices often omit the fields when refusing.
    /// Once any trailing byte is present the type-specific fields must be complete.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let original_type = MessageType::from_u16(r.u16()?);
        let status = Status::from_u8(r.u8()?)?;

        if r.is_empty() {
            return Ok(Self::generic(original_type, status));
        }

        let detail = match original_type {
            MessageType::DownloadRequest => StatusDetail::Download {
                status: DownloadStatus::from_u8(r.u8()?)?,
                max_file_size: r.u32()?,
            },
            MessageType::UploadRequest => StatusDetail::Upload {
                status: UploadStatus::from_u8(r.u8()?)?,
                data_offset: r.u32()?,
                max_file_size: r.u32()?,
                crc_seed: r.u16()?,
            },
            MessageType::FileTransferData => StatusDetail::Transfer {
                status: TransferStatus::from_u8(r.u8()?)?,
                data_offset: r.u32()?,
            },
            MessageType::CreateFile => StatusDetail::CreateFile {
                status: CreateStatus::from_u8(r.u8()?)?,
                file_index: r.u16()?,
                data_type: r.u8()?,
                sub_type: r.u8()?,
                file_number: r.u16()?,
            },
            MessageType::NotificationData => StatusDetail::Notification {
                status: NotificationChunkStatus::from_u8(r.u8()?)?,
            },
            MessageType::ProtobufRequest | MessageType::ProtobufResponse => {
                StatusDetail::Protobuf {
                    request_id: r.u16()?,
                    data_offset: r.u32()?,
                    chunk_status: ProtobufChunkStatus::from_u8(r.u8()?)?,
                    status_code: ProtobufStatusCode::from_u8(r.u8()?)?,
                }
            }
            _ => StatusDetail::Generic,
        };

        Ok(Self {
            original_type,
            status,
            detail,
        })
    }

    /// Decode a frame that must be a RESPONSE.
    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        if frame.message_type != MessageType::Response {
            return Err(WireError::UnexpectedResponse(format!(
                "expected Response, got {}",
                frame.message_type
            )));
        }
        Self::decode(&frame.payload)
    }

    /// Encode the RESPONSE payload. Inverse of [`StatusMessage::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.original_type.as_u16().to_le_bytes());
        out.push(self.status as u8);
        match self.detail {
            StatusDetail::Generic => {}
            StatusDetail::Download {
                status,
                max_file_size,
            } => {
                out.push(status as u8);
                out.extend_from_slice(&max_file_size.to_le_bytes());
            }
            StatusDetail::Upload {
                status,
                data_offset,
                max_file_size,
                crc_seed,
            } => {
                out.push(status as u8);
                out.extend_from_slice(&data_offset.to_le_bytes());
                out.extend_from_slice(&max_file_size.to_le_bytes());
                out.extend_from_slice(&crc_seed.to_le_bytes());
            }
            StatusDetail::Transfer {
                status,
                data_offset,
            } => {
                out.push(status as u8);
                out.extend_from_slice(&data_offset.to_le_bytes());
            }
            StatusDetail::CreateFile {
                status,
                file_index,
                data_type,
                sub_type,
                file_number,
            } => {
                out.push(status as u8);
                out.extend_from_slice(&file_index.to_le_bytes());
                out.push(data_type);
                out.push(sub_type);
                out.extend_from_slice(&file_number.to_le_bytes());
            }
            StatusDetail::Notification { status } => out.push(status as u8),
            StatusDetail::Protobuf {
                request_id,
                data_offset,
                chunk_status,
                status_code,
            } => {
                out.extend_from_slice(&request_id.to_le_bytes());
                out.extend_from_slice(&data_offset.to_le_bytes());
                out.push(chunk_status as u8);
                out.push(status_code as u8);
            }
        }
        out
    }

    /// Wrap the encoded payload in a RESPONSE frame.
    pub fn to_frame(&self) -> Frame {
        Frame::new(MessageType::Response, self.encode())
    }
}

/// Little-endian cursor over a status payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated {
            needed: end,
            got: self.buf.len(),
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take()?))
    }
}
