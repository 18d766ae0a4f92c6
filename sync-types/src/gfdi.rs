//! Garmin GFDI message framing.
//!
//! Every GFDI frame has the layout:
//!
//! ```text
//! [length u16le][message type u16le][payload ...][crc16 u16le]
//! ```
//!
//! `length` counts the whole frame, including itself and the trailing CRC.
//! The CRC covers everything before it.
//!
//! Devices may send the message type in a compact form: bit 15 set, bits
//! 14..8 carry a sequence number and the low byte is `type - 5000`.

use crate::checksum::crc16;
use crate::WireError;

/// Smallest possible frame: length, type and CRC with no payload.
pub const MIN_FRAME_LEN: usize = 6;

/// Largest payload whose frame length still fits in 16 bits.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - MIN_FRAME_LEN;

const COMPACT_FLAG: u16 = 0x8000;
const COMPACT_BASE: u16 = 5000;

/// GFDI message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Status reply to another message (5000).
    Response,
    /// Request to download a file from the device (5002).
    DownloadRequest,
    /// Request to upload a file to the device (5003).
    UploadRequest,
    /// One chunk of file data (5004).
    FileTransferData,
    /// Request to create a file on the device (5005).
    CreateFile,
    /// File listing filter (5007).
    Filter,
    /// Set flags on a device file (5008).
    SetFileFlag,
    /// Device information (5024).
    DeviceInformation,
    /// Device settings (5026).
    DeviceSettings,
    /// System event (5030).
    SystemEvent,
    /// Supported file types (5031).
    SupportedFileTypesRequest,
    /// Notification payload chunk (5035).
    NotificationData,
    /// Device asks the host to sync (5037).
    Synchronization,
    /// Protobuf request chunk (5043).
    ProtobufRequest,
    /// Protobuf response chunk (5044).
    ProtobufResponse,
    /// Capability configuration (5050).
    Configuration,
    /// Device asks for the current time (5052).
    CurrentTimeRequest,
    /// Any other message type, carried verbatim.
    Other(u16),
}

impl MessageType {
    /// Map a numeric id to a message type. Unknown ids become [`MessageType::Other`].
    pub fn from_u16(id: u16) -> Self {
        match id {
            5000 => MessageType::Response,
            5002 => MessageType::DownloadRequest,
            5003 => MessageType::UploadRequest,
            5004 => MessageType::FileTransferData,
            5005 => MessageType::CreateFile,
            5007 => MessageType::Filter,
            5008 => MessageType::SetFileFlag,
            5024 => MessageType::DeviceInformation,
            5026 => MessageType::DeviceSettings,
            5030 => MessageType::SystemEvent,
            5031 => MessageType::SupportedFileTypesRequest,
            5035 => MessageType::NotificationData,
            5037 => MessageType::Synchronization,
            5043 => MessageType::ProtobufRequest,
            5044 => MessageType::ProtobufResponse,
            5050 => MessageType::Configuration,
            5052 => MessageType::CurrentTimeRequest,
            other => MessageType::Other(other),
        }
    }

    /// Numeric id.
    pub fn as_u16(&self) -> u16 {
        match self {
            MessageType::Response => 5000,
            MessageType::DownloadRequest => 5002,
            MessageType::UploadRequest => 5003,
            MessageType::FileTransferData => 5004,
            MessageType::CreateFile => 5005,
            MessageType::Filter => 5007,
            MessageType::SetFileFlag => 5008,
            MessageType::DeviceInformation => 5024,
            MessageType::DeviceSettings => 5026,
            MessageType::SystemEvent => 5030,
            MessageType::SupportedFileTypesRequest => 5031,
            MessageType::NotificationData => 5035,
            MessageType::Synchronization => 5037,
            MessageType::ProtobufRequest => 5043,
            MessageType::ProtobufResponse => 5044,
            MessageType::Configuration => 5050,
            MessageType::CurrentTimeRequest => 5052,
            MessageType::Other(id) => *id,
        }
    }

    /// Decode a raw type field, expanding the compact form.
    ///
    /// Returns the message type and the sequence number if compact.
    pub fn decode_field(raw: u16) -> (Self, Option<u8>) {
        if raw & COMPACT_FLAG != 0 {
            let sequence = ((raw >> 8) & 0x7F) as u8;
            (Self::from_u16((raw & 0xFF) + COMPACT_BASE), Some(sequence))
        } else {
            (Self::from_u16(raw), None)
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Other(id) => write!(f, "Other({})", id),
            known => write!(f, "{:?}({})", known, known.as_u16()),
        }
    }
}

/// Outer status of a GFDI response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Accepted.
    Ack = 0,
    /// Rejected.
    Nak = 1,
    /// Message type not supported.
    Unsupported = 2,
    /// Payload could not be decoded.
    DecodeError = 3,
    /// Frame CRC did not match.
    CrcError = 4,
    /// Frame length did not match.
    LengthError = 5,
}

impl Status {
    /// Decode a status byte.
    pub fn from_u8(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(Status::Ack),
            1 => Ok(Status::Nak),
            2 => Ok(Status::Unsupported),
            3 => Ok(Status::DecodeError),
            4 => Ok(Status::CrcError),
            5 => Ok(Status::LengthError),
            code => Err(WireError::InvalidStatus {
                field: "status",
                code,
            }),
        }
    }

    /// Protocol name of the status.
    pub fn name(&self) -> &'static str {
        match self {
            Status::Ack => "ACK",
            Status::Nak => "NAK",
            Status::Unsupported => "UNSUPPORTED",
            Status::DecodeError => "DECODE_ERROR",
            Status::CrcError => "CRC_ERROR",
            Status::LengthError => "LENGTH_ERROR",
        }
    }
}

/// A framed GFDI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type.
    pub message_type: MessageType,
    /// Sequence number, present when the type was sent in compact form.
    pub sequence: Option<u8>,
    /// Message payload between the type field and the CRC.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with a plain (non-compact) type field.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            sequence: None,
            payload,
        }
    }

    /// Encode the frame including length and CRC.
    ///
    /// Fails with [`WireError::InvalidLength`] when the frame would not fit
    /// the 16-bit length field, i.e. payloads over [`MAX_PAYLOAD_LEN`] bytes.
    pub fn try_encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::InvalidLength {
                declared: usize::from(u16::MAX),
                actual: MIN_FRAME_LEN + self.payload.len(),
            });
        }
        Ok(self.encode())
    }

    /// Encode the frame including length and CRC.
    ///
    /// The payload must be at most [`MAX_PAYLOAD_LEN`] bytes; use
    /// [`Frame::try_encode`] for payloads of unchecked size.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "GFDI payload of {} bytes overflows the length field",
            self.payload.len()
        );
        let total = MIN_FRAME_LEN + self.payload.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u16).to_le_bytes());
        out.extend_from_slice(&self.type_field().to_le_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode and validate a complete frame.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(WireError::Truncated {
                needed: MIN_FRAME_LEN,
                got: raw.len(),
            });
        }
        let declared = usize::from(u16::from_le_bytes([raw[0], raw[1]]));
        if declared != raw.len() {
            return Err(WireError::InvalidLength {
                declared,
                actual: raw.len(),
            });
        }

        let (body, trailer) = raw.split_at(raw.len() - 2);
        let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
        let computed = crc16(body);
        if expected != computed {
            return Err(WireError::BadChecksum {
                expected: u32::from(expected),
                computed: u32::from(computed),
            });
        }

        let (message_type, sequence) =
            MessageType::decode_field(u16::from_le_bytes([raw[2], raw[3]]));
        Ok(Self {
            message_type,
            sequence,
            payload: body[4..].to_vec(),
        })
    }

    fn type_field(&self) -> u16 {
        let id = self.message_type.as_u16();
        match self.sequence {
            Some(seq) if (COMPACT_BASE..COMPACT_BASE + 0x100).contains(&id) => {
                COMPACT_FLAG | (u16::from(seq & 0x7F) << 8) | (id - COMPACT_BASE)
            }
            _ => id,
        }
    }
}

/// Payload of a FileTransferData (5004) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferData {
    /// Transfer flags.
    pub flags: u8,
    /// Running CRC-16 of the file up to and including this chunk.
    pub crc: u16,
    /// Offset of `data` within the file.
    pub data_offset: u32,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl FileTransferData {
    const HEADER_LEN: usize = 7;

    /// Encode to a message payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.data.len());
        out.push(self.flags);
        out.extend_from_slice(&self.crc.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode from a message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < Self::HEADER_LEN {
            return Err(WireError::Truncated {
                needed: Self::HEADER_LEN,
                got: payload.len(),
            });
        }
        Ok(Self {
            flags: payload[0],
            crc: u16::from_le_bytes([payload[1], payload[2]]),
            data_offset: u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]),
            data: payload[Self::HEADER_LEN..].to_vec(),
        })
    }
}

/// Whether a download starts over or continues at an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownloadRequestType {
    /// Continue a partial download.
    Continue = 0,
    /// Start a new download.
    New = 1,
}

/// Payload of a DownloadRequest (5002) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Index of the file on the device.
    pub file_index: u16,
    /// Offset to start from.
    pub data_offset: u32,
    /// New or continued download.
    pub request_type: DownloadRequestType,
    /// CRC seed matching the bytes already held.
    pub crc_seed: u16,
    /// Bytes requested; zero means the whole file.
    pub data_size: u32,
}

impl DownloadRequest {
    const LEN: usize = 13;

    /// Request the whole file from the start.
    pub fn new_file(file_index: u16) -> Self {
        Self {
            file_index,
            data_offset: 0,
            request_type: DownloadRequestType::New,
            crc_seed: 0,
            data_size: 0,
        }
    }

    /// Encode to a message payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.file_index.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.push(self.request_type as u8);
        out.extend_from_slice(&self.crc_seed.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out
    }

    /// Decode from a message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < Self::LEN {
            return Err(WireError::Truncated {
                needed: Self::LEN,
                got: payload.len(),
            });
        }
        let request_type = match payload[6] {
            0 => DownloadRequestType::Continue,
            1 => DownloadRequestType::New,
            code => {
                return Err(WireError::InvalidStatus {
                    field: "request_type",
                    code,
                })
            }
        };
        Ok(Self {
            file_index: u16::from_le_bytes([payload[0], payload[1]]),
            data_offset: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
            request_type,
            crc_seed: u16::from_le_bytes([payload[7], payload[8]]),
            data_size: u32::from_le_bytes([payload[9], payload[10], payload[11], payload[12]]),
        })
    }
}
