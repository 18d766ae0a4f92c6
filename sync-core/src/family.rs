//! Device family codecs and capabilities.
//!
//! The engine is generic over device families. A family is described by
//! [`FamilyCapabilities`] (what the protocol can do) and a [`FamilyCodec`]
//! (how its control and data frames look on the wire). All byte-level
//! dispatch lives in the codec's decode step, which produces a typed
//! [`ControlMessage`] before the round state machine sees anything.

use crate::{MismatchPolicy, OverflowPolicy, ProtocolError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_types::checksum::ChecksumKind;
use sync_types::huami::{self, Response};
use sync_types::{DataKind, Timestamp, WireError};

/// Default cap on rounds per data kind.
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Default minimum time a round must cover for another round to follow.
pub const DEFAULT_MIN_ROUND_PROGRESS: Duration = Duration::from_secs(1);

/// Default time to wait for the next device event.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on a declared payload length (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// What a device family's fetch protocol supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyCapabilities {
    /// Data chunks carry a leading 1-byte counter.
    pub chunk_counter_present: bool,

    /// Checksum protecting the reassembled payload.
    pub checksum_kind: ChecksumKind,

    /// The checksum is the payload's trailing bytes and the payload is
    /// complete once the declared length arrives. When false, the device
    /// ends the transfer with a control message that may carry the checksum.
    pub checksum_embedded: bool,

    /// What to do when the checksum fails.
    pub mismatch_policy: MismatchPolicy,

    /// What to do when more bytes arrive than were declared.
    pub overflow_policy: OverflowPolicy,

    /// The ack can tell the device to keep or drop the data.
    pub supports_retain_flag: bool,

    /// The device confirms acks and the round waits for it.
    pub ack_confirmation: bool,

    /// Ask the device to keep data even after a successful round.
    pub keep_data_on_device: bool,

    /// Cap on rounds per data kind, retries included.
    pub max_rounds: u32,

    /// Minimum time a round must cover for another round to follow.
    #[serde(rename = "min_round_progress_ms", with = "duration_ms")]
    pub min_round_progress: Duration,

    /// Time to wait for the next device event before aborting.
    #[serde(rename = "response_timeout_ms", with = "duration_ms")]
    pub response_timeout: Duration,

    /// Largest payload a device may declare. Larger declarations abort the
    /// round as a protocol violation.
    pub max_payload_len: usize,
}

impl FamilyCapabilities {
    /// Classic Huami (Mi Band 2 era): counters, no checksum, plain ack.
    pub fn huami() -> Self {
        Self {
            chunk_counter_present: true,
            checksum_kind: ChecksumKind::None,
            checksum_embedded: false,
            mismatch_policy: MismatchPolicy::Abort,
            overflow_policy: OverflowPolicy::Reject,
            supports_retain_flag: false,
            ack_confirmation: true,
            keep_data_on_device: false,
            max_rounds: DEFAULT_MAX_ROUNDS,
            min_round_progress: DEFAULT_MIN_ROUND_PROGRESS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }

    /// Zepp OS: counters, CRC-32 in the end-of-transfer message, keep/drop ack.
    pub fn zepp_os() -> Self {
        Self {
            checksum_kind: ChecksumKind::Crc32,
            mismatch_policy: MismatchPolicy::RetainOnDevice,
            supports_retain_flag: true,
            ..Self::huami()
        }
    }
}

impl Default for FamilyCapabilities {
    fn default() -> Self {
        Self::zepp_os()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A data chunk split into its counter and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Running counter, for families that send one.
    pub sequence: Option<u8>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// A decoded control-endpoint message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// How much data the device will send and from when.
    Metadata {
        /// Device accepted the request.
        success: bool,
        /// Payload bytes to expect.
        expected_len: u32,
        /// Timestamp of the first sample.
        start: Timestamp,
    },
    /// The device finished sending.
    TransferComplete {
        /// Device-side success.
        success: bool,
        /// Checksum of the payload, if the family sends one here.
        checksum: Option<u32>,
    },
    /// The device processed our ack.
    AckConfirmed,
    /// Not a fetch response; ignored by the round.
    Unrecognized(Vec<u8>),
}

/// Wire encoding of one device family's fetch protocol.
pub trait FamilyCodec: Send + Sync {
    /// Short family name for logs.
    fn name(&self) -> &'static str;

    /// Protocol capabilities.
    fn capabilities(&self) -> &FamilyCapabilities;

    /// Whether the family can fetch `kind`.
    fn supports(&self, kind: DataKind) -> bool;

    /// "Begin fetch of `kind` since `since`".
    fn encode_start(&self, kind: DataKind, since: Timestamp) -> Result<Vec<u8>, ProtocolError>;

    /// "Start streaming".
    fn encode_stream_request(&self) -> Vec<u8>;

    /// Ack; `retain` is encoded only if the family supports the flag.
    fn encode_ack(&self, retain: bool) -> Vec<u8>;

    /// Decode a control-endpoint frame.
    fn decode_control(&self, bytes: &[u8]) -> Result<ControlMessage, WireError>;

    /// Split a data-endpoint frame.
    fn split_chunk(&self, bytes: &[u8]) -> Result<Chunk, WireError>;
}

/// Huami and Zepp OS history fetch.
#[derive(Debug, Clone)]
pub struct HuamiCodec {
    capabilities: FamilyCapabilities,
    zepp_os: bool,
    tz_quarter_hours: i8,
}

impl HuamiCodec {
    /// Classic Huami devices.
    pub fn classic() -> Self {
        Self {
            capabilities: FamilyCapabilities::huami(),
            zepp_os: false,
            tz_quarter_hours: 0,
        }
    }

    /// Zepp OS devices.
    pub fn zepp_os() -> Self {
        Self {
            capabilities: FamilyCapabilities::zepp_os(),
            zepp_os: true,
            tz_quarter_hours: 0,
        }
    }

    /// Replace the capabilities, e.g. with config overrides.
    pub fn with_capabilities(mut self, capabilities: FamilyCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Device UTC offset in quarter hours, used for start-date requests.
    pub fn with_tz_quarter_hours(mut self, tz_quarter_hours: i8) -> Self {
        self.tz_quarter_hours = tz_quarter_hours;
        self
    }

    /// Whether this codec speaks the Zepp OS dialect.
    pub fn is_zepp_os(&self) -> bool {
        self.zepp_os
    }

    /// Fetch-type byte for `kind`.
    pub fn fetch_type(&self, kind: DataKind) -> Option<u8> {
        match kind {
            DataKind::Activity => Some(huami::FETCH_ACTIVITY),
            DataKind::GpsTrack => Some(huami::FETCH_SPORTS_DETAILS),
            DataKind::HeartRate if self.zepp_os => Some(huami::FETCH_MANUAL_HEART_RATE),
            DataKind::Stress if self.zepp_os => Some(huami::FETCH_STRESS),
            DataKind::Spo2 if self.zepp_os => Some(huami::FETCH_SPO2),
            _ => None,
        }
    }
}

impl FamilyCodec for HuamiCodec {
    fn name(&self) -> &'static str {
        if self.zepp_os {
            "zepp-os"
        } else {
            "huami"
        }
    }

    fn capabilities(&self) -> &FamilyCapabilities {
        &self.capabilities
    }

    fn supports(&self, kind: DataKind) -> bool {
        self.fetch_type(kind).is_some()
    }

    fn encode_start(&self, kind: DataKind, since: Timestamp) -> Result<Vec<u8>, ProtocolError> {
        let fetch_type = self.fetch_type(kind).ok_or_else(|| {
            ProtocolError::UnexpectedMessage(format!("{} cannot fetch {}", self.name(), kind))
        })?;
        Ok(huami::encode_start_request(
            fetch_type,
            since,
            self.tz_quarter_hours,
        )?)
    }

    fn encode_stream_request(&self) -> Vec<u8> {
        huami::encode_fetch_request()
    }

    fn encode_ack(&self, retain: bool) -> Vec<u8> {
        if self.capabilities.supports_retain_flag {
            huami::encode_ack(Some(retain))
        } else {
            huami::encode_ack(None)
        }
    }

    fn decode_control(&self, bytes: &[u8]) -> Result<ControlMessage, WireError> {
        match huami::decode_response(bytes) {
            Ok(Response::StartDate(r)) => Ok(ControlMessage::Metadata {
                success: r.success,
                expected_len: r.expected_len,
                start: r.start,
            }),
            Ok(Response::FetchData(r)) => Ok(ControlMessage::TransferComplete {
                success: r.success,
                checksum: r.checksum,
            }),
            Ok(Response::AckConfirmed) => Ok(ControlMessage::AckConfirmed),
            Err(WireError::UnexpectedResponse(_)) => Ok(ControlMessage::Unrecognized(bytes.to_vec())),
            Err(e) => Err(e),
        }
    }

    fn split_chunk(&self, bytes: &[u8]) -> Result<Chunk, WireError> {
        if self.capabilities.chunk_counter_present {
            let (counter, payload) = huami::split_data_chunk(bytes)?;
            Ok(Chunk {
                sequence: Some(counter),
                payload: payload.to_vec(),
            })
        } else {
            Ok(Chunk {
                sequence: None,
                payload: bytes.to_vec(),
            })
        }
    }
}
