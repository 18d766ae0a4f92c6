//! Huami / Zepp OS history fetch wire format.
//!
//! A fetch talks over two endpoints. The control endpoint carries commands
//! from the host and `0x10`-tagged responses from the device:
//!
//! ```text
//! host   -> [0x01, type, time(8)]              start date ("since T")
//! device <- [0x10, 0x01, st, len u32, time(8)] metadata
//! host   -> [0x02]                             fetch data
//! device <- [0x10, 0x02, st, (crc32 u32)]      transfer complete
//! host   -> [0x03, (flag)]                     ack (flag: 0x01 drop, 0x09 keep)
//! device <- [0x10, 0x03, ...]                  ack confirmed
//! ```
//!
//! The data endpoint carries chunks prefixed with a 1-byte running counter.
//! Time fields are device-local calendar values followed by the device's UTC
//! offset in quarter hours.

use crate::{Timestamp, WireError};
use chrono::{Datelike, FixedOffset, NaiveDate, TimeZone, Timelike};

/// Tag byte of every device response.
pub const RESPONSE: u8 = 0x10;
/// Status byte meaning the command succeeded.
pub const SUCCESS: u8 = 0x01;

/// Start-date command: "begin fetch since T".
pub const COMMAND_START_DATE: u8 = 0x01;
/// Fetch-data command: "start streaming".
pub const COMMAND_FETCH_DATA: u8 = 0x02;
/// Acknowledge-data command.
pub const COMMAND_ACK: u8 = 0x03;

/// Ack flag: data saved on the host, the device may drop it.
pub const ACK_DROP: u8 = 0x01;
/// Ack flag: the device must keep the data marked as not synced.
pub const ACK_KEEP: u8 = 0x09;

/// Fetch type for activity samples.
pub const FETCH_ACTIVITY: u8 = 0x01;
/// Fetch type for manually triggered heart rate measurements.
pub const FETCH_MANUAL_HEART_RATE: u8 = 0x02;
/// Fetch type for workout details including GPS tracks.
pub const FETCH_SPORTS_DETAILS: u8 = 0x06;
/// Fetch type for stress samples.
pub const FETCH_STRESS: u8 = 0x13;
/// Fetch type for SpO2 samples.
pub const FETCH_SPO2: u8 = 0x25;

/// Length of an encoded time field.
pub const TIME_LEN: usize = 8;

const START_RESPONSE_LEN: usize = 3 + 4 + TIME_LEN;

/// Decoded `0x10 0x01` start-date response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartResponse {
    /// Whether the device accepted the start date.
    pub success: bool,
    /// Payload bytes to expect, excluding the per-chunk counter bytes.
    pub expected_len: u32,
    /// Timestamp of the first sample the device will send.
    pub start: Timestamp,
}

/// Decoded `0x10 0x02` fetch-data response, sent after the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponse {
    /// Whether the transfer completed on the device side.
    pub success: bool,
    /// CRC-32 of the transferred payload (Zepp OS only).
    pub checksum: Option<u32>,
}

/// A decoded device response on the control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Metadata for the requested range.
    StartDate(StartResponse),
    /// End of transfer.
    FetchData(FetchResponse),
    /// The device processed the ack.
    AckConfirmed,
}

/// Encode `ts` as device-local calendar bytes.
///
/// Layout: `year u16le, month, day, hour, minute, 0x00, tz`. Seconds are
/// not sent; the device works at minute granularity.
pub fn encode_time(ts: Timestamp, tz_quarter_hours: i8) -> Result<[u8; TIME_LEN], WireError> {
    let local = to_local(ts, tz_quarter_hours)?;
    let year = u16::try_from(local.year())
        .map_err(|_| WireError::InvalidTimestamp(format!("year {} out of range", local.year())))?;
    let [lo, hi] = year.to_le_bytes();
    Ok([
        lo,
        hi,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        0x00,
        tz_quarter_hours as u8,
    ])
}

/// Decode device calendar bytes: `year u16le, month, day, hour, minute, second, [tz]`.
///
/// Without a tz byte the fields are taken as UTC.
pub fn decode_time(bytes: &[u8]) -> Result<Timestamp, WireError> {
    if bytes.len() < 7 {
        return Err(WireError::Truncated {
            needed: 7,
            got: bytes.len(),
        });
    }
    let year = i32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let tz = bytes.get(7).map(|&b| b as i8).unwrap_or(0);
    let naive = NaiveDate::from_ymd_opt(year, u32::from(bytes[2]), u32::from(bytes[3]))
        .and_then(|d| {
            d.and_hms_opt(
                u32::from(bytes[4]),
                u32::from(bytes[5]),
                u32::from(bytes[6]),
            )
        })
        .ok_or_else(|| WireError::InvalidTimestamp(crate::hex_dump(bytes, 8)))?;
    let offset = quarter_hour_offset(tz)?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| WireError::InvalidTimestamp(crate::hex_dump(bytes, 8)))?;
    Ok(Timestamp::from_millis(local.timestamp_millis()))
}

/// Build the start-date command for `fetch_type` since `since`.
pub fn encode_start_request(
    fetch_type: u8,
    since: Timestamp,
    tz_quarter_hours: i8,
) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(2 + TIME_LEN);
    out.push(COMMAND_START_DATE);
    out.push(fetch_type);
    out.extend_from_slice(&encode_time(since, tz_quarter_hours)?);
    Ok(out)
}

/// Build the fetch-data command.
pub fn encode_fetch_request() -> Vec<u8> {
    vec![COMMAND_FETCH_DATA]
}

/// Build the ack command.
///
/// `None` produces the classic single-byte ack; `Some(retain)` appends the
/// Zepp OS keep/drop flag.
pub fn encode_ack(retain: Option<bool>) -> Vec<u8> {
    match retain {
        None => vec![COMMAND_ACK],
        Some(true) => vec![COMMAND_ACK, ACK_KEEP],
        Some(false) => vec![COMMAND_ACK, ACK_DROP],
    }
}

/// Decode a control-endpoint response.
pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    if bytes.len() < 3 {
        return Err(WireError::Truncated {
            needed: 3,
            got: bytes.len(),
        });
    }
    if bytes[0] != RESPONSE {
        return Err(WireError::UnexpectedResponse(format!(
            "not a response: {}",
            crate::hex_dump(bytes, 16)
        )));
    }
    let success = bytes[2] == SUCCESS;
    match bytes[1] {
        COMMAND_START_DATE => decode_start_response(bytes, success),
        COMMAND_FETCH_DATA => decode_fetch_response(bytes, success),
        COMMAND_ACK => Ok(Response::AckConfirmed),
        other => Err(WireError::UnexpectedResponse(format!(
            "unknown command {:#04x}",
            other
        ))),
    }
}

fn decode_start_response(bytes: &[u8], success: bool) -> Result<Response, WireError> {
    if !success {
        return Ok(Response::StartDate(StartResponse {
            success,
            expected_len: 0,
            start: Timestamp::EPOCH,
        }));
    }
    // Some devices append a zero byte.
    let valid_len = bytes.len() == START_RESPONSE_LEN
        || (bytes.len() == START_RESPONSE_LEN + 1 && bytes[START_RESPONSE_LEN] == 0x00);
    if !valid_len {
        return Err(WireError::InvalidLength {
            declared: START_RESPONSE_LEN,
            actual: bytes.len(),
        });
    }
    let expected_len = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let start = decode_time(&bytes[7..START_RESPONSE_LEN])?;
    Ok(Response::StartDate(StartResponse {
        success,
        expected_len,
        start,
    }))
}

fn decode_fetch_response(bytes: &[u8], success: bool) -> Result<Response, WireError> {
    let checksum = match bytes.len() {
        3 => None,
        7 => Some(u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]])),
        n => {
            return Err(WireError::InvalidLength {
                declared: 7,
                actual: n,
            })
        }
    };
    Ok(Response::FetchData(FetchResponse { success, checksum }))
}

/// Split a data-endpoint chunk into its counter and payload.
pub fn split_data_chunk(bytes: &[u8]) -> Result<(u8, &[u8]), WireError> {
    match bytes.split_first() {
        Some((&counter, payload)) => Ok((counter, payload)),
        None => Err(WireError::Truncated { needed: 1, got: 0 }),
    }
}

// Device-side encoders, used by simulators and tests.

/// Encode a start-date response as a device would send it.
pub fn encode_start_response(
    success: bool,
    expected_len: u32,
    start: Timestamp,
    tz_quarter_hours: i8,
) -> Result<Vec<u8>, WireError> {
    let local = to_local(start, tz_quarter_hours)?;
    let year = u16::try_from(local.year())
        .map_err(|_| WireError::InvalidTimestamp(format!("year {} out of range", local.year())))?;
    let mut out = Vec::with_capacity(START_RESPONSE_LEN);
    out.extend_from_slice(&[RESPONSE, COMMAND_START_DATE, status_byte(success)]);
    out.extend_from_slice(&expected_len.to_le_bytes());
    out.extend_from_slice(&year.to_le_bytes());
    out.extend_from_slice(&[
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
        tz_quarter_hours as u8,
    ]);
    Ok(out)
}

/// Encode a fetch-data response as a device would send it.
pub fn encode_fetch_response(success: bool, checksum: Option<u32>) -> Vec<u8> {
    let mut out = vec![RESPONSE, COMMAND_FETCH_DATA, status_byte(success)];
    if let Some(crc) = checksum {
        out.extend_from_slice(&crc.to_le_bytes());
    }
    out
}

/// Encode the device's reply to an ack.
pub fn encode_ack_response() -> Vec<u8> {
    vec![RESPONSE, COMMAND_ACK, SUCCESS]
}

/// Prefix `payload` with a chunk counter.
pub fn encode_data_chunk(counter: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(counter);
    out.extend_from_slice(payload);
    out
}

fn status_byte(success: bool) -> u8 {
    if success {
        SUCCESS
    } else {
        0x02
    }
}

fn quarter_hour_offset(tz_quarter_hours: i8) -> Result<FixedOffset, WireError> {
    FixedOffset::east_opt(i32::from(tz_quarter_hours) * 15 * 60).ok_or_else(|| {
        WireError::InvalidTimestamp(format!("tz offset {} out of range", tz_quarter_hours))
    })
}

fn to_local(ts: Timestamp, tz_quarter_hours: i8) -> Result<chrono::DateTime<FixedOffset>, WireError> {
    let offset = quarter_hour_offset(tz_quarter_hours)?;
    ts.to_datetime()
        .map(|dt| dt.with_timezone(&offset))
        .ok_or_else(|| WireError::InvalidTimestamp(format!("{}ms out of range", ts.millis())))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14T22:13:20Z
    const T: i64 = 1_700_000_000;

    #[test]
    fn encode_time_utc() {
        let bytes = encode_time(Timestamp::from_secs(T), 0).unwrap();
        assert_eq!(bytes, [0xE7, 0x07, 11, 14, 22, 13, 0x00, 0x00]);
    }

    #[test]
    fn encode_time_with_offset_rolls_date() {
        // UTC+2 is 8 quarter hours; 22:13Z becomes 00:13 on the 15th.
        let bytes = encode_time(Timestamp::from_secs(T), 8).unwrap();
        assert_eq!(bytes, [0xE7, 0x07, 11, 15, 0, 13, 0x00, 8]);
    }

    #[test]
    fn decode_time_honors_tz_byte() {
        let utc = decode_time(&[0xE7, 0x07, 11, 14, 22, 13, 20]).unwrap();
        assert_eq!(utc, Timestamp::from_secs(T));

        let local = decode_time(&[0xE7, 0x07, 11, 15, 0, 13, 20, 8]).unwrap();
        assert_eq!(local, Timestamp::from_secs(T));
    }

    #[test]
    fn decode_time_rejects_bad_calendar() {
        assert!(matches!(
            decode_time(&[0xE7, 0x07, 13, 1, 0, 0, 0]),
            Err(WireError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            decode_time(&[0xE7, 0x07]),
            Err(WireError::Truncated { needed: 7, got: 2 })
        ));
    }

    #[test]
    fn start_request_layout() {
        let bytes = encode_start_request(FETCH_STRESS, Timestamp::from_secs(T), 0).unwrap();
        assert_eq!(bytes[..2], [COMMAND_START_DATE, FETCH_STRESS]);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn start_response_round_trip() {
        let start = Timestamp::from_secs(T);
        let frame = encode_start_response(true, 60, start, 4).unwrap();
        assert_eq!(frame.len(), 15);

        let decoded = decode_response(&frame).unwrap();
        assert_eq!(
            decoded,
            Response::StartDate(StartResponse {
                success: true,
                expected_len: 60,
                start,
            })
        );

        let mut padded = frame.clone();
        padded.push(0x00);
        assert_eq!(decode_response(&padded).unwrap(), decoded);

        let mut bad = frame;
        bad.push(0x07);
        assert!(matches!(
            decode_response(&bad),
            Err(WireError::InvalidLength { .. })
        ));
    }

    #[test]
    fn unsuccessful_start_response() {
        let decoded = decode_response(&[RESPONSE, COMMAND_START_DATE, 0x02]).unwrap();
        assert!(matches!(
            decoded,
            Response::StartDate(StartResponse { success: false, .. })
        ));
    }

    #[test]
    fn fetch_response_with_and_without_crc() {
        assert_eq!(
            decode_response(&encode_fetch_response(true, None)).unwrap(),
            Response::FetchData(FetchResponse {
                success: true,
                checksum: None
            })
        );
        assert_eq!(
            decode_response(&encode_fetch_response(true, Some(0xCBF4_3926))).unwrap(),
            Response::FetchData(FetchResponse {
                success: true,
                checksum: Some(0xCBF4_3926)
            })
        );
        assert!(decode_response(&[RESPONSE, COMMAND_FETCH_DATA, SUCCESS, 0]).is_err());
    }

    #[test]
    fn ack_encoding() {
        assert_eq!(encode_ack(None), vec![0x03]);
        assert_eq!(encode_ack(Some(true)), vec![0x03, 0x09]);
        assert_eq!(encode_ack(Some(false)), vec![0x03, 0x01]);
        assert_eq!(
            decode_response(&encode_ack_response()).unwrap(),
            Response::AckConfirmed
        );
    }

    #[test]
    fn rejects_non_response() {
        assert!(matches!(
            decode_response(&[0x01, 0x01, 0x01]),
            Err(WireError::UnexpectedResponse(_))
        ));
        assert!(matches!(
            decode_response(&[RESPONSE, 0x7F, SUCCESS]),
            Err(WireError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn data_chunk_counter() {
        let chunk = encode_data_chunk(7, &[1, 2, 3]);
        let (counter, payload) = split_data_chunk(&chunk).unwrap();
        assert_eq!(counter, 7);
        assert_eq!(payload, &[1, 2, 3]);
        assert!(split_data_chunk(&[]).is_err());
    }
}
