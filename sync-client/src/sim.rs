//! Simulated Huami / Zepp OS device.
//!
//! Holds per-minute history for a few fetch types and answers the fetch
//! protocol the way a band does: start-date responses, counted data chunks,
//! an end-of-transfer response (with CRC-32 on Zepp OS) and ack handling
//! that drops or keeps the acknowledged records. Plugged into a
//! [`MockTransport`] through its responder, it drives full sessions in
//! tests and in the CLI's dry run.

use crate::transport::{MockTransport, Responder};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_types::checksum::crc32;
use sync_types::huami::{self, TIME_LEN};
use sync_types::{hex_dump, EndpointId, Timestamp, WireError};
use tracing::{debug, warn};

/// Default payload bytes per data notification (a 23-byte ATT MTU minus
/// the write header and the chunk counter).
pub const DEFAULT_CHUNK_LEN: usize = 19;

#[derive(Debug, Clone)]
struct History {
    start: Timestamp,
    interval: Duration,
    records: Vec<Vec<u8>>,
}

impl History {
    fn timestamp_of(&self, index: usize) -> Timestamp {
        self.start.saturating_add(self.interval * index as u32)
    }

    fn first_at_or_after(&self, since: Timestamp) -> usize {
        (0..self.records.len())
            .find(|&i| self.timestamp_of(i) >= since)
            .unwrap_or(self.records.len())
    }
}

#[derive(Debug, Clone)]
struct Transfer {
    fetch_type: u8,
    first: usize,
    count: usize,
}

#[derive(Debug)]
struct DeviceState {
    zepp_os: bool,
    tz_quarter_hours: i8,
    chunk_len: usize,
    max_records_per_round: usize,
    histories: BTreeMap<u8, History>,
    transfer: Option<Transfer>,
    acks: Vec<Vec<u8>>,
    corrupt_next_checksum: bool,
    skip_next_counter: bool,
    silent: bool,
}

/// A scripted band.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// A classic Huami band: no checksum, plain ack.
    pub fn classic() -> Self {
        Self::new(false)
    }

    /// A Zepp OS band: CRC-32 in the fetch response, keep/drop ack.
    pub fn zepp_os() -> Self {
        Self::new(true)
    }

    fn new(zepp_os: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                zepp_os,
                tz_quarter_hours: 0,
                chunk_len: DEFAULT_CHUNK_LEN,
                max_records_per_round: usize::MAX,
                histories: BTreeMap::new(),
                transfer: None,
                acks: Vec::new(),
                corrupt_next_checksum: false,
                skip_next_counter: false,
                silent: false,
            })),
        }
    }

    /// Store per-minute `records` for `fetch_type`, the first one at `start`.
    pub fn with_history(self, fetch_type: u8, start: Timestamp, records: Vec<Vec<u8>>) -> Self {
        self.state.lock().unwrap().histories.insert(
            fetch_type,
            History {
                start,
                interval: Duration::from_secs(60),
                records,
            },
        );
        self
    }

    /// Payload bytes per data notification.
    pub fn with_chunk_len(self, chunk_len: usize) -> Self {
        self.state.lock().unwrap().chunk_len = chunk_len.max(1);
        self
    }

    /// Cap the records sent per round, forcing follow-up rounds.
    pub fn with_max_records_per_round(self, max: usize) -> Self {
        self.state.lock().unwrap().max_records_per_round = max.max(1);
        self
    }

    /// Device UTC offset in quarter hours.
    pub fn with_tz_quarter_hours(self, tz_quarter_hours: i8) -> Self {
        self.state.lock().unwrap().tz_quarter_hours = tz_quarter_hours;
        self
    }

    /// Send a wrong CRC with the next transfer.
    pub fn corrupt_next_checksum(&self) {
        self.state.lock().unwrap().corrupt_next_checksum = true;
    }

    /// Skip one chunk counter in the next transfer.
    pub fn skip_next_counter(&self) {
        self.state.lock().unwrap().skip_next_counter = true;
    }

    /// Stop answering writes.
    pub fn go_silent(&self) {
        self.state.lock().unwrap().silent = true;
    }

    /// Records still held for `fetch_type`.
    pub fn remaining(&self, fetch_type: u8) -> usize {
        let state = self.state.lock().unwrap();
        state.histories.get(&fetch_type).map_or(0, |h| h.records.len())
    }

    /// Ack commands received so far.
    pub fn acks(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().acks.clone()
    }

    /// Responder for a [`MockTransport`].
    pub fn responder(&self) -> Responder {
        let device = self.clone();
        Arc::new(move |endpoint: EndpointId, data: &[u8]| device.handle(endpoint, data))
    }

    /// A connected-on-demand mock transport backed by this device.
    pub fn transport(&self) -> MockTransport {
        MockTransport::with_responder(self.responder())
    }

    /// Answer one write.
    pub fn handle(&self, endpoint: EndpointId, data: &[u8]) -> Vec<(EndpointId, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        if state.silent || endpoint != EndpointId::Control {
            return Vec::new();
        }
        let result = match data.first() {
            Some(&huami::COMMAND_START_DATE) => state.on_start(data),
            Some(&huami::COMMAND_FETCH_DATA) => state.on_fetch(),
            Some(&huami::COMMAND_ACK) => Ok(state.on_ack(data)),
            _ => {
                warn!(command = %hex_dump(data, 16), "simulated device ignoring unknown command");
                Ok(Vec::new())
            }
        };
        result.unwrap_or_else(|e| {
            warn!(error = %e, "simulated device failed to answer");
            Vec::new()
        })
    }
}

impl DeviceState {
    fn on_start(&mut self, data: &[u8]) -> Result<Vec<(EndpointId, Vec<u8>)>, WireError> {
        if data.len() < 2 + TIME_LEN {
            return Err(WireError::Truncated {
                needed: 2 + TIME_LEN,
                got: data.len(),
            });
        }
        let fetch_type = data[1];
        let since = huami::decode_time(&data[2..2 + TIME_LEN])?;

        let Some(history) = self.histories.get(&fetch_type) else {
            debug!(fetch_type, "simulated device has no such history");
            let refused = huami::encode_start_response(false, 0, since, self.tz_quarter_hours)?;
            return Ok(vec![(EndpointId::Control, refused)]);
        };

        let first = history.first_at_or_after(since);
        let count = (history.records.len() - first).min(self.max_records_per_round);
        let len: usize = history.records[first..first + count].iter().map(Vec::len).sum();
        let start = if count == 0 {
            since
        } else {
            history.timestamp_of(first)
        };
        debug!(fetch_type, %since, records = count, bytes = len, "simulated device starting transfer");

        self.transfer = Some(Transfer {
            fetch_type,
            first,
            count,
        });
        let response =
            huami::encode_start_response(true, len as u32, start, self.tz_quarter_hours)?;
        Ok(vec![(EndpointId::Control, response)])
    }

    fn on_fetch(&mut self) -> Result<Vec<(EndpointId, Vec<u8>)>, WireError> {
        let Some(transfer) = self.transfer.clone() else {
            return Ok(vec![(
                EndpointId::Control,
                huami::encode_fetch_response(false, None),
            )]);
        };
        let payload: Vec<u8> = self
            .histories
            .get(&transfer.fetch_type)
            .map(|h| h.records[transfer.first..transfer.first + transfer.count].concat())
            .unwrap_or_default();

        let mut out = Vec::new();
        let mut counter: u8 = 0;
        for chunk in payload.chunks(self.chunk_len) {
            if std::mem::take(&mut self.skip_next_counter) {
                counter = counter.wrapping_add(1);
            }
            out.push((EndpointId::Data, huami::encode_data_chunk(counter, chunk)));
            counter = counter.wrapping_add(1);
        }

        let checksum = if self.zepp_os {
            let crc = crc32(&payload);
            Some(if std::mem::take(&mut self.corrupt_next_checksum) {
                crc ^ 0xFFFF_FFFF
            } else {
                crc
            })
        } else {
            None
        };
        out.push((EndpointId::Control, huami::encode_fetch_response(true, checksum)));
        Ok(out)
    }

    fn on_ack(&mut self, data: &[u8]) -> Vec<(EndpointId, Vec<u8>)> {
        self.acks.push(data.to_vec());
        let keep = data.get(1) == Some(&huami::ACK_KEEP);

        if let Some(transfer) = self.transfer.take() {
            if !keep {
                if let Some(history) = self.histories.get_mut(&transfer.fetch_type) {
                    // Only whole prefixes are ever acknowledged.
                    let end = (transfer.first + transfer.count).min(history.records.len());
                    history.records.drain(..end);
                    history.start = history.timestamp_of(end);
                    debug!(fetch_type = transfer.fetch_type, dropped = end, "simulated device dropped records");
                }
            }
        }
        vec![(EndpointId::Control, huami::encode_ack_response())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: Timestamp = Timestamp::from_secs(1_700_000_040);

    fn device() -> SimulatedDevice {
        SimulatedDevice::zepp_os().with_history(
            huami::FETCH_ACTIVITY,
            START,
            vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10, 11, 12]],
        )
    }

    fn start_request(fetch_type: u8, since: Timestamp) -> Vec<u8> {
        huami::encode_start_request(fetch_type, since, 0).unwrap()
    }

    #[test]
    fn answers_start_with_length_and_first_timestamp() {
        let device = device();
        let replies = device.handle(
            EndpointId::Control,
            &start_request(huami::FETCH_ACTIVITY, Timestamp::from_secs(1_699_000_000)),
        );
        match huami::decode_response(&replies[0].1).unwrap() {
            huami::Response::StartDate(r) => {
                assert!(r.success);
                assert_eq!(r.expected_len, 12);
                assert_eq!(r.start, START);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn streams_counted_chunks_and_crc() {
        let device = device().with_chunk_len(5);
        device.handle(
            EndpointId::Control,
            &start_request(huami::FETCH_ACTIVITY, Timestamp::EPOCH),
        );
        let replies = device.handle(EndpointId::Control, &huami::encode_fetch_request());

        let data: Vec<_> = replies
            .iter()
            .filter(|(e, _)| *e == EndpointId::Data)
            .map(|(_, b)| b.clone())
            .collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0][0], 0);
        assert_eq!(data[2][0], 2);

        let payload: Vec<u8> = (1..=12).collect();
        let (_, last) = replies.last().unwrap();
        assert_eq!(*last, huami::encode_fetch_response(true, Some(crc32(&payload))));
    }

    #[test]
    fn drop_ack_removes_records_and_keep_does_not() {
        let device = device().with_max_records_per_round(2);
        device.handle(
            EndpointId::Control,
            &start_request(huami::FETCH_ACTIVITY, Timestamp::EPOCH),
        );
        device.handle(EndpointId::Control, &huami::encode_ack(Some(true)));
        assert_eq!(device.remaining(huami::FETCH_ACTIVITY), 3);

        device.handle(
            EndpointId::Control,
            &start_request(huami::FETCH_ACTIVITY, Timestamp::EPOCH),
        );
        let replies = device.handle(EndpointId::Control, &huami::encode_ack(Some(false)));
        assert_eq!(replies[0].1, huami::encode_ack_response());
        assert_eq!(device.remaining(huami::FETCH_ACTIVITY), 1);
        assert_eq!(device.acks().len(), 2);
    }

    #[test]
    fn unknown_fetch_type_is_refused() {
        let replies = device().handle(
            EndpointId::Control,
            &start_request(huami::FETCH_SPO2, Timestamp::EPOCH),
        );
        match huami::decode_response(&replies[0].1).unwrap() {
            huami::Response::StartDate(r) => assert!(!r.success),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn silent_device_answers_nothing() {
        let device = device();
        device.go_silent();
        assert!(device
            .handle(EndpointId::Control, &huami::encode_fetch_request())
            .is_empty());
    }
}
