//! Fixed-interval sample decoder.
//!
//! Most per-minute history formats are a flat array of equally sized
//! records, one per interval, starting at the round's start timestamp.
//! [`FixedIntervalDecoder`] slices payloads that way and keeps the raw
//! records; richer per-kind parsing can sit on top of [`RawSample`].

use std::collections::BTreeMap;
use std::time::Duration;
use sync_core::{DecodeError, DecodedPayload, SampleDecoder, VerifiedPayload};
use sync_types::{DataKind, Timestamp};
use tracing::debug;

/// Size and spacing of the records of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    /// Bytes per record.
    pub record_len: usize,
    /// Time between consecutive records.
    pub interval: Duration,
}

impl SampleLayout {
    /// One `record_len`-byte record per minute.
    pub const fn per_minute(record_len: usize) -> Self {
        Self {
            record_len,
            interval: Duration::from_secs(60),
        }
    }
}

/// One undecoded record with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    /// Kind the record belongs to.
    pub kind: DataKind,
    /// Time of the record.
    pub timestamp: Timestamp,
    /// Record bytes.
    pub bytes: Vec<u8>,
}

/// Slices payloads into fixed-size records and collects them.
#[derive(Debug, Clone)]
pub struct FixedIntervalDecoder {
    layouts: BTreeMap<DataKind, SampleLayout>,
    samples: Vec<RawSample>,
}

impl Default for FixedIntervalDecoder {
    /// Per-minute layouts for the kinds the Huami family streams as flat
    /// arrays: 4-byte activity records (kind, intensity, steps, heart rate)
    /// and 1-byte heart rate, stress and SpO2 values.
    fn default() -> Self {
        Self::empty()
            .with_layout(DataKind::Activity, SampleLayout::per_minute(4))
            .with_layout(DataKind::HeartRate, SampleLayout::per_minute(1))
            .with_layout(DataKind::Stress, SampleLayout::per_minute(1))
            .with_layout(DataKind::Spo2, SampleLayout::per_minute(1))
    }
}

impl FixedIntervalDecoder {
    /// Decoder with the default layouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that knows no kinds.
    pub fn empty() -> Self {
        Self {
            layouts: BTreeMap::new(),
            samples: Vec::new(),
        }
    }

    /// Set the layout for `kind`.
    pub fn with_layout(mut self, kind: DataKind, layout: SampleLayout) -> Self {
        self.layouts.insert(kind, layout);
        self
    }

    /// Layout for `kind`, if known.
    pub fn layout(&self, kind: DataKind) -> Option<SampleLayout> {
        self.layouts.get(&kind).copied()
    }

    /// Records decoded so far.
    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }

    /// Take the decoded records, leaving the decoder empty.
    pub fn take_samples(&mut self) -> Vec<RawSample> {
        std::mem::take(&mut self.samples)
    }
}

impl SampleDecoder for FixedIntervalDecoder {
    fn decode(
        &mut self,
        kind: DataKind,
        payload: &VerifiedPayload,
        start: Timestamp,
    ) -> Result<DecodedPayload, DecodeError> {
        let layout = self.layout(kind).ok_or(DecodeError::UnsupportedKind(kind))?;
        if layout.record_len == 0 {
            return Err(DecodeError::Invalid(format!("zero-length records for {}", kind)));
        }

        let len = payload.bytes.len();
        if len % layout.record_len != 0 {
            return Err(DecodeError::Misaligned {
                len,
                record_len: layout.record_len,
            });
        }

        let mut timestamp = start;
        for record in payload.bytes.chunks_exact(layout.record_len) {
            self.samples.push(RawSample {
                kind,
                timestamp,
                bytes: record.to_vec(),
            });
            timestamp = timestamp.saturating_add(layout.interval);
        }

        let samples = len / layout.record_len;
        let span = layout.interval * samples as u32;
        debug!(%kind, samples, ?span, "decoded records");
        Ok(DecodedPayload { samples, span })
    }
}
