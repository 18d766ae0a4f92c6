//! Per-kind sync watermarks.
//!
//! A watermark is the timestamp up to which a data kind is confirmed
//! synced. It only ever moves forward.

use std::collections::BTreeMap;
use std::path::PathBuf;
use sync_types::{DataKind, Timestamp};
use thiserror::Error;

/// Errors from a watermark store.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// Reading persisted state failed
    #[error("failed to read watermarks from {path}: {source}")]
    Read {
        /// Location of the state.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing persisted state failed
    #[error("failed to write watermarks to {path}: {source}")]
    Write {
        /// Location of the state.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Persisted state could not be parsed
    #[error("corrupt watermark state in {path}: {reason}")]
    Corrupt {
        /// Location of the state.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
}

/// Storage for per-kind watermarks.
pub trait WatermarkStore {
    /// Current watermark for `kind`, if one was ever stored.
    fn get(&self, kind: DataKind) -> Option<Timestamp>;

    /// Store a watermark for `kind`.
    fn set(&mut self, kind: DataKind, ts: Timestamp) -> Result<(), WatermarkError>;
}

/// Move the watermark for `kind` forward to `ts`.
///
/// Does nothing if the stored watermark is already at or past `ts`.
/// Returns the watermark in effect afterwards.
pub fn advance(
    store: &mut dyn WatermarkStore,
    kind: DataKind,
    ts: Timestamp,
) -> Result<Timestamp, WatermarkError> {
    match store.get(kind) {
        Some(current) if current >= ts => Ok(current),
        _ => {
            store.set(kind, ts)?;
            Ok(ts)
        }
    }
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    marks: BTreeMap<DataKind, Timestamp>,
}

impl MemoryWatermarkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored watermarks, ordered by kind.
    pub fn iter(&self) -> impl Iterator<Item = (DataKind, Timestamp)> + '_ {
        self.marks.iter().map(|(k, v)| (*k, *v))
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, kind: DataKind) -> Option<Timestamp> {
        self.marks.get(&kind).copied()
    }

    fn set(&mut self, kind: DataKind, ts: Timestamp) -> Result<(), WatermarkError> {
        self.marks.insert(kind, ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let mut store = MemoryWatermarkStore::new();
        let kind = DataKind::Stress;

        let steps = [100, 300, 200, 300, 50, 900];
        let mut previous = None;
        for millis in steps {
            let after = advance(&mut store, kind, Timestamp::from_millis(millis)).unwrap();
            if let Some(before) = previous {
                assert!(after >= before);
            }
            previous = Some(after);
        }
        assert_eq!(store.get(kind), Some(Timestamp::from_millis(900)));
    }

    #[test]
    fn kinds_are_independent() {
        let mut store = MemoryWatermarkStore::new();
        advance(&mut store, DataKind::Activity, Timestamp::from_secs(10)).unwrap();
        assert_eq!(store.get(DataKind::HeartRate), None);
        assert_eq!(store.iter().count(), 1);
    }
}
