//! Ordering and addressing types for wearable sync.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// An instant on the sync timeline, in Unix milliseconds.
///
/// Watermarks and device-reported start times are both expressed as
/// timestamps. Arithmetic saturates instead of wrapping.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp from Unix milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from Unix seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Get the raw millisecond value.
    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// Add a duration, saturating at `i64::MAX`.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Subtract a duration, saturating at `i64::MIN`.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(diff).unwrap_or(0))
    }

    /// Convert to a chrono UTC datetime, if representable.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

/// A category of historical data, synced independently with its own watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    /// Steps, intensity and activity kind samples.
    Activity,
    /// Heart rate samples.
    HeartRate,
    /// Stress level samples.
    Stress,
    /// Blood oxygen saturation samples.
    Spo2,
    /// Sleep stage records.
    Sleep,
    /// Heart rate variability records.
    Hrv,
    /// Recorded GPS tracks of workouts.
    GpsTrack,
}

impl DataKind {
    /// Default sync order: activity first, GPS tracks last.
    pub const PRIORITY: [DataKind; 7] = [
        DataKind::Activity,
        DataKind::HeartRate,
        DataKind::Stress,
        DataKind::Spo2,
        DataKind::Sleep,
        DataKind::Hrv,
        DataKind::GpsTrack,
    ];

    /// Stable kebab-case name, as used in config and state files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Activity => "activity",
            DataKind::HeartRate => "heart-rate",
            DataKind::Stress => "stress",
            DataKind::Spo2 => "spo2",
            DataKind::Sleep => "sleep",
            DataKind::Hrv => "hrv",
            DataKind::GpsTrack => "gps-track",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::PRIORITY
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown data kind: {s}"))
    }
}

/// Addressed endpoint on the device link.
///
/// On BLE these map to GATT characteristics; the engine only needs to tell
/// the command/metadata channel apart from the bulk data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointId {
    /// Command requests and metadata/status responses.
    Control,
    /// Bulk data notifications.
    Data,
}
