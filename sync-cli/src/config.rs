//! Configuration loading for wearsync.
//!
//! Configuration is loaded from a TOML file (default: `config.toml` in the
//! data directory). Every section and key is optional.
//!
//! ```toml
//! [family]
//! profile = "zepp-os"
//! tz_quarter_hours = 4
//! response_timeout_ms = 5000
//!
//! [sync]
//! kinds = ["activity", "spo2"]
//! lookback_days = 3
//!
//! [logging]
//! filter = "wearsync=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{FamilyCapabilities, HuamiCodec, MismatchPolicy, OverflowPolicy};
use sync_types::checksum::ChecksumKind;
use sync_types::DataKind;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device family.
    #[serde(default)]
    pub family: FamilyConfig,
    /// What to sync and where to keep state.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device family profile.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FamilyProfile {
    /// Classic Huami bands.
    Huami,
    /// Zepp OS devices.
    #[default]
    ZeppOs,
}

/// Device family configuration: a profile plus per-capability overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Base capabilities.
    #[serde(default)]
    pub profile: FamilyProfile,
    /// Device UTC offset in quarter hours.
    #[serde(default)]
    pub tz_quarter_hours: i8,
    /// Data chunks carry a counter.
    pub chunk_counter_present: Option<bool>,
    /// Payload checksum.
    pub checksum_kind: Option<ChecksumKind>,
    /// Checksum trails the payload.
    pub checksum_embedded: Option<bool>,
    /// Checksum failure handling.
    pub mismatch_policy: Option<MismatchPolicy>,
    /// Overlong payload handling.
    pub overflow_policy: Option<OverflowPolicy>,
    /// Ack carries a keep/drop flag.
    pub supports_retain_flag: Option<bool>,
    /// Device confirms acks.
    pub ack_confirmation: Option<bool>,
    /// Keep data on the device after a successful round.
    pub keep_data_on_device: Option<bool>,
    /// Rounds per kind.
    pub max_rounds: Option<u32>,
    /// Minimum progress for a follow-up round, in milliseconds.
    pub min_round_progress_ms: Option<u64>,
    /// Response timeout, in milliseconds.
    pub response_timeout_ms: Option<u64>,
    /// Largest payload a device may declare, in bytes.
    pub max_payload_len: Option<usize>,
}

impl FamilyConfig {
    /// Profile capabilities with the overrides applied.
    pub fn capabilities(&self) -> FamilyCapabilities {
        let mut caps = match self.profile {
            FamilyProfile::Huami => FamilyCapabilities::huami(),
            FamilyProfile::ZeppOs => FamilyCapabilities::zepp_os(),
        };
        if let Some(v) = self.chunk_counter_present {
            caps.chunk_counter_present = v;
        }
        if let Some(v) = self.checksum_kind {
            caps.checksum_kind = v;
        }
        if let Some(v) = self.checksum_embedded {
            caps.checksum_embedded = v;
        }
        if let Some(v) = self.mismatch_policy {
            caps.mismatch_policy = v;
        }
        if let Some(v) = self.overflow_policy {
            caps.overflow_policy = v;
        }
        if let Some(v) = self.supports_retain_flag {
            caps.supports_retain_flag = v;
        }
        if let Some(v) = self.ack_confirmation {
            caps.ack_confirmation = v;
        }
        if let Some(v) = self.keep_data_on_device {
            caps.keep_data_on_device = v;
        }
        if let Some(v) = self.max_rounds {
            caps.max_rounds = v;
        }
        if let Some(ms) = self.min_round_progress_ms {
            caps.min_round_progress = Duration::from_millis(ms);
        }
        if let Some(ms) = self.response_timeout_ms {
            caps.response_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.max_payload_len {
            caps.max_payload_len = v;
        }
        caps
    }

    /// Codec for the profile, carrying the effective capabilities.
    pub fn codec(&self) -> HuamiCodec {
        let base = match self.profile {
            FamilyProfile::Huami => HuamiCodec::classic(),
            FamilyProfile::ZeppOs => HuamiCodec::zepp_os(),
        };
        base.with_capabilities(self.capabilities())
            .with_tz_quarter_hours(self.tz_quarter_hours)
    }
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Kinds to sync, in any order.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<DataKind>,
    /// How far back to fetch a kind that has no watermark yet.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Watermark state file (default: `state.json` in the data directory).
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions
fn default_kinds() -> Vec<DataKind> {
    vec![
        DataKind::Activity,
        DataKind::HeartRate,
        DataKind::Stress,
        DataKind::Spo2,
    ]
}

fn default_lookback_days() -> u32 {
    7
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            lookback_days: default_lookback_days(),
            state_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl SyncConfig {
    /// Lookback window as a duration.
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(u64::from(self.lookback_days) * 24 * 60 * 60)
    }

    /// State file, resolved against the data directory.
    pub fn state_path(&self, data_dir: &Path) -> PathBuf {
        match &self.state_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join("state.json"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `explicit` if given, else `config.toml` in `data_dir` if it
    /// exists, else the defaults.
    pub fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = data_dir.join("config.toml");
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::FamilyCodec;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.family.profile, FamilyProfile::ZeppOs);
        assert_eq!(config.family.capabilities(), FamilyCapabilities::zepp_os());
        assert_eq!(config.sync.lookback_days, 7);
        assert_eq!(config.sync.kinds.len(), 4);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.kinds, default_kinds());
        assert_eq!(config.family.tz_quarter_hours, 0);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[family]
profile = "huami"
tz_quarter_hours = -20
max_rounds = 2
response_timeout_ms = 2500

[sync]
kinds = ["activity", "gps-track"]
lookback_days = 1
state_file = "band.json"

[logging]
filter = "wearsync_core=debug"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        let caps = config.family.capabilities();
        assert_eq!(config.family.profile, FamilyProfile::Huami);
        assert_eq!(caps.max_rounds, 2);
        assert_eq!(caps.response_timeout, Duration::from_millis(2500));
        assert_eq!(caps.checksum_kind, ChecksumKind::None);
        assert_eq!(
            config.sync.kinds,
            vec![DataKind::Activity, DataKind::GpsTrack]
        );
        assert_eq!(config.sync.lookback(), Duration::from_secs(86_400));
        assert_eq!(
            config.sync.state_path(Path::new("/data")),
            PathBuf::from("/data/band.json")
        );
        assert_eq!(config.logging.filter, "wearsync_core=debug");
    }

    #[test]
    fn overrides_apply_on_top_of_profile() {
        let toml = r#"
[family]
profile = "zepp-os"
checksum_kind = "crc16"
mismatch_policy = "abort"
keep_data_on_device = true
max_payload_len = 65536
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let codec = config.family.codec();
        let caps = codec.capabilities();
        assert!(codec.is_zepp_os());
        assert_eq!(caps.checksum_kind, ChecksumKind::Crc16);
        assert_eq!(caps.mismatch_policy, MismatchPolicy::Abort);
        assert!(caps.keep_data_on_device);
        assert_eq!(caps.max_payload_len, 65_536);
        assert!(caps.supports_retain_flag);
    }

    #[test]
    fn load_prefers_explicit_then_data_dir() {
        let dir = tempdir().unwrap();
        assert_eq!(
            Config::load(None, dir.path()).unwrap().sync.lookback_days,
            7
        );

        std::fs::write(dir.path().join("config.toml"), "[sync]\nlookback_days = 2\n").unwrap();
        assert_eq!(
            Config::load(None, dir.path()).unwrap().sync.lookback_days,
            2
        );

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(Some(&missing), dir.path()),
            Err(ConfigError::ReadError { .. })
        ));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[family]\nprofile = \"fitbit\"\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
