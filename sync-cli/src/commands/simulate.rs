//! Run a full sync against a simulated band.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{
    FixedIntervalDecoder, JsonWatermarkStore, SimulatedDevice, SyncReport, SyncSession, Transport,
};
use sync_core::{RoundOutcome, SyncEvent};
use sync_types::{DataKind, Timestamp};
use tracing::info;

use crate::config::{Config, FamilyProfile};

/// Record length used for kinds without a decoder layout.
const RAW_RECORD_LEN: usize = 16;

/// What the simulated band holds and how it misbehaves.
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    /// Overrides the configured family profile.
    pub profile: Option<FamilyProfile>,
    /// Overrides the configured kinds.
    pub kinds: Vec<DataKind>,
    /// Minutes of history per kind.
    pub minutes: usize,
    /// Records the band sends per round.
    pub max_per_round: Option<usize>,
    /// Corrupt the first transfer's checksum.
    pub corrupt_checksum: bool,
    /// Skip a chunk counter in the first transfer.
    pub skip_counter: bool,
}

/// Run the simulate command.
pub async fn run(data_dir: &Path, config: &Config, options: SimulateOptions) -> Result<()> {
    let report = simulate(data_dir, config, options, true).await?;

    println!();
    println!("=== sync report ===");
    println!("  Rounds:      {}", report.rounds.len());
    println!("  Bytes:       {}", report.bytes_transferred());
    println!("  Completed:   {}", join(&report.completed));
    if !report.unsupported.is_empty() {
        println!("  Unsupported: {}", join(&report.unsupported));
    }
    Ok(())
}

/// Sync every configured kind from a freshly generated band.
///
/// Watermarks are read from and written to the configured state file, so
/// repeated runs only fetch what is newer than the last one.
pub async fn simulate(
    data_dir: &Path,
    config: &Config,
    options: SimulateOptions,
    handle_ctrl_c: bool,
) -> Result<SyncReport> {
    let mut family = config.family.clone();
    if let Some(profile) = options.profile {
        family.profile = profile;
    }
    let codec = family.codec();
    let kinds = if options.kinds.is_empty() {
        config.sync.kinds.clone()
    } else {
        options.kinds.clone()
    };
    let decoder = FixedIntervalDecoder::new();

    // The band stores whole minutes.
    let now = Timestamp::from_secs(Timestamp::now().millis() / 60_000 * 60);
    let start = now.saturating_sub(Duration::from_secs(60 * options.minutes as u64));

    let mut device = if codec.is_zepp_os() {
        SimulatedDevice::zepp_os()
    } else {
        SimulatedDevice::classic()
    }
    .with_tz_quarter_hours(family.tz_quarter_hours);
    for &kind in &kinds {
        let Some(fetch_type) = codec.fetch_type(kind) else {
            continue;
        };
        let record_len = decoder.layout(kind).map_or(RAW_RECORD_LEN, |l| l.record_len);
        let records = (0..options.minutes)
            .map(|i| synthetic_record(kind, i, record_len))
            .collect();
        device = device.with_history(fetch_type, start, records);
    }
    if let Some(max) = options.max_per_round {
        device = device.with_max_records_per_round(max);
    }
    if options.corrupt_checksum {
        device.corrupt_next_checksum();
    }
    if options.skip_counter {
        device.skip_next_counter();
    }

    let transport = device.transport();
    transport
        .connect("simulated")
        .await
        .context("Failed to connect to simulated device")?;

    let state_path = config.sync.state_path(data_dir);
    let store = JsonWatermarkStore::open(&state_path)
        .with_context(|| format!("Failed to open state file {}", state_path.display()))?;

    let mut session = SyncSession::new(transport, store, decoder, Arc::new(codec));
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });
    let ctrl_c = handle_ctrl_c.then(|| {
        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    });

    let default_since = Timestamp::now().saturating_sub(config.sync.lookback());
    info!(kinds = kinds.len(), minutes = options.minutes, "simulating sync");
    let result = session.sync(&kinds, default_since).await;

    if let Some(task) = ctrl_c {
        task.abort();
    }
    let (_, store, decoder) = session.into_parts();
    printer.await.context("Event printer panicked")?;
    let report = result?;

    info!(
        samples = decoder.samples().len(),
        state = %store.path().display(),
        "samples decoded"
    );
    Ok(report)
}

/// Plausible per-minute bytes for a kind.
fn synthetic_record(kind: DataKind, index: usize, len: usize) -> Vec<u8> {
    let i = (index % 256) as u8;
    let mut record = match kind {
        DataKind::Activity => vec![1, 20 + i % 40, i % 30, 60 + i % 25],
        DataKind::HeartRate => vec![60 + i % 30],
        DataKind::Stress => vec![20 + i % 40],
        DataKind::Spo2 => vec![95 + i % 4],
        _ => vec![i; len],
    };
    record.resize(len, 0);
    record
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::RoundStarted {
            kind,
            round_index,
            since,
        } => println!("{kind}: round {round_index} from {since}"),
        SyncEvent::RoundProgress {
            kind,
            bytes_so_far,
            bytes_expected,
        } => println!("{kind}:   {bytes_so_far}/{bytes_expected} bytes"),
        SyncEvent::RoundFinished { kind, outcome } => {
            println!("{kind}: {}", describe(outcome))
        }
        SyncEvent::SyncFinished {
            data_kinds_completed,
        } => println!("sync finished ({} kinds completed)", data_kinds_completed.len()),
    }
}

fn describe(outcome: &RoundOutcome) -> String {
    match outcome {
        RoundOutcome::Success {
            bytes_transferred,
            new_watermark,
        } => format!("done, {bytes_transferred} bytes, watermark {new_watermark}"),
        RoundOutcome::NeedsAnotherRound { new_watermark } => {
            format!("more to fetch, watermark {new_watermark}")
        }
        RoundOutcome::Aborted(reason) => format!("aborted: {reason}"),
    }
}

fn join(kinds: &[DataKind]) -> String {
    if kinds.is_empty() {
        return "-".to_string();
    }
    kinds
        .iter()
        .map(DataKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{AbortReason, WatermarkStore};
    use tempfile::TempDir;

    fn options(kinds: &[DataKind]) -> SimulateOptions {
        SimulateOptions {
            kinds: kinds.to_vec(),
            minutes: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn syncs_and_persists_watermarks() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();

        let report = simulate(
            dir.path(),
            &config,
            options(&[DataKind::Activity, DataKind::Spo2]),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.completed, vec![DataKind::Activity, DataKind::Spo2]);
        // 10 activity records of 4 bytes plus 10 SpO2 records of 1 byte.
        assert_eq!(report.bytes_transferred(), 50);

        let store = JsonWatermarkStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.get(DataKind::Activity).is_some());
        assert!(store.get(DataKind::Spo2).is_some());
    }

    #[tokio::test]
    async fn classic_profile_skips_unsupported_kinds() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&[DataKind::Activity, DataKind::Stress]);
        opts.profile = Some(FamilyProfile::Huami);

        let report = simulate(dir.path(), &Config::default(), opts, false)
            .await
            .unwrap();

        assert_eq!(report.completed, vec![DataKind::Activity]);
        assert_eq!(report.unsupported, vec![DataKind::Stress]);
    }

    #[tokio::test]
    async fn corrupt_checksum_is_retried() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&[DataKind::HeartRate]);
        opts.corrupt_checksum = true;

        let report = simulate(dir.path(), &Config::default(), opts, false)
            .await
            .unwrap();

        assert_eq!(
            report.rounds[0].outcome,
            RoundOutcome::Aborted(AbortReason::ChecksumMismatch { retained: true })
        );
        assert_eq!(report.completed, vec![DataKind::HeartRate]);
    }

    #[test]
    fn synthetic_records_have_layout_length() {
        assert_eq!(synthetic_record(DataKind::Activity, 3, 4).len(), 4);
        assert_eq!(synthetic_record(DataKind::Spo2, 300, 1), vec![95]);
        assert_eq!(synthetic_record(DataKind::GpsTrack, 1, 16), vec![1; 16]);
    }

    #[test]
    fn describes_outcomes() {
        let aborted = RoundOutcome::Aborted(AbortReason::Timeout);
        assert_eq!(describe(&aborted), "aborted: timed out waiting for the device");
        assert_eq!(join(&[]), "-");
        assert_eq!(join(&[DataKind::HeartRate, DataKind::Spo2]), "heart-rate, spo2");
    }
}
