//! Show or edit stored watermarks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use sync_client::JsonWatermarkStore;
use sync_core::WatermarkStore;
use sync_types::{DataKind, Timestamp};

/// Parse `KIND=RFC3339`, as given to `--set`.
pub fn parse_assignment(s: &str) -> Result<(DataKind, Timestamp), String> {
    let (kind, time) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=TIME, got '{s}'"))?;
    let kind: DataKind = kind.trim().parse()?;
    let time = DateTime::parse_from_rfc3339(time.trim())
        .map_err(|e| format!("invalid time '{time}': {e}"))?;
    Ok((kind, Timestamp::from(time.with_timezone(&Utc))))
}

/// Run the watermarks command.
pub async fn run(state_path: &Path, reset: bool, set: &[(DataKind, Timestamp)]) -> Result<()> {
    if reset {
        match tokio::fs::remove_file(state_path).await {
            Ok(()) => println!("Removed {}", state_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove {}", state_path.display()))
            }
        }
    }

    let mut store = JsonWatermarkStore::open(state_path)
        .with_context(|| format!("Failed to open state file {}", state_path.display()))?;
    for &(kind, ts) in set {
        store
            .set(kind, ts)
            .with_context(|| format!("Failed to store watermark for {kind}"))?;
    }

    print_store(&store);
    Ok(())
}

fn print_store(store: &JsonWatermarkStore) {
    println!("=== watermarks ({}) ===", store.path().display());
    let now = Timestamp::now();
    let mut any = false;
    for (kind, ts) in store.iter() {
        any = true;
        println!(
            "  {:<12} {}  ({} ago)",
            kind.as_str(),
            ts,
            format_age(now.duration_since(ts))
        );
    }
    if !any {
        println!("  (none: the next sync starts from the lookback window)");
    }
}

/// Format an age as a short human-readable string.
fn format_age(age: std::time::Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn parses_assignments() {
        let (kind, ts) = parse_assignment("spo2=2024-03-01T12:00:00Z").unwrap();
        assert_eq!(kind, DataKind::Spo2);
        assert_eq!(ts, Timestamp::from_secs(1_709_294_400));

        let (_, ts) = parse_assignment("activity = 2024-03-01T13:00:00+01:00").unwrap();
        assert_eq!(ts, Timestamp::from_secs(1_709_294_400));
    }

    #[test]
    fn rejects_bad_assignments() {
        assert!(parse_assignment("spo2").is_err());
        assert!(parse_assignment("steps=2024-03-01T12:00:00Z").is_err());
        assert!(parse_assignment("spo2=yesterday").is_err());
    }

    #[test]
    fn formats_ages() {
        assert_eq!(format_age(Duration::from_secs(5)), "5s");
        assert_eq!(format_age(Duration::from_secs(125)), "2m");
        assert_eq!(format_age(Duration::from_secs(7_300)), "2h");
        assert_eq!(format_age(Duration::from_secs(200_000)), "2d");
    }

    #[tokio::test]
    async fn set_then_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let ts = Timestamp::from_secs(1_709_294_400);

        run(&path, false, &[(DataKind::Stress, ts)]).await.unwrap();
        let store = JsonWatermarkStore::open(&path).unwrap();
        assert_eq!(store.get(DataKind::Stress), Some(ts));

        run(&path, true, &[]).await.unwrap();
        assert!(!path.exists());
    }
}
