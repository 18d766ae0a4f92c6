//! # wearsync
//!
//! CLI tool for exercising the wearable history sync engine.
//!
//! ## Commands
//!
//! - `simulate`: Sync against a simulated Huami / Zepp OS band
//! - `watermarks`: Show, set or reset stored watermarks
//! - `decode-status`: Decode a captured GFDI frame
//! - `config`: Print the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Two hours of history, three records per round, first CRC corrupted
//! wearsync simulate --minutes 120 --max-per-round 3 --corrupt-checksum
//!
//! # Re-fetch SpO2 from a given point
//! wearsync watermarks --set spo2=2024-03-01T00:00:00Z
//!
//! # Decode a Synchronization ACK captured from a Garmin watch
//! wearsync decode-status "09 00 88 13 ad 13 00 e1 4a"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sync_types::{DataKind, Timestamp};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::simulate::SimulateOptions;
use commands::{decode_status, simulate, watermarks};
use config::{Config, FamilyProfile};

/// CLI tool for wearable history sync.
#[derive(Parser, Debug)]
#[command(name = "wearsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for configuration and sync state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: config.toml in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync against a simulated band
    Simulate {
        /// Device family (overrides the configuration)
        #[arg(long, value_enum)]
        profile: Option<FamilyProfile>,

        /// Kind to sync, repeatable (overrides the configuration)
        #[arg(long = "kind", short)]
        kinds: Vec<DataKind>,

        /// Minutes of history the band holds per kind
        #[arg(long, default_value = "60")]
        minutes: usize,

        /// Records the band sends per round
        #[arg(long)]
        max_per_round: Option<usize>,

        /// Corrupt the checksum of the first transfer
        #[arg(long)]
        corrupt_checksum: bool,

        /// Skip a chunk counter in the first transfer
        #[arg(long)]
        skip_counter: bool,
    },

    /// Show, set or reset stored watermarks
    Watermarks {
        /// Delete the state file first
        #[arg(long)]
        reset: bool,

        /// Set a watermark, as KIND=RFC3339 (repeatable)
        #[arg(long, value_parser = watermarks::parse_assignment)]
        set: Vec<(DataKind, Timestamp)>,
    },

    /// Decode a captured GFDI frame given as hex
    DecodeStatus {
        /// Frame bytes in hex
        hex: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    let config = Config::load(cli.config.as_deref(), &data_dir)?;
    init_tracing(&config.logging.filter);

    match cli.command {
        Commands::Simulate {
            profile,
            kinds,
            minutes,
            max_per_round,
            corrupt_checksum,
            skip_counter,
        } => {
            tokio::fs::create_dir_all(&data_dir)
                .await
                .context("Failed to create data directory")?;
            let options = SimulateOptions {
                profile,
                kinds,
                minutes,
                max_per_round,
                corrupt_checksum,
                skip_counter,
            };
            simulate::run(&data_dir, &config, options).await?;
        }
        Commands::Watermarks { reset, set } => {
            watermarks::run(&config.sync.state_path(&data_dir), reset, &set).await?;
        }
        Commands::DecodeStatus { hex } => {
            decode_status::run(&hex)?;
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{rendered}");
        }
    }

    Ok(())
}

/// Log to stderr. `RUST_LOG` wins over the configured filter.
fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory for wearsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "wearsync", "wearsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
