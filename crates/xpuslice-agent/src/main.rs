//! xpuslice agent
//!
//! Runs the per-process limiter standalone and emits device telemetry
//! samples as JSON lines, one per interval.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use xpuslice_core::{LimiterConfig, NvmlSampler};
use xpuslice_limiter::CoreLimiter;

/// xpuslice agent - shared accelerator time-slicing limiter
#[derive(Parser, Debug)]
#[command(name = "xpuslice-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML limiter configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// This process's slot in the shared segment
    #[arg(long)]
    slot_index: Option<u32>,

    /// Quota share as an integer percentage (1-100)
    #[arg(long)]
    quota_percent: Option<u32>,

    /// Shared segment path
    #[arg(long)]
    segment_path: Option<PathBuf>,

    /// Telemetry sample interval in seconds
    #[arg(long, default_value_t = 5)]
    sample_interval_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    info!("Starting xpuslice agent v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };
    if let Some(slot_index) = args.slot_index {
        config.slot_index = slot_index;
    }
    if let Some(quota_percent) = args.quota_percent {
        config.quota_percent = quota_percent;
    }
    if let Some(segment_path) = args.segment_path {
        config.segment.path = segment_path;
    }

    let limiter = CoreLimiter::initialize(&config)?;

    let sampler = match NvmlSampler::new(config.device.device_index, &config.device.device_id) {
        Ok(sampler) => Some(sampler),
        Err(e) => {
            warn!(error = %e, "telemetry unavailable, running without samples");
            None
        }
    };

    let interval = Duration::from_secs(args.sample_interval_secs.max(1));
    loop {
        std::thread::sleep(interval);
        info!(available_ops = limiter.available_ops(), "admission tokens");
        if let Some(sampler) = &sampler {
            match sampler.sample() {
                Ok(sample) => println!("{}", serde_json::to_string(&sample)?),
                Err(e) => warn!(error = %e, "telemetry sample failed"),
            }
        }
    }
}
