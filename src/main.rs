//! `upload-sim`: run the upload pipeline against a simulated flaky store.
//!
//! ```text
//! upload-sim --records 5000 --failure-rate 0.3 --seed 7 --strategy aggressive
//! ```
//!
//! The store fails more often for larger batches, so the run shows the
//! reducer shrinking batches and the breaker opening under sustained failure.
//! The final `UploadReport` is printed as JSON on stdout.

use std::path::PathBuf;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use upload_resilience::batching::BatchError;
use upload_resilience::config::{load_config, UploadConfig};
use upload_resilience::observability::{logging, metrics};
use upload_resilience::pipeline::{BatchSink, UploadPipeline};

/// Batch size at which the simulated store fails at the full configured rate.
const SATURATION_BATCH: f64 = 50.0;

#[derive(Parser)]
#[command(name = "upload-sim")]
#[command(about = "Simulate a resilient batch upload against a flaky store", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of records to upload
    #[arg(short, long, default_value_t = 1_000)]
    records: usize,

    /// Failure probability for a saturated batch, 0.0-1.0
    #[arg(short, long, default_value_t = 0.2, value_parser = parse_rate)]
    failure_rate: f64,

    /// RNG seed for reproducible runs
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Pin a reduction strategy instead of selecting automatically
    #[arg(long)]
    strategy: Option<String>,

    /// Override the initial batch size
    #[arg(long)]
    batch_size: Option<usize>,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{} is not within 0.0-1.0", rate))
    }
}

/// In-memory store whose failure probability grows with batch size.
struct FlakyStore {
    rng: StdRng,
    failure_rate: f64,
    stored: usize,
}

impl FlakyStore {
    fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            failure_rate,
            stored: 0,
        }
    }

    fn pick_error(&mut self, batch_len: usize) -> BatchError {
        let roll: f64 = self.rng.gen();
        if batch_len > 20 && roll < 0.6 {
            BatchError::message("Request timeout")
        } else if roll < 0.75 {
            BatchError {
                message: Some("duplicate key value violates unique constraint".into()),
                code: Some("23505".into()),
            }
        } else if roll < 0.9 {
            BatchError::message("Network request failed")
        } else {
            BatchError::message("JavaScript heap out of memory")
        }
    }
}

impl BatchSink<u64> for FlakyStore {
    async fn write(&mut self, records: &[u64]) -> Result<(), BatchError> {
        let load = (records.len() as f64 / SATURATION_BATCH).min(1.0);
        if self.rng.gen_bool(self.failure_rate * load.max(0.1)) {
            return Err(self.pick_error(records.len()));
        }
        self.stored += records.len();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => UploadConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.batching.strategy = Some(strategy);
    }
    if let Some(size) = cli.batch_size {
        config.batching.initial_batch_size = size;
    }

    logging::init(&config.observability);

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    tracing::info!(
        records = cli.records,
        failure_rate = cli.failure_rate,
        seed = cli.seed,
        "upload-sim starting"
    );

    let records: Vec<u64> = (0..cli.records as u64).collect();
    let store = FlakyStore::new(cli.seed, cli.failure_rate);
    let mut pipeline = UploadPipeline::new(store, &config)?;

    let report = pipeline.upload(&records).await?;
    tracing::info!(stored = pipeline.sink().stored, "Store contents verified");

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
