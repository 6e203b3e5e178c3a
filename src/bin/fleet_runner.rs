//! Production entry point: loads the truck registry, J1939 data and
//! durable persistence, then runs the fleet scheduler until a shutdown
//! signal arrives.
//!
//! This binary polls a directory of per-truck newline-delimited JSON
//! reading files on a fixed cadence rather than a live Wialon client —
//! Wialon auth bootstrap is explicitly out of scope, and no live feed is
//! available in this environment, so a file-backed source stands in for
//! "whatever polls Wialon and decodes into `RawReading`s" at the same
//! seam the scheduler consumes.

use clap::Parser;
use fleet_fuel_core::config::{self, PipelineConfig};
use fleet_fuel_core::dtc::J1939Store;
use fleet_fuel_core::ekf::CalibrationStore;
use fleet_fuel_core::persistence::{PersistenceLayer, SledGateway};
use fleet_fuel_core::registry::TruckRegistry;
use fleet_fuel_core::scheduler::FleetScheduler;
use fleet_fuel_core::types::RawReading;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fleet-runner", about = "Fleet fuel telemetry core runner")]
struct Args {
    /// Pipeline config TOML (falls back to FLEET_CONFIG env var, then defaults).
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Truck registry TOML file.
    #[arg(long, default_value = "data/trucks.toml")]
    registry: PathBuf,

    /// J1939 DTC data file.
    #[arg(long, default_value = "data/j1939.toml")]
    j1939_data: PathBuf,

    /// sled database directory for durable persistence.
    #[arg(long, default_value = "data/fleet.sled")]
    db_path: PathBuf,

    /// Directory containing one `<truck_id>.jsonl` file per truck, each
    /// line a serialized `RawReading` appended by the upstream poller.
    #[arg(long, default_value = "data/readings")]
    readings_dir: PathBuf,

    /// Kalman per-truck calibration file.
    #[arg(long, default_value = "data/calibration.toml")]
    calibration: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        }
        None => PipelineConfig::load(),
    };
    config::init(cfg);

    let registry = TruckRegistry::load(&args.registry);
    tracing::info!(trucks = registry.len(), "truck registry loaded");

    let j1939 = J1939Store::load(&args.j1939_data);
    let calibration = Arc::new(CalibrationStore::load(&args.calibration));
    let gateway: Arc<dyn PersistenceLayer> = Arc::new(SledGateway::open(&args.db_path)?);
    let scorer = Arc::new(fleet_fuel_core::classifier::RuleBasedScorer);
    let scheduler = Arc::new(FleetScheduler::with_calibration(j1939, scorer, gateway, calibration));

    for truck in registry.all() {
        scheduler.ensure_worker(truck, 50.0);
    }

    let poll_interval = std::time::Duration::from_secs(config::get().scheduler.wialon_poll_interval_secs);
    let mut ticker = tokio::time::interval(poll_interval);
    let mut cursor = ReadingCursor::new(&args.readings_dir);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for reading in cursor.poll() {
                    scheduler.dispatch(&reading.truck_id.clone(), reading);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, draining workers");
                break;
            }
        }
    }

    Arc::try_unwrap(scheduler)
        .unwrap_or_else(|_| panic!("scheduler still has outstanding references at shutdown"))
        .shutdown()
        .await;
    Ok(())
}

/// Tracks a read offset (in lines) per per-truck JSONL file so repeated
/// polls only surface newly appended readings.
struct ReadingCursor {
    dir: PathBuf,
    offsets: std::collections::HashMap<PathBuf, usize>,
}

impl ReadingCursor {
    fn new(dir: &std::path::Path) -> Self {
        Self { dir: dir.to_path_buf(), offsets: std::collections::HashMap::new() }
    }

    fn poll(&mut self) -> Vec<RawReading> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else { continue };
            let lines: Vec<&str> = text.lines().collect();
            let seen = self.offsets.entry(path.clone()).or_insert(0);
            for line in lines.iter().skip(*seen) {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawReading>(line) {
                    Ok(reading) => out.push(reading),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed reading line"),
                }
            }
            *seen = lines.len();
        }
        out
    }
}
