//! Synthetic fleet simulator: generates plausible `RawReading`s for a
//! configurable number of trucks — including an injected slow-siphon
//! truck and a DTC-emitting truck — and feeds them through the same
//! `FleetScheduler` the production runner uses, backed by the in-memory
//! gateway. Useful for smoke-testing the pipeline without a live feed.

use clap::Parser;
use fleet_fuel_core::classifier::RuleBasedScorer;
use fleet_fuel_core::config::{self, PipelineConfig};
use fleet_fuel_core::dtc::J1939Store;
use fleet_fuel_core::persistence::InMemoryGateway;
use fleet_fuel_core::scheduler::FleetScheduler;
use fleet_fuel_core::types::{RawReading, Truck};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fleet-sim", about = "Synthetic fleet telemetry simulator")]
struct Args {
    /// Number of synthetic trucks to simulate.
    #[arg(long, default_value_t = 8)]
    trucks: u32,

    /// Number of simulated readings per truck.
    #[arg(long, default_value_t = 200)]
    readings: u32,

    /// Simulated seconds between readings for a given truck.
    #[arg(long, default_value_t = 60)]
    interval_secs: i64,
}

fn synthetic_truck(idx: u32) -> Truck {
    Truck {
        truck_id: format!("SIM-{idx:03}"),
        tank_capacity_gal: 120.0,
        baseline_mpg: 6.2,
        refuel_factor: None,
        biodiesel_blend_fraction: Some(0.05),
        is_allowed: true,
    }
}

/// Generates a plausible driving day for one truck: mostly highway cruise
/// with idle stretches, one truck siphoning fuel overnight, one truck
/// throwing an intermittent DTC.
struct TruckSim {
    truck_id: String,
    clock: chrono::DateTime<chrono::Utc>,
    odometer_mi: f64,
    fuel_used_gal: f64,
    fuel_level_pct: f64,
    is_siphon_truck: bool,
    is_dtc_truck: bool,
}

impl TruckSim {
    fn new(truck: &Truck, is_siphon_truck: bool, is_dtc_truck: bool) -> Self {
        Self {
            truck_id: truck.truck_id.clone(),
            clock: chrono::Utc::now(),
            odometer_mi: 80_000.0,
            fuel_used_gal: 0.0,
            fuel_level_pct: 70.0,
            is_siphon_truck,
            is_dtc_truck,
        }
    }

    fn next_reading(&mut self, interval_secs: i64, rng: &mut impl Rng) -> RawReading {
        self.clock += chrono::Duration::seconds(interval_secs);
        let moving = rng.gen_bool(0.7);
        let speed_mph = if moving { rng.gen_range(45.0..68.0) } else { 0.0 };
        let noise = Normal::new(0.0_f64, 0.15).expect("fixed standard deviation is always valid");

        let miles = speed_mph * (interval_secs as f64 / 3600.0);
        self.odometer_mi += miles;
        let gal_burned = (miles / 6.2).max(0.0) + noise.sample(rng).abs() * 0.05;
        self.fuel_used_gal += gal_burned;

        let mut drop_pct = gal_burned / 120.0 * 100.0;
        if self.is_siphon_truck && !moving && rng.gen_bool(0.3) {
            drop_pct += rng.gen_range(1.5..2.5);
        }
        self.fuel_level_pct = (self.fuel_level_pct - drop_pct).max(2.0);
        if self.fuel_level_pct < 15.0 {
            self.fuel_level_pct = rng.gen_range(85.0..98.0);
        }

        let dtc_string = if self.is_dtc_truck && rng.gen_bool(0.05) {
            Some("157.3,100.1".to_string())
        } else {
            None
        };

        RawReading {
            truck_id: self.truck_id.clone(),
            timestamp: self.clock,
            fuel_level_pct: Some(self.fuel_level_pct),
            odometer_mi: Some(self.odometer_mi),
            ecu_total_fuel_used_gal: Some(self.fuel_used_gal),
            ecu_fuel_rate_lph: None,
            speed_mph,
            rpm: if moving { rng.gen_range(1200.0..1800.0) } else { rng.gen_range(600.0..750.0) },
            engine_load_pct: if moving { rng.gen_range(30.0..70.0) } else { 5.0 },
            battery_voltage: rng.gen_range(13.2..14.1),
            gps_satellites: rng.gen_range(6..14),
            altitude_m: Some(rng.gen_range(100.0..900.0)),
            ambient_temp_f: Some(rng.gen_range(40.0..95.0)),
            dtc_string,
            engine_hours: None,
            location: None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if !config::is_initialized() {
        config::init(PipelineConfig::default());
    }

    let gateway = Arc::new(InMemoryGateway::new());
    let scheduler = Arc::new(FleetScheduler::new(
        J1939Store::empty(),
        Arc::new(RuleBasedScorer),
        gateway.clone(),
    ));

    let mut rng = rand::thread_rng();
    let mut sims = Vec::new();
    for idx in 0..args.trucks {
        let truck = synthetic_truck(idx);
        let is_siphon_truck = idx == 0;
        let is_dtc_truck = idx == 1;
        scheduler.ensure_worker(truck.clone(), 70.0);
        sims.push(TruckSim::new(&truck, is_siphon_truck, is_dtc_truck));
    }

    for _ in 0..args.readings {
        for sim in &mut sims {
            let reading = sim.next_reading(args.interval_secs, &mut rng);
            scheduler.dispatch(&reading.truck_id.clone(), reading);
        }
        tokio::task::yield_now().await;
    }

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    for sim in &sims {
        let metrics = gateway.fuel_metric_count(&sim.truck_id);
        let thefts = gateway.theft_events_for(&sim.truck_id).len();
        tracing::info!(truck_id = %sim.truck_id, metrics, thefts, "simulation summary");
    }

    Arc::try_unwrap(scheduler)
        .unwrap_or_else(|_| panic!("scheduler still has outstanding references at shutdown"))
        .shutdown()
        .await;
}
