//! Per-Truck Orchestrator (spec §4.9): the single-writer state owner for
//! one truck, driving the nine-step pipeline contract over each incoming
//! reading. Pure computation is delegated to `ekf`/`mpg`/`classifier`/
//! `dtc`/`sensor_health`; this module owns sequencing, persistence and
//! failure handling.

use crate::classifier::{self, ClassifierInput, TheftScorer, VolatilityBucket};
use crate::config::PipelineConfig;
use crate::dtc::{self, J1939Store};
use crate::ekf::{self, KalmanCalibration};
use crate::mpg;
use crate::persistence::PersistenceLayer;
use crate::sensor_health::{HealthLevel, TruckSensorHealth};
use crate::status::{self, LocationTracker};
use crate::types::{
    ClassifierOutcome, ConfidenceLevel, DtcEvent, DtcStatus, FuelMetric, RawReading, Truck,
    TruckState,
};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Per-truck runtime state that sits alongside the persisted `TruckState`
/// checkpoint: derived accumulators that are cheap to recompute from
/// scratch and therefore don't need to survive a restart bit-for-bit.
pub struct TruckRuntime {
    pub truck: Truck,
    pub state: TruckState,
    pub calibration: KalmanCalibration,
    pub location_tracker: LocationTracker,
    pub sensor_health: TruckSensorHealth,
    pub last_odometer_mi: Option<f64>,
    pub last_ecu_fuel_used_gal: Option<f64>,
    pub last_altitude_m: Option<f64>,
    pub unresolved_dtcs: HashMap<(u32, u8), DtcStatus>,
    pub readings_since_snapshot: u32,
}

impl TruckRuntime {
    pub fn new(truck: Truck, initial_level_pct: f64, cfg: &PipelineConfig) -> Self {
        Self::with_calibration(truck, initial_level_pct, KalmanCalibration::default_for(&cfg.ekf))
    }

    pub fn with_calibration(truck: Truck, initial_level_pct: f64, calibration: KalmanCalibration) -> Self {
        Self {
            calibration,
            state: TruckState {
                kalman: crate::types::KalmanState::cold(initial_level_pct),
                mpg: crate::types::MpgState::new(),
                classifier: crate::types::ClassifierState::new(),
                last_processed_timestamp: None,
            },
            truck,
            location_tracker: LocationTracker::new(),
            sensor_health: TruckSensorHealth::new(),
            last_odometer_mi: None,
            last_ecu_fuel_used_gal: None,
            last_altitude_m: None,
            unresolved_dtcs: HashMap::new(),
            readings_since_snapshot: 0,
        }
    }

    pub fn from_checkpoint(truck: Truck, state: TruckState, cfg: &PipelineConfig) -> Self {
        Self {
            calibration: KalmanCalibration::default_for(&cfg.ekf),
            state,
            truck,
            location_tracker: LocationTracker::new(),
            sensor_health: TruckSensorHealth::new(),
            last_odometer_mi: None,
            last_ecu_fuel_used_gal: None,
            last_altitude_m: None,
            unresolved_dtcs: HashMap::new(),
            readings_since_snapshot: 0,
        }
    }
}

fn volatility_bucket(health: HealthLevel) -> VolatilityBucket {
    match health {
        HealthLevel::Excellent | HealthLevel::Good => VolatilityBucket::Low,
        HealthLevel::Fair => VolatilityBucket::Medium,
        HealthLevel::Poor => VolatilityBucket::High,
        HealthLevel::Critical => VolatilityBucket::Disconnected,
    }
}

/// Step 3: assemble the weighted confidence inputs named in spec §4.9 into
/// a single 0-100 score. Each factor contributes a bounded share; missing
/// inputs (no sensor, no ECU) simply contribute zero rather than failing
/// the computation.
fn confidence_score(
    reading: &RawReading,
    kalman_trace: f64,
    fuel_sensor_uptime_pct: f64,
    ecu_deviation_pct: Option<f64>,
    drift_warning: bool,
) -> f64 {
    let mut score = 0.0;

    score += if reading.fuel_level_pct.is_some() { 20.0 } else { 0.0 };
    score += 15.0; // data freshness: this reading was just received, always fresh
    score += match reading.gps_satellites {
        n if n >= 8 => 15.0,
        n if n >= 5 => 10.0,
        n if n >= 3 => 5.0,
        _ => 0.0,
    };
    score += if reading.battery_voltage >= 12.5 {
        10.0
    } else if reading.battery_voltage >= 12.0 {
        5.0
    } else {
        0.0
    };
    score += (10.0 * (1.0 - (kalman_trace / 10.0).min(1.0))).max(0.0);
    score += 10.0 * (fuel_sensor_uptime_pct / 100.0).min(1.0);
    score += match ecu_deviation_pct {
        Some(d) if d < 15.0 => 10.0,
        Some(d) if d < 30.0 => 5.0,
        Some(_) => 0.0,
        None => 5.0,
    };
    score += if drift_warning { 0.0 } else { 5.0 };
    score += if reading.speed_mph.is_finite() && reading.rpm.is_finite() { 5.0 } else { 0.0 };

    score.clamp(0.0, 100.0)
}

/// Outcome surfaced to the scheduler/caller after one reading is processed.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub refuel: Option<crate::types::RefuelEvent>,
    pub theft: Option<crate::types::TheftEvent>,
    pub dtc_events: Vec<DtcEvent>,
    pub dropped_out_of_order: bool,
}

/// Run the full nine-step contract for one reading against one truck's
/// runtime state, persisting through `gateway`. Any internal error is
/// logged and swallowed at this boundary (spec §4.9 failure semantics) —
/// the caller always gets a (possibly empty) `StepOutcome`, never an `Err`.
#[allow(clippy::too_many_arguments)]
pub async fn process_reading(
    runtime: &mut TruckRuntime,
    reading: RawReading,
    cfg: &PipelineConfig,
    j1939: &J1939Store,
    scorer: &dyn TheftScorer,
    gateway: &dyn PersistenceLayer,
    snapshot_every_n: u32,
) -> StepOutcome {
    let mut outcome = StepOutcome::default();

    // 0. Ordering guarantee (spec §5): drop arrivals at or before the last
    // processed timestamp for this truck rather than reprocessing/rewinding
    // state that has already moved forward.
    if let Some(last) = runtime.state.last_processed_timestamp {
        if reading.timestamp <= last {
            tracing::warn!(
                truck_id = %runtime.truck.truck_id,
                reading_timestamp = %reading.timestamp,
                last_processed_timestamp = %last,
                "dropping out-of-order reading"
            );
            outcome.dropped_out_of_order = true;
            return outcome;
        }
    }

    // 1. Derive truck status.
    let stable_secs = runtime.location_tracker.observe(reading.location, reading.timestamp);
    let status = status::derive_status(&reading, stable_secs);

    // 2. Sensor health bookkeeping.
    runtime.sensor_health.fuel_level.push(reading.timestamp, reading.fuel_level_pct, &cfg.sensor_health);
    runtime.sensor_health.odometer.push(reading.timestamp, reading.odometer_mi, &cfg.sensor_health);
    runtime.sensor_health.ecu_fuel_used.push(
        reading.timestamp,
        reading.ecu_total_fuel_used_gal,
        &cfg.sensor_health,
    );
    runtime.sensor_health.gps_satellites.push(
        reading.timestamp,
        Some(f64::from(reading.gps_satellites)),
        &cfg.sensor_health,
    );
    runtime.sensor_health.battery_voltage.push(
        reading.timestamp,
        Some(reading.battery_voltage),
        &cfg.sensor_health,
    );
    let overall_health = runtime.sensor_health.overall_health();
    let fuel_sensor_uptime_pct = runtime.sensor_health.fuel_sensor_uptime_pct();

    // 4. EKF predict -> update.
    ekf::predict(
        &mut runtime.state.kalman,
        &runtime.truck,
        &runtime.calibration,
        &reading,
        runtime.last_altitude_m,
        status,
        &cfg.ekf,
    );
    let in_refuel_window = runtime
        .state
        .classifier
        .last_refuel_timestamp
        .is_some_and(|t| (reading.timestamp - t).num_minutes().abs() < 10);
    let ekf_outcome = ekf::update(
        &mut runtime.state.kalman,
        &runtime.truck,
        &runtime.calibration,
        &reading,
        status,
        in_refuel_window,
        &cfg.ekf,
    );
    runtime.last_altitude_m = reading.altitude_m.or(runtime.last_altitude_m);

    // 3. Confidence precompute (depends on the fresh Kalman trace / ECU
    // deviation the predict+update step above just produced).
    let confidence = confidence_score(
        &reading,
        runtime.state.kalman.covariance.trace(),
        fuel_sensor_uptime_pct,
        ekf_outcome.ecu_deviation_pct,
        ekf_outcome.drift_warning,
    );
    let confidence_level = ConfidenceLevel::from_score(confidence);

    // 5. MPG update.
    let distance_mi = mpg::distance_delta(
        reading.odometer_mi,
        runtime.last_odometer_mi,
        reading.speed_mph,
        1.0,
    );
    let kalman_level_delta_pct = runtime
        .state
        .last_processed_timestamp
        .map(|_| ekf_outcome.filtered_level_pct - runtime.state.kalman.level_pct)
        .unwrap_or(0.0);
    let fuel_gal = mpg::fuel_delta(
        reading.ecu_total_fuel_used_gal,
        runtime.last_ecu_fuel_used_gal,
        kalman_level_delta_pct,
        runtime.truck.tank_capacity_gal,
        runtime.truck.biodiesel_blend_fraction,
    );
    let mpg_outcome = mpg::update(
        &mut runtime.state.mpg,
        mpg::WindowDelta { miles: distance_mi, gallons: fuel_gal },
        reading.speed_mph,
        runtime.truck.tank_capacity_gal,
        &cfg.mpg,
    );
    runtime.last_odometer_mi = reading.odometer_mi.or(runtime.last_odometer_mi);
    runtime.last_ecu_fuel_used_gal = reading.ecu_total_fuel_used_gal.or(runtime.last_ecu_fuel_used_gal);

    // 6. Classifier.
    let classifier_input = ClassifierInput {
        truck_id: &runtime.truck.truck_id,
        timestamp: reading.timestamp,
        sensor_level_pct: reading.fuel_level_pct,
        kalman_level_pct: ekf_outcome.filtered_level_pct,
        speed_mph: reading.speed_mph,
        status,
        location: reading.location,
        tank_capacity_gal: runtime.truck.tank_capacity_gal,
        refuel_candidate: ekf_outcome.refuel_candidate,
        sensor_uptime_pct: fuel_sensor_uptime_pct,
        sensor_volatility_bucket: volatility_bucket(overall_health),
        in_known_safe_zone: false,
    };
    let classifier_outcome =
        classifier::classify(&mut runtime.state.classifier, &classifier_input, &cfg.thresholds, scorer);
    match classifier_outcome {
        ClassifierOutcome::Refuel(event) | ClassifierOutcome::RefuelAfterDrop(event) => {
            outcome.refuel = Some(event);
        }
        ClassifierOutcome::Theft(event) => {
            outcome.theft = Some(event);
        }
        ClassifierOutcome::SensorGlitch | ClassifierOutcome::Consumption | ClassifierOutcome::None => {}
    }

    // 7. DTC decode for any new unresolved code.
    if let Some(dtc_string) = &reading.dtc_string {
        if !dtc_string.trim().is_empty() {
            let decoded = dtc::decode(dtc_string, j1939);
            let mut still_present = std::collections::HashSet::new();
            for d in decoded {
                still_present.insert((d.spn, d.fmi));
                if runtime.unresolved_dtcs.contains_key(&(d.spn, d.fmi)) {
                    continue;
                }
                runtime.unresolved_dtcs.insert((d.spn, d.fmi), DtcStatus::New);
                outcome.dtc_events.push(DtcEvent {
                    id: Uuid::new_v4(),
                    truck_id: runtime.truck.truck_id.clone(),
                    timestamp: reading.timestamp,
                    dtc_code: d.dtc_code(),
                    spn: d.spn,
                    fmi: d.fmi,
                    severity: d.severity,
                    category: d.category,
                    description_es: d.description_es,
                    spn_explanation_es: d.spn_explanation_es,
                    fmi_explanation_es: d.fmi_explanation_es,
                    has_detailed_info: d.has_detailed_info,
                    oem: d.oem,
                    action_required: d.action_required,
                    status: DtcStatus::New,
                });
            }
            runtime.unresolved_dtcs.retain(|k, _| still_present.contains(k));
        } else {
            runtime.unresolved_dtcs.clear();
        }
    }

    // 8. Persist FuelMetric (idempotent on (truck_id, timestamp)).
    let metric = FuelMetric {
        truck_id: runtime.truck.truck_id.clone(),
        timestamp: reading.timestamp,
        sensor_fuel_pct: reading.fuel_level_pct,
        kalman_fuel_pct: ekf_outcome.filtered_level_pct,
        mpg_instant: mpg_outcome.instant_mpg,
        mpg_ema: mpg_outcome.ema_mpg,
        mpg_snr: mpg_outcome.snr,
        ecu_validation_status: ekf_outcome.ecu_validation_status,
        ecu_deviation_pct: ekf_outcome.ecu_deviation_pct,
        confidence_score: confidence,
        confidence_level,
        is_interpolated: ekf_outcome.is_interpolated,
    };

    if let Err(e) = persist_with_retry(gateway, metric.clone(), 3).await {
        tracing::warn!(truck_id = %runtime.truck.truck_id, error = %e, "dropping reading after persistence retries exhausted");
        return outcome;
    }
    if let Err(e) = gateway.upsert_latest(metric).await {
        tracing::warn!(truck_id = %runtime.truck.truck_id, error = %e, "failed to upsert latest snapshot");
    }
    if let Some(event) = &outcome.refuel {
        if let Err(e) = gateway.write_refuel_event(event.clone()).await {
            tracing::warn!(error = %e, "failed to persist refuel event");
        }
    }
    if let Some(event) = &outcome.theft {
        if let Err(e) = gateway.write_theft_event(event.clone()).await {
            tracing::warn!(error = %e, "failed to persist theft event");
        }
    }
    for event in &outcome.dtc_events {
        if let Err(e) = gateway.write_dtc_event(event.clone()).await {
            tracing::warn!(error = %e, "failed to persist DTC event");
        }
    }

    runtime.state.last_processed_timestamp = Some(reading.timestamp);

    // 9. Periodic state snapshot.
    runtime.readings_since_snapshot += 1;
    if runtime.readings_since_snapshot >= snapshot_every_n {
        runtime.readings_since_snapshot = 0;
        if let Err(e) = gateway.save_state(&runtime.truck.truck_id, &runtime.state).await {
            tracing::warn!(truck_id = %runtime.truck.truck_id, error = %e, "failed to snapshot truck state");
        }
    }

    outcome
}

async fn persist_with_retry(
    gateway: &dyn PersistenceLayer,
    metric: FuelMetric,
    max_attempts: u32,
) -> Result<(), crate::persistence::PersistenceError> {
    let mut attempt = 0;
    loop {
        match gateway.append_fuel_metric(metric.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 >= max_attempts => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "fuel metric persistence failed, retrying");
                tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RuleBasedScorer;
    use crate::persistence::InMemoryGateway;
    use crate::types::Location;
    use chrono::{TimeZone, Utc};

    fn truck() -> Truck {
        Truck {
            truck_id: "t1".into(),
            tank_capacity_gal: 120.0,
            baseline_mpg: 6.0,
            refuel_factor: None,
            biodiesel_blend_fraction: None,
            is_allowed: true,
        }
    }

    fn reading(secs: i64, level: Option<f64>, speed: f64, rpm: f64) -> RawReading {
        RawReading {
            truck_id: "t1".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            fuel_level_pct: level,
            odometer_mi: None,
            ecu_total_fuel_used_gal: None,
            ecu_fuel_rate_lph: None,
            speed_mph: speed,
            rpm,
            engine_load_pct: 30.0,
            battery_voltage: 13.0,
            gps_satellites: 9,
            altitude_m: None,
            ambient_temp_f: None,
            dtc_string: None,
            engine_hours: None,
            location: Some(Location { lat: 30.0, lon: -95.0 }),
        }
    }

    #[tokio::test]
    async fn end_to_end_reading_persists_fuel_metric() {
        let cfg = PipelineConfig::default();
        let mut runtime = TruckRuntime::new(truck(), 60.0, &cfg);
        let store = J1939Store::empty();
        let scorer = RuleBasedScorer;
        let gw = InMemoryGateway::new();

        process_reading(
            &mut runtime,
            reading(0, Some(60.0), 0.0, 0.0),
            &cfg,
            &store,
            &scorer,
            &gw,
            1000,
        )
        .await;
        process_reading(
            &mut runtime,
            reading(300, Some(59.0), 0.0, 0.0),
            &cfg,
            &store,
            &scorer,
            &gw,
            1000,
        )
        .await;

        assert_eq!(gw.fuel_metric_count("t1"), 2);
    }

    #[tokio::test]
    async fn refuel_event_persisted_through_orchestrator() {
        let cfg = PipelineConfig::default();
        let mut runtime = TruckRuntime::new(truck(), 22.0, &cfg);
        let store = J1939Store::empty();
        let scorer = RuleBasedScorer;
        let gw = InMemoryGateway::new();

        process_reading(&mut runtime, reading(0, Some(22.0), 0.0, 0.0), &cfg, &store, &scorer, &gw, 1000)
            .await;
        let out = process_reading(
            &mut runtime,
            reading(2700, Some(78.0), 0.0, 0.0),
            &cfg,
            &store,
            &scorer,
            &gw,
            1000,
        )
        .await;

        assert!(out.refuel.is_some());
        assert_eq!(gw.refuel_events_for("t1").len(), 1);
    }
}
