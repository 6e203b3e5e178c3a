//! Extended Kalman Filter fuel-level estimator (spec §4.3).
//!
//! State `x = [level_pct, rate_pct_per_sec]`. The predict step runs on every
//! reading (even without a sensor value); the update step only runs when
//! `fuel_level_pct` is present. Both steps are pure functions of
//! `(&mut KalmanState, ...)` — no I/O, single-digit-millisecond cost.

use crate::config::EkfConfig;
use crate::types::{Covariance2, EcuValidationStatus, KalmanState, RawReading, Truck, TruckStatus};
use serde::{Deserialize, Serialize};

/// Per-truck physics calibration, loaded from the optional Kalman
/// Calibration File (spec §6). Missing truck -> `KalmanCalibration::default()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KalmanCalibration {
    pub baseline_consumption_lph: f64,
    pub load_factor: f64,
    pub altitude_factor: f64,
    pub samples: u32,
    pub r_squared: f64,
}

impl KalmanCalibration {
    pub fn default_for(cfg: &EkfConfig) -> Self {
        Self {
            baseline_consumption_lph: cfg.baseline_consumption_lph_default,
            load_factor: cfg.load_factor_default,
            altitude_factor: cfg.altitude_factor_default,
            samples: 0,
            r_squared: 0.0,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawCalibration {
    truck_id: String,
    baseline_consumption_lph: f64,
    load_factor: f64,
    altitude_factor: f64,
    #[serde(default)]
    samples: u32,
    #[serde(default)]
    r_squared: f64,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawCalibrationTable {
    #[serde(default)]
    truck: Vec<RawCalibration>,
}

/// Per-truck Kalman calibration, loaded once from the optional Kalman
/// Calibration File (spec §6). A truck absent from the file — or the file
/// itself missing or unparsable — falls back to `KalmanCalibration::default_for`,
/// the same degrade-not-fail behavior as the J1939 store and truck registry.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    by_truck: std::collections::HashMap<String, KalmanCalibration>,
}

impl CalibrationStore {
    pub fn load(path: impl AsRef<std::path::Path>) -> Self {
        let path = path.as_ref();
        let table = match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<RawCalibrationTable>(&text) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse Kalman calibration file, starting empty");
                    RawCalibrationTable::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Kalman calibration file unreadable, starting empty");
                RawCalibrationTable::default()
            }
        };
        let by_truck = table
            .truck
            .into_iter()
            .map(|r| {
                (
                    r.truck_id.clone(),
                    KalmanCalibration {
                        baseline_consumption_lph: r.baseline_consumption_lph,
                        load_factor: r.load_factor,
                        altitude_factor: r.altitude_factor,
                        samples: r.samples,
                        r_squared: r.r_squared,
                    },
                )
            })
            .collect();
        Self { by_truck }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Calibration for `truck_id`, or `EkfConfig`'s defaults if this truck
    /// has no curated calibration row.
    pub fn lookup(&self, truck_id: &str, cfg: &EkfConfig) -> KalmanCalibration {
        self.by_truck.get(truck_id).copied().unwrap_or_else(|| KalmanCalibration::default_for(cfg))
    }
}

/// A refuel candidate surfaced by the EKF's jump detection, handed to the
/// classifier for confirmation (the estimator itself never emits events).
#[derive(Debug, Clone, Copy)]
pub struct RefuelCandidate {
    pub sensor_level_pct: f64,
    pub predicted_level_pct: f64,
}

/// Outcome of one full EKF step (predict, then update if a sensor value
/// was present).
#[derive(Debug, Clone)]
pub struct EkfOutcome {
    pub filtered_level_pct: f64,
    pub ecu_validation_status: EcuValidationStatus,
    pub ecu_deviation_pct: Option<f64>,
    pub is_interpolated: bool,
    pub refuel_candidate: Option<RefuelCandidate>,
    /// Set when a large downward drift while PARKED would have triggered an
    /// auto-resync, but the resync was blocked (spec §4.3, theft protection).
    pub drift_warning: bool,
}

fn clamp_pct(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Physics-model consumption estimate, clamped to `[0, max_consumption_lph]`.
fn physics_consumption_lph(
    calibration: &KalmanCalibration,
    engine_load_pct: f64,
    climb_rate_m_per_s: f64,
    cfg: &EkfConfig,
) -> f64 {
    let raw = calibration.baseline_consumption_lph
        + calibration.load_factor * engine_load_pct
        + calibration.altitude_factor * climb_rate_m_per_s;
    raw.clamp(0.0, cfg.max_consumption_lph)
}

fn thermal_correction_pct(ambient_temp_f: Option<f64>, cfg: &EkfConfig) -> f64 {
    match ambient_temp_f {
        Some(temp) if temp > cfg.thermal_baseline_f => {
            ((temp - cfg.thermal_baseline_f) / 15.0) * cfg.thermal_expansion_pct_per_15f
        }
        _ => 0.0,
    }
}

fn ecu_validation_status(deviation_pct: f64) -> EcuValidationStatus {
    if deviation_pct >= 30.0 {
        EcuValidationStatus::Critical
    } else if deviation_pct >= 15.0 {
        EcuValidationStatus::Warning
    } else {
        EcuValidationStatus::Normal
    }
}

/// Base measurement-noise variance (pct^2) before satellite/voltage/refuel
/// adaptive scaling. Not named in the spec's config table; chosen so that a
/// single, well-conditioned reading (8+ satellites, healthy battery) has a
/// ~1.4pct standard deviation, matching typical tank-sender noise. Recorded
/// as an explicit decision in DESIGN.md.
const R_BASE_PCT2: f64 = 2.0;

fn measurement_variance(reading: &RawReading, in_refuel_window: bool) -> f64 {
    let mut r = R_BASE_PCT2;
    r *= if reading.gps_satellites < 3 {
        3.0
    } else if reading.gps_satellites <= 4 {
        1.5
    } else {
        1.0
    };
    r *= if reading.battery_voltage < 12.0 {
        2.0
    } else if reading.battery_voltage <= 12.5 {
        1.3
    } else {
        1.0
    };
    if in_refuel_window {
        r *= 0.5;
    }
    r
}

fn k_max_for(p00: f64, cfg: &EkfConfig) -> f64 {
    if p00 > 5.0 {
        cfg.k_max_high
    } else if p00 > 2.0 {
        cfg.k_max_mid
    } else {
        cfg.k_max_low
    }
}

/// Run one predict step. Always runs, even when no sensor value is present.
pub fn predict(
    state: &mut KalmanState,
    truck: &Truck,
    calibration: &KalmanCalibration,
    reading: &RawReading,
    prev_altitude_m: Option<f64>,
    status: TruckStatus,
    cfg: &EkfConfig,
) {
    let dt = match state.last_timestamp {
        Some(last) => {
            let raw = (reading.timestamp - last).num_milliseconds() as f64 / 1000.0;
            raw.clamp(cfg.min_dt_secs, cfg.max_dt_secs)
        }
        None => {
            // First reading for this truck: nothing to predict from yet.
            state.last_timestamp = Some(reading.timestamp);
            return;
        }
    };

    // Cross-validate ECU vs engine state (P4): RPM=0 forces consumption=0,
    // overriding any ECU reading, to prevent phantom consumption while parked.
    let consumption_lph = if reading.rpm <= 0.0 {
        if matches!(reading.ecu_fuel_rate_lph, Some(v) if v > 0.0) {
            tracing::warn!(
                truck_id = %truck.truck_id,
                ecu_rate = ?reading.ecu_fuel_rate_lph,
                "ECU reported nonzero fuel rate with rpm=0, forcing consumption to 0"
            );
        }
        0.0
    } else {
        let climb_rate = match (reading.altitude_m, prev_altitude_m) {
            (Some(alt), Some(prev)) if dt > 0.0 => (alt - prev) / dt,
            _ => 0.0,
        };
        physics_consumption_lph(calibration, reading.engine_load_pct, climb_rate, cfg)
    };

    let consumption_pct_per_sec =
        (consumption_lph / truck.tank_capacity_liters()) * 100.0 / 3600.0;

    // x <- F x + B u (level integrates the consumption-derived rate; the
    // rate component is a near-random walk driven by the same estimate).
    state.rate_pct_per_sec = -consumption_pct_per_sec;
    state.level_pct = clamp_pct(state.level_pct + state.rate_pct_per_sec * dt);

    // P <- F P F^T + Q, adaptively scaled.
    let p = state.covariance;
    let mut p00 = p.p00 + 2.0 * dt * p.p01 + dt * dt * p.p11;
    let p01 = p.p01 + dt * p.p11;
    let p11 = p.p11;

    let mut q_scale = 1.0;
    if status == TruckStatus::Moving {
        q_scale *= 2.0;
    }
    if reading.engine_load_pct > 80.0 {
        q_scale *= 1.5;
    }
    if status == TruckStatus::Parked {
        q_scale *= 0.5;
    }
    let q_level = if status == TruckStatus::Moving {
        cfg.q_l_moving
    } else {
        cfg.q_l_static
    } * q_scale;
    p00 += q_level;
    let p11 = p11 + cfg.q_r * q_scale;

    state.covariance = Covariance2 { p00, p01, p11 };

    // Bounded-state invariant (P3): reinitialize covariance on excessive growth.
    if state.covariance.trace() > cfg.p_max {
        tracing::warn!(truck_id = %truck.truck_id, trace = state.covariance.trace(), "EKF covariance exceeded P_max, reinitializing");
        state.covariance = KalmanState::cold(state.level_pct).covariance;
    }

    state.last_timestamp = Some(reading.timestamp);
}

/// Run the update step against a validated sensor reading. Returns the
/// outcome; callers (the orchestrator) decide what to do with
/// `refuel_candidate` and `drift_warning`.
#[allow(clippy::too_many_arguments)]
pub fn update(
    state: &mut KalmanState,
    truck: &Truck,
    calibration: &KalmanCalibration,
    reading: &RawReading,
    status: TruckStatus,
    in_refuel_window: bool,
    cfg: &EkfConfig,
) -> EkfOutcome {
    let mut outcome = EkfOutcome {
        filtered_level_pct: state.level_pct,
        ecu_validation_status: EcuValidationStatus::NotApplicable,
        ecu_deviation_pct: None,
        is_interpolated: true,
        refuel_candidate: None,
        drift_warning: false,
    };

    let Some(sensor_raw) = reading.fuel_level_pct else {
        return outcome;
    };
    if !(0.0..=100.0).contains(&sensor_raw) {
        tracing::warn!(truck_id = %truck.truck_id, value = sensor_raw, "rejecting out-of-range fuel_level_pct");
        return outcome;
    }

    // ECU cross-validation against the physics prediction (P8). Only
    // meaningful while the engine is running; rpm=0 already zeroed
    // consumption in predict().
    if reading.rpm > 0.0 {
        if let Some(ecu_rate) = reading.ecu_fuel_rate_lph {
            let physics = physics_consumption_lph(calibration, reading.engine_load_pct, 0.0, cfg);
            let deviation_pct = if physics > 0.0 {
                ((ecu_rate - physics).abs() / physics) * 100.0
            } else if ecu_rate > 0.0 {
                100.0
            } else {
                0.0
            };
            outcome.ecu_validation_status = ecu_validation_status(deviation_pct);
            outcome.ecu_deviation_pct = Some(deviation_pct);
            // CRITICAL substitutes the physics value for the *next* predict
            // step's implied rate; WARNING/NORMAL leave the ECU-derived rate
            // already applied in predict() untouched.
            if outcome.ecu_validation_status == EcuValidationStatus::Critical {
                let corrected_pct_per_sec = (physics / truck.tank_capacity_liters()) * 100.0 / 3600.0;
                state.rate_pct_per_sec = -corrected_pct_per_sec;
            }
        }
    }

    let thermal_correction = thermal_correction_pct(reading.ambient_temp_f, cfg);
    let sensor_corrected = clamp_pct(sensor_raw - thermal_correction);

    let predicted_level = state.level_pct;
    let innovation = sensor_corrected - predicted_level;

    // Refuel detection, before applying the update (resets covariance to
    // trust the next observation).
    if innovation > cfg.refuel_jump_threshold_pct {
        outcome.refuel_candidate = Some(RefuelCandidate {
            sensor_level_pct: sensor_corrected,
            predicted_level_pct: predicted_level,
        });
        state.covariance = Covariance2 { p00: 5.0, p01: 0.0, p11: 1.0 };
    }

    // Theft-protection on auto-resync: large sustained downward drift while
    // PARKED must not auto-resync the filter toward the sensor.
    let large_downward_drift = -innovation > cfg.emergency_drift_threshold_pct;
    if large_downward_drift && status == TruckStatus::Parked {
        outcome.drift_warning = true;
        outcome.filtered_level_pct = state.level_pct;
        state.push_innovation(innovation);
        return outcome;
    }

    let r = measurement_variance(reading, in_refuel_window);
    let expected_noise_pct = r.sqrt();

    let p = state.covariance;
    let mut k_max = k_max_for(p.p00, cfg);
    if innovation.abs() > 3.0 * expected_noise_pct {
        k_max = (k_max * cfg.innovation_boost_factor).min(cfg.k_max_boosted_cap);
    }

    let s = p.p00 + r;
    let k_level_raw = if s > 0.0 { p.p00 / s } else { 0.0 };
    let k_rate_raw = if s > 0.0 { p.p01 / s } else { 0.0 };
    let k_level = k_level_raw.min(k_max);
    // Preserve the level/rate gain ratio when clamping so the rate estimate
    // doesn't get a disproportionate update relative to level.
    let scale = if k_level_raw > 0.0 { k_level / k_level_raw } else { 1.0 };
    let k_rate = k_rate_raw * scale;

    state.level_pct = clamp_pct(state.level_pct + k_level * innovation);
    state.rate_pct_per_sec += k_rate * innovation;

    // Joseph-form-equivalent covariance update, P' = (I - K H) P.
    let p00_new = (1.0 - k_level) * p.p00;
    let p01_new = (1.0 - k_level) * p.p01;
    let p11_new = p.p11 - k_rate * p.p01;
    state.covariance = Covariance2 { p00: p00_new, p01: p01_new, p11: p11_new };

    state.last_level_pct = Some(state.level_pct);
    state.push_innovation(innovation);

    outcome.filtered_level_pct = state.level_pct;
    outcome.is_interpolated = false;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
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

    fn reading_at(secs: i64, level: Option<f64>, speed: f64, rpm: f64, ecu_rate: Option<f64>) -> RawReading {
        RawReading {
            truck_id: "t1".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            fuel_level_pct: level,
            odometer_mi: None,
            ecu_total_fuel_used_gal: None,
            ecu_fuel_rate_lph: ecu_rate,
            speed_mph: speed,
            rpm,
            engine_load_pct: 40.0,
            battery_voltage: 13.2,
            gps_satellites: 9,
            altitude_m: None,
            ambient_temp_f: None,
            dtc_string: None,
            engine_hours: None,
            location: None,
        }
    }

    #[test]
    fn p4_rpm_zero_holds_level_steady() {
        let cfg = PipelineConfig::default().ekf;
        let t = truck();
        let calib = KalmanCalibration::default_for(&cfg);
        let mut state = KalmanState::cold(60.0);

        predict(&mut state, &t, &calib, &reading_at(0, None, 0.0, 0.0, None), None, TruckStatus::Parked, &cfg);
        let level_after_first = state.level_pct;
        predict(&mut state, &t, &calib, &reading_at(300, None, 0.0, 0.0, Some(8.0)), None, TruckStatus::Parked, &cfg);

        assert!(state.level_pct >= level_after_first, "level must not decrease while rpm=0");
    }

    #[test]
    fn p3_level_stays_in_bounds() {
        let cfg = PipelineConfig::default().ekf;
        let t = truck();
        let calib = KalmanCalibration::default_for(&cfg);
        let mut state = KalmanState::cold(1.0);
        for i in 0..20 {
            let r = reading_at(i * 60, Some(0.0), 0.0, 1200.0, Some(40.0));
            predict(&mut state, &t, &calib, &r, None, TruckStatus::Idle, &cfg);
            update(&mut state, &t, &calib, &r, TruckStatus::Idle, false, &cfg);
            assert!((0.0..=100.0).contains(&state.level_pct));
            assert!(state.covariance.trace() <= cfg.p_max + 1e-6);
        }
    }

    #[test]
    fn p8_critical_ecu_deviation_substitutes_physics() {
        let cfg = PipelineConfig::default().ekf;
        let t = truck();
        let calib = KalmanCalibration::default_for(&cfg);
        let mut state = KalmanState::cold(60.0);
        predict(&mut state, &t, &calib, &reading_at(0, None, 60.0, 1400.0, None), None, TruckStatus::Moving, &cfg);
        let reading = reading_at(60, Some(59.5), 60.0, 1400.0, Some(100.0));
        let outcome = update(&mut state, &t, &calib, &reading, TruckStatus::Moving, false, &cfg);
        assert_eq!(outcome.ecu_validation_status, EcuValidationStatus::Critical);
    }

    #[test]
    fn refuel_jump_resets_covariance_small() {
        let cfg = PipelineConfig::default().ekf;
        let t = truck();
        let calib = KalmanCalibration::default_for(&cfg);
        let mut state = KalmanState::cold(22.0);
        predict(&mut state, &t, &calib, &reading_at(0, None, 0.0, 0.0, None), None, TruckStatus::Parked, &cfg);
        let r = reading_at(2700, Some(78.0), 0.0, 0.0, None);
        predict(&mut state, &t, &calib, &r, None, TruckStatus::Parked, &cfg);
        let outcome = update(&mut state, &t, &calib, &r, TruckStatus::Parked, false, &cfg);
        assert!(outcome.refuel_candidate.is_some());
        assert!(state.covariance.trace() < 10.0);
    }

    #[test]
    fn calibration_store_missing_file_yields_defaults() {
        let cfg = PipelineConfig::default().ekf;
        let store = CalibrationStore::load("/nonexistent/path/calibration.toml");
        let calib = store.lookup("t1", &cfg);
        assert_eq!(calib.baseline_consumption_lph, cfg.baseline_consumption_lph_default);
        assert_eq!(calib.samples, 0);
    }

    #[test]
    fn calibration_store_loads_curated_truck() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calibration.toml");
        std::fs::write(
            &path,
            r#"
            [[truck]]
            truck_id = "t1"
            baseline_consumption_lph = 9.5
            load_factor = 1.2
            altitude_factor = 1.05
            samples = 240
            r_squared = 0.87
            "#,
        )
        .expect("write");

        let cfg = PipelineConfig::default().ekf;
        let store = CalibrationStore::load(&path);
        let calib = store.lookup("t1", &cfg);
        assert_eq!(calib.baseline_consumption_lph, 9.5);
        assert_eq!(calib.samples, 240);

        let fallback = store.lookup("unknown-truck", &cfg);
        assert_eq!(fallback.baseline_consumption_lph, cfg.baseline_consumption_lph_default);
    }
}
