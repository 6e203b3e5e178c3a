//! MPG Engine: accumulator -> raw MPG -> outlier-filtered EMA with SNR
//! gating (spec §4.4).

use crate::config::defaults::MIN_FUEL_GAL;
use crate::config::MpgConfig;
use crate::types::MpgState;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpgStatus {
    Normal,
    Warning,
    Critical,
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct MpgOutcome {
    pub instant_mpg: Option<f64>,
    pub ema_mpg: Option<f64>,
    pub snr: Option<f64>,
    pub status: MpgStatus,
}

/// One window's contribution to the accumulators.
pub struct WindowDelta {
    pub miles: f64,
    pub gallons: f64,
}

/// Derive this reading's distance delta: prefer the odometer, fall back to
/// `speed * dt`.
pub fn distance_delta(
    odometer_mi: Option<f64>,
    last_odometer_mi: Option<f64>,
    speed_mph: f64,
    dt_secs: f64,
) -> f64 {
    match (odometer_mi, last_odometer_mi) {
        (Some(cur), Some(prev)) if cur >= prev => cur - prev,
        _ => speed_mph * (dt_secs / 3600.0),
    }
}

/// Derive this reading's fuel delta: prefer the ECU cumulative counter, fall
/// back to the Kalman level delta x tank capacity, adjusted for the
/// configured biodiesel blend's effective energy density.
pub fn fuel_delta(
    ecu_total_fuel_used_gal: Option<f64>,
    last_ecu_fuel_used_gal: Option<f64>,
    kalman_level_delta_pct: f64,
    tank_capacity_gal: f64,
    biodiesel_blend_fraction: Option<f64>,
) -> f64 {
    let raw = match (ecu_total_fuel_used_gal, last_ecu_fuel_used_gal) {
        (Some(cur), Some(prev)) if cur >= prev => cur - prev,
        _ => (-kalman_level_delta_pct / 100.0) * tank_capacity_gal,
    };
    let blend = biodiesel_blend_fraction.unwrap_or(0.0).clamp(0.0, 1.0);
    // Biodiesel carries ~7% less energy per gallon than diesel; a blend of
    // `blend` fraction therefore needs a larger nominal gallon count to
    // deliver the same energy, which is what raw MPG should reflect.
    raw * (1.0 + 0.07 * blend)
}

fn iqr_filter(history: &[f64], multiplier: f64) -> Vec<f64> {
    if history.len() < 4 {
        return history.to_vec();
    }
    let mut data = Data::new(history.to_vec());
    let q1 = data.percentile(25);
    let q3 = data.percentile(75);
    let iqr = q3 - q1;
    let lower = q1 - multiplier * iqr;
    let upper = q3 + multiplier * iqr;
    history.iter().copied().filter(|v| *v >= lower && *v <= upper).collect()
}

fn mad_filter(values: &[f64], z_threshold: f64) -> Vec<f64> {
    if values.len() < 3 {
        return values.to_vec();
    }
    let median = Data::new(values.to_vec()).median();
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    let mad = Data::new(deviations).median();
    if mad == 0.0 {
        return values.to_vec();
    }
    values
        .iter()
        .copied()
        .filter(|v| {
            let modified_z = 0.6745 * (v - median) / mad;
            modified_z.abs() <= z_threshold
        })
        .collect()
}

/// Apply the dual outlier filter (IQR, then MAD on the survivors) and return
/// the cleanest recent value, or the raw value if nothing survives.
fn clean_value(history: &[f64], raw: f64, cfg: &MpgConfig) -> f64 {
    let mut with_raw = history.to_vec();
    with_raw.push(raw);
    let iqr_survivors = iqr_filter(&with_raw, cfg.iqr_multiplier);
    let mad_survivors = mad_filter(&iqr_survivors, cfg.mad_z_threshold);
    mad_survivors.last().copied().unwrap_or(raw)
}

fn update_variance(state: &mut MpgState) {
    let n = state.raw_mpg_history.len().max(1) as f64;
    let mean: f64 = state.raw_mpg_history.iter().sum::<f64>() / n;
    let variance = state
        .raw_mpg_history
        .iter()
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / n;
    state.variance = variance.max(1e-6);
}

fn snr_of(state: &MpgState) -> Option<f64> {
    match (state.ema_mpg, state.sample_count) {
        (Some(ema), n) if n >= 1 => Some(ema / state.variance.max(1e-9).sqrt()),
        _ => None,
    }
}

fn status_for(snr: Option<f64>, cfg: &MpgConfig) -> MpgStatus {
    match snr {
        None => MpgStatus::Idle,
        Some(s) if s > cfg.snr_warning => MpgStatus::Normal,
        Some(s) if s >= cfg.snr_critical => MpgStatus::Warning,
        Some(_) => MpgStatus::Critical,
    }
}

fn idle_or_gated_outcome(state: &MpgState, cfg: &MpgConfig) -> MpgOutcome {
    let snr = snr_of(state);
    MpgOutcome {
        instant_mpg: state.instant_mpg,
        ema_mpg: state.ema_mpg,
        snr,
        status: status_for(snr, cfg),
    }
}

/// Feed one reading's contribution into the accumulator and, if the gate
/// opens, compute a fresh instant/EMA MPG. The returned `instant_mpg`/
/// `ema_mpg` carry the *last computed* values whenever the gate hasn't
/// opened on this call — the state is still mutated to accumulate.
pub fn update(
    state: &mut MpgState,
    delta: WindowDelta,
    speed_mph: f64,
    tank_capacity_gal: f64,
    cfg: &MpgConfig,
) -> MpgOutcome {
    if speed_mph < cfg.min_speed_mph {
        let mut outcome = idle_or_gated_outcome(state, cfg);
        outcome.status = MpgStatus::Idle;
        return outcome;
    }

    state.distance_accum_mi += delta.miles.max(0.0);
    state.fuel_accum_gal += delta.gallons.max(0.0);

    if state.distance_accum_mi < cfg.min_miles || state.fuel_accum_gal < cfg.min_fuel_gal {
        return idle_or_gated_outcome(state, cfg);
    }

    let raw_mpg = if state.fuel_accum_gal > 0.0 {
        state.distance_accum_mi / state.fuel_accum_gal
    } else {
        0.0
    };

    if !(cfg.min_mpg..=cfg.max_mpg).contains(&raw_mpg) {
        tracing::debug!(raw_mpg, "MPG window rejected: outside Class-8 physics bounds");
        state.distance_accum_mi = 0.0;
        state.fuel_accum_gal = 0.0;
        return idle_or_gated_outcome(state, cfg);
    }

    let expected_noise_gal = cfg.expected_noise_gal_fraction * tank_capacity_gal.max(MIN_FUEL_GAL);
    if expected_noise_gal > 0.0 && state.fuel_accum_gal / expected_noise_gal < 1.0 {
        tracing::debug!(
            fuel_accum_gal = state.fuel_accum_gal,
            expected_noise_gal,
            "MPG window below SNR gate, extending accumulation"
        );
        // "increase window to at least 2.5 gal": leave accumulators intact
        // and keep collecting rather than discarding this window's progress.
        return idle_or_gated_outcome(state, cfg);
    }

    let history: Vec<f64> = state.raw_mpg_history.iter().copied().collect();
    let clean = clean_value(&history, raw_mpg, cfg);
    state.push_raw(raw_mpg);

    let ema = match state.ema_mpg {
        Some(prev) => cfg.ema_alpha * clean + (1.0 - cfg.ema_alpha) * prev,
        None => clean,
    };
    state.instant_mpg = Some(clean);
    state.ema_mpg = Some(ema);
    state.sample_count += 1;
    update_variance(state);

    state.distance_accum_mi = 0.0;
    state.fuel_accum_gal = 0.0;

    idle_or_gated_outcome(state, cfg)
}
