//! Pipeline configuration.
//!
//! Loaded once at startup from a TOML file (path from `FLEET_CONFIG` env var,
//! then `./fleet_config.toml` in the working directory, then built-in
//! defaults), and exposed thereafter via the global [`get`] accessor —
//! mirroring the teacher's `WellConfig` loading order and `OnceLock` global.
//!
//! ```ignore
//! config::init(PipelineConfig::load());
//! let k_max = config::get().ekf.k_max_mid;
//! ```

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

static PIPELINE_CONFIG: OnceLock<PipelineConfig> = OnceLock::new();

/// Initialize the global pipeline configuration. Must be called exactly once
/// before any call to [`get`]. A second call is ignored with a warning.
pub fn init(config: PipelineConfig) {
    if PIPELINE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Fetch the global pipeline configuration.
///
/// Panics if [`init`] has not been called — a missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static PipelineConfig {
    PIPELINE_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

pub fn is_initialized() -> bool {
    PIPELINE_CONFIG.get().is_some()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    pub drop_threshold_pct: f64,
    pub refuel_threshold_pct: f64,
    pub recovery_tolerance_pct: f64,
    pub recovery_window_min: i64,
    pub recovery_window_extended_min: i64,
    pub min_refuel_jump_pct: f64,
    pub min_refuel_jump_floor_pct: f64,
    pub min_refuel_gal: f64,
    pub max_refuel_gap_hr: f64,
    pub min_refuel_gap_min: f64,
    pub theft_confirmed_score: f64,
    pub theft_suspected_score: f64,
    pub refuel_dedup_window_min: i64,
    pub speed_gate_mph: f64,
    pub parked_speed_mph: f64,
    pub parked_rpm_idle_threshold: f64,
    pub parked_location_stable_secs: i64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        use defaults::*;
        Self {
            drop_threshold_pct: DROP_THRESHOLD_PCT,
            refuel_threshold_pct: REFUEL_THRESHOLD_PCT,
            recovery_tolerance_pct: RECOVERY_TOLERANCE_PCT,
            recovery_window_min: RECOVERY_WINDOW_MIN,
            recovery_window_extended_min: RECOVERY_WINDOW_EXTENDED_MIN,
            min_refuel_jump_pct: MIN_REFUEL_JUMP_PCT,
            min_refuel_jump_floor_pct: MIN_REFUEL_JUMP_FLOOR_PCT,
            min_refuel_gal: MIN_REFUEL_GAL,
            max_refuel_gap_hr: MAX_REFUEL_GAP_HR,
            min_refuel_gap_min: MIN_REFUEL_GAP_MIN,
            theft_confirmed_score: THEFT_CONFIRMED_SCORE,
            theft_suspected_score: THEFT_SUSPECTED_SCORE,
            refuel_dedup_window_min: REFUEL_DEDUP_WINDOW_MIN,
            speed_gate_mph: SPEED_GATE_MPH,
            parked_speed_mph: PARKED_SPEED_MPH,
            parked_rpm_idle_threshold: PARKED_RPM_IDLE_THRESHOLD,
            parked_location_stable_secs: PARKED_LOCATION_STABLE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    pub q_r: f64,
    pub q_l_moving: f64,
    pub q_l_static: f64,
    pub p_max: f64,
    pub k_max_low: f64,
    pub k_max_mid: f64,
    pub k_max_high: f64,
    pub innovation_boost_factor: f64,
    pub k_max_boosted_cap: f64,
    pub baseline_consumption_lph_default: f64,
    pub load_factor_default: f64,
    pub altitude_factor_default: f64,
    pub emergency_drift_threshold_pct: f64,
    pub refuel_jump_threshold_pct: f64,
    pub max_consumption_lph: f64,
    pub min_dt_secs: f64,
    pub max_dt_secs: f64,
    pub thermal_expansion_pct_per_15f: f64,
    pub thermal_baseline_f: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            q_r: Q_R,
            q_l_moving: Q_L_MOVING,
            q_l_static: Q_L_STATIC,
            p_max: P_MAX,
            k_max_low: K_MAX_LOW,
            k_max_mid: K_MAX_MID,
            k_max_high: K_MAX_HIGH,
            innovation_boost_factor: INNOVATION_BOOST_FACTOR,
            k_max_boosted_cap: K_MAX_BOOSTED_CAP,
            baseline_consumption_lph_default: BASELINE_CONSUMPTION_LPH_DEFAULT,
            load_factor_default: LOAD_FACTOR_DEFAULT,
            altitude_factor_default: ALTITUDE_FACTOR_DEFAULT,
            emergency_drift_threshold_pct: EMERGENCY_DRIFT_THRESHOLD_PCT,
            refuel_jump_threshold_pct: REFUEL_JUMP_THRESHOLD_PCT,
            max_consumption_lph: MAX_CONSUMPTION_LPH,
            min_dt_secs: MIN_DT_SECS,
            max_dt_secs: MAX_DT_SECS,
            thermal_expansion_pct_per_15f: THERMAL_EXPANSION_PCT_PER_15F,
            thermal_baseline_f: THERMAL_BASELINE_F,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpgConfig {
    pub min_miles: f64,
    pub min_fuel_gal: f64,
    pub min_mpg: f64,
    pub max_mpg: f64,
    pub ema_alpha: f64,
    pub snr_warning: f64,
    pub snr_critical: f64,
    pub min_speed_mph: f64,
    pub expected_noise_gal_fraction: f64,
    pub iqr_multiplier: f64,
    pub mad_z_threshold: f64,
}

impl Default for MpgConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            min_miles: MIN_MILES,
            min_fuel_gal: MIN_FUEL_GAL,
            min_mpg: MIN_MPG,
            max_mpg: MAX_MPG,
            ema_alpha: EMA_ALPHA,
            snr_warning: SNR_WARNING,
            snr_critical: SNR_CRITICAL,
            min_speed_mph: MIN_SPEED_MPH,
            expected_noise_gal_fraction: EXPECTED_NOISE_GAL_FRACTION,
            iqr_multiplier: IQR_MULTIPLIER,
            mad_z_threshold: MAD_Z_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiphonConfig {
    pub window_days: usize,
    pub min_consecutive_days: usize,
    pub daily_threshold_gal: f64,
    pub window_threshold_gal: f64,
}

impl Default for SiphonConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            window_days: SIPHON_WINDOW_DAYS,
            min_consecutive_days: SIPHON_MIN_CONSECUTIVE_DAYS,
            daily_threshold_gal: SIPHON_DAILY_THRESHOLD_GAL,
            window_threshold_gal: SIPHON_WINDOW_THRESHOLD_GAL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorHealthConfig {
    pub buffer_cap: usize,
    pub missing_minutes: i64,
    pub stuck_minutes: i64,
    pub erratic_fraction_of_range: f64,
    pub issue_retention_days: i64,
}

impl Default for SensorHealthConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            buffer_cap: SENSOR_HEALTH_BUFFER_CAP,
            missing_minutes: SENSOR_MISSING_MINUTES,
            stuck_minutes: SENSOR_STUCK_MINUTES,
            erratic_fraction_of_range: SENSOR_ERRATIC_FRACTION_OF_RANGE,
            issue_retention_days: SENSOR_ISSUE_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulConfig {
    pub warning_score: f64,
    pub critical_score: f64,
    pub max_days: f64,
    pub min_trend_per_day: f64,
    pub service_lead_days: f64,
    pub fit_window: usize,
    pub recompute_interval_secs: u64,
}

impl Default for RulConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            warning_score: RUL_WARNING_SCORE,
            critical_score: RUL_CRITICAL_SCORE,
            max_days: RUL_MAX_DAYS,
            min_trend_per_day: RUL_MIN_TREND_PER_DAY,
            service_lead_days: RUL_SERVICE_LEAD_DAYS,
            fit_window: RUL_FIT_WINDOW,
            recompute_interval_secs: RUL_RECOMPUTE_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub queue_high_water: usize,
    pub persistence_timeout_sec: u64,
    pub snapshot_interval_readings: u64,
    pub graceful_shutdown_timeout_sec: u64,
    pub wialon_poll_interval_secs: u64,
    pub persistence_max_retries: u32,
    pub persistence_retry_base_backoff_ms: u64,
    pub worker_restart_base_backoff_ms: u64,
    pub worker_restart_max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            persistence_timeout_sec: DEFAULT_PERSISTENCE_TIMEOUT_SECS,
            snapshot_interval_readings: DEFAULT_SNAPSHOT_INTERVAL_READINGS,
            graceful_shutdown_timeout_sec: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS,
            wialon_poll_interval_secs: DEFAULT_WIALON_POLL_INTERVAL_SECS,
            persistence_max_retries: PERSISTENCE_MAX_RETRIES,
            persistence_retry_base_backoff_ms: PERSISTENCE_RETRY_BASE_BACKOFF_MS,
            worker_restart_base_backoff_ms: WORKER_RESTART_BASE_BACKOFF_MS,
            worker_restart_max_backoff_ms: WORKER_RESTART_MAX_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub thresholds: ClassifierThresholds,
    pub ekf: EkfConfig,
    pub mpg: MpgConfig,
    pub siphon: SiphonConfig,
    pub sensor_health: SensorHealthConfig,
    pub rul: RulConfig,
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// Load order: `FLEET_CONFIG` env var path, then `./fleet_config.toml`,
    /// then built-in defaults. A missing or unparsable file falls back to
    /// defaults with a warning rather than failing startup (spec §7,
    /// Configuration errors).
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("FLEET_CONFIG") {
            if let Some(cfg) = Self::try_load_file(&path) {
                return cfg;
            }
            tracing::warn!(path = %path, "FLEET_CONFIG path unreadable or invalid, falling back");
        }
        if let Some(cfg) = Self::try_load_file("fleet_config.toml") {
            return cfg;
        }
        tracing::info!("no pipeline config file found, using built-in defaults");
        Self::default()
    }

    fn try_load_file(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&text) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "loaded pipeline config");
                Some(cfg)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse pipeline config");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = PipelineConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: PipelineConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.ekf.p_max, cfg.ekf.p_max);
        assert_eq!(parsed.mpg.min_mpg, cfg.mpg.min_mpg);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let partial = "[ekf]\np_max = 99.0\n";
        let parsed: PipelineConfig = toml::from_str(partial).expect("parse");
        assert_eq!(parsed.ekf.p_max, 99.0);
        assert_eq!(parsed.mpg.min_mpg, defaults::MIN_MPG);
    }
}
