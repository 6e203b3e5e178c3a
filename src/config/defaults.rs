//! System-wide default constants, grouped by subsystem.
//!
//! Centralises the magic numbers named in §6 of the spec so they appear in
//! exactly one place; every one of these is overridable via the config
//! TOML file loaded by [`super::PipelineConfig::load`].

// ============================================================================
// Classifier thresholds
// ============================================================================

pub const DROP_THRESHOLD_PCT: f64 = 10.0;
pub const REFUEL_THRESHOLD_PCT: f64 = 8.0;
pub const RECOVERY_TOLERANCE_PCT: f64 = 5.0;
pub const RECOVERY_WINDOW_MIN: i64 = 10;
pub const RECOVERY_WINDOW_EXTENDED_MIN: i64 = 20;
pub const MIN_REFUEL_JUMP_PCT: f64 = 10.0;
pub const MIN_REFUEL_JUMP_FLOOR_PCT: f64 = 5.0;
pub const MIN_REFUEL_GAL: f64 = 5.0;
pub const MAX_REFUEL_GAP_HR: f64 = 96.0;
pub const MIN_REFUEL_GAP_MIN: f64 = 5.0;
pub const THEFT_CONFIRMED_SCORE: f64 = 85.0;
pub const THEFT_SUSPECTED_SCORE: f64 = 60.0;
pub const REFUEL_DEDUP_WINDOW_MIN: i64 = 5;
pub const SPEED_GATE_MPH: f64 = 5.0;
pub const PARKED_SPEED_MPH: f64 = 2.0;
pub const PARKED_RPM_IDLE_THRESHOLD: f64 = 300.0;
pub const PARKED_LOCATION_STABLE_SECS: i64 = 60;

// ============================================================================
// EKF
// ============================================================================

pub const Q_R: f64 = 0.05;
pub const Q_L_MOVING: f64 = 2.5;
pub const Q_L_STATIC: f64 = 1.0;
pub const P_MAX: f64 = 50.0;
pub const K_MAX_LOW: f64 = 0.20;
pub const K_MAX_MID: f64 = 0.35;
pub const K_MAX_HIGH: f64 = 0.50;
pub const INNOVATION_BOOST_FACTOR: f64 = 1.5;
pub const K_MAX_BOOSTED_CAP: f64 = 0.70;
pub const BASELINE_CONSUMPTION_LPH_DEFAULT: f64 = 15.0;
pub const LOAD_FACTOR_DEFAULT: f64 = 0.35;
pub const ALTITUDE_FACTOR_DEFAULT: f64 = 0.02;
pub const EMERGENCY_DRIFT_THRESHOLD_PCT: f64 = 30.0;
pub const REFUEL_JUMP_THRESHOLD_PCT: f64 = 10.0;
pub const MAX_CONSUMPTION_LPH: f64 = 60.0;
pub const MIN_DT_SECS: f64 = 1.0;
pub const MAX_DT_SECS: f64 = 3600.0;
pub const THERMAL_EXPANSION_PCT_PER_15F: f64 = 1.0;
pub const THERMAL_BASELINE_F: f64 = 60.0;

// ============================================================================
// MPG
// ============================================================================

pub const MIN_MILES: f64 = 20.0;
pub const MIN_FUEL_GAL: f64 = 2.5;
pub const MIN_MPG: f64 = 3.5;
pub const MAX_MPG: f64 = 8.5;
pub const EMA_ALPHA: f64 = 0.20;
pub const SNR_WARNING: f64 = 5.0;
pub const SNR_CRITICAL: f64 = 2.0;
pub const MIN_SPEED_MPH: f64 = 5.0;
pub const EXPECTED_NOISE_GAL_FRACTION: f64 = 0.02;
pub const IQR_MULTIPLIER: f64 = 1.5;
pub const MAD_Z_THRESHOLD: f64 = 3.0;

// ============================================================================
// Slow siphon
// ============================================================================

pub const SIPHON_WINDOW_DAYS: usize = 7;
pub const SIPHON_MIN_CONSECUTIVE_DAYS: usize = 3;
pub const SIPHON_DAILY_THRESHOLD_GAL: f64 = 2.0;
pub const SIPHON_WINDOW_THRESHOLD_GAL: f64 = 10.0;

// ============================================================================
// Sensor health
// ============================================================================

pub const SENSOR_HEALTH_BUFFER_CAP: usize = 1000;
pub const SENSOR_MISSING_MINUTES: i64 = 15;
pub const SENSOR_STUCK_MINUTES: i64 = 30;
pub const SENSOR_ERRATIC_FRACTION_OF_RANGE: f64 = 0.20;
pub const SENSOR_ISSUE_RETENTION_DAYS: i64 = 7;

// ============================================================================
// RUL
// ============================================================================

pub const RUL_WARNING_SCORE: f64 = 50.0;
pub const RUL_CRITICAL_SCORE: f64 = 25.0;
pub const RUL_MAX_DAYS: f64 = 365.0;
pub const RUL_MIN_TREND_PER_DAY: f64 = 0.01;
pub const RUL_SERVICE_LEAD_DAYS: f64 = 7.0;
pub const RUL_FIT_WINDOW: usize = 60;
pub const RUL_RECOMPUTE_INTERVAL_SECS: u64 = 3600;

// ============================================================================
// Scheduler
// ============================================================================

pub const DEFAULT_MAX_WORKERS: usize = 512;
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 64;
pub const DEFAULT_PERSISTENCE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_SNAPSHOT_INTERVAL_READINGS: u64 = 50;
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WIALON_POLL_INTERVAL_SECS: u64 = 30;
pub const PERSISTENCE_MAX_RETRIES: u32 = 3;
pub const PERSISTENCE_RETRY_BASE_BACKOFF_MS: u64 = 100;
pub const WORKER_RESTART_BASE_BACKOFF_MS: u64 = 200;
pub const WORKER_RESTART_MAX_BACKOFF_MS: u64 = 5_000;
