//! Core data model shared by every subsystem.
//!
//! Mirrors the entities defined in the system spec: immutable truck
//! configuration, the raw telemetry reading, the three pieces of
//! per-truck state that are owned exclusively by that truck's worker,
//! and the persisted, append-only output entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// A geographic point. `None` fields on the containing reading mean "no fix".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// Static, immutable-once-loaded configuration for one truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    pub truck_id: String,
    pub tank_capacity_gal: f64,
    pub baseline_mpg: f64,
    pub refuel_factor: Option<f64>,
    pub biodiesel_blend_fraction: Option<f64>,
    /// False for an unrecognized/untrusted truck (spec §7, Configuration errors):
    /// still processed, but outputs are marked untrusted.
    pub is_allowed: bool,
}

impl Truck {
    pub fn tank_capacity_liters(&self) -> f64 {
        self.tank_capacity_gal * 3.78541
    }
}

/// One telemetry sample ingested from the Wialon source for a single truck.
///
/// Every numeric field besides `truck_id`, `timestamp`, `speed_mph`, `rpm`,
/// `engine_load_pct`, `battery_voltage` and `gps_satellites` is nullable: the
/// fleet reports a fixed but sparsely-populated schema depending on which
/// sensors/ECU parameters a given truck exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub truck_id: String,
    pub timestamp: DateTime<Utc>,
    pub fuel_level_pct: Option<f64>,
    pub odometer_mi: Option<f64>,
    pub ecu_total_fuel_used_gal: Option<f64>,
    pub ecu_fuel_rate_lph: Option<f64>,
    pub speed_mph: f64,
    pub rpm: f64,
    pub engine_load_pct: f64,
    pub battery_voltage: f64,
    pub gps_satellites: u32,
    pub altitude_m: Option<f64>,
    pub ambient_temp_f: Option<f64>,
    pub dtc_string: Option<String>,
    pub engine_hours: Option<f64>,
    pub location: Option<Location>,
}

/// Coarse operating mode derived from speed/rpm/location, used throughout
/// the EKF, classifier and confidence scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruckStatus {
    Parked,
    Idle,
    Moving,
}

// ---------------------------------------------------------------------
// Per-truck state, exclusively owned by that truck's worker.
// ---------------------------------------------------------------------

/// 2x2 covariance matrix, row-major, always kept symmetric PSD by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Covariance2 {
    pub p00: f64,
    pub p01: f64,
    pub p11: f64,
}

impl Covariance2 {
    pub fn trace(&self) -> f64 {
        self.p00 + self.p11
    }
}

/// Persisted Extended Kalman Filter state for one truck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalmanState {
    pub level_pct: f64,
    pub rate_pct_per_sec: f64,
    pub covariance: Covariance2,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub last_odometer_mi: Option<f64>,
    pub last_ecu_fuel_used_gal: Option<f64>,
    pub last_level_pct: Option<f64>,
    /// Bounded history of recent innovations (sensor - predicted), most recent last.
    pub innovation_history: VecDeque<f64>,
}

impl KalmanState {
    pub const INNOVATION_HISTORY_CAP: usize = 10;

    pub fn cold(initial_level_pct: f64) -> Self {
        Self {
            level_pct: initial_level_pct.clamp(0.0, 100.0),
            rate_pct_per_sec: 0.0,
            covariance: Covariance2 { p00: 25.0, p01: 0.0, p11: 1.0 },
            last_timestamp: None,
            last_odometer_mi: None,
            last_ecu_fuel_used_gal: None,
            last_level_pct: None,
            innovation_history: VecDeque::with_capacity(Self::INNOVATION_HISTORY_CAP),
        }
    }

    pub fn push_innovation(&mut self, innovation: f64) {
        if self.innovation_history.len() == Self::INNOVATION_HISTORY_CAP {
            self.innovation_history.pop_front();
        }
        self.innovation_history.push_back(innovation);
    }
}

/// Persisted MPG accumulator/EMA state for one truck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpgState {
    pub distance_accum_mi: f64,
    pub fuel_accum_gal: f64,
    pub instant_mpg: Option<f64>,
    pub ema_mpg: Option<f64>,
    pub variance: f64,
    pub sample_count: u64,
    pub last_update: Option<DateTime<Utc>>,
    /// Bounded history of recent raw MPG samples for the IQR/MAD outlier filter.
    pub raw_mpg_history: VecDeque<f64>,
}

impl MpgState {
    pub const RAW_HISTORY_CAP: usize = 100;

    pub fn new() -> Self {
        Self {
            distance_accum_mi: 0.0,
            fuel_accum_gal: 0.0,
            instant_mpg: None,
            ema_mpg: None,
            variance: 0.0,
            sample_count: 0,
            last_update: None,
            raw_mpg_history: VecDeque::with_capacity(Self::RAW_HISTORY_CAP),
        }
    }

    pub fn push_raw(&mut self, mpg: f64) {
        if self.raw_mpg_history.len() == Self::RAW_HISTORY_CAP {
            self.raw_mpg_history.pop_front();
        }
        self.raw_mpg_history.push_back(mpg);
    }
}

impl Default for MpgState {
    fn default() -> Self {
        Self::new()
    }
}

/// A level-drop currently being tracked by the classifier state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDrop {
    pub original_level_pct: f64,
    pub drop_start_timestamp: DateTime<Utc>,
    pub cumulative_drop_pct: f64,
}

/// Persisted classifier state machine for one truck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierState {
    pub pending_drop: Option<PendingDrop>,
    /// Timestamps of the last N confirmed theft events, for pattern scoring.
    pub recent_theft_timestamps: VecDeque<DateTime<Utc>>,
    /// Magnitude (in %) of the last N confirmed refuels, for adaptive threshold learning.
    pub recent_refuel_jumps_pct: VecDeque<f64>,
    pub last_refuel_timestamp: Option<DateTime<Utc>>,
    /// Cooldown timer: resync proposals are ignored until this instant passes.
    pub resync_cooldown_until: Option<DateTime<Utc>>,
}

impl ClassifierState {
    pub const HISTORY_CAP: usize = 50;

    pub fn new() -> Self {
        Self {
            pending_drop: None,
            recent_theft_timestamps: VecDeque::with_capacity(Self::HISTORY_CAP),
            recent_refuel_jumps_pct: VecDeque::with_capacity(Self::HISTORY_CAP),
            last_refuel_timestamp: None,
            resync_cooldown_until: None,
        }
    }

    pub fn push_refuel_jump(&mut self, pct: f64) {
        if self.recent_refuel_jumps_pct.len() == Self::HISTORY_CAP {
            self.recent_refuel_jumps_pct.pop_front();
        }
        self.recent_refuel_jumps_pct.push_back(pct);
    }

    pub fn push_theft_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.recent_theft_timestamps.len() == Self::HISTORY_CAP {
            self.recent_theft_timestamps.pop_front();
        }
        self.recent_theft_timestamps.push_back(ts);
    }
}

impl Default for ClassifierState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bundle of the three pieces of per-truck state that get snapshotted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruckState {
    pub kalman: KalmanState,
    pub mpg: MpgState,
    pub classifier: ClassifierState,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// Persisted, append-only / upserted output entities.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuValidationStatus {
    Normal,
    Warning,
    Critical,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            ConfidenceLevel::High
        } else if score >= 65.0 {
            ConfidenceLevel::Medium
        } else if score >= 40.0 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

/// One row of the append-only fuel metrics stream, keyed on `(truck_id, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuelMetric {
    pub truck_id: String,
    pub timestamp: DateTime<Utc>,
    pub sensor_fuel_pct: Option<f64>,
    pub kalman_fuel_pct: f64,
    pub mpg_instant: Option<f64>,
    pub mpg_ema: Option<f64>,
    pub mpg_snr: Option<f64>,
    pub ecu_validation_status: EcuValidationStatus,
    pub ecu_deviation_pct: Option<f64>,
    pub confidence_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub is_interpolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    Sensor,
    Kalman,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefuelEvent {
    pub id: Uuid,
    pub truck_id: String,
    pub timestamp: DateTime<Utc>,
    pub fuel_before_pct: f64,
    pub fuel_after_pct: f64,
    pub gallons_added: f64,
    pub detection_method: DetectionMethod,
    pub confidence: f64,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TheftClassification {
    TheftConfirmed,
    TheftSuspected,
    SlowSiphon,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GallonRange {
    pub min: f64,
    pub max: f64,
}

/// Feature breakdown behind a theft confidence score (spec §4.5).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TheftFeatureBreakdown {
    pub movement: f64,
    pub time_of_day: f64,
    pub sensor_health: f64,
    pub drop_size: f64,
    pub location: f64,
    pub pattern: f64,
    pub recovery: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TheftEvent {
    pub id: Uuid,
    pub truck_id: String,
    pub timestamp: DateTime<Utc>,
    pub fuel_drop_gal: f64,
    pub drop_pct: f64,
    pub classification: TheftClassification,
    pub confidence_0_100: f64,
    pub estimated_loss_gal_range: GallonRange,
    pub features: TheftFeatureBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Moderate,
    Low,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcStatus {
    New,
    Active,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcEvent {
    pub id: Uuid,
    pub truck_id: String,
    pub timestamp: DateTime<Utc>,
    pub dtc_code: String,
    pub spn: u32,
    pub fmi: u8,
    pub severity: Severity,
    pub category: String,
    pub description_es: String,
    pub spn_explanation_es: Option<String>,
    pub fmi_explanation_es: String,
    pub has_detailed_info: bool,
    pub oem: String,
    pub action_required: String,
    pub status: DtcStatus,
}

/// Static, read-only (SPN, FMI) -> detail record, either tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct J1939Record {
    pub name: String,
    pub description_es: String,
    pub spn_explanation_es: Option<String>,
    pub fmi_explanation_es: String,
    pub severity: Severity,
    pub category: String,
    pub action: String,
    pub oem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulModel {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RulStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulPrediction {
    pub truck_id: String,
    pub component_id: String,
    pub model: RulModel,
    pub current_score: f64,
    pub rul_days: f64,
    pub rul_miles: f64,
    pub confidence_r2: f64,
    pub estimated_cost: f64,
    pub recommended_service_date: DateTime<Utc>,
    pub status: RulStatus,
}

/// Outcome of a single classifier invocation (design notes §9: no exceptions
/// for control flow, tagged result variants instead).
#[derive(Debug, Clone)]
pub enum ClassifierOutcome {
    Refuel(RefuelEvent),
    Theft(TheftEvent),
    SensorGlitch,
    RefuelAfterDrop(RefuelEvent),
    Consumption,
    None,
}
