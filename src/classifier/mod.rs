//! Refuel / Theft Classifier (spec §4.5): a per-truck state machine over
//! level changes, with a speed gate, recovery-window debouncing, and a
//! pluggable confidence scorer.

mod scoring;

pub use scoring::{RuleBasedScorer, TheftScorer};

use crate::config::ClassifierThresholds;
use crate::ekf::RefuelCandidate;
use crate::types::{
    ClassifierOutcome, ClassifierState, DetectionMethod, GallonRange, Location, PendingDrop,
    RefuelEvent, TheftClassification, TheftEvent, TruckStatus,
};
use chrono::{DateTime, Utc};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use uuid::Uuid;

/// Everything the classifier needs about the current reading that isn't
/// already on `ClassifierState`.
pub struct ClassifierInput<'a> {
    pub truck_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub sensor_level_pct: Option<f64>,
    pub kalman_level_pct: f64,
    pub speed_mph: f64,
    pub status: TruckStatus,
    pub location: Option<Location>,
    pub tank_capacity_gal: f64,
    pub refuel_candidate: Option<RefuelCandidate>,
    pub sensor_uptime_pct: f64,
    pub sensor_volatility_bucket: VolatilityBucket,
    pub in_known_safe_zone: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
    Disconnected,
}

/// Percentile-10 (with variance-adjustment floor) of a truck's confirmed
/// refuel jump magnitudes, once at least 10 samples exist — P10 adaptive
/// threshold learning.
pub fn adaptive_min_refuel_jump_pct(state: &ClassifierState, cfg: &ClassifierThresholds) -> f64 {
    if state.recent_refuel_jumps_pct.len() < 10 {
        return cfg.min_refuel_jump_pct;
    }
    let samples: Vec<f64> = state.recent_refuel_jumps_pct.iter().copied().collect();
    let p10 = Data::new(samples.clone()).percentile(10);
    let variance_adjustment = samples.std_dev() * 0.1;

    (p10 - variance_adjustment).max(cfg.min_refuel_jump_floor_pct)
}

fn within_dedup_window(last: Option<DateTime<Utc>>, now: DateTime<Utc>, window_min: i64) -> bool {
    matches!(last, Some(t) if (now - t).num_minutes().abs() < window_min)
}

/// Run one classifier step. This is the only entry point the orchestrator
/// calls; it drives both the immediate-refuel rule and the drop state
/// machine, and is free of any I/O.
pub fn classify(
    state: &mut ClassifierState,
    input: &ClassifierInput,
    cfg: &ClassifierThresholds,
    scorer: &dyn TheftScorer,
) -> ClassifierOutcome {
    if let Some(candidate) = &input.refuel_candidate {
        if let Some(outcome) = try_immediate_refuel(state, input, candidate, cfg) {
            return outcome;
        }
    }

    if let Some(pending) = state.pending_drop.clone() {
        return drive_pending_drop(state, input, pending, cfg, scorer);
    }

    try_enter_pending_drop(state, input, cfg)
}

fn try_immediate_refuel(
    state: &mut ClassifierState,
    input: &ClassifierInput,
    candidate: &RefuelCandidate,
    cfg: &ClassifierThresholds,
) -> Option<ClassifierOutcome> {
    let jump_pct = candidate.sensor_level_pct - candidate.predicted_level_pct;
    let min_jump = adaptive_min_refuel_jump_pct(state, cfg);
    if jump_pct < min_jump {
        return None;
    }

    let gallons_added = (jump_pct / 100.0) * input.tank_capacity_gal;
    if gallons_added < cfg.min_refuel_gal {
        return None;
    }

    if let Some(last) = state.last_refuel_timestamp {
        let gap_hr = (input.timestamp - last).num_minutes() as f64 / 60.0;
        let gap_min = gap_hr * 60.0;
        if gap_min < cfg.min_refuel_gap_min || gap_hr > cfg.max_refuel_gap_hr {
            return None;
        }
        if within_dedup_window(Some(last), input.timestamp, cfg.refuel_dedup_window_min) {
            return Some(ClassifierOutcome::None);
        }
    }

    state.last_refuel_timestamp = Some(input.timestamp);
    state.push_refuel_jump(jump_pct);
    state.pending_drop = None;

    let event = RefuelEvent {
        id: Uuid::new_v4(),
        truck_id: input.truck_id.to_string(),
        timestamp: input.timestamp,
        fuel_before_pct: candidate.predicted_level_pct,
        fuel_after_pct: candidate.sensor_level_pct,
        gallons_added,
        detection_method: DetectionMethod::Both,
        confidence: (0.8 + (jump_pct - min_jump) / 100.0).min(1.0),
        location: input.location,
    };
    Some(ClassifierOutcome::Refuel(event))
}

fn try_enter_pending_drop(
    state: &mut ClassifierState,
    input: &ClassifierInput,
    cfg: &ClassifierThresholds,
) -> ClassifierOutcome {
    let Some(sensor) = input.sensor_level_pct else {
        return ClassifierOutcome::None;
    };
    let drop_pct = input.kalman_level_pct - sensor;
    if drop_pct < cfg.drop_threshold_pct {
        return ClassifierOutcome::None;
    }

    // Mandatory speed gate: drops while moving are never theft candidates.
    if input.speed_mph > cfg.speed_gate_mph {
        return ClassifierOutcome::Consumption;
    }

    state.pending_drop = Some(PendingDrop {
        original_level_pct: input.kalman_level_pct,
        drop_start_timestamp: input.timestamp,
        cumulative_drop_pct: drop_pct,
    });
    ClassifierOutcome::None
}

fn drive_pending_drop(
    state: &mut ClassifierState,
    input: &ClassifierInput,
    pending: PendingDrop,
    cfg: &ClassifierThresholds,
    scorer: &dyn TheftScorer,
) -> ClassifierOutcome {
    let Some(sensor) = input.sensor_level_pct else {
        return ClassifierOutcome::None;
    };

    // Speed gate applies across the whole drop window (P5).
    if input.speed_mph > cfg.speed_gate_mph {
        state.pending_drop = None;
        return ClassifierOutcome::Consumption;
    }

    let elapsed_min = (input.timestamp - pending.drop_start_timestamp).num_seconds() as f64 / 60.0;
    let window_min = if matches!(input.sensor_volatility_bucket, VolatilityBucket::High) {
        cfg.recovery_window_extended_min
    } else {
        cfg.recovery_window_min
    } as f64;

    let recovered_to_within_tolerance =
        (sensor - pending.original_level_pct).abs() <= cfg.recovery_tolerance_pct;
    // Rise measured from the lowest point seen so far in this drop, not from
    // the original level — a rise mid-drop still counts as a refuel-after-drop.
    let lowest_seen = pending.original_level_pct - pending.cumulative_drop_pct;
    let rose_pct = sensor - lowest_seen;

    if elapsed_min < window_min {
        if recovered_to_within_tolerance {
            state.pending_drop = None;
            return ClassifierOutcome::SensorGlitch;
        }
        if rose_pct > cfg.refuel_threshold_pct {
            let gallons_added = (rose_pct / 100.0) * input.tank_capacity_gal;
            state.pending_drop = None;
            let event = RefuelEvent {
                id: Uuid::new_v4(),
                truck_id: input.truck_id.to_string(),
                timestamp: input.timestamp,
                fuel_before_pct: pending.original_level_pct - pending.cumulative_drop_pct,
                fuel_after_pct: sensor,
                gallons_added,
                detection_method: DetectionMethod::Sensor,
                confidence: 0.7,
                location: input.location,
            };
            return ClassifierOutcome::RefuelAfterDrop(event);
        }
        // Still inside the window with no recovery yet: keep tracking the
        // deepest point reached so a partial bounce doesn't look like a rise.
        let current_drop = pending.original_level_pct - sensor;
        state.pending_drop = Some(PendingDrop {
            cumulative_drop_pct: pending.cumulative_drop_pct.max(current_drop),
            ..pending
        });
        return ClassifierOutcome::None;
    }

    // Window expired, level remains depressed: score confidence.
    state.pending_drop = None;
    let drop_pct = pending.original_level_pct - sensor;
    let drop_gal = (drop_pct / 100.0) * input.tank_capacity_gal;

    let score = scorer.score(&scoring::ScoringInput {
        status: input.status,
        timestamp: input.timestamp,
        sensor_uptime_pct: input.sensor_uptime_pct,
        volatility_bucket: input.sensor_volatility_bucket,
        drop_gal,
        drop_pct,
        in_known_safe_zone: input.in_known_safe_zone,
        recent_theft_timestamps: &state.recent_theft_timestamps,
        elapsed_recovery_min: elapsed_min,
    });

    if score.total < cfg.theft_suspected_score {
        return ClassifierOutcome::None;
    }

    let classification = if score.total >= cfg.theft_confirmed_score {
        TheftClassification::TheftConfirmed
    } else {
        TheftClassification::TheftSuspected
    };

    state.push_theft_timestamp(input.timestamp);

    let event = TheftEvent {
        id: Uuid::new_v4(),
        truck_id: input.truck_id.to_string(),
        timestamp: input.timestamp,
        fuel_drop_gal: drop_gal,
        drop_pct,
        classification,
        confidence_0_100: score.total,
        estimated_loss_gal_range: GallonRange { min: drop_gal * 0.95, max: drop_gal * 1.05 },
        features: score.breakdown,
    };
    ClassifierOutcome::Theft(event)
}
