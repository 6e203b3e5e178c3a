//! Theft confidence scoring.
//!
//! `TheftScorer` is a pluggable seam: the rule-based formula below is the
//! only implementation specified, but deployed inference for theft
//! classification is explicitly in scope while *training* one is not (spec
//! §1) — a future learned scorer implements this same trait without any
//! change at the classifier's call site.

use super::VolatilityBucket;
use crate::types::{TheftFeatureBreakdown, TruckStatus};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::VecDeque;

pub struct ScoringInput<'a> {
    pub status: TruckStatus,
    pub timestamp: DateTime<Utc>,
    pub sensor_uptime_pct: f64,
    pub volatility_bucket: VolatilityBucket,
    pub drop_gal: f64,
    pub drop_pct: f64,
    pub in_known_safe_zone: bool,
    pub recent_theft_timestamps: &'a VecDeque<DateTime<Utc>>,
    pub elapsed_recovery_min: f64,
}

pub struct ScoringOutput {
    pub total: f64,
    pub breakdown: TheftFeatureBreakdown,
}

pub trait TheftScorer: Send + Sync {
    fn score(&self, input: &ScoringInput) -> ScoringOutput;
}

/// The rule-based formula from spec §4.5: base 50, additive/subtractive
/// factors, clamped to `[0, 100]`.
pub struct RuleBasedScorer;

impl TheftScorer for RuleBasedScorer {
    fn score(&self, input: &ScoringInput) -> ScoringOutput {
        let movement = match input.status {
            TruckStatus::Parked => 30.0,
            TruckStatus::Idle => 10.0,
            TruckStatus::Moving => -50.0,
        };

        let hour = input.timestamp.hour();
        let is_night = !(5..22).contains(&hour);
        let is_weekend = matches!(input.timestamp.weekday().num_days_from_monday(), 5 | 6);
        let mut time_of_day = 0.0;
        if is_night {
            time_of_day += 10.0;
        }
        if is_weekend {
            time_of_day += 5.0;
        }
        if hour < 6 || hour >= 20 {
            time_of_day += 3.0;
        }

        let sensor_health = match input.volatility_bucket {
            VolatilityBucket::Disconnected => -40.0,
            VolatilityBucket::High => -30.0,
            VolatilityBucket::Medium => -20.0,
            VolatilityBucket::Low => -10.0 * (1.0 - (input.sensor_uptime_pct / 100.0).min(1.0)),
        };

        let mut drop_size = if input.drop_gal >= 50.0 {
            25.0
        } else if input.drop_gal >= 30.0 {
            20.0
        } else if input.drop_gal >= 20.0 {
            15.0
        } else if input.drop_gal >= 15.0 {
            10.0
        } else {
            5.0
        };
        if input.drop_pct >= 30.0 {
            drop_size += 5.0;
        }

        let location = if input.in_known_safe_zone { -20.0 } else { 10.0 };

        let recurrence_count = input.recent_theft_timestamps.len();
        let mut pattern = match recurrence_count {
            0 => 0.0,
            1 => 5.0,
            2 => 10.0,
            _ => 15.0,
        };
        let same_weekday = input
            .recent_theft_timestamps
            .iter()
            .any(|t| t.weekday() == input.timestamp.weekday());
        let same_hour = input.recent_theft_timestamps.iter().any(|t| {
            let diff = (t.hour() as i64 - input.timestamp.hour() as i64).abs();
            diff <= 2 || diff >= 22
        });
        if same_weekday {
            pattern += 5.0;
        }
        if same_hour {
            pattern += 5.0;
        }

        let recovery = if input.elapsed_recovery_min < 10.0 {
            -50.0
        } else if input.elapsed_recovery_min < 20.0 {
            -40.0
        } else if input.elapsed_recovery_min < 30.0 {
            -30.0
        } else {
            0.0
        };

        let breakdown = TheftFeatureBreakdown {
            movement,
            time_of_day,
            sensor_health,
            drop_size,
            location,
            pattern,
            recovery,
        };

        let total = (50.0
            + breakdown.movement
            + breakdown.time_of_day
            + breakdown.sensor_health
            + breakdown.drop_size
            + breakdown.location
            + breakdown.pattern
            + breakdown.recovery)
            .clamp(0.0, 100.0);

        ScoringOutput { total, breakdown }
    }
}
