//! Slow-Siphon Detector (spec §4.6): a rolling 7-day window of daily
//! consumption aggregates, looking for gradual loss patterns the
//! instantaneous classifier can't see.

use crate::config::SiphonConfig;
use crate::types::{GallonRange, TheftClassification, TheftEvent};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub expected_consumption_gal: f64,
    pub actual_consumption_gal: f64,
    pub miles_driven: f64,
    pub parked_heavy: bool,
}

impl DailyAggregate {
    pub fn derived_loss_gal(&self) -> f64 {
        (self.actual_consumption_gal - self.expected_consumption_gal).max(0.0)
    }
}

/// Per-truck rolling window of daily aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiphonWindow {
    days: VecDeque<DailyAggregate>,
}

impl SiphonWindow {
    pub fn new() -> Self {
        Self { days: VecDeque::new() }
    }

    pub fn push_day(&mut self, day: DailyAggregate, cfg: &SiphonConfig) {
        self.days.push_back(day);
        while self.days.len() > cfg.window_days {
            self.days.pop_front();
        }
    }

    /// Evaluate the current window and return a theft event if the pattern
    /// crosses both the consecutive-day and cumulative-loss thresholds.
    pub fn evaluate(
        &self,
        truck_id: &str,
        as_of: DateTime<Utc>,
        cfg: &SiphonConfig,
    ) -> Option<TheftEvent> {
        let mut consecutive = 0usize;
        let mut streak: Vec<&DailyAggregate> = Vec::new();
        for day in self.days.iter().rev() {
            if day.derived_loss_gal() > cfg.daily_threshold_gal {
                consecutive += 1;
                streak.push(day);
            } else {
                break;
            }
        }

        if consecutive < cfg.min_consecutive_days {
            return None;
        }

        let cumulative_loss: f64 = streak.iter().map(|d| d.derived_loss_gal()).sum();
        if cumulative_loss < cfg.window_threshold_gal {
            return None;
        }

        let mut confidence = 50.0 + 10.0 * consecutive as f64;
        let losses: Vec<f64> = streak.iter().rev().map(|d| d.derived_loss_gal()).collect();
        let monotone = losses.windows(2).all(|w| w[1] >= w[0]);
        if monotone {
            confidence += 5.0;
        }
        if streak.iter().all(|d| d.parked_heavy) {
            confidence += 5.0;
        }
        confidence = confidence.min(100.0);

        Some(TheftEvent {
            id: Uuid::new_v4(),
            truck_id: truck_id.to_string(),
            timestamp: as_of,
            fuel_drop_gal: cumulative_loss,
            drop_pct: 0.0,
            classification: TheftClassification::SlowSiphon,
            confidence_0_100: confidence,
            estimated_loss_gal_range: GallonRange {
                min: cumulative_loss * 0.95,
                max: cumulative_loss * 1.05,
            },
            features: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(offset: i64, expected: f64, actual: f64) -> DailyAggregate {
        DailyAggregate {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Duration::days(offset),
            expected_consumption_gal: expected,
            actual_consumption_gal: actual,
            miles_driven: 300.0,
            parked_heavy: true,
        }
    }

    #[test]
    fn s6_slow_siphon_scenario() {
        let cfg = SiphonConfig {
            window_days: 7,
            min_consecutive_days: 3,
            daily_threshold_gal: 2.0,
            window_threshold_gal: 10.0,
        };
        let mut window = SiphonWindow::new();
        for i in 0..5 {
            window.push_day(day(i, 50.0, 52.4), &cfg);
        }
        let as_of = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let event = window.evaluate("t1", as_of, &cfg).expect("expected siphon event");
        assert_eq!(event.classification, TheftClassification::SlowSiphon);
        assert!((event.fuel_drop_gal - 12.0).abs() < 1e-6);
        assert_eq!(event.confidence_0_100, 100.0);
    }

    #[test]
    fn below_threshold_emits_nothing() {
        let cfg = SiphonConfig {
            window_days: 7,
            min_consecutive_days: 3,
            daily_threshold_gal: 2.0,
            window_threshold_gal: 10.0,
        };
        let mut window = SiphonWindow::new();
        window.push_day(day(0, 50.0, 50.5), &cfg);
        window.push_day(day(1, 50.0, 50.5), &cfg);
        let as_of = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();
        assert!(window.evaluate("t1", as_of, &cfg).is_none());
    }
}
