//! Sensor Health Monitor (spec §4.7): tracks per-sensor reading patterns and
//! surfaces a health level that degrades the EKF's measurement trust and the
//! classifier's confidence scoring.

use crate::config::SensorHealthConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    FuelLevel,
    Odometer,
    EcuFuelUsed,
    GpsSatellites,
    BatteryVoltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueKind {
    Missing,
    Stuck,
    Erratic,
    OutOfRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorIssue {
    pub kind: IssueKind,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthLevel {
    fn from_uptime_and_issues(uptime_pct: f64, active_issue_count: usize) -> Self {
        if active_issue_count >= 3 || uptime_pct < 50.0 {
            HealthLevel::Critical
        } else if active_issue_count >= 2 || uptime_pct < 75.0 {
            HealthLevel::Poor
        } else if active_issue_count >= 1 || uptime_pct < 90.0 {
            HealthLevel::Fair
        } else if uptime_pct < 99.0 {
            HealthLevel::Good
        } else {
            HealthLevel::Excellent
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
    present: bool,
}

/// Rolling per-sensor buffer and derived health state.
#[derive(Debug, Clone)]
pub struct SensorTrack {
    kind: SensorKind,
    history: VecDeque<Sample>,
    range_min: f64,
    range_max: f64,
    issues: Vec<SensorIssue>,
}

impl SensorTrack {
    pub fn new(kind: SensorKind, range_min: f64, range_max: f64) -> Self {
        Self { kind, history: VecDeque::new(), range_min, range_max, issues: Vec::new() }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: Option<f64>, cfg: &SensorHealthConfig) {
        let present = value.is_some();
        self.history.push_back(Sample { timestamp, value: value.unwrap_or(f64::NAN), present });
        while self.history.len() > cfg.buffer_cap {
            self.history.pop_front();
        }
        self.detect_issues(cfg);
    }

    fn detect_issues(&mut self, cfg: &SensorHealthConfig) {
        let now = match self.history.back() {
            Some(s) => s.timestamp,
            None => return,
        };

        if let Some(last_present) = self.history.iter().rev().find(|s| s.present) {
            let gap_min = (now - last_present.timestamp).num_seconds() as f64 / 60.0;
            if gap_min >= cfg.missing_minutes as f64 {
                self.record(IssueKind::Missing, now);
            }
        } else {
            self.record(IssueKind::Missing, now);
        }

        let present: Vec<Sample> = self.history.iter().filter(|s| s.present).copied().collect();
        if present.len() >= 2 {
            let Some(latest) = present.last().map(|s| s.value) else { return };
            let stuck_run_start = present
                .iter()
                .rev()
                .take_while(|s| (s.value - latest).abs() < 1e-6)
                .last()
                .map(|s| s.timestamp)
                .unwrap_or(now);
            let stuck_min = (now - stuck_run_start).num_seconds() as f64 / 60.0;
            if stuck_min >= cfg.stuck_minutes as f64 {
                self.record(IssueKind::Stuck, now);
            }

            let range = (self.range_max - self.range_min).max(1e-6);
            let recent: Vec<f64> = present.iter().rev().take(10).map(|s| s.value).collect();
            if recent.len() >= 3 {
                let max = recent.iter().cloned().fold(f64::MIN, f64::max);
                let min = recent.iter().cloned().fold(f64::MAX, f64::min);
                if (max - min) / range >= cfg.erratic_fraction_of_range {
                    self.record(IssueKind::Erratic, now);
                }
            }

            if latest < self.range_min || latest > self.range_max {
                self.record(IssueKind::OutOfRange, now);
            }
        }

        let retention = chrono::Duration::days(cfg.issue_retention_days);
        self.issues.retain(|issue| now - issue.last_seen <= retention);
    }

    fn record(&mut self, kind: IssueKind, at: DateTime<Utc>) {
        if let Some(existing) = self.issues.iter_mut().find(|i| i.kind == kind) {
            existing.last_seen = at;
        } else {
            self.issues.push(SensorIssue { kind, first_seen: at, last_seen: at });
        }
    }

    pub fn uptime_pct(&self) -> f64 {
        if self.history.is_empty() {
            return 100.0;
        }
        let present = self.history.iter().filter(|s| s.present).count();
        100.0 * present as f64 / self.history.len() as f64
    }

    pub fn active_issues(&self) -> &[SensorIssue] {
        &self.issues
    }

    pub fn health_level(&self) -> HealthLevel {
        HealthLevel::from_uptime_and_issues(self.uptime_pct(), self.issues.len())
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }
}

/// All sensor tracks for one truck.
#[derive(Debug, Clone)]
pub struct TruckSensorHealth {
    pub fuel_level: SensorTrack,
    pub odometer: SensorTrack,
    pub ecu_fuel_used: SensorTrack,
    pub gps_satellites: SensorTrack,
    pub battery_voltage: SensorTrack,
}

impl TruckSensorHealth {
    pub fn new() -> Self {
        Self {
            fuel_level: SensorTrack::new(SensorKind::FuelLevel, 0.0, 100.0),
            odometer: SensorTrack::new(SensorKind::Odometer, 0.0, 2_000_000.0),
            ecu_fuel_used: SensorTrack::new(SensorKind::EcuFuelUsed, 0.0, 1_000_000.0),
            gps_satellites: SensorTrack::new(SensorKind::GpsSatellites, 0.0, 32.0),
            battery_voltage: SensorTrack::new(SensorKind::BatteryVoltage, 8.0, 16.0),
        }
    }

    /// Worst of the per-sensor health levels, since any degraded sensor can
    /// poison downstream fusion.
    pub fn overall_health(&self) -> HealthLevel {
        [
            self.fuel_level.health_level(),
            self.odometer.health_level(),
            self.ecu_fuel_used.health_level(),
            self.gps_satellites.health_level(),
            self.battery_voltage.health_level(),
        ]
        .into_iter()
        .max_by_key(|h| match h {
            HealthLevel::Excellent => 0,
            HealthLevel::Good => 1,
            HealthLevel::Fair => 2,
            HealthLevel::Poor => 3,
            HealthLevel::Critical => 4,
        })
        .unwrap_or(HealthLevel::Excellent)
    }

    pub fn fuel_sensor_uptime_pct(&self) -> f64 {
        self.fuel_level.uptime_pct()
    }
}

impl Default for TruckSensorHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(sec)
    }

    #[test]
    fn missing_reading_flagged_after_gap() {
        let cfg = SensorHealthConfig::default();
        let mut track = SensorTrack::new(SensorKind::FuelLevel, 0.0, 100.0);
        track.push(t(0), Some(50.0), &cfg);
        track.push(t(3600), None, &cfg);
        assert!(track.active_issues().iter().any(|i| i.kind == IssueKind::Missing));
    }

    #[test]
    fn stuck_value_flagged() {
        let cfg = SensorHealthConfig::default();
        let mut track = SensorTrack::new(SensorKind::FuelLevel, 0.0, 100.0);
        for i in 0..40 {
            track.push(t(i * 60), Some(42.0), &cfg);
        }
        assert!(track.active_issues().iter().any(|i| i.kind == IssueKind::Stuck));
    }

    #[test]
    fn healthy_sensor_reports_excellent() {
        let cfg = SensorHealthConfig::default();
        let mut track = SensorTrack::new(SensorKind::FuelLevel, 0.0, 100.0);
        let mut v = 50.0;
        for i in 0..20 {
            v += 0.1;
            track.push(t(i * 60), Some(v), &cfg);
        }
        assert_eq!(track.health_level(), HealthLevel::Excellent);
    }

    #[test]
    fn out_of_range_value_flagged() {
        let cfg = SensorHealthConfig::default();
        let mut track = SensorTrack::new(SensorKind::FuelLevel, 0.0, 100.0);
        track.push(t(0), Some(40.0), &cfg);
        track.push(t(60), Some(45.0), &cfg);
        track.push(t(120), Some(150.0), &cfg);
        assert!(track.active_issues().iter().any(|i| i.kind == IssueKind::OutOfRange));
    }
}
