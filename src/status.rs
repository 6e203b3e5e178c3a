//! Truck operating-status derivation (spec §4.5, "used here and elsewhere"):
//! shared by the EKF (process-noise scaling), the classifier (speed gate,
//! confidence scoring) and the orchestrator (persisted metric context).

use crate::config::defaults::{PARKED_LOCATION_STABLE_SECS, PARKED_RPM_IDLE_THRESHOLD, PARKED_SPEED_MPH};
use crate::types::{Location, RawReading, TruckStatus};
use chrono::{DateTime, Utc};

/// Tracks the truck's last-known location and how long it's been stable,
/// needed to distinguish PARKED (stationary *and* idle) from IDLE
/// (engine running, not moving, but location not yet confirmed stable).
#[derive(Debug, Clone, Default)]
pub struct LocationTracker {
    last_location: Option<Location>,
    stable_since: Option<DateTime<Utc>>,
}

impl LocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many seconds the location has been unchanged as of `now`,
    /// updating internal state with the new observation.
    pub fn observe(&mut self, location: Option<Location>, now: DateTime<Utc>) -> i64 {
        match (self.last_location, location) {
            (Some(prev), Some(cur)) if locations_close(prev, cur) => {
                let since = self.stable_since.get_or_insert(now);
                (now - *since).num_seconds().max(0)
            }
            _ => {
                self.last_location = location;
                self.stable_since = Some(now);
                0
            }
        }
    }
}

fn locations_close(a: Location, b: Location) -> bool {
    // ~10m at mid-latitudes; good enough to treat as "hasn't moved".
    (a.lat - b.lat).abs() < 0.0001 && (a.lon - b.lon).abs() < 0.0001
}

/// Derive PARKED / IDLE / MOVING from the reading and how long the truck's
/// location has been stable.
pub fn derive_status(reading: &RawReading, location_stable_secs: i64) -> TruckStatus {
    if reading.speed_mph >= 2.0 {
        return TruckStatus::Moving;
    }
    if reading.speed_mph < PARKED_SPEED_MPH
        && reading.rpm < PARKED_RPM_IDLE_THRESHOLD
        && location_stable_secs > PARKED_LOCATION_STABLE_SECS
    {
        return TruckStatus::Parked;
    }
    if reading.rpm > 0.0 && reading.speed_mph < PARKED_SPEED_MPH {
        return TruckStatus::Idle;
    }
    TruckStatus::Parked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(speed: f64, rpm: f64) -> RawReading {
        RawReading {
            truck_id: "t1".into(),
            timestamp: Utc::now(),
            fuel_level_pct: None,
            odometer_mi: None,
            ecu_total_fuel_used_gal: None,
            ecu_fuel_rate_lph: None,
            speed_mph: speed,
            rpm,
            engine_load_pct: 0.0,
            battery_voltage: 13.0,
            gps_satellites: 8,
            altitude_m: None,
            ambient_temp_f: None,
            dtc_string: None,
            engine_hours: None,
            location: None,
        }
    }

    #[test]
    fn moving_when_speed_above_threshold() {
        assert_eq!(derive_status(&reading(10.0, 1400.0), 0), TruckStatus::Moving);
    }

    #[test]
    fn idle_when_running_but_not_parked_long_enough() {
        assert_eq!(derive_status(&reading(0.0, 700.0), 5), TruckStatus::Idle);
    }

    #[test]
    fn parked_when_stationary_and_stable() {
        assert_eq!(derive_status(&reading(0.0, 0.0), 120), TruckStatus::Parked);
    }
}
