use super::{PersistenceError, PersistenceLayer, PersistenceResult};
use crate::types::{DtcEvent, DtcStatus, FuelMetric, RefuelEvent, TheftEvent, TruckState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory `PersistenceLayer`, used in tests and by `fleet-sim`. Nothing
/// survives process exit.
#[derive(Default)]
pub struct InMemoryGateway {
    fuel_metrics: DashMap<String, Mutex<Vec<FuelMetric>>>,
    seen_metric_keys: DashMap<(String, DateTime<Utc>), ()>,
    latest: DashMap<String, FuelMetric>,
    refuel_events: DashMap<String, Mutex<Vec<RefuelEvent>>>,
    seen_refuel_ids: DashMap<Uuid, ()>,
    theft_events: DashMap<String, Mutex<Vec<TheftEvent>>>,
    seen_theft_ids: DashMap<Uuid, ()>,
    dtc_events: DashMap<String, Mutex<Vec<DtcEvent>>>,
    seen_dtc_ids: DashMap<Uuid, ()>,
    state: DashMap<String, TruckState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fuel_metric_count(&self, truck_id: &str) -> usize {
        self.fuel_metrics.get(truck_id).map(|v| v.lock().unwrap_or_else(|e| e.into_inner()).len()).unwrap_or(0)
    }

    pub fn refuel_events_for(&self, truck_id: &str) -> Vec<RefuelEvent> {
        self.refuel_events
            .get(truck_id)
            .map(|v| v.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    pub fn theft_events_for(&self, truck_id: &str) -> Vec<TheftEvent> {
        self.theft_events
            .get(truck_id)
            .map(|v| v.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    pub fn dtc_events_for(&self, truck_id: &str) -> Vec<DtcEvent> {
        self.dtc_events
            .get(truck_id)
            .map(|v| v.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceLayer for InMemoryGateway {
    async fn append_fuel_metric(&self, metric: FuelMetric) -> PersistenceResult<()> {
        let key = (metric.truck_id.clone(), metric.timestamp);
        if self.seen_metric_keys.insert(key, ()).is_some() {
            return Ok(());
        }
        self.fuel_metrics
            .entry(metric.truck_id.clone())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .map_err(|_| PersistenceError::Backend("fuel metric lock poisoned".into()))?
            .push(metric);
        Ok(())
    }

    async fn upsert_latest(&self, metric: FuelMetric) -> PersistenceResult<()> {
        self.latest.insert(metric.truck_id.clone(), metric);
        Ok(())
    }

    async fn write_refuel_event(&self, event: RefuelEvent) -> PersistenceResult<()> {
        if self.seen_refuel_ids.insert(event.id, ()).is_some() {
            return Ok(());
        }
        let bucket = self.refuel_events.entry(event.truck_id.clone()).or_insert_with(|| Mutex::new(Vec::new()));
        let mut events = bucket.lock().map_err(|_| PersistenceError::Backend("refuel event lock poisoned".into()))?;
        let within_dedup_window = events
            .iter()
            .any(|e| (e.timestamp - event.timestamp).num_seconds().abs() < 300);
        if within_dedup_window {
            return Ok(());
        }
        events.push(event);
        Ok(())
    }

    async fn write_theft_event(&self, event: TheftEvent) -> PersistenceResult<()> {
        if self.seen_theft_ids.insert(event.id, ()).is_some() {
            return Ok(());
        }
        self.theft_events
            .entry(event.truck_id.clone())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .map_err(|_| PersistenceError::Backend("theft event lock poisoned".into()))?
            .push(event);
        Ok(())
    }

    async fn write_dtc_event(&self, event: DtcEvent) -> PersistenceResult<()> {
        if self.seen_dtc_ids.insert(event.id, ()).is_some() {
            return Ok(());
        }
        let bucket = self.dtc_events.entry(event.truck_id.clone()).or_insert_with(|| Mutex::new(Vec::new()));
        let mut events = bucket.lock().map_err(|_| PersistenceError::Backend("dtc event lock poisoned".into()))?;
        let unresolved_exists =
            events.iter().any(|e| e.dtc_code == event.dtc_code && e.status != DtcStatus::Resolved);
        if unresolved_exists {
            return Ok(());
        }
        events.push(event);
        Ok(())
    }

    async fn load_state(&self, truck_id: &str) -> PersistenceResult<Option<TruckState>> {
        Ok(self.state.get(truck_id).map(|s| s.clone()))
    }

    async fn save_state(&self, truck_id: &str, state: &TruckState) -> PersistenceResult<()> {
        self.state.insert(truck_id.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConfidenceLevel, DetectionMethod, EcuValidationStatus, KalmanState, MpgState, ClassifierState,
        Severity,
    };

    fn metric(truck: &str, t: DateTime<Utc>) -> FuelMetric {
        FuelMetric {
            truck_id: truck.to_string(),
            timestamp: t,
            sensor_fuel_pct: Some(50.0),
            kalman_fuel_pct: 50.0,
            mpg_instant: None,
            mpg_ema: None,
            mpg_snr: None,
            ecu_validation_status: EcuValidationStatus::Normal,
            ecu_deviation_pct: None,
            confidence_score: 90.0,
            confidence_level: ConfidenceLevel::High,
            is_interpolated: false,
        }
    }

    fn refuel(truck: &str, t: DateTime<Utc>) -> RefuelEvent {
        RefuelEvent {
            id: Uuid::new_v4(),
            truck_id: truck.to_string(),
            timestamp: t,
            fuel_before_pct: 20.0,
            fuel_after_pct: 80.0,
            gallons_added: 72.0,
            detection_method: DetectionMethod::Both,
            confidence: 95.0,
            location: None,
        }
    }

    fn dtc(truck: &str, t: DateTime<Utc>, code: &str, status: DtcStatus) -> DtcEvent {
        DtcEvent {
            id: Uuid::new_v4(),
            truck_id: truck.to_string(),
            timestamp: t,
            dtc_code: code.to_string(),
            spn: 100,
            fmi: 1,
            severity: Severity::Critical,
            category: "engine".to_string(),
            description_es: "presion de aceite baja".to_string(),
            spn_explanation_es: None,
            fmi_explanation_es: "datos por debajo del rango normal".to_string(),
            has_detailed_info: true,
            oem: "generic".to_string(),
            action_required: "detener el motor".to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn duplicate_fuel_metric_append_is_idempotent() {
        let gw = InMemoryGateway::new();
        let t = Utc::now();
        gw.append_fuel_metric(metric("t1", t)).await.unwrap();
        gw.append_fuel_metric(metric("t1", t)).await.unwrap();
        assert_eq!(gw.fuel_metric_count("t1"), 1);
    }

    #[tokio::test]
    async fn upsert_latest_overwrites() {
        let gw = InMemoryGateway::new();
        gw.upsert_latest(metric("t1", Utc::now())).await.unwrap();
        gw.upsert_latest(metric("t1", Utc::now())).await.unwrap();
        assert!(gw.latest.contains_key("t1"));
    }

    #[tokio::test]
    async fn state_round_trips() {
        let gw = InMemoryGateway::new();
        assert!(gw.load_state("t1").await.unwrap().is_none());
        let state = TruckState {
            kalman: KalmanState::cold(50.0),
            mpg: MpgState::new(),
            classifier: ClassifierState::new(),
            last_processed_timestamp: None,
        };
        gw.save_state("t1", &state).await.unwrap();
        assert!(gw.load_state("t1").await.unwrap().is_some());
    }

    /// P7 — a second refuel event for the same truck within the 5-minute
    /// window, with a fresh id, is still deduplicated at the gateway rather
    /// than only by the classifier's transient in-memory state.
    #[tokio::test]
    async fn refuel_events_dedup_within_five_minute_window() {
        let gw = InMemoryGateway::new();
        let t0 = Utc::now();
        gw.write_refuel_event(refuel("t1", t0)).await.unwrap();
        gw.write_refuel_event(refuel("t1", t0 + chrono::Duration::minutes(3))).await.unwrap();
        assert_eq!(gw.refuel_events_for("t1").len(), 1);

        gw.write_refuel_event(refuel("t1", t0 + chrono::Duration::minutes(10))).await.unwrap();
        assert_eq!(gw.refuel_events_for("t1").len(), 2);
    }

    #[tokio::test]
    async fn dtc_events_keep_one_unresolved_row_per_code() {
        let gw = InMemoryGateway::new();
        let t0 = Utc::now();
        gw.write_dtc_event(dtc("t1", t0, "SPN100-FMI1", DtcStatus::New)).await.unwrap();
        gw.write_dtc_event(dtc("t1", t0 + chrono::Duration::hours(1), "SPN100-FMI1", DtcStatus::New))
            .await
            .unwrap();
        assert_eq!(
            gw.dtc_events_for("t1").len(),
            1,
            "a second unresolved row for the same code must not be created"
        );

        gw.write_dtc_event(dtc("t1", t0, "SPN100-FMI1", DtcStatus::Resolved)).await.unwrap();
        // distinct code is unaffected by the (truck_id, dtc_code) dedup
        gw.write_dtc_event(dtc("t1", t0, "SPN110-FMI0", DtcStatus::New)).await.unwrap();
        assert_eq!(gw.dtc_events_for("t1").len(), 2);
    }
}
