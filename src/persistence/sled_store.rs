use super::{PersistenceError, PersistenceLayer, PersistenceResult};
use crate::types::{DtcEvent, DtcStatus, FuelMetric, RefuelEvent, TheftEvent, TruckState};
use async_trait::async_trait;
use uuid::Uuid;

/// `sled`-backed durable `PersistenceLayer`. Each logical stream lives in
/// its own tree; keys are chosen so repeated writes of the same logical
/// record are naturally idempotent overwrites rather than duplicates.
pub struct SledGateway {
    fuel_metrics: sled::Tree,
    latest: sled::Tree,
    refuel_events: sled::Tree,
    theft_events: sled::Tree,
    dtc_events: sled::Tree,
    state: sled::Tree,
    _db: sled::Db,
}

impl SledGateway {
    pub fn open(path: impl AsRef<std::path::Path>) -> PersistenceResult<Self> {
        let db = sled::open(path).map_err(|e| PersistenceError::Backend(e.to_string()))?;
        let open_tree = |name: &str| -> PersistenceResult<sled::Tree> {
            db.open_tree(name).map_err(|e| PersistenceError::Backend(e.to_string()))
        };
        Ok(Self {
            fuel_metrics: open_tree("fuel_metrics")?,
            latest: open_tree("latest")?,
            refuel_events: open_tree("refuel_events")?,
            theft_events: open_tree("theft_events")?,
            dtc_events: open_tree("dtc_events")?,
            state: open_tree("truck_state")?,
            _db: db,
        })
    }

    fn metric_key(truck_id: &str, timestamp: chrono::DateTime<chrono::Utc>) -> Vec<u8> {
        format!("{truck_id}#{}", timestamp.timestamp_nanos_opt().unwrap_or_default()).into_bytes()
    }

    /// Namespaces an event's key by truck so a truck's own events can be
    /// range-scanned with `scan_prefix` for the gateway-level dedup checks.
    fn event_key(truck_id: &str, id: Uuid) -> Vec<u8> {
        let mut key = format!("{truck_id}#").into_bytes();
        key.extend_from_slice(id.as_bytes());
        key
    }
}

#[async_trait]
impl PersistenceLayer for SledGateway {
    async fn append_fuel_metric(&self, metric: FuelMetric) -> PersistenceResult<()> {
        let key = Self::metric_key(&metric.truck_id, metric.timestamp);
        if self.fuel_metrics.contains_key(&key).map_err(|e| PersistenceError::Backend(e.to_string()))? {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&metric)?;
        self.fuel_metrics
            .insert(key, bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn upsert_latest(&self, metric: FuelMetric) -> PersistenceResult<()> {
        let bytes = serde_json::to_vec(&metric)?;
        self.latest
            .insert(metric.truck_id.as_bytes(), bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn write_refuel_event(&self, event: RefuelEvent) -> PersistenceResult<()> {
        let prefix = format!("{}#", event.truck_id);
        for item in self.refuel_events.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item.map_err(|e| PersistenceError::Backend(e.to_string()))?;
            let existing: RefuelEvent = serde_json::from_slice(&bytes)?;
            if (existing.timestamp - event.timestamp).num_seconds().abs() < 300 {
                return Ok(());
            }
        }
        let key = Self::event_key(&event.truck_id, event.id);
        let bytes = serde_json::to_vec(&event)?;
        self.refuel_events
            .insert(key, bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn write_theft_event(&self, event: TheftEvent) -> PersistenceResult<()> {
        let key = event.id.as_bytes().to_vec();
        let bytes = serde_json::to_vec(&event)?;
        self.theft_events
            .insert(key, bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn write_dtc_event(&self, event: DtcEvent) -> PersistenceResult<()> {
        let prefix = format!("{}#", event.truck_id);
        for item in self.dtc_events.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item.map_err(|e| PersistenceError::Backend(e.to_string()))?;
            let existing: DtcEvent = serde_json::from_slice(&bytes)?;
            if existing.dtc_code == event.dtc_code && existing.status != DtcStatus::Resolved {
                return Ok(());
            }
        }
        let key = Self::event_key(&event.truck_id, event.id);
        let bytes = serde_json::to_vec(&event)?;
        self.dtc_events
            .insert(key, bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load_state(&self, truck_id: &str) -> PersistenceResult<Option<TruckState>> {
        let raw = self
            .state
            .get(truck_id.as_bytes())
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_state(&self, truck_id: &str, state: &TruckState) -> PersistenceResult<()> {
        let bytes = serde_json::to_vec(state)?;
        self.state
            .insert(truck_id.as_bytes(), bytes)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassifierState, DetectionMethod, KalmanState, MpgState, Severity};

    fn refuel(truck: &str, t: chrono::DateTime<chrono::Utc>) -> RefuelEvent {
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

    fn dtc(truck: &str, t: chrono::DateTime<chrono::Utc>, code: &str, status: DtcStatus) -> DtcEvent {
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
    async fn state_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let gw = SledGateway::open(&path).unwrap();
            let state = TruckState {
                kalman: KalmanState::cold(60.0),
                mpg: MpgState::new(),
                classifier: ClassifierState::new(),
                last_processed_timestamp: None,
            };
            gw.save_state("t1", &state).await.unwrap();
        }
        let gw2 = SledGateway::open(&path).unwrap();
        let loaded = gw2.load_state("t1").await.unwrap();
        assert!(loaded.is_some());
        assert!((loaded.unwrap().kalman.level_pct - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_metric_append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let gw = SledGateway::open(dir.path().join("db")).unwrap();
        let t = chrono::Utc::now();
        let metric = FuelMetric {
            truck_id: "t1".into(),
            timestamp: t,
            sensor_fuel_pct: Some(50.0),
            kalman_fuel_pct: 50.0,
            mpg_instant: None,
            mpg_ema: None,
            mpg_snr: None,
            ecu_validation_status: crate::types::EcuValidationStatus::Normal,
            ecu_deviation_pct: None,
            confidence_score: 90.0,
            confidence_level: crate::types::ConfidenceLevel::High,
            is_interpolated: false,
        };
        gw.append_fuel_metric(metric.clone()).await.unwrap();
        gw.append_fuel_metric(metric).await.unwrap();
        assert_eq!(gw.fuel_metrics.len(), 1);
    }

    /// P7 — a second refuel event for the same truck within the 5-minute
    /// window, with a fresh id, is deduplicated at the gateway.
    #[tokio::test]
    async fn refuel_events_dedup_within_five_minute_window() {
        let dir = tempfile::tempdir().unwrap();
        let gw = SledGateway::open(dir.path().join("db")).unwrap();
        let t0 = chrono::Utc::now();
        gw.write_refuel_event(refuel("t1", t0)).await.unwrap();
        gw.write_refuel_event(refuel("t1", t0 + chrono::Duration::minutes(3))).await.unwrap();
        assert_eq!(gw.refuel_events.len(), 1);

        gw.write_refuel_event(refuel("t1", t0 + chrono::Duration::minutes(10))).await.unwrap();
        assert_eq!(gw.refuel_events.len(), 2);
    }

    #[tokio::test]
    async fn dtc_events_keep_one_unresolved_row_per_code() {
        let dir = tempfile::tempdir().unwrap();
        let gw = SledGateway::open(dir.path().join("db")).unwrap();
        let t0 = chrono::Utc::now();
        gw.write_dtc_event(dtc("t1", t0, "SPN100-FMI1", DtcStatus::New)).await.unwrap();
        gw.write_dtc_event(dtc("t1", t0 + chrono::Duration::hours(1), "SPN100-FMI1", DtcStatus::New))
            .await
            .unwrap();
        assert_eq!(
            gw.dtc_events.len(),
            1,
            "a second unresolved row for the same code must not be created"
        );

        gw.write_dtc_event(dtc("t1", t0, "SPN100-FMI1", DtcStatus::Resolved)).await.unwrap();
        // distinct code is unaffected by the (truck_id, dtc_code) dedup
        gw.write_dtc_event(dtc("t1", t0, "SPN110-FMI0", DtcStatus::New)).await.unwrap();
        assert_eq!(gw.dtc_events.len(), 2);
    }
}
