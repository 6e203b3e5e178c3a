//! Persistence Gateway (spec §4.11): the only point in the pipeline that
//! talks to storage. Two implementations share one trait — an in-memory
//! backend for tests/simulation and a `sled`-backed durable backend for
//! production, mirroring the teacher's dual-backend `PersistenceLayer`
//! split.

pub mod memory;
pub mod sled_store;

use crate::types::{DtcEvent, FuelMetric, RefuelEvent, TheftEvent, TruckState};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryGateway;
pub use sled_store::SledGateway;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no persisted state for truck {0}")]
    NotFound(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// The seven operations downstream consumers and the orchestrator rely on.
/// Every write is keyed so repeated delivery (at-least-once redelivery from
/// a retried orchestrator step) is idempotent.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Append-only: keyed by `(truck_id, timestamp)`, so re-appending the
    /// same reading's metric is a silent no-op rather than a duplicate row.
    async fn append_fuel_metric(&self, metric: FuelMetric) -> PersistenceResult<()>;

    /// Upsert: keyed by `truck_id` alone, always overwritten by the latest.
    async fn upsert_latest(&self, metric: FuelMetric) -> PersistenceResult<()>;

    /// Append-only, deduplicated within a 5-minute window on the same
    /// truck (spec §3/§4.11/P7): a retry carrying the same `id` is always a
    /// no-op, and a *different* refuel event for the same truck landing
    /// within 5 minutes of an already-persisted one is also dropped rather
    /// than double-counted.
    async fn write_refuel_event(&self, event: RefuelEvent) -> PersistenceResult<()>;

    async fn write_theft_event(&self, event: TheftEvent) -> PersistenceResult<()>;

    /// Append-only, but creates a row only if no unresolved
    /// (`status != Resolved`) row already exists for this truck's
    /// `(truck_id, dtc_code)` (spec §4.11/§6) — at most one active row per
    /// code per truck, independent of any in-memory tracking the caller
    /// keeps.
    async fn write_dtc_event(&self, event: DtcEvent) -> PersistenceResult<()>;

    /// Load a truck's last checkpointed in-memory state (Kalman, MPG,
    /// classifier accumulators), if any was ever saved.
    async fn load_state(&self, truck_id: &str) -> PersistenceResult<Option<TruckState>>;

    /// Checkpoint a truck's in-memory state so a restart can resume instead
    /// of cold-starting the filter.
    async fn save_state(&self, truck_id: &str, state: &TruckState) -> PersistenceResult<()>;
}
