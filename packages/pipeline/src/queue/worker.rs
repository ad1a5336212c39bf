//! Lease-renewing worker runtime.
//!
//! Wraps processing of one claimed job: the runtime repeatedly calls a
//! `process_step` callable and renews the job's lease on a fixed cadence
//! of monotonic time. Losing the lease stops processing immediately. The
//! runtime never finalizes the job; the caller decides between
//! [`WorkQueueStore::complete`] and [`WorkQueueStore::fail`].
//!
//! [`WorkQueueStore::complete`]: crate::queue::WorkQueueStore::complete
//! [`WorkQueueStore::fail`]: crate::queue::WorkQueueStore::fail

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::store::{Diagnostics, WorkQueueStore};

/// Lifecycle events observed while a worker holds a lease.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    HeartbeatRenewed {
        job_id: i64,
        worker_id: String,
        lease_duration_seconds: i64,
    },
    LeaseLost {
        job_id: i64,
        worker_id: String,
        diagnostics: Diagnostics,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunStatus {
    ProcessingComplete,
    LeaseLost,
}

/// Outcome of processing one claimed job under a lease.
#[derive(Debug)]
pub struct WorkerRunResult {
    pub status: WorkerRunStatus,
    pub lease_lost: bool,
    pub events: Vec<WorkerEvent>,
}

type NowFn = Box<dyn FnMut() -> f64 + Send>;

/// Runs lease-bound processing loops and records structured events.
pub struct WorkerRuntime {
    store: WorkQueueStore,
    worker_id: String,
    now_fn: NowFn,
    lease_lost: bool,
}

impl WorkerRuntime {
    /// Create a runtime with a generated worker identity.
    pub fn new(store: WorkQueueStore) -> Self {
        Self::with_worker_id(store, format!("worker-{}", Uuid::new_v4()))
    }

    pub fn with_worker_id(store: WorkQueueStore, worker_id: impl Into<String>) -> Self {
        let start = Instant::now();
        Self {
            store,
            worker_id: worker_id.into(),
            now_fn: Box::new(move || start.elapsed().as_secs_f64()),
            lease_lost: false,
        }
    }

    /// Replace the monotonic clock; deterministic tests advance it by hand.
    pub fn with_now_fn(mut self, now_fn: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.now_fn = Box::new(now_fn);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether a previous run on this runtime lost its lease.
    pub fn lease_lost(&self) -> bool {
        self.lease_lost
    }

    /// Drive `process_step` until it reports no more work, renewing the
    /// lease every third of `lease_duration_seconds` (rounded up, at least
    /// one second). A failed renewal means the lease is gone: processing
    /// stops at that tick and the diagnostics are returned in the
    /// `lease_lost` event.
    pub async fn process_running_job(
        &mut self,
        job_id: i64,
        mut process_step: impl FnMut() -> bool,
        lease_duration_seconds: i64,
    ) -> Result<WorkerRunResult> {
        let heartbeat_every = heartbeat_interval(lease_duration_seconds) as f64;
        let mut next_heartbeat_at = (self.now_fn)() + heartbeat_every;
        let mut events = Vec::new();

        loop {
            if (self.now_fn)() >= next_heartbeat_at {
                let renewal = self
                    .store
                    .heartbeat(job_id, &self.worker_id, lease_duration_seconds)
                    .await?;
                if !renewal.ok {
                    self.lease_lost = true;
                    warn!(
                        job_id,
                        worker_id = %self.worker_id,
                        code = renewal.diagnostics.code,
                        "lease lost, stopping"
                    );
                    events.push(WorkerEvent::LeaseLost {
                        job_id,
                        worker_id: self.worker_id.clone(),
                        diagnostics: renewal.diagnostics,
                    });
                    return Ok(WorkerRunResult {
                        status: WorkerRunStatus::LeaseLost,
                        lease_lost: true,
                        events,
                    });
                }

                debug!(job_id, worker_id = %self.worker_id, "heartbeat renewed");
                events.push(WorkerEvent::HeartbeatRenewed {
                    job_id,
                    worker_id: self.worker_id.clone(),
                    lease_duration_seconds,
                });
                next_heartbeat_at = (self.now_fn)() + heartbeat_every;
            }

            if !process_step() {
                return Ok(WorkerRunResult {
                    status: WorkerRunStatus::ProcessingComplete,
                    lease_lost: false,
                    events,
                });
            }
        }
    }
}

/// Renewal cadence: a third of the lease, rounded up, never below a second.
fn heartbeat_interval(lease_duration_seconds: i64) -> i64 {
    ((lease_duration_seconds + 2) / 3).max(1)
}
