//! Periodic reclamation of expired work-queue leases.
//!
//! The sweeper is the only component that retries on a schedule: every
//! pass reclaims whatever leases have lapsed and reports the count, so a
//! crashed worker's job returns to the runnable pool without operator
//! intervention.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::queue::store::{MutationResult, WorkQueueStore};
use crate::store;

/// Emitted once per sweep pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepEvent {
    pub code: &'static str,
    pub iteration: u64,
    pub ok: bool,
    pub rows_requeued: u64,
}

/// Totals for a finished (bounded) sweeper loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperReport {
    pub iterations: u64,
    pub total_requeued: u64,
}

/// Run a single reclamation pass against the store at `db_path`.
pub async fn sweep_once(db_path: &str) -> Result<MutationResult> {
    let pool = store::connect(db_path).await?;
    let result = WorkQueueStore::new(pool.clone()).requeue_expired_running().await;
    pool.close().await;
    result
}

/// Run the sweeper until `iterations` passes complete (forever when
/// `None`), sleeping `interval_seconds` between passes via the injected
/// sleep and reporting each pass through `emit_fn`.
pub async fn run_sweeper_loop<S, Fut, E>(
    db_path: &str,
    interval_seconds: f64,
    iterations: Option<u64>,
    mut sleep_fn: S,
    mut emit_fn: E,
) -> Result<SweeperReport>
where
    S: FnMut(Duration) -> Fut,
    Fut: Future<Output = ()>,
    E: FnMut(&SweepEvent),
{
    if interval_seconds <= 0.0 {
        return Err(PipelineError::InvalidInput(
            "interval_seconds must be > 0".to_string(),
        ));
    }
    if iterations == Some(0) {
        return Err(PipelineError::InvalidInput(
            "iterations must be > 0 when provided".to_string(),
        ));
    }

    let interval = Duration::from_secs_f64(interval_seconds);
    let mut completed = 0u64;
    let mut total_requeued = 0u64;

    while iterations.map_or(true, |limit| completed < limit) {
        let result = sweep_once(db_path).await?;
        completed += 1;
        total_requeued += result.rows_affected;

        let event = SweepEvent {
            code: "work_queue_sweep",
            iteration: completed,
            ok: result.ok,
            rows_requeued: result.rows_affected,
        };
        info!(
            iteration = event.iteration,
            rows_requeued = event.rows_requeued,
            "work queue sweep"
        );
        emit_fn(&event);

        if iterations.map_or(true, |limit| completed < limit) {
            sleep_fn(interval).await;
        }
    }

    Ok(SweeperReport {
        iterations: completed,
        total_requeued,
    })
}

/// [`run_sweeper_loop`] with the runtime clock; the CLI entry point.
pub async fn run_sweeper<E>(
    db_path: &str,
    interval_seconds: f64,
    iterations: Option<u64>,
    emit_fn: E,
) -> Result<SweeperReport>
where
    E: FnMut(&SweepEvent),
{
    run_sweeper_loop(db_path, interval_seconds, iterations, tokio::time::sleep, emit_fn).await
}
