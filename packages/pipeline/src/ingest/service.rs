//! Ingest chain: fetch the changelist, ask dispatch for admission, and on
//! admission enqueue the review payload.

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::dispatch::{JobDispatchStore, SubmissionStatus};
use crate::error::Result;
use crate::ingest::fetcher::ChangeFetcher;
use crate::queue::WorkQueueStore;

/// How an ingest request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Enqueued,
    DuplicateIdempotency,
    AlreadySucceededSameVersion,
    RerunRequired,
    StaleReviewVersion,
}

impl From<SubmissionStatus> for IngestStatus {
    fn from(status: SubmissionStatus) -> Self {
        match status {
            SubmissionStatus::Created => IngestStatus::Enqueued,
            SubmissionStatus::DuplicateIdempotency => IngestStatus::DuplicateIdempotency,
            SubmissionStatus::AlreadySucceededSameVersion => {
                IngestStatus::AlreadySucceededSameVersion
            }
            SubmissionStatus::RerunRequired => IngestStatus::RerunRequired,
            SubmissionStatus::StaleReviewVersion => IngestStatus::StaleReviewVersion,
        }
    }
}

/// Outcome of one ingest request. `queue_id` is set only when a new work
/// item was actually enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub job_id: i64,
    pub queue_id: Option<i64>,
}

/// Receives changelist input and enqueues first-pass review jobs.
pub struct ChangeIngestService {
    fetcher: ChangeFetcher,
    job_dispatch: JobDispatchStore,
    queue: WorkQueueStore,
}

impl ChangeIngestService {
    pub fn new(fetcher: ChangeFetcher, job_dispatch: JobDispatchStore, queue: WorkQueueStore) -> Self {
        Self {
            fetcher,
            job_dispatch,
            queue,
        }
    }

    pub fn fetcher(&self) -> &ChangeFetcher {
        &self.fetcher
    }

    /// Fetch the change, submit it for dispatch, and enqueue the review
    /// payload when admission created a new job. Dispatch refusals pass
    /// through as non-enqueued outcomes.
    pub async fn ingest_change(
        &self,
        changelist_id: i64,
        review_version: i64,
        idempotency_key: &str,
        rerun_requested: bool,
        requested_paths: &[String],
        priority: i64,
    ) -> Result<IngestResult> {
        let change = self
            .fetcher
            .fetch_change(changelist_id, requested_paths)
            .await?;
        let submit = self
            .job_dispatch
            .submit_job(changelist_id, review_version, idempotency_key, rerun_requested)
            .await?;

        if !submit.created {
            return Ok(IngestResult {
                status: submit.status.into(),
                job_id: submit.job.id,
                queue_id: None,
            });
        }

        let payload = serde_json::to_string(&json!({
            "job_id": submit.job.id,
            "changelist_id": changelist_id,
            "review_version": review_version,
            "files": change.files,
        }))?;
        let queue_id = self.queue.enqueue_with(&payload, priority, None).await?;

        info!(
            changelist_id,
            review_version,
            job_id = submit.job.id,
            queue_id,
            "review job enqueued"
        );

        Ok(IngestResult {
            status: IngestStatus::Enqueued,
            job_id: submit.job.id,
            queue_id: Some(queue_id),
        })
    }
}
