//! Deduplicating job submission gate.
//!
//! Admission is decided in two steps: a globally unique idempotency key
//! short-circuits repeats of the same request, then the review-version
//! ordering policy compares against the most recent succeeded attempt for
//! the changelist. Losers of an insert race on the unique key observe the
//! winner's row.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::info;

use crate::error::Result;
use crate::outbox::NotificationOutboxStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One row of the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DispatchJob {
    pub id: i64,
    pub changelist_id: i64,
    pub review_version: i64,
    pub idempotency_key: String,
    pub status: DispatchStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Why a submission did or did not create a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Created,
    DuplicateIdempotency,
    AlreadySucceededSameVersion,
    RerunRequired,
    StaleReviewVersion,
}

/// Outcome of one submission attempt. `job` is the created row, or the
/// prior row that blocked creation.
#[derive(Debug, Clone)]
pub struct JobSubmissionResult {
    pub status: SubmissionStatus,
    pub job: DispatchJob,
    pub created: bool,
}

/// Idempotent submission gate over the `jobs` table.
pub struct JobDispatchStore {
    pool: SqlitePool,
    outbox: NotificationOutboxStore,
}

impl JobDispatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        let outbox = NotificationOutboxStore::new(pool.clone());
        Self { pool, outbox }
    }

    pub fn outbox(&self) -> &NotificationOutboxStore {
        &self.outbox
    }

    /// Admit (or refuse) one review-job submission.
    ///
    /// `stale_review_version` is a distinct non-created outcome, not an
    /// error: callers decide whether an older version arriving late is
    /// worth surfacing.
    pub async fn submit_job(
        &self,
        changelist_id: i64,
        review_version: i64,
        idempotency_key: &str,
        rerun_requested: bool,
    ) -> Result<JobSubmissionResult> {
        if let Some(existing) = self.find_by_idempotency_key(idempotency_key).await? {
            return Ok(JobSubmissionResult {
                status: SubmissionStatus::DuplicateIdempotency,
                job: existing,
                created: false,
            });
        }

        let prior_success = sqlx::query_as::<_, DispatchJob>(
            r#"
            SELECT *
            FROM jobs
            WHERE changelist_id = ?1
              AND status = 'succeeded'
            ORDER BY review_version DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(changelist_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(prior) = prior_success {
            if review_version == prior.review_version {
                return Ok(JobSubmissionResult {
                    status: SubmissionStatus::AlreadySucceededSameVersion,
                    job: prior,
                    created: false,
                });
            }
            if review_version > prior.review_version && !rerun_requested {
                return Ok(JobSubmissionResult {
                    status: SubmissionStatus::RerunRequired,
                    job: prior,
                    created: false,
                });
            }
            if review_version < prior.review_version {
                return Ok(JobSubmissionResult {
                    status: SubmissionStatus::StaleReviewVersion,
                    job: prior,
                    created: false,
                });
            }
        }

        let created = sqlx::query(
            r#"
            INSERT INTO jobs (changelist_id, review_version, idempotency_key, status)
            VALUES (?1, ?2, ?3, 'queued')
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(changelist_id)
        .bind(review_version)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let job = sqlx::query_as::<_, DispatchJob>("SELECT * FROM jobs WHERE idempotency_key = ?1")
            .bind(idempotency_key)
            .fetch_one(&self.pool)
            .await?;

        if created {
            info!(
                job_id = job.id,
                changelist_id, review_version, "review job admitted"
            );
        }

        Ok(JobSubmissionResult {
            status: if created {
                SubmissionStatus::Created
            } else {
                SubmissionStatus::DuplicateIdempotency
            },
            job,
            created,
        })
    }

    pub async fn mark_succeeded(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stage outbox rows for the job's recipients, partitioned by the
    /// dispatch row's `(changelist_id, review_version)`.
    pub async fn prepare_notifications(
        &self,
        job_id: i64,
        recipients: &[String],
        payload: &Value,
    ) -> Result<()> {
        let job = self.get_job(job_id).await?;
        self.outbox
            .prepare_rows(job.changelist_id, job.review_version, recipients, payload)
            .await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<DispatchJob> {
        let job = sqlx::query_as::<_, DispatchJob>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<DispatchJob>> {
        let job = sqlx::query_as::<_, DispatchJob>("SELECT * FROM jobs WHERE idempotency_key = ?1")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}
