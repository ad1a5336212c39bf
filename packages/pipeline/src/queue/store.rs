//! Persistence layer for work-queue state transitions.
//!
//! Every mutation commits in its own transaction and owner identity is
//! validated in the WHERE clause of every owner-scoped update, so two
//! workers can never both observe success on the same row. Failed
//! mutations come back as [`MutationResult`] diagnostics, never as errors.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, SqliteConnection};
use tracing::warn;

use crate::error::{PipelineError, Result};

/// Lease granted when the caller does not choose one.
pub const DEFAULT_LEASE_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// One row of the `work_queue` table.
///
/// `claimed_by` and `lease_expires_at` are non-null exactly while the row
/// is `running`; finalization clears both.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkQueueJob {
    pub id: i64,
    pub payload: Option<String>,
    pub status: JobStatus,
    pub priority: i64,
    pub run_at: NaiveDateTime,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<NaiveDateTime>,
    pub started_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Structured record attached to every rejected (and accepted) mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "from", skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "to", skip_serializing_if = "Option::is_none")]
    pub to_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_from: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_from: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_statuses: Option<Vec<&'static str>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            code: "ok",
            action: None,
            job_id: None,
            requested_by: None,
            owner: None,
            from_status: None,
            status: None,
            to_status: None,
            required_from: None,
            required_status: None,
            allowed_from: None,
            valid_statuses: None,
        }
    }
}

impl Diagnostics {
    pub fn ok() -> Self {
        Self::default()
    }
}

/// Outcome of one queue mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationResult {
    pub ok: bool,
    pub rows_affected: u64,
    pub diagnostics: Diagnostics,
}

impl MutationResult {
    fn accepted(rows_affected: u64, diagnostics: Diagnostics) -> Self {
        Self {
            ok: true,
            rows_affected,
            diagnostics,
        }
    }

    fn rejected(diagnostics: Diagnostics) -> Self {
        warn!(
            code = diagnostics.code,
            job_id = diagnostics.job_id,
            requested_by = diagnostics.requested_by.as_deref(),
            "work queue mutation rejected"
        );
        Self {
            ok: false,
            rows_affected: 0,
            diagnostics,
        }
    }
}

/// Database-backed work queue with lease ownership.
#[derive(Clone)]
pub struct WorkQueueStore {
    pool: SqlitePool,
}

impl WorkQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Enqueue a payload at priority 0, eligible immediately.
    pub async fn enqueue(&self, payload: &str) -> Result<i64> {
        self.enqueue_with(payload, 0, None).await
    }

    /// Enqueue a payload with an explicit priority and, optionally, an
    /// earliest eligible time (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub async fn enqueue_with(
        &self,
        payload: &str,
        priority: i64,
        run_at: Option<&str>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO work_queue (payload, status, priority, run_at)
            VALUES (?1, 'queued', ?2, COALESCE(?3, CURRENT_TIMESTAMP))
            RETURNING id
            "#,
        )
        .bind(payload)
        .bind(priority)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Claim the next runnable job for `worker_id`.
    ///
    /// One write-reserving transaction reclaims every expired lease,
    /// checks the optional running-capacity cap, picks the candidate by
    /// `priority DESC, created_at ASC, id ASC`, and flips it to `running`.
    /// Concurrent claimers serialize on the database writer; at most one
    /// wins any given row.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease_duration_seconds: i64,
        max_active_running: Option<i64>,
    ) -> Result<Option<WorkQueueJob>> {
        if let Some(cap) = max_active_running {
            if cap < 0 {
                return Err(PipelineError::InvalidInput(
                    "max_active_running must be >= 0".to_string(),
                ));
            }
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::claim_next_locked(&mut conn, worker_id, lease_duration_seconds, max_active_running)
            .await
        {
            Ok(job) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(job)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    async fn claim_next_locked(
        conn: &mut SqliteConnection,
        worker_id: &str,
        lease_duration_seconds: i64,
        max_active_running: Option<i64>,
    ) -> Result<Option<WorkQueueJob>> {
        sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'queued',
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE status = 'running'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at <= CURRENT_TIMESTAMP
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let job = sqlx::query_as::<_, WorkQueueJob>(
            r#"
            WITH active_capacity AS (
                SELECT COUNT(*) AS active_running
                FROM work_queue
                WHERE status = 'running'
                  AND lease_expires_at IS NOT NULL
                  AND lease_expires_at > CURRENT_TIMESTAMP
            ),
            candidate AS (
                SELECT id
                FROM work_queue
                WHERE status = 'queued'
                  AND run_at <= CURRENT_TIMESTAMP
                  AND (?1 IS NULL OR (SELECT active_running FROM active_capacity) < ?1)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            UPDATE work_queue
            SET status = 'running',
                claimed_by = ?2,
                lease_expires_at = datetime('now', '+' || ?3 || ' seconds'),
                started_at = COALESCE(started_at, CURRENT_TIMESTAMP),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = (SELECT id FROM candidate)
            RETURNING *
            "#,
        )
        .bind(max_active_running)
        .bind(worker_id)
        .bind(lease_duration_seconds)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(job)
    }

    /// Directed claim of a specific job; only valid from `queued`.
    pub async fn claim(&self, job_id: i64, worker_id: &str) -> Result<MutationResult> {
        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'running',
                claimed_by = ?1,
                lease_expires_at = datetime('now', '+' || ?2 || ' seconds'),
                started_at = COALESCE(started_at, CURRENT_TIMESTAMP),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?3 AND status = 'queued'
            "#,
        )
        .bind(worker_id)
        .bind(DEFAULT_LEASE_SECONDS)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            let current = self.get_status(job_id).await?;
            return Ok(MutationResult::rejected(Diagnostics {
                code: "invalid_transition",
                from_status: current.map(|status| status.as_str().to_string()),
                to_status: Some("running".to_string()),
                allowed_from: Some(vec!["queued"]),
                ..Diagnostics::default()
            }));
        }

        Ok(MutationResult::accepted(rows, Diagnostics::ok()))
    }

    /// Extend the lease; only the current owner of a running job may renew.
    pub async fn heartbeat(
        &self,
        job_id: i64,
        worker_id: &str,
        lease_duration_seconds: i64,
    ) -> Result<MutationResult> {
        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET lease_expires_at = datetime('now', '+' || ?1 || ' seconds'),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2 AND claimed_by = ?3 AND status = 'running'
            "#,
        )
        .bind(lease_duration_seconds)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        self.owner_guard_result(rows, job_id, worker_id, "heartbeat")
            .await
    }

    /// Finalize a running job as `completed`; owner-guarded.
    pub async fn complete(&self, job_id: i64, worker_id: &str) -> Result<MutationResult> {
        self.finalize(job_id, worker_id, JobStatus::Completed).await
    }

    /// Finalize a running job as `failed`; owner-guarded.
    pub async fn fail(&self, job_id: i64, worker_id: &str) -> Result<MutationResult> {
        self.finalize(job_id, worker_id, JobStatus::Failed).await
    }

    async fn finalize(
        &self,
        job_id: i64,
        worker_id: &str,
        target_status: JobStatus,
    ) -> Result<MutationResult> {
        if !matches!(target_status, JobStatus::Completed | JobStatus::Failed) {
            return Ok(MutationResult::rejected(Diagnostics {
                code: "invalid_status",
                status: Some(target_status.as_str().to_string()),
                valid_statuses: Some(vec!["queued", "running", "completed", "failed"]),
                ..Diagnostics::default()
            }));
        }

        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = ?1,
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2 AND claimed_by = ?3 AND status = 'running'
            "#,
        )
        .bind(target_status)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            let current = self.get_status(job_id).await?;
            let owner = self.get_owner(job_id).await?;
            let code = match &owner {
                Some(owner) if owner != worker_id => "not_owner",
                _ => "invalid_transition",
            };
            return Ok(MutationResult::rejected(Diagnostics {
                code,
                action: Some("finalize"),
                job_id: Some(job_id),
                requested_by: Some(worker_id.to_string()),
                owner,
                from_status: current.map(|status| status.as_str().to_string()),
                to_status: Some(target_status.as_str().to_string()),
                required_from: Some("running"),
                ..Diagnostics::default()
            }));
        }

        Ok(MutationResult::accepted(
            rows,
            Diagnostics {
                to_status: Some(target_status.as_str().to_string()),
                ..Diagnostics::ok()
            },
        ))
    }

    /// Reclaim every expired lease back to `queued`. Idempotent: a second
    /// immediate call affects zero rows.
    pub async fn requeue_expired_running(&self) -> Result<MutationResult> {
        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'queued',
                claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE status = 'running'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at <= CURRENT_TIMESTAMP
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(MutationResult::accepted(rows, Diagnostics::ok()))
    }

    pub async fn get_job(&self, job_id: i64) -> Result<WorkQueueJob> {
        let job = sqlx::query_as::<_, WorkQueueJob>("SELECT * FROM work_queue WHERE id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    async fn owner_guard_result(
        &self,
        rows: u64,
        job_id: i64,
        worker_id: &str,
        action: &'static str,
    ) -> Result<MutationResult> {
        if rows > 0 {
            return Ok(MutationResult::accepted(rows, Diagnostics::ok()));
        }

        let current = self.get_status(job_id).await?;
        let owner = self.get_owner(job_id).await?;
        let code = match &owner {
            Some(owner) if owner != worker_id => "not_owner",
            _ => "invalid_transition",
        };
        Ok(MutationResult::rejected(Diagnostics {
            code,
            action: Some(action),
            job_id: Some(job_id),
            requested_by: Some(worker_id.to_string()),
            owner,
            status: current.map(|status| status.as_str().to_string()),
            required_status: Some("running"),
            ..Diagnostics::default()
        }))
    }

    async fn get_status(&self, job_id: i64) -> Result<Option<JobStatus>> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            "SELECT status FROM work_queue WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    async fn get_owner(&self, job_id: i64) -> Result<Option<String>> {
        let owner = sqlx::query_scalar::<_, Option<String>>(
            "SELECT claimed_by FROM work_queue WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_diagnostics_carry_no_context() {
        let diagnostics = Diagnostics::ok();
        assert_eq!(diagnostics.code, "ok");
        assert!(diagnostics.owner.is_none());
        assert!(diagnostics.from_status.is_none());
    }

    #[test]
    fn diagnostics_serialize_with_wire_field_names() {
        let diagnostics = Diagnostics {
            code: "invalid_transition",
            from_status: Some("queued".to_string()),
            to_status: Some("completed".to_string()),
            required_from: Some("running"),
            ..Diagnostics::default()
        };
        let json = serde_json::to_string(&diagnostics).unwrap();
        assert!(json.contains("\"from\":\"queued\""));
        assert!(json.contains("\"to\":\"completed\""));
        assert!(!json.contains("owner"));
    }

    #[test]
    fn status_round_trips_as_snake_case() {
        assert_eq!(JobStatus::Queued.as_str(), "queued");
        assert_eq!(JobStatus::Completed.as_str(), "completed");
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
