//! Dead-letter ledger and controlled replay workflow.
//!
//! Non-retryable failures leave the main path as `open` dead letters.
//! Replay is human-gated: remediation evidence must be recorded before a
//! replay starts, downstream completion is verified stage-by-stage, and a
//! non-retryable recurrence of the same error class escalates instead of
//! reopening.
//!
//! ```text
//! open ──start_replay (requires remediation)──▶ replaying
//! replaying ──complete_replay (verified)──▶ resolved
//! replaying ──fail_replay (same class, non-retryable)──▶ escalated
//! replaying ──fail_replay (otherwise)──▶ open
//! ```

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Open,
    Replaying,
    Resolved,
    Escalated,
}

/// One row of the `pipeline_runs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PipelineRun {
    pub id: i64,
    pub payload_ref: String,
    pub current_stage: String,
    pub status: RunStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One row of the `dead_letter_entries` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub run_id: i64,
    pub failed_stage: String,
    pub error_class: String,
    pub error_message: Option<String>,
    pub error_metadata: String,
    pub original_payload_ref: String,
    pub remediation_evidence: Option<String>,
    pub replay_start_stage: Option<String>,
    pub replay_count: i64,
    pub resolution_notes: Option<String>,
    pub status: DeadLetterStatus,
    pub escalated_at: Option<NaiveDateTime>,
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Where a sanctioned replay restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    pub dead_letter_id: i64,
    pub run_id: i64,
    pub restart_stage: String,
    pub full_restart: bool,
}

/// Tracks non-retryable failures and controlled replay workflows over a
/// fixed, ordered stage list.
pub struct FailureHandlingPipeline {
    pool: SqlitePool,
    stages: Vec<String>,
}

impl FailureHandlingPipeline {
    pub fn new(pool: SqlitePool, stages: Vec<String>) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidInput(
                "stages must not be empty".to_string(),
            ));
        }
        Ok(Self { pool, stages })
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Start a run at the first stage.
    pub async fn create_run(&self, payload_ref: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pipeline_runs (payload_ref, current_stage, status)
            VALUES (?1, ?2, 'running')
            RETURNING id
            "#,
        )
        .bind(payload_ref)
        .bind(&self.stages[0])
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Record a stage failure against the run. Retryable failures only
    /// mark the run failed; non-retryable ones also open a dead letter
    /// carrying a snapshot of the payload reference and canonical-JSON
    /// error metadata.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_failure(
        &self,
        run_id: i64,
        failed_stage: &str,
        error_class: &str,
        error_message: &str,
        error_metadata: &Value,
        retryable: bool,
        original_payload_ref: Option<&str>,
    ) -> Result<Option<DeadLetter>> {
        if !self.stages.iter().any(|stage| stage == failed_stage) {
            return Err(PipelineError::InvalidInput(
                "unknown failed_stage".to_string(),
            ));
        }

        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET current_stage = ?1,
                status = 'failed',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(failed_stage)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if retryable {
            return Ok(None);
        }

        let payload_ref = match original_payload_ref {
            Some(payload_ref) => payload_ref.to_string(),
            None => self.get_run(run_id).await?.payload_ref,
        };

        let dead_letter_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dead_letter_entries
                (run_id, failed_stage, error_class, error_message, error_metadata,
                 original_payload_ref, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open')
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(failed_stage)
        .bind(error_class)
        .bind(error_message)
        .bind(serde_json::to_string(error_metadata)?)
        .bind(&payload_ref)
        .fetch_one(&self.pool)
        .await?;

        warn!(
            run_id,
            dead_letter_id,
            failed_stage,
            error_class,
            "non-retryable failure dead-lettered"
        );

        Ok(Some(self.get_dead_letter(dead_letter_id).await?))
    }

    /// Record the operator evidence that arms a replay.
    pub async fn record_remediation_evidence(
        &self,
        dead_letter_id: i64,
        operator_id: &str,
        evidence: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET remediation_evidence = ?1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(format!("operator={operator_id}; evidence={evidence}"))
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Begin a replay from either the failed stage or, for a full
    /// restart, the first stage. Refused until remediation evidence has
    /// been recorded.
    pub async fn start_replay(&self, dead_letter_id: i64, full_restart: bool) -> Result<ReplayPlan> {
        let dead_letter = self.get_dead_letter(dead_letter_id).await?;
        if dead_letter.remediation_evidence.is_none() {
            return Err(PipelineError::InvalidInput(
                "remediation evidence required before replay".to_string(),
            ));
        }

        let restart_stage = if full_restart {
            self.stages[0].clone()
        } else {
            dead_letter.failed_stage.clone()
        };

        sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET status = 'replaying',
                replay_start_stage = ?1,
                replay_count = replay_count + 1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(&restart_stage)
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET current_stage = ?1,
                status = 'running',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(&restart_stage)
        .bind(dead_letter.run_id)
        .execute(&self.pool)
        .await?;

        info!(
            dead_letter_id,
            run_id = dead_letter.run_id,
            restart_stage = %restart_stage,
            full_restart,
            "replay started"
        );

        Ok(ReplayPlan {
            dead_letter_id,
            run_id: dead_letter.run_id,
            restart_stage,
            full_restart,
        })
    }

    /// Resolve a replay after verifying that every stage downstream of
    /// the restart point completed, in order and in full.
    pub async fn complete_replay(
        &self,
        dead_letter_id: i64,
        completed_stages: &[String],
        resolution_notes: &str,
    ) -> Result<()> {
        let dead_letter = self.get_dead_letter(dead_letter_id).await?;
        let restart_stage = dead_letter
            .replay_start_stage
            .as_deref()
            .unwrap_or(&dead_letter.failed_stage);
        let restart_index = self
            .stages
            .iter()
            .position(|stage| stage == restart_stage)
            .ok_or_else(|| PipelineError::InvalidInput("unknown replay_start_stage".to_string()))?;

        let expected = &self.stages[restart_index..];
        if completed_stages != expected {
            return Err(PipelineError::InvalidInput(
                "downstream completion verification failed".to_string(),
            ));
        }

        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET current_stage = ?1,
                status = 'completed',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(&expected[expected.len() - 1])
        .bind(dead_letter.run_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET status = 'resolved',
                resolution_notes = ?1,
                resolved_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(resolution_notes)
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?;

        info!(dead_letter_id, run_id = dead_letter.run_id, "replay resolved");
        Ok(())
    }

    /// Record a failed replay. The run returns to `failed` at the
    /// original stage; the dead letter escalates when the new error is
    /// non-retryable and of the same class as the original, and reopens
    /// otherwise.
    pub async fn fail_replay(
        &self,
        dead_letter_id: i64,
        error_class: &str,
        error_message: &str,
        error_metadata: &Value,
        retryable: bool,
    ) -> Result<()> {
        let dead_letter = self.get_dead_letter(dead_letter_id).await?;
        let escalated = !retryable && error_class == dead_letter.error_class;
        let status = if escalated { "escalated" } else { "open" };

        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = 'failed',
                current_stage = ?1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(&dead_letter.failed_stage)
        .bind(dead_letter.run_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET status = ?1,
                error_class = ?2,
                error_message = ?3,
                error_metadata = ?4,
                escalated_at = CASE WHEN ?5 THEN CURRENT_TIMESTAMP ELSE escalated_at END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?6
            "#,
        )
        .bind(status)
        .bind(error_class)
        .bind(error_message)
        .bind(serde_json::to_string(error_metadata)?)
        .bind(escalated)
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?;

        if escalated {
            warn!(
                dead_letter_id,
                run_id = dead_letter.run_id,
                error_class,
                "replay failed with recurring error class, escalated"
            );
        } else {
            info!(
                dead_letter_id,
                run_id = dead_letter.run_id,
                "replay failed, dead letter reopened"
            );
        }
        Ok(())
    }

    pub async fn get_dead_letter(&self, dead_letter_id: i64) -> Result<DeadLetter> {
        let dead_letter =
            sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letter_entries WHERE id = ?1")
                .bind(dead_letter_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(dead_letter)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<PipelineRun> {
        let run = sqlx::query_as::<_, PipelineRun>("SELECT * FROM pipeline_runs WHERE id = ?1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(run)
    }
}
