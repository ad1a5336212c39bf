//! Behavior tests for the deduplicating dispatch gate.

use pipeline_core::dispatch::{DispatchStatus, JobDispatchStore, SubmissionStatus};
use pipeline_core::outbox::NotificationOutboxStore;
use pipeline_core::store;
use sqlx::SqlitePool;
use std::sync::Arc;

async fn make_store() -> (SqlitePool, JobDispatchStore) {
    let pool = store::connect_in_memory().await.expect("in-memory store");
    let dispatch = JobDispatchStore::new(pool.clone());
    (pool, dispatch)
}

async fn job_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn first_submission_creates_a_queued_job() {
    let (_pool, dispatch) = make_store().await;
    let result = dispatch.submit_job(42, 1, "cl42-v1", false).await.unwrap();

    assert_eq!(result.status, SubmissionStatus::Created);
    assert!(result.created);
    assert_eq!(result.job.changelist_id, 42);
    assert_eq!(result.job.review_version, 1);
    assert_eq!(result.job.status, DispatchStatus::Queued);
}

#[tokio::test]
async fn repeated_idempotency_keys_return_the_winners_row() {
    let (pool, dispatch) = make_store().await;
    let first = dispatch.submit_job(42, 1, "cl42-v1", false).await.unwrap();
    let second = dispatch.submit_job(42, 1, "cl42-v1", false).await.unwrap();

    assert_eq!(second.status, SubmissionStatus::DuplicateIdempotency);
    assert!(!second.created);
    assert_eq!(second.job.id, first.job.id);
    assert_eq!(job_count(&pool).await, 1);
}

#[tokio::test]
async fn concurrent_submissions_with_one_key_create_exactly_one_row() {
    let (pool, dispatch) = make_store().await;
    let dispatch = Arc::new(dispatch);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let dispatch = Arc::clone(&dispatch);
        handles.push(tokio::spawn(async move {
            dispatch.submit_job(7, 1, "cl7-v1", false).await.unwrap()
        }));
    }

    let mut created = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.created {
            created += 1;
        } else {
            assert_eq!(result.status, SubmissionStatus::DuplicateIdempotency);
        }
    }
    assert_eq!(created, 1);
    assert_eq!(job_count(&pool).await, 1);
}

#[tokio::test]
async fn review_version_ordering_policy() {
    let (pool, dispatch) = make_store().await;

    let v1 = dispatch.submit_job(77, 1, "cl77-v1", false).await.unwrap();
    assert_eq!(v1.status, SubmissionStatus::Created);
    dispatch.mark_succeeded(v1.job.id).await.unwrap();

    // Same version after success.
    let same = dispatch.submit_job(77, 1, "cl77-v1-again", false).await.unwrap();
    assert_eq!(same.status, SubmissionStatus::AlreadySucceededSameVersion);
    assert!(!same.created);
    assert_eq!(same.job.id, v1.job.id);

    // Newer version needs an explicit rerun request.
    let newer = dispatch.submit_job(77, 2, "cl77-v2", false).await.unwrap();
    assert_eq!(newer.status, SubmissionStatus::RerunRequired);
    assert!(!newer.created);
    assert_eq!(job_count(&pool).await, 1);

    let rerun = dispatch
        .submit_job(77, 2, "cl77-v2-rerun", true)
        .await
        .unwrap();
    assert_eq!(rerun.status, SubmissionStatus::Created);
    assert!(rerun.created);
    assert_ne!(rerun.job.id, v1.job.id);

    // The two versions map to distinct outbox idempotency keys.
    assert_ne!(
        NotificationOutboxStore::idempotency_key(77, "r@example.com", 1),
        NotificationOutboxStore::idempotency_key(77, "r@example.com", 2),
    );
}

#[tokio::test]
async fn stale_versions_are_refused_without_mutation() {
    let (pool, dispatch) = make_store().await;
    let v3 = dispatch.submit_job(9, 3, "cl9-v3", false).await.unwrap();
    dispatch.mark_succeeded(v3.job.id).await.unwrap();

    let stale = dispatch.submit_job(9, 2, "cl9-v2", false).await.unwrap();
    assert_eq!(stale.status, SubmissionStatus::StaleReviewVersion);
    assert!(!stale.created);
    assert_eq!(stale.job.id, v3.job.id);
    assert_eq!(job_count(&pool).await, 1);
}

#[tokio::test]
async fn version_policy_compares_against_the_latest_success() {
    let (_pool, dispatch) = make_store().await;
    let v1 = dispatch.submit_job(5, 1, "cl5-v1", false).await.unwrap();
    dispatch.mark_succeeded(v1.job.id).await.unwrap();
    let v2 = dispatch.submit_job(5, 2, "cl5-v2", true).await.unwrap();
    assert!(v2.created);
    dispatch.mark_succeeded(v2.job.id).await.unwrap();

    let same_as_latest = dispatch.submit_job(5, 2, "cl5-v2-again", false).await.unwrap();
    assert_eq!(
        same_as_latest.status,
        SubmissionStatus::AlreadySucceededSameVersion
    );
    assert_eq!(same_as_latest.job.id, v2.job.id);
}

#[tokio::test]
async fn failed_attempts_do_not_block_resubmission() {
    let (_pool, dispatch) = make_store().await;
    let first = dispatch.submit_job(11, 1, "cl11-v1", false).await.unwrap();
    assert!(first.created);

    // No success recorded: a new key for the same version is admitted.
    let retry = dispatch.submit_job(11, 1, "cl11-v1-retry", false).await.unwrap();
    assert_eq!(retry.status, SubmissionStatus::Created);
}

#[tokio::test]
async fn prepare_notifications_uses_the_dispatch_rows_partition() {
    let (pool, dispatch) = make_store().await;
    let result = dispatch.submit_job(4, 7, "cl4-v7", false).await.unwrap();

    let recipients = vec![
        "x@example.com".to_string(),
        "x@example.com".to_string(),
        "a@example.com".to_string(),
    ];
    dispatch
        .prepare_notifications(
            result.job.id,
            &recipients,
            &serde_json::json!({"summary": "ok"}),
        )
        .await
        .unwrap();

    // Duplicate recipients collapse to one row per triple.
    let rows = dispatch.outbox().unsent_rows(4, 7).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].recipient, "a@example.com");
    assert_eq!(rows[1].recipient, "x@example.com");
    assert!(rows
        .iter()
        .all(|row| row.changelist_id == 4 && row.review_version == 7));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_outbox")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}
