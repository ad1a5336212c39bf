//! At-most-once notification delivery ledger.
//!
//! Rows are persisted before any provider call, keyed uniquely per
//! `(changelist_id, recipient, review_version)`. Delivery reconciles
//! against the provider's message identifiers, so a crash between
//! "provider accepted" and "row marked sent" never produces a second
//! user-visible message as long as the provider honors the supplied
//! idempotency key.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::info;

use crate::error::Result;

/// Capability surface the ledger needs from the transport.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Send a message and return the provider's message id.
    async fn send(&self, recipient: &str, payload: &str, idempotency_key: &str) -> Result<String>;

    /// True when the message id exists on the provider side.
    async fn lookup(&self, provider_message_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Queued,
    Sent,
}

/// One row of the `notification_outbox` table.
///
/// `status = sent` holds exactly when `notified_at` is set.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OutboxRow {
    pub id: i64,
    pub changelist_id: i64,
    pub recipient: String,
    pub review_version: i64,
    pub payload: String,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub provider_message_id: Option<String>,
    pub notified_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    AlreadySent,
    Reconciled,
    Sent,
}

/// Outcome of delivering (or declining to re-deliver) one outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub row_id: i64,
    pub provider_message_id: Option<String>,
}

/// Ledger of intended notifications, deduplicated per recipient triple.
#[derive(Clone)]
pub struct NotificationOutboxStore {
    pool: SqlitePool,
}

impl NotificationOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deterministic dedup key for one (changelist, recipient, version)
    /// triple.
    pub fn idempotency_key(changelist_id: i64, recipient: &str, review_version: i64) -> String {
        let raw = format!("{changelist_id}:{recipient}:{review_version}");
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Insert one row per recipient, skipping triples that already exist.
    /// Duplicate recipients in a single call collapse to one row; the
    /// payload is canonically serialized (sorted keys) at first write.
    pub async fn prepare_rows(
        &self,
        changelist_id: i64,
        review_version: i64,
        recipients: &[String],
        payload: &Value,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        for recipient in recipients {
            sqlx::query(
                r#"
                INSERT INTO notification_outbox
                    (changelist_id, recipient, review_version, payload, idempotency_key)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (changelist_id, recipient, review_version) DO NOTHING
                "#,
            )
            .bind(changelist_id)
            .bind(recipient)
            .bind(review_version)
            .bind(&payload_json)
            .bind(Self::idempotency_key(changelist_id, recipient, review_version))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Undelivered rows for one partition, in `(recipient ASC, id ASC)`
    /// order.
    pub async fn unsent_rows(
        &self,
        changelist_id: i64,
        review_version: i64,
    ) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT *
            FROM notification_outbox
            WHERE changelist_id = ?1
              AND review_version = ?2
              AND notified_at IS NULL
            ORDER BY recipient ASC, id ASC
            "#,
        )
        .bind(changelist_id)
        .bind(review_version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deliver one row through the provider.
    ///
    /// Already-finalized rows short-circuit. A stored provider message id
    /// without `notified_at` marks the crash window: the provider is asked
    /// whether the message exists, and a confirmed id finalizes the row
    /// without a second send.
    pub async fn deliver_row(
        &self,
        row_id: i64,
        provider: &dyn NotificationProvider,
    ) -> Result<DeliveryResult> {
        let row = self.get_row(row_id).await?;

        if row.notified_at.is_some() {
            return Ok(DeliveryResult {
                status: DeliveryStatus::AlreadySent,
                row_id,
                provider_message_id: row.provider_message_id,
            });
        }

        if let Some(existing_id) = row.provider_message_id.clone() {
            if provider.lookup(&existing_id).await? {
                self.mark_sent(row_id, None).await?;
                info!(
                    row_id,
                    provider_message_id = %existing_id,
                    "reconciled notification against provider"
                );
                return Ok(DeliveryResult {
                    status: DeliveryStatus::Reconciled,
                    row_id,
                    provider_message_id: Some(existing_id),
                });
            }
        }

        let provider_message_id = provider
            .send(&row.recipient, &row.payload, &row.idempotency_key)
            .await?;
        self.mark_sent(row_id, Some(&provider_message_id)).await?;
        info!(
            row_id,
            recipient = %row.recipient,
            provider_message_id = %provider_message_id,
            "notification sent"
        );
        Ok(DeliveryResult {
            status: DeliveryStatus::Sent,
            row_id,
            provider_message_id: Some(provider_message_id),
        })
    }

    /// Deliver every unsent row in one partition, recipients in
    /// deterministic order.
    pub async fn deliver_pending(
        &self,
        changelist_id: i64,
        review_version: i64,
        provider: &dyn NotificationProvider,
    ) -> Result<Vec<DeliveryResult>> {
        let mut results = Vec::new();
        for row in self.unsent_rows(changelist_id, review_version).await? {
            results.push(self.deliver_row(row.id, provider).await?);
        }
        Ok(results)
    }

    pub async fn get_row(&self, row_id: i64) -> Result<OutboxRow> {
        let row = sqlx::query_as::<_, OutboxRow>("SELECT * FROM notification_outbox WHERE id = ?1")
            .bind(row_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn mark_sent(&self, row_id: i64, provider_message_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET provider_message_id = COALESCE(?1, provider_message_id),
                status = 'sent',
                notified_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(provider_message_id)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_sha256_of_triple() {
        let key = NotificationOutboxStore::idempotency_key(4, "x@example.com", 7);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            key,
            hex::encode(Sha256::digest("4:x@example.com:7".as_bytes()))
        );
    }

    #[test]
    fn idempotency_key_varies_by_every_component() {
        let base = NotificationOutboxStore::idempotency_key(4, "x@example.com", 7);
        assert_ne!(base, NotificationOutboxStore::idempotency_key(5, "x@example.com", 7));
        assert_ne!(base, NotificationOutboxStore::idempotency_key(4, "y@example.com", 7));
        assert_ne!(base, NotificationOutboxStore::idempotency_key(4, "x@example.com", 8));
    }
}
