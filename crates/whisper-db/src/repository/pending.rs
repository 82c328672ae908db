//! Pending queue repository — per-recipient FIFO of undelivered envelopes.
//!
//! Ordered by `(enqueued_at, message_id)` for stable cursor pagination.
//! Fetching never drains; only receipts delete rows, so a network flap
//! between fetch and ack cannot lose a message.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingRow {
    pub recipient_id: String,
    pub message_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub envelope: serde_json::Value,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    /// False when the (recipient, messageId) pair was already queued.
    pub inserted: bool,
    /// True when this insert took the queue from empty to non-empty —
    /// the push-trigger edge.
    pub was_empty: bool,
}

/// Enqueue an envelope for an offline recipient. Idempotent on
/// (recipientId, messageId).
pub async fn enqueue(
    pool: &PgPool,
    recipient_id: &str,
    message_id: Uuid,
    envelope: &serde_json::Value,
) -> Result<EnqueueOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let (before,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pending_items WHERE recipient_id = $1")
            .bind(recipient_id)
            .fetch_one(&mut *tx)
            .await?;

    let result = sqlx::query(
        r#"
        INSERT INTO pending_items (recipient_id, message_id, envelope)
        VALUES ($1, $2, $3)
        ON CONFLICT (recipient_id, message_id) DO NOTHING
        "#,
    )
    .bind(recipient_id)
    .bind(message_id)
    .bind(envelope)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let inserted = result.rows_affected() > 0;
    Ok(EnqueueOutcome { inserted, was_empty: inserted && before == 0 })
}

/// Fetch one page in enqueue order, starting strictly after the cursor.
pub async fn fetch_page(
    pool: &PgPool,
    recipient_id: &str,
    after: Option<(DateTime<Utc>, Uuid)>,
    limit: i64,
) -> Result<Vec<PendingRow>, sqlx::Error> {
    match after {
        Some((ts, id)) => {
            sqlx::query_as::<_, PendingRow>(
                r#"
                SELECT * FROM pending_items
                WHERE recipient_id = $1 AND (enqueued_at, message_id) > ($2, $3)
                ORDER BY enqueued_at, message_id
                LIMIT $4
                "#,
            )
            .bind(recipient_id)
            .bind(ts)
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, PendingRow>(
                r#"
                SELECT * FROM pending_items
                WHERE recipient_id = $1
                ORDER BY enqueued_at, message_id
                LIMIT $2
                "#,
            )
            .bind(recipient_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Drain one entry on receipt. Returns whether it was still queued.
pub async fn remove(
    pool: &PgPool,
    recipient_id: &str,
    message_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM pending_items WHERE recipient_id = $1 AND message_id = $2")
            .bind(recipient_id)
            .bind(message_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}
