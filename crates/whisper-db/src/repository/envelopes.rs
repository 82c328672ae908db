//! Envelope repository — durable message headers and receipt state.
//!
//! Persisting the envelope is the commit point of `send_message`: fanout and
//! push happen only after the insert succeeds, so a client disconnect
//! mid-send can never leave a half-committed message.

use sqlx::PgPool;
use uuid::Uuid;

use whisper_common::frames::{GroupSubEnvelope, ReceiptStatus};

/// New 1:1 envelope header.
pub struct NewEnvelope<'a> {
    pub message_id: Uuid,
    pub from_id: &'a str,
    pub to_id: &'a str,
    pub msg_type: &'a str,
    pub timestamp_ms: i64,
    pub nonce: &'a str,
    pub ciphertext: &'a str,
    pub sig: &'a str,
    pub reply_to: Option<Uuid>,
    pub attachment: Option<serde_json::Value>,
}

/// Dedup check: has this sender already sent this messageId recently?
pub async fn was_recently_sent(
    pool: &PgPool,
    from_id: &str,
    message_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM envelopes
        WHERE from_id = $1 AND message_id = $2
          AND created_at > NOW() - INTERVAL '24 hours'
        "#,
    )
    .bind(from_id)
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Persist a 1:1 envelope. Idempotent on (from, messageId).
pub async fn insert(pool: &PgPool, env: NewEnvelope<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO envelopes (
            message_id, from_id, to_id, msg_type, timestamp_ms,
            nonce, ciphertext, sig, reply_to, attachment
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (from_id, message_id) DO NOTHING
        "#,
    )
    .bind(env.message_id)
    .bind(env.from_id)
    .bind(env.to_id)
    .bind(env.msg_type)
    .bind(env.timestamp_ms)
    .bind(env.nonce)
    .bind(env.ciphertext)
    .bind(env.sig)
    .bind(env.reply_to)
    .bind(env.attachment)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a group message: one header row plus every per-recipient
/// sub-envelope, in a single transaction. The sender's `message_accepted`
/// may only be sent after this commits.
pub async fn insert_group(
    pool: &PgPool,
    group_id: Uuid,
    message_id: Uuid,
    from_id: &str,
    msg_type: &str,
    timestamp_ms: i64,
    attachment: Option<serde_json::Value>,
    recipients: &[GroupSubEnvelope],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO envelopes (message_id, from_id, group_id, msg_type, timestamp_ms, attachment)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (from_id, message_id) DO NOTHING
        "#,
    )
    .bind(message_id)
    .bind(from_id)
    .bind(group_id)
    .bind(msg_type)
    .bind(timestamp_ms)
    .bind(attachment)
    .execute(&mut *tx)
    .await?;

    for sub in recipients {
        sqlx::query(
            r#"
            INSERT INTO group_sub_envelopes (message_id, group_id, from_id, to_id, nonce, ciphertext, sig)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (message_id, to_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(group_id)
        .bind(from_id)
        .bind(sub.to.as_str())
        .bind(&sub.nonce)
        .bind(&sub.ciphertext)
        .bind(&sub.sig)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Apply a receipt to the original sender's envelope. First receipt wins:
/// a `delivered` never downgrades a `read`, and repeated receipts are no-ops.
/// Returns whether this receipt changed state.
pub async fn apply_receipt(
    pool: &PgPool,
    from_id: &str,
    message_id: Uuid,
    status: ReceiptStatus,
) -> Result<bool, sqlx::Error> {
    let sql = match status {
        ReceiptStatus::Delivered => {
            r#"
            UPDATE envelopes SET delivered_at = NOW()
            WHERE from_id = $1 AND message_id = $2 AND delivered_at IS NULL
            "#
        }
        ReceiptStatus::Read => {
            r#"
            UPDATE envelopes SET
                read_at = NOW(),
                delivered_at = COALESCE(delivered_at, NOW())
            WHERE from_id = $1 AND message_id = $2 AND read_at IS NULL
            "#
        }
    };
    let result = sqlx::query(sql).bind(from_id).bind(message_id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Tombstone a message. Only the original sender's row matches, so the
/// predicate doubles as the "is original sender" check. Returns whether the
/// envelope existed and was live.
pub async fn tombstone(
    pool: &PgPool,
    from_id: &str,
    message_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE envelopes SET deleted_at = NOW() WHERE from_id = $1 AND message_id = $2 AND deleted_at IS NULL",
    )
    .bind(from_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

