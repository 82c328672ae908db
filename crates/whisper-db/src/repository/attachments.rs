//! Attachment records and access grants.
//!
//! A grant exists iff the server observed a signed envelope referencing the
//! object addressed to the grantee; grants are minted at send time and die
//! with the attachment.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttachmentRow {
    pub object_key: String,
    pub owner_id: String,
    pub content_type: String,
    pub ciphertext_size: i64,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert(
    pool: &PgPool,
    object_key: &str,
    owner_id: &str,
    content_type: &str,
    ciphertext_size: i64,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO attachments (object_key, owner_id, content_type, ciphertext_size, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(object_key)
    .bind(owner_id)
    .bind(content_type)
    .bind(ciphertext_size)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &PgPool, object_key: &str) -> Result<Option<AttachmentRow>, sqlx::Error> {
    sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE object_key = $1")
        .bind(object_key)
        .fetch_optional(pool)
        .await
}

/// Grant download access to one recipient. Idempotent; the grant inherits the
/// attachment's expiry.
pub async fn grant_access(
    pool: &PgPool,
    object_key: &str,
    grantee_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO attachment_grants (object_key, grantee_id, expires_at)
        SELECT object_key, $2, expires_at FROM attachments WHERE object_key = $1
        ON CONFLICT (object_key, grantee_id) DO NOTHING
        "#,
    )
    .bind(object_key)
    .bind(grantee_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether an unexpired grant authorizes `grantee_id` for `object_key`.
pub async fn has_active_grant(
    pool: &PgPool,
    object_key: &str,
    grantee_id: &str,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM attachment_grants
        WHERE object_key = $1 AND grantee_id = $2 AND expires_at > NOW()
        "#,
    )
    .bind(object_key)
    .bind(grantee_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Collect and delete expired attachment records. The `whisper/att/` prefix
/// is re-checked in the predicate so a corrupted row can never name an
/// arbitrary object for deletion. Grants go with the records via FK cascade.
/// Returns the object keys to remove from storage.
pub async fn reap_expired(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        DELETE FROM attachments
        WHERE expires_at < NOW() AND object_key LIKE 'whisper/att/%'
        RETURNING object_key
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(k,)| k).collect())
}

/// Reap grants that expired ahead of their attachment. Returns the count.
pub async fn reap_expired_grants(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM attachment_grants WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
