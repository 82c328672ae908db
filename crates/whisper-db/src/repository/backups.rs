//! Encrypted contact backup — one opaque blob per identity.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackupRow {
    pub whisper_id: String,
    pub nonce: String,
    pub ciphertext: String,
    pub updated_at: DateTime<Utc>,
}

/// Store or replace the blob. Returns true when this was the first write
/// (PUT answers 201 on create, 200 on replace).
pub async fn upsert(
    pool: &PgPool,
    whisper_id: &str,
    nonce: &str,
    ciphertext: &str,
) -> Result<bool, sqlx::Error> {
    let row: (bool,) = sqlx::query_as(
        r#"
        INSERT INTO contact_backups (whisper_id, nonce, ciphertext)
        VALUES ($1, $2, $3)
        ON CONFLICT (whisper_id) DO UPDATE SET
            nonce = EXCLUDED.nonce,
            ciphertext = EXCLUDED.ciphertext,
            updated_at = NOW()
        RETURNING (xmax = 0)
        "#,
    )
    .bind(whisper_id)
    .bind(nonce)
    .bind(ciphertext)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn find(pool: &PgPool, whisper_id: &str) -> Result<Option<BackupRow>, sqlx::Error> {
    sqlx::query_as::<_, BackupRow>("SELECT * FROM contact_backups WHERE whisper_id = $1")
        .bind(whisper_id)
        .fetch_optional(pool)
        .await
}

pub async fn delete(pool: &PgPool, whisper_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM contact_backups WHERE whisper_id = $1")
        .bind(whisper_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
