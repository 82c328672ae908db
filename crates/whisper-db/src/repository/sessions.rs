//! Session repository — opaque bearer tokens with TTL.
//!
//! Expiry is enforced in the lookup predicate, never by a sweeper: an expired
//! token is indistinguishable from an unknown one.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_token: String,
    pub whisper_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Look up a live session.
pub async fn find_valid(pool: &PgPool, token: &str) -> Result<Option<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(
        "SELECT * FROM sessions WHERE session_token = $1 AND expires_at > NOW()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
}

/// Extend a live session. Returns the new expiry, or `None` for an
/// unknown/expired token.
pub async fn refresh(
    pool: &PgPool,
    token: &str,
    ttl_secs: u64,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let expires_at = Utc::now() + Duration::seconds(ttl_secs as i64);
    let result = sqlx::query(
        "UPDATE sessions SET expires_at = $2 WHERE session_token = $1 AND expires_at > NOW()",
    )
    .bind(token)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok((result.rows_affected() > 0).then_some(expires_at))
}

/// Revoke one session (logout). Returns whether a row was removed.
pub async fn revoke(pool: &PgPool, token: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE session_token = $1")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
