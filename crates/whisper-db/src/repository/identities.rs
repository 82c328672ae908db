//! Identity repository — users, key material, device bindings.
//!
//! The register transaction is the atomicity boundary for single-active-device:
//! binding replacement, prior-session revocation, and new-session insertion
//! commit together or not at all. Socket eviction is a best-effort hint the
//! gateway applies after commit.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

/// Row type for identities.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdentityRow {
    pub whisper_id: String,
    pub enc_public_key: String,
    pub sign_public_key: String,
    pub active_device_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Row type for device bindings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceBindingRow {
    pub whisper_id: String,
    pub device_id: String,
    pub platform: String,
    pub push_token: Option<String>,
    pub voip_token: Option<String>,
    pub registered_at: DateTime<Utc>,
}

pub async fn find_by_id(pool: &PgPool, whisper_id: &str) -> Result<Option<IdentityRow>, sqlx::Error> {
    sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities WHERE whisper_id = $1")
        .bind(whisper_id)
        .fetch_optional(pool)
        .await
}

pub async fn find_binding(
    pool: &PgPool,
    whisper_id: &str,
) -> Result<Option<DeviceBindingRow>, sqlx::Error> {
    sqlx::query_as::<_, DeviceBindingRow>("SELECT * FROM device_bindings WHERE whisper_id = $1")
        .bind(whisper_id)
        .fetch_optional(pool)
        .await
}

/// Everything `register_proof` commits atomically.
pub struct RegisterDevice<'a> {
    pub whisper_id: &'a str,
    pub enc_public_key: &'a str,
    pub sign_public_key: &'a str,
    pub device_id: &'a str,
    pub platform: &'a str,
    pub push_token: Option<&'a str>,
    pub voip_token: Option<&'a str>,
    pub session_token: &'a str,
    pub session_ttl_secs: u64,
}

/// Commit a successful registration: upsert the identity, replace the device
/// binding, revoke all prior sessions, insert the new session. Returns the
/// new session expiry.
pub async fn register_device(
    pool: &PgPool,
    reg: RegisterDevice<'_>,
) -> Result<DateTime<Utc>, sqlx::Error> {
    let expires_at = Utc::now() + Duration::seconds(reg.session_ttl_secs as i64);
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO identities (whisper_id, enc_public_key, sign_public_key, active_device_id, status)
        VALUES ($1, $2, $3, $4, 'active')
        ON CONFLICT (whisper_id) DO UPDATE SET active_device_id = EXCLUDED.active_device_id
        "#,
    )
    .bind(reg.whisper_id)
    .bind(reg.enc_public_key)
    .bind(reg.sign_public_key)
    .bind(reg.device_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO device_bindings (whisper_id, device_id, platform, push_token, voip_token)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (whisper_id) DO UPDATE SET
            device_id = EXCLUDED.device_id,
            platform = EXCLUDED.platform,
            push_token = EXCLUDED.push_token,
            voip_token = EXCLUDED.voip_token,
            registered_at = NOW()
        "#,
    )
    .bind(reg.whisper_id)
    .bind(reg.device_id)
    .bind(reg.platform)
    .bind(reg.push_token)
    .bind(reg.voip_token)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM sessions WHERE whisper_id = $1")
        .bind(reg.whisper_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO sessions (session_token, whisper_id, device_id, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(reg.session_token)
    .bind(reg.whisper_id)
    .bind(reg.device_id)
    .bind(expires_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(expires_at)
}

/// Replace push tokens on the active binding.
pub async fn update_tokens(
    pool: &PgPool,
    whisper_id: &str,
    push_token: Option<&str>,
    voip_token: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE device_bindings SET
            push_token = COALESCE($2, push_token),
            voip_token = COALESCE($3, voip_token)
        WHERE whisper_id = $1
        "#,
    )
    .bind(whisper_id)
    .bind(push_token)
    .bind(voip_token)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear a push token the provider reported as invalid.
pub async fn clear_push_token(
    pool: &PgPool,
    whisper_id: &str,
    voip: bool,
) -> Result<(), sqlx::Error> {
    let sql = if voip {
        "UPDATE device_bindings SET voip_token = NULL WHERE whisper_id = $1"
    } else {
        "UPDATE device_bindings SET push_token = NULL WHERE whisper_id = $1"
    };
    sqlx::query(sql).bind(whisper_id).execute(pool).await?;
    Ok(())
}

/// Set an identity's lifecycle status (admin ban/unban). Revokes all
/// sessions when the new status is not `active`. Returns whether the
/// identity existed.
pub async fn set_status(
    pool: &PgPool,
    whisper_id: &str,
    status: &str,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("UPDATE identities SET status = $2 WHERE whisper_id = $1")
        .bind(whisper_id)
        .bind(status)
        .execute(&mut *tx)
        .await?;
    if status != "active" {
        sqlx::query("DELETE FROM sessions WHERE whisper_id = $1")
            .bind(whisper_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Self-delete: remove the identity and every row keyed to it.
///
/// FK cascades cover bindings, sessions, and the contact backup; pending
/// items, grants, and hints have no FK (their ids may outlive identities)
/// and are deleted explicitly.
pub async fn delete_identity(pool: &PgPool, whisper_id: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM pending_items WHERE recipient_id = $1")
        .bind(whisper_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM attachment_grants WHERE grantee_id = $1")
        .bind(whisper_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM contact_hints WHERE owner_id = $1 OR contact_id = $1")
        .bind(whisper_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM identities WHERE whisper_id = $1")
        .bind(whisper_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}
