//! Key lookup route.
//!
//! GET /users/{whisperId}/keys — public key material for a handle.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use whisper_common::error::{WhisperError, WhisperResult};
use whisper_common::models::IdentityStatus;
use whisper_common::WhisperId;
use whisper_db::repository::identities;

use crate::middleware::require_admin;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/users/{whisper_id}/keys", get(get_keys))
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/users/{whisper_id}/ban", post(ban_user))
        .route("/admin/users/{whisper_id}/unban", post(unban_user))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeysResponse {
    whisper_id: WhisperId,
    enc_public_key: String,
    sign_public_key: String,
    status: &'static str,
}

/// 400 on malformed handle, 404 unknown/deleted, 403 banned.
async fn get_keys(
    State(state): State<Arc<AppState>>,
    Path(whisper_id): Path<String>,
) -> WhisperResult<Json<KeysResponse>> {
    let whisper_id = WhisperId::parse(&whisper_id)?;

    let identity = identities::find_by_id(&state.db.pg, whisper_id.as_str())
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "identity".into() })?;

    let status = match IdentityStatus::from_str(&identity.status) {
        Some(IdentityStatus::Active) => "active",
        Some(IdentityStatus::Banned) => return Err(WhisperError::Forbidden),
        _ => return Err(WhisperError::NotFound { resource: "identity".into() }),
    };

    Ok(Json(KeysResponse {
        whisper_id,
        enc_public_key: identity.enc_public_key,
        sign_public_key: identity.sign_public_key,
        status,
    }))
}

/// Ban an identity: sessions are revoked immediately; routing to and from
/// the identity starts failing with FORBIDDEN. A still-open socket dies on
/// its next authenticated action or idle timeout.
async fn ban_user(
    State(state): State<Arc<AppState>>,
    Path(whisper_id): Path<String>,
    headers: HeaderMap,
) -> WhisperResult<axum::http::StatusCode> {
    require_admin(&headers)?;
    let whisper_id = WhisperId::parse(&whisper_id)?;
    let existed =
        identities::set_status(&state.db.pg, whisper_id.as_str(), IdentityStatus::Banned.as_str())
            .await?;
    if !existed {
        return Err(WhisperError::NotFound { resource: "identity".into() });
    }
    tracing::info!(whisper_id = %whisper_id, "Identity banned");
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn unban_user(
    State(state): State<Arc<AppState>>,
    Path(whisper_id): Path<String>,
    headers: HeaderMap,
) -> WhisperResult<axum::http::StatusCode> {
    require_admin(&headers)?;
    let whisper_id = WhisperId::parse(&whisper_id)?;
    let existed =
        identities::set_status(&state.db.pg, whisper_id.as_str(), IdentityStatus::Active.as_str())
            .await?;
    if !existed {
        return Err(WhisperError::NotFound { resource: "identity".into() });
    }
    tracing::info!(whisper_id = %whisper_id, "Identity unbanned");
    Ok(axum::http::StatusCode::NO_CONTENT)
}
