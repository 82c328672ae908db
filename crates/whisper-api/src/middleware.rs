//! Middleware — session-token authentication for the REST surface.
//!
//! The bearer token is the opaque `sessionToken` minted at `register_proof`.
//! Tokens authenticate the caller's socket/session only; anything that needs
//! message authenticity still rides a signed frame through the gateway.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use whisper_common::error::WhisperError;
use whisper_common::models::IdentityStatus;
use whisper_common::WhisperId;
use whisper_db::repository::{identities, sessions};

use crate::AppState;

/// Authentication context extracted from the Authorization header.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub whisper_id: WhisperId,
    pub device_id: String,
}

/// Gate an admin route on the shared admin token. An empty configured token
/// disables the admin surface outright.
pub(crate) fn require_admin(headers: &axum::http::HeaderMap) -> Result<(), WhisperError> {
    let cfg = whisper_common::config::get();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if cfg.auth.admin_token.is_empty() || presented != Some(cfg.auth.admin_token.as_str()) {
        return Err(WhisperError::Forbidden);
    }
    Ok(())
}

/// Extract and validate the bearer session token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, WhisperError> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(WhisperError::AuthFailed)?;

    let token = auth_header.strip_prefix("Bearer ").ok_or(WhisperError::AuthFailed)?;

    let session = sessions::find_valid(&state.db.pg, token)
        .await?
        .ok_or(WhisperError::AuthFailed)?;

    let identity = identities::find_by_id(&state.db.pg, &session.whisper_id)
        .await?
        .ok_or(WhisperError::AuthFailed)?;
    match IdentityStatus::from_str(&identity.status) {
        Some(IdentityStatus::Active) => {}
        Some(IdentityStatus::Banned) => return Err(WhisperError::Forbidden),
        _ => return Err(WhisperError::AuthFailed),
    }

    let auth_ctx = AuthContext {
        whisper_id: WhisperId::parse(&session.whisper_id)?,
        device_id: session.device_id,
    };

    // Insert auth context into request extensions for handlers to use
    request.extensions_mut().insert(auth_ctx);

    Ok(next.run(request).await)
}
