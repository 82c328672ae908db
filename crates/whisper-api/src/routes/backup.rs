//! Encrypted contact backup routes.
//!
//! PUT    /backup/contacts — store/replace the opaque blob (201 create, 200 replace)
//! GET    /backup/contacts — fetch it byte-identically
//! DELETE /backup/contacts — remove it
//!
//! The blob is `{nonce (24 B), ciphertext}`; the server can neither read nor
//! index it.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;
use whisper_common::error::{invalid_payload, WhisperError, WhisperResult};
use whisper_common::validation;
use whisper_db::repository::backups;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/backup/contacts",
        put(put_backup).get(get_backup).delete(delete_backup),
    )
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BackupBody {
    #[validate(length(min = 1, max = 64))]
    nonce: String,
    #[validate(length(min = 1, max = 1_048_576))]
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupResponse {
    nonce: String,
    ciphertext: String,
}

async fn put_backup(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupBody>,
) -> WhisperResult<impl IntoResponse> {
    body.validate()
        .map_err(|e| invalid_payload(e.to_string()))?;
    validation::check_nonce(&body.nonce)?;
    validation::check_ciphertext(&body.ciphertext)?;

    let created =
        backups::upsert(&state.db.pg, auth.whisper_id.as_str(), &body.nonce, &body.ciphertext)
            .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok(status)
}

async fn get_backup(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> WhisperResult<Json<BackupResponse>> {
    let row = backups::find(&state.db.pg, auth.whisper_id.as_str())
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "backup".into() })?;
    Ok(Json(BackupResponse { nonce: row.nonce, ciphertext: row.ciphertext }))
}

async fn delete_backup(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> WhisperResult<StatusCode> {
    let removed = backups::delete(&state.db.pg, auth.whisper_id.as_str()).await?;
    if !removed {
        return Err(WhisperError::NotFound { resource: "backup".into() });
    }
    Ok(StatusCode::NO_CONTENT)
}
