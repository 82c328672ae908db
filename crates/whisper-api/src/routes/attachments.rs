//! Attachment access gate.
//!
//! POST /attachments/presign/upload   — mint an object key + presigned PUT
//! POST /attachments/presign/download — presigned GET for owner or grantee
//! POST /admin/attachments/gc/run     — reap expired records, grants, objects
//!
//! The server never streams a byte of attachment content; clients talk to
//! object storage directly through the short-lived URLs minted here.

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;
use whisper_common::config;
use whisper_common::error::{invalid_payload, WhisperError, WhisperResult};
use whisper_common::validation;
use whisper_db::repository::attachments;

use crate::{middleware::AuthContext, AppState};

/// Content types that may never be stored, even under a generic label.
const DENIED_CONTENT_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-executable",
    "application/x-sh",
    "application/x-elf",
    "application/x-mach-binary",
    "application/vnd.microsoft.portable-executable",
];

/// Specific non-media document types we accept.
const ALLOWED_DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "application/zip",
    "application/octet-stream",
];

/// Allow-list check: media prefixes, a short document list, and the generic
/// octet-stream label clients use for E2E-encrypted blobs.
fn is_allowed_content_type(ct: &str) -> bool {
    if DENIED_CONTENT_TYPES.contains(&ct) {
        return false;
    }
    ct.starts_with("image/")
        || ct.starts_with("video/")
        || ct.starts_with("audio/")
        || ALLOWED_DOCUMENT_TYPES.contains(&ct)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/attachments/presign/upload", post(presign_upload))
        .route("/attachments/presign/download", post(presign_download))
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new().route("/admin/attachments/gc/run", post(run_gc))
}

// ============================================================
// POST /attachments/presign/upload
// ============================================================

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PresignUploadBody {
    #[validate(length(min = 3, max = 100))]
    content_type: String,
    size_bytes: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignUploadResponse {
    object_key: String,
    upload_url: String,
    expires_at: chrono::DateTime<Utc>,
}

async fn presign_upload(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PresignUploadBody>,
) -> WhisperResult<Json<PresignUploadResponse>> {
    body.validate().map_err(|e| invalid_payload(e.to_string()))?;

    let cfg = config::get();
    if !is_allowed_content_type(&body.content_type) {
        return Err(invalid_payload(format!(
            "content type '{}' is not allowed",
            body.content_type
        )));
    }
    if body.size_bytes <= 0 || body.size_bytes as u64 > cfg.limits.max_attachment_bytes {
        return Err(invalid_payload("sizeBytes out of range"));
    }

    let now = Utc::now();
    let object_key = format!(
        "whisper/att/{:04}/{:02}/{}/{}.bin",
        now.year(),
        now.month(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    let expires_at = now + Duration::days(cfg.limits.attachment_ttl_days);

    attachments::insert(
        &state.db.pg,
        &object_key,
        auth.whisper_id.as_str(),
        &body.content_type,
        body.size_bytes,
        expires_at,
    )
    .await?;

    let upload_url = state
        .storage
        .presigned_put_url(&object_key, &body.content_type)
        .await
        .map_err(WhisperError::Internal)?;

    tracing::debug!(owner = %auth.whisper_id, key = %object_key, "Attachment presigned for upload");
    Ok(Json(PresignUploadResponse { object_key, upload_url, expires_at }))
}

// ============================================================
// POST /attachments/presign/download
// ============================================================

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PresignDownloadBody {
    #[validate(length(min = 1, max = 255))]
    object_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignDownloadResponse {
    object_key: String,
    download_url: String,
    content_type: String,
    ciphertext_size: i64,
}

async fn presign_download(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PresignDownloadBody>,
) -> WhisperResult<Json<PresignDownloadResponse>> {
    body.validate().map_err(|e| invalid_payload(e.to_string()))?;
    validation::check_object_key(&body.object_key)?;

    let record = attachments::find(&state.db.pg, &body.object_key)
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "attachment".into() })?;

    // Owner always; everyone else needs an unexpired grant minted at send time.
    let caller = auth.whisper_id.as_str();
    let authorized = record.owner_id == caller
        || attachments::has_active_grant(&state.db.pg, &body.object_key, caller).await?;
    if !authorized {
        return Err(WhisperError::Forbidden);
    }

    let download_url = state
        .storage
        .presigned_get_url(&body.object_key)
        .await
        .map_err(WhisperError::Internal)?;

    Ok(Json(PresignDownloadResponse {
        object_key: record.object_key,
        download_url,
        content_type: record.content_type,
        ciphertext_size: record.ciphertext_size,
    }))
}

// ============================================================
// POST /admin/attachments/gc/run
// ============================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GcResponse {
    attachments_reaped: usize,
    grants_reaped: u64,
}

/// Reap expired attachment records (prefix re-checked in the delete
/// predicate), their storage objects, and stray expired grants.
async fn run_gc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> WhisperResult<Json<GcResponse>> {
    crate::middleware::require_admin(&headers)?;

    let keys = attachments::reap_expired(&state.db.pg).await?;
    for key in &keys {
        if let Err(e) = state.storage.delete_object(key).await {
            tracing::warn!(key = %key, error = %e, "GC could not delete object; record already reaped");
        }
    }
    let grants_reaped = attachments::reap_expired_grants(&state.db.pg).await?;

    tracing::info!(
        attachments = keys.len(),
        grants = grants_reaped,
        "Attachment GC pass complete"
    );
    Ok(Json(GcResponse { attachments_reaped: keys.len(), grants_reaped }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_prefixes_are_allowed() {
        for ct in ["image/png", "image/webp", "video/mp4", "audio/ogg"] {
            assert!(is_allowed_content_type(ct), "{ct}");
        }
    }

    #[test]
    fn documents_and_octet_stream_are_allowed() {
        for ct in ["application/pdf", "text/plain", "application/octet-stream"] {
            assert!(is_allowed_content_type(ct), "{ct}");
        }
    }

    #[test]
    fn executables_are_denied() {
        for ct in [
            "application/x-msdownload",
            "application/x-executable",
            "application/x-sh",
            "application/javascript",
            "text/html",
        ] {
            assert!(!is_allowed_content_type(ct), "{ct}");
        }
    }
}
