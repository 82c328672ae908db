//! Registration and session handshake.
//!
//! `register_begin` hands out a one-shot 32-byte challenge (60 s TTL);
//! `register_proof` consumes it, verifies the Ed25519 proof, and commits the
//! single-active-device switch: new binding + new session in one transaction,
//! then a best-effort `session_superseded` close of the prior socket. The
//! store write is the commit; the socket close is a hint.
//!
//! "Unknown challenge", "expired challenge", "bad signature", and "wrong
//! recovery key" are all the same `AUTH_FAILED` to a probing client.

use base64::{engine::general_purpose::STANDARD as B64, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use whisper_common::canonical::verify_challenge_proof;
use whisper_common::config;
use whisper_common::error::{WhisperError, WhisperResult};
use whisper_common::frames::{self, ErrorBody, RegisterAck, RegisterChallenge, ServerFrame, SessionRefreshAck};
use whisper_common::models::IdentityStatus;
use whisper_common::WhisperId;
use whisper_db::repository::{identities, sessions};

use crate::registry::ConnHandle;
use crate::{ConnCtx, GatewayState, SocketSession};

// ============================================================
// Challenge store
// ============================================================

#[derive(Debug, Clone)]
pub struct Challenge {
    pub bytes: [u8; 32],
    pub device_id: String,
    /// Present on recovery attempts.
    pub whisper_id: Option<WhisperId>,
    pub expires_at: Instant,
}

/// In-process one-shot challenge store. Expiry is checked on consumption;
/// issuing opportunistically prunes dead entries.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    entries: Arc<RwLock<HashMap<Uuid, Challenge>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(
        &self,
        device_id: String,
        whisper_id: Option<WhisperId>,
        ttl: Duration,
    ) -> (Uuid, [u8; 32], Instant) {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let challenge_id = Uuid::new_v4();
        let expires_at = Instant::now() + ttl;

        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, c| c.expires_at > now);
        entries.insert(challenge_id, Challenge { bytes, device_id, whisper_id, expires_at });
        (challenge_id, bytes, expires_at)
    }

    /// One-shot consumption. Expired, unknown, and device-mismatched
    /// challenges all read as absent.
    pub async fn consume(&self, challenge_id: Uuid, device_id: &str) -> Option<Challenge> {
        let challenge = self.entries.write().await.remove(&challenge_id)?;
        if challenge.expires_at <= Instant::now() || challenge.device_id != device_id {
            return None;
        }
        Some(challenge)
    }
}

/// Opaque session token: 32 random bytes, base64url (43 chars).
fn mint_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ============================================================
// Socket attachment
// ============================================================

/// Bind this socket to an identity in the registry, evicting any prior
/// socket with `session_superseded`, and replay a live incoming call.
async fn attach_socket(state: &Arc<GatewayState>, ctx: &ConnCtx, whisper_id: &WhisperId) {
    let handle = ConnHandle::new(ctx.conn_id, ctx.out.clone());
    if let Some(prior) = state.registry.insert(whisper_id.as_str(), handle).await {
        if prior.conn_id != ctx.conn_id {
            prior.send(
                &ServerFrame::Error(ErrorBody {
                    code: "CONFLICT",
                    message: "session_superseded".into(),
                }),
                None,
            );
            prior.close();
            tracing::info!(whisper_id = %whisper_id, "Prior device socket superseded");
        }
    }

    if let Some(incoming) = state.calls.pending_incoming_for(whisper_id).await {
        ctx.send(&ServerFrame::CallIncoming(incoming));
    }
}

// ============================================================
// Frame handlers
// ============================================================

pub(crate) async fn handle_register_begin(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    p: frames::RegisterBegin,
) -> WhisperResult<()> {
    let cfg = config::get();
    let ttl = Duration::from_secs(cfg.auth.challenge_ttl_secs);
    let (challenge_id, bytes, _) = state
        .challenges
        .issue(p.device_id, p.whisper_id, ttl)
        .await;

    ctx.reply(&ServerFrame::RegisterChallenge(RegisterChallenge {
        challenge_id,
        challenge: B64.encode(bytes),
        expires_at: Utc::now().timestamp_millis() + (ttl.as_millis() as i64),
    }));
    Ok(())
}

pub(crate) async fn handle_register_proof(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    session: &mut Option<SocketSession>,
    p: frames::RegisterProof,
) -> WhisperResult<()> {
    let challenge = state
        .challenges
        .consume(p.challenge_id, &p.device_id)
        .await
        .ok_or(WhisperError::AuthFailed)?;

    verify_challenge_proof(&p.sign_public_key, &p.signature, &challenge.bytes)?;

    // Resolve the identity this proof binds to. On recovery the supplied keys
    // must byte-match the stored ones; on fresh registration the handle is
    // derived from the signing key, so the same key pair always yields the
    // same WhisperID.
    let whisper_id = match &challenge.whisper_id {
        Some(recovery_id) => recovery_id.clone(),
        None => {
            let key = whisper_common::validation::check_public_key(
                &p.sign_public_key,
                "signPublicKey",
            )?;
            WhisperId::derive(&key)
        }
    };

    if let Some(existing) = identities::find_by_id(&state.db.pg, whisper_id.as_str()).await? {
        match IdentityStatus::from_str(&existing.status) {
            Some(IdentityStatus::Active) => {}
            Some(IdentityStatus::Banned) => return Err(WhisperError::Forbidden),
            _ => return Err(WhisperError::AuthFailed),
        }
        if existing.sign_public_key != p.sign_public_key
            || existing.enc_public_key != p.enc_public_key
        {
            // Keys are immutable for the lifetime of an identity.
            return Err(WhisperError::AuthFailed);
        }
    } else if challenge.whisper_id.is_some() {
        // Recovery of a handle this server has never seen.
        return Err(WhisperError::AuthFailed);
    }

    let cfg = config::get();
    let session_token = mint_session_token();
    let expires_at = identities::register_device(
        &state.db.pg,
        identities::RegisterDevice {
            whisper_id: whisper_id.as_str(),
            enc_public_key: &p.enc_public_key,
            sign_public_key: &p.sign_public_key,
            device_id: &p.device_id,
            platform: &p.platform,
            push_token: p.push_token.as_deref(),
            voip_token: p.voip_token.as_deref(),
            session_token: &session_token,
            session_ttl_secs: cfg.auth.session_ttl_secs,
        },
    )
    .await?;

    *session = Some(SocketSession {
        whisper_id: whisper_id.clone(),
        device_id: p.device_id.clone(),
        conn_id: ctx.conn_id,
    });
    attach_socket(state, ctx, &whisper_id).await;

    tracing::info!(whisper_id = %whisper_id, platform = %p.platform, "Device registered");
    ctx.reply(&ServerFrame::RegisterAck(RegisterAck {
        whisper_id,
        session_token,
        session_expires_at: expires_at.timestamp_millis(),
        server_time: Utc::now().timestamp_millis(),
    }));
    Ok(())
}

pub(crate) async fn handle_session_refresh(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    session: &mut Option<SocketSession>,
    p: frames::SessionRefresh,
) -> WhisperResult<()> {
    let row = sessions::find_valid(&state.db.pg, &p.session_token)
        .await?
        .ok_or(WhisperError::AuthFailed)?;

    let identity = identities::find_by_id(&state.db.pg, &row.whisper_id)
        .await?
        .ok_or(WhisperError::AuthFailed)?;
    match IdentityStatus::from_str(&identity.status) {
        Some(IdentityStatus::Active) => {}
        Some(IdentityStatus::Banned) => return Err(WhisperError::Forbidden),
        _ => return Err(WhisperError::AuthFailed),
    }

    let cfg = config::get();
    let expires_at = sessions::refresh(&state.db.pg, &p.session_token, cfg.auth.session_ttl_secs)
        .await?
        .ok_or(WhisperError::AuthFailed)?;

    // A refresh over a fresh socket is how a reconnecting device re-attaches
    // without redoing the challenge dance.
    let whisper_id = WhisperId::parse(&row.whisper_id)?;
    *session = Some(SocketSession {
        whisper_id: whisper_id.clone(),
        device_id: row.device_id,
        conn_id: ctx.conn_id,
    });
    attach_socket(state, ctx, &whisper_id).await;

    ctx.reply(&ServerFrame::SessionRefreshAck(SessionRefreshAck {
        session_expires_at: expires_at.timestamp_millis(),
    }));
    Ok(())
}

pub(crate) async fn handle_logout(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    session: &mut Option<SocketSession>,
    p: frames::Logout,
) -> WhisperResult<()> {
    sessions::revoke(&state.db.pg, &p.session_token).await?;
    if let Some(sess) = session.take() {
        state.registry.remove_if(sess.whisper_id.as_str(), sess.conn_id).await;
        tracing::info!(whisper_id = %sess.whisper_id, "Logged out");
    }
    ctx.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn challenges_are_one_shot() {
        let store = ChallengeStore::new();
        let (id, bytes, _) = store
            .issue("dev-1".into(), None, Duration::from_secs(60))
            .await;
        let challenge = store.consume(id, "dev-1").await.expect("first consume succeeds");
        assert_eq!(challenge.bytes, bytes);
        assert!(store.consume(id, "dev-1").await.is_none(), "second consume must fail");
    }

    #[tokio::test]
    async fn expired_and_mismatched_challenges_read_as_absent() {
        let store = ChallengeStore::new();
        let (id, _, _) = store
            .issue("dev-1".into(), None, Duration::from_millis(1))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.consume(id, "dev-1").await.is_none());

        let (id, _, _) = store
            .issue("dev-1".into(), None, Duration::from_secs(60))
            .await;
        assert!(store.consume(id, "dev-2").await.is_none(), "device mismatch");
    }

    #[test]
    fn session_tokens_are_long_and_distinct() {
        let a = mint_session_token();
        let b = mint_session_token();
        assert!(a.len() >= 32);
        assert_ne!(a, b);
    }
}
