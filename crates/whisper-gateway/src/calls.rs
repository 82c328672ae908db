//! Call signaling — per-call state machine, signed forwarding, TURN creds.
//!
//! States: initiated → ringing → connected → ended, with direct jumps to
//! ended from any non-terminal state. Only the two parties may touch a call.
//! SDP offers/answers and ICE candidates are ciphertext to the server; the
//! gateway verifies the canonical signature and relays.
//!
//! TTLs are enforced at every access (an expired entry reads as absent) and
//! a per-call timer additionally converts a stale non-connected call into
//! `call_end{timeout}` for both parties.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use whisper_common::canonical::{verify_fields, CanonicalFields};
use whisper_common::config;
use whisper_common::error::{WhisperError, WhisperResult};
use whisper_common::frames::{
    self, CallEnded, CallIncoming, CallSignal, ServerFrame, TurnCredentials,
};
use whisper_common::models::{Call, CallEndReason, CallState};
use whisper_common::WhisperId;

use crate::{load_active_identity, load_recipient, ConnCtx, GatewayState, SocketSession};

/// One tracked call: the state row plus the `call_incoming` frame replayed
/// to a callee who connects while the call is still live.
#[derive(Debug, Clone)]
struct CallEntry {
    call: Call,
    incoming: CallIncoming,
}

#[derive(Clone, Default)]
pub struct CallStateManager {
    calls: Arc<RwLock<HashMap<Uuid, CallEntry>>>,
}

impl CallStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a fresh call. Rejects a reused callId.
    pub async fn begin(&self, call: Call, incoming: CallIncoming) -> WhisperResult<()> {
        let mut calls = self.calls.write().await;
        if let Some(existing) = calls.get(&call.call_id) {
            if existing.call.expires_at() > Utc::now() {
                return Err(WhisperError::Conflict { message: "call already exists".into() });
            }
        }
        calls.insert(call.call_id, CallEntry { call, incoming });
        Ok(())
    }

    /// Fetch a live call for one of its parties. Expired entries are reaped
    /// on contact; non-parties get FORBIDDEN.
    pub async fn get_for_party(&self, call_id: Uuid, party: &WhisperId) -> WhisperResult<Call> {
        let mut calls = self.calls.write().await;
        let entry = calls
            .get(&call_id)
            .ok_or_else(|| WhisperError::NotFound { resource: "call".into() })?;
        if entry.call.expires_at() <= Utc::now() {
            calls.remove(&call_id);
            return Err(WhisperError::NotFound { resource: "call".into() });
        }
        if !entry.call.is_party(party) {
            return Err(WhisperError::Forbidden);
        }
        Ok(entry.call.clone())
    }

    /// callee: initiated → ringing.
    pub async fn mark_ringing(&self, call_id: Uuid, by: &WhisperId) -> WhisperResult<Call> {
        self.transition(call_id, by, |call, by| {
            if &call.callee_id != by || call.state != CallState::Initiated {
                return Err(WhisperError::Forbidden);
            }
            call.state = CallState::Ringing;
            Ok(())
        })
        .await
    }

    /// callee: initiated|ringing → connected. Extends the TTL to 4 h.
    pub async fn mark_connected(&self, call_id: Uuid, by: &WhisperId) -> WhisperResult<Call> {
        self.transition(call_id, by, |call, by| {
            if &call.callee_id != by
                || !matches!(call.state, CallState::Initiated | CallState::Ringing)
            {
                return Err(WhisperError::Forbidden);
            }
            call.state = CallState::Connected;
            call.connected_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Either party: any non-terminal → ended. Frees the state.
    pub async fn end(
        &self,
        call_id: Uuid,
        by: &WhisperId,
        reason: CallEndReason,
    ) -> WhisperResult<Call> {
        let mut calls = self.calls.write().await;
        let entry = calls
            .get(&call_id)
            .ok_or_else(|| WhisperError::NotFound { resource: "call".into() })?;
        if !entry.call.is_party(by) {
            return Err(WhisperError::Forbidden);
        }
        let mut entry = calls.remove(&call_id).expect("entry just observed");
        entry.call.state = CallState::Ended;
        entry.call.end_reason = Some(reason);
        Ok(entry.call)
    }

    /// Server-applied timeout: frees a call that never connected.
    pub async fn timeout_if_stale(&self, call_id: Uuid) -> Option<Call> {
        let mut calls = self.calls.write().await;
        let connected = calls.get(&call_id).map(|e| e.call.state == CallState::Connected)?;
        if connected {
            return None;
        }
        let mut entry = calls.remove(&call_id).expect("entry just observed");
        entry.call.state = CallState::Ended;
        entry.call.end_reason = Some(CallEndReason::Timeout);
        Some(entry.call)
    }

    /// Live incoming call for a callee who just connected.
    pub async fn pending_incoming_for(&self, callee: &WhisperId) -> Option<CallIncoming> {
        let calls = self.calls.read().await;
        let now = Utc::now();
        calls
            .values()
            .find(|e| {
                &e.call.callee_id == callee
                    && matches!(e.call.state, CallState::Initiated | CallState::Ringing)
                    && e.call.expires_at() > now
            })
            .map(|e| e.incoming.clone())
    }

    async fn transition(
        &self,
        call_id: Uuid,
        by: &WhisperId,
        apply: impl FnOnce(&mut Call, &WhisperId) -> WhisperResult<()>,
    ) -> WhisperResult<Call> {
        let mut calls = self.calls.write().await;
        let entry = calls
            .get_mut(&call_id)
            .ok_or_else(|| WhisperError::NotFound { resource: "call".into() })?;
        if entry.call.expires_at() <= Utc::now() {
            calls.remove(&call_id);
            return Err(WhisperError::NotFound { resource: "call".into() });
        }
        if !entry.call.is_party(by) {
            return Err(WhisperError::Forbidden);
        }
        apply(&mut entry.call, by)?;
        Ok(entry.call.clone())
    }
}

// ============================================================
// Frame handlers
// ============================================================

fn verify_call_sig(
    sign_public_key: &str,
    sig: &str,
    message_type: &str,
    call_id: Uuid,
    from: &WhisperId,
    to: &WhisperId,
    timestamp: i64,
    nonce: Option<&str>,
    ciphertext: Option<&str>,
) -> WhisperResult<()> {
    verify_fields(
        sign_public_key,
        sig,
        &CanonicalFields {
            message_type,
            message_id: &call_id.to_string(),
            from: from.as_str(),
            to_or_group_id: to.as_str(),
            timestamp,
            nonce,
            ciphertext,
        },
    )
}

pub(crate) async fn handle_call_initiate(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::CallInitiate,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let caller = load_active_identity(&state.db, &p.from).await?;
    load_recipient(&state.db, &p.to).await?;
    verify_call_sig(
        &caller.sign_public_key,
        &p.sig,
        "call_initiate",
        p.call_id,
        &p.from,
        &p.to,
        p.timestamp,
        p.nonce.as_deref(),
        p.ciphertext.as_deref(),
    )?;

    let call = Call {
        call_id: p.call_id,
        caller_id: p.from.clone(),
        callee_id: p.to.clone(),
        is_video: p.is_video,
        state: CallState::Initiated,
        created_at: Utc::now(),
        connected_at: None,
        end_reason: None,
    };
    let incoming = CallIncoming {
        call_id: p.call_id,
        from: p.from.clone(),
        is_video: p.is_video,
        timestamp: p.timestamp,
        nonce: p.nonce.clone(),
        ciphertext: p.ciphertext.clone(),
        sig: p.sig.clone(),
    };
    state.calls.begin(call, incoming.clone()).await?;

    match state
        .registry
        .send_frame(p.to.as_str(), &ServerFrame::CallIncoming(incoming))
        .await
    {
        crate::registry::Delivery::Delivered => {}
        crate::registry::Delivery::Offline => {
            // The entry stays as a pending call; the wake push tells the
            // callee's device to connect and pick it up.
            state.push.on_incoming_call(&p.to).await;
        }
    }

    // Non-connected calls time out server-side after 180 s.
    let state = state.clone();
    let call_id = p.call_id;
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(180)).await;
        if let Some(call) = state.calls.timeout_if_stale(call_id).await {
            let frame = |from: &WhisperId| {
                ServerFrame::CallEnd(CallEnded {
                    call_id,
                    from: from.clone(),
                    reason: CallEndReason::Timeout,
                    timestamp: Utc::now().timestamp_millis(),
                })
            };
            state
                .registry
                .send_frame(call.caller_id.as_str(), &frame(&call.callee_id))
                .await;
            state
                .registry
                .send_frame(call.callee_id.as_str(), &frame(&call.caller_id))
                .await;
            tracing::debug!(call_id = %call_id, "Call timed out before connecting");
        }
    });

    Ok(())
}

pub(crate) async fn handle_call_ringing(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::CallRinging,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;
    verify_call_sig(
        &sender.sign_public_key,
        &p.sig,
        "call_ringing",
        p.call_id,
        &p.from,
        &p.to,
        p.timestamp,
        None,
        None,
    )?;

    let call = state.calls.mark_ringing(p.call_id, &p.from).await?;
    let signal = CallSignal {
        call_id: p.call_id,
        from: p.from,
        timestamp: p.timestamp,
        nonce: None,
        ciphertext: None,
        sig: p.sig,
    };
    state
        .registry
        .send_frame(call.caller_id.as_str(), &ServerFrame::CallRinging(signal))
        .await;
    Ok(())
}

pub(crate) async fn handle_call_answer(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::CallAnswer,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;
    verify_call_sig(
        &sender.sign_public_key,
        &p.sig,
        "call_answer",
        p.call_id,
        &p.from,
        &p.to,
        p.timestamp,
        p.nonce.as_deref(),
        p.ciphertext.as_deref(),
    )?;

    let call = state.calls.mark_connected(p.call_id, &p.from).await?;
    let signal = CallSignal {
        call_id: p.call_id,
        from: p.from,
        timestamp: p.timestamp,
        nonce: p.nonce,
        ciphertext: p.ciphertext,
        sig: p.sig,
    };
    state
        .registry
        .send_frame(call.caller_id.as_str(), &ServerFrame::CallAnswer(signal))
        .await;
    Ok(())
}

pub(crate) async fn handle_call_ice_candidate(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::CallIceCandidate,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;
    verify_call_sig(
        &sender.sign_public_key,
        &p.sig,
        "call_ice_candidate",
        p.call_id,
        &p.from,
        &p.to,
        p.timestamp,
        p.nonce.as_deref(),
        p.ciphertext.as_deref(),
    )?;

    let call = state.calls.get_for_party(p.call_id, &p.from).await?;
    if call.state != CallState::Connected {
        return Err(WhisperError::Forbidden);
    }
    let peer = call.peer_of(&p.from).clone();
    let signal = CallSignal {
        call_id: p.call_id,
        from: p.from,
        timestamp: p.timestamp,
        nonce: p.nonce,
        ciphertext: p.ciphertext,
        sig: p.sig,
    };
    state
        .registry
        .send_frame(peer.as_str(), &ServerFrame::CallIceCandidate(signal))
        .await;
    Ok(())
}

pub(crate) async fn handle_call_end(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::CallEnd,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;
    verify_call_sig(
        &sender.sign_public_key,
        &p.sig,
        "call_end",
        p.call_id,
        &p.from,
        &p.to,
        p.timestamp,
        None,
        None,
    )?;

    let call = state.calls.end(p.call_id, &p.from, p.reason).await?;
    let peer = call.peer_of(&p.from).clone();
    state
        .registry
        .send_frame(
            peer.as_str(),
            &ServerFrame::CallEnd(CallEnded {
                call_id: p.call_id,
                from: p.from,
                reason: p.reason,
                timestamp: p.timestamp,
            }),
        )
        .await;
    tracing::debug!(call_id = %p.call_id, reason = ?p.reason, "Call ended");
    Ok(())
}

// ============================================================
// TURN credentials (coturn REST style)
// ============================================================

type HmacSha256 = Hmac<Sha256>;

/// Short-lived TURN credentials: `username = "<unixExpiry>:<whisperId>"`,
/// `credential = base64(HMAC-SHA256(sharedSecret, username))`.
pub(crate) fn mint_turn_credentials(whisper_id: &WhisperId) -> WhisperResult<TurnCredentials> {
    let cfg = config::get();
    if cfg.turn.shared_secret.is_empty() || cfg.turn.urls.is_empty() {
        return Err(WhisperError::NotFound { resource: "turn".into() });
    }

    let ttl = cfg.turn.credential_ttl_secs;
    let expiry = Utc::now().timestamp() + ttl as i64;
    let username = format!("{expiry}:{whisper_id}");

    let mut mac = HmacSha256::new_from_slice(cfg.turn.shared_secret.as_bytes())
        .map_err(|e| WhisperError::Internal(anyhow::anyhow!("hmac init: {e}")))?;
    mac.update(username.as_bytes());
    let credential = B64.encode(mac.finalize().into_bytes());

    Ok(TurnCredentials {
        urls: cfg.turn.urls.split(',').map(|s| s.trim().to_owned()).collect(),
        username,
        credential,
        ttl,
    })
}

pub(crate) async fn handle_get_turn_credentials(
    ctx: &ConnCtx,
    sess: &SocketSession,
) -> WhisperResult<()> {
    let creds = mint_turn_credentials(&sess.whisper_id)?;
    ctx.reply(&ServerFrame::TurnCredentials(creds));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wid(seed: u8) -> WhisperId {
        WhisperId::derive(&[seed; 32])
    }

    fn call(id: Uuid, caller: u8, callee: u8) -> Call {
        Call {
            call_id: id,
            caller_id: wid(caller),
            callee_id: wid(callee),
            is_video: false,
            state: CallState::Initiated,
            created_at: Utc::now(),
            connected_at: None,
            end_reason: None,
        }
    }

    fn incoming(id: Uuid, caller: u8) -> CallIncoming {
        CallIncoming {
            call_id: id,
            from: wid(caller),
            is_video: false,
            timestamp: 1,
            nonce: None,
            ciphertext: None,
            sig: "sig".into(),
        }
    }

    #[tokio::test]
    async fn happy_path_initiated_ringing_connected_ended() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();

        let ringing = mgr.mark_ringing(id, &wid(2)).await.unwrap();
        assert_eq!(ringing.state, CallState::Ringing);

        let connected = mgr.mark_connected(id, &wid(2)).await.unwrap();
        assert_eq!(connected.state, CallState::Connected);

        let ended = mgr.end(id, &wid(1), CallEndReason::Ended).await.unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.end_reason, Some(CallEndReason::Ended));

        // State freed.
        assert!(mgr.get_for_party(id, &wid(1)).await.is_err());
    }

    #[tokio::test]
    async fn answer_straight_from_initiated_is_legal() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        assert!(mgr.mark_connected(id, &wid(2)).await.is_ok());
    }

    #[tokio::test]
    async fn only_the_callee_may_ring_or_answer() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        assert!(mgr.mark_ringing(id, &wid(1)).await.is_err());
        assert!(mgr.mark_connected(id, &wid(1)).await.is_err());
    }

    #[tokio::test]
    async fn third_parties_are_forbidden() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        let err = mgr.get_for_party(id, &wid(9)).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
        assert!(mgr.end(id, &wid(9), CallEndReason::Ended).await.is_err());
    }

    #[tokio::test]
    async fn either_party_may_end_from_any_non_terminal_state() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        let ended = mgr.end(id, &wid(2), CallEndReason::Declined).await.unwrap();
        assert_eq!(ended.end_reason, Some(CallEndReason::Declined));
    }

    #[tokio::test]
    async fn duplicate_call_id_conflicts() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        let err = mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[tokio::test]
    async fn timeout_reaps_non_connected_calls_only() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        mgr.mark_connected(id, &wid(2)).await.unwrap();
        assert!(mgr.timeout_if_stale(id).await.is_none());

        let id2 = Uuid::new_v4();
        mgr.begin(call(id2, 1, 2), incoming(id2, 1)).await.unwrap();
        let timed_out = mgr.timeout_if_stale(id2).await.unwrap();
        assert_eq!(timed_out.end_reason, Some(CallEndReason::Timeout));
    }

    #[tokio::test]
    async fn expired_calls_read_as_absent() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        let mut stale = call(id, 1, 2);
        stale.created_at = Utc::now() - chrono::Duration::seconds(181);
        mgr.begin(stale, incoming(id, 1)).await.unwrap();
        let err = mgr.get_for_party(id, &wid(1)).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn pending_incoming_is_replayed_to_the_callee_only() {
        let mgr = CallStateManager::new();
        let id = Uuid::new_v4();
        mgr.begin(call(id, 1, 2), incoming(id, 1)).await.unwrap();
        assert!(mgr.pending_incoming_for(&wid(2)).await.is_some());
        assert!(mgr.pending_incoming_for(&wid(1)).await.is_none());
        mgr.end(id, &wid(1), CallEndReason::Cancelled).await.unwrap();
        assert!(mgr.pending_incoming_for(&wid(2)).await.is_none());
    }
}
