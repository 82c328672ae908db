//! # whisper-gateway
//!
//! Realtime WebSocket gateway for Whisper. Handles:
//! - The challenge/proof registration handshake and session attachment
//! - Typed frame dispatch (messages, groups, calls, receipts, presence)
//! - Heartbeat/keepalive and idle-socket reaping
//! - Single-active-device eviction
//!
//! One dispatcher per socket serializes that socket's frames; fanout to other
//! sockets is concurrent. The codec and the signature verifier are pure —
//! the stores are the only synchronization boundary.

pub mod auth;
pub mod calls;
pub mod groups;
pub mod pending;
pub mod rate_limit;
pub mod registry;
pub mod router;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use whisper_common::error::{WhisperError, WhisperResult};
use whisper_common::frames::{
    decode_client_frame, encode_server_frame, ClientFrame, ServerFrame,
};
use whisper_common::models::IdentityStatus;
use whisper_common::WhisperId;
use whisper_db::repository::identities::{self, IdentityRow};
use whisper_db::Database;
use whisper_push::PushCoordinator;

use auth::ChallengeStore;
use calls::CallStateManager;
use rate_limit::RateLimiter;
use registry::{ConnectionRegistry, Outbound};

/// Idle sockets are closed after this much silence.
const HEARTBEAT_IDLE: Duration = Duration::from_secs(90);
/// More than this many INVALID_PAYLOAD strikes inside [`STRIKE_WINDOW`]
/// closes the socket.
const MAX_INVALID_STRIKES: usize = 10;
const STRIKE_WINDOW: Duration = Duration::from_secs(60);

/// Gateway state — one long-lived instance owned by the server binary.
#[derive(Clone)]
pub struct GatewayState {
    pub db: Database,
    pub registry: ConnectionRegistry,
    pub calls: CallStateManager,
    pub challenges: ChallengeStore,
    pub push: PushCoordinator,
    pub limiter: RateLimiter,
}

impl GatewayState {
    pub fn new(db: Database, push: PushCoordinator, limiter: RateLimiter) -> Self {
        Self {
            db,
            registry: ConnectionRegistry::new(),
            calls: CallStateManager::new(),
            challenges: ChallengeStore::new(),
            push,
            limiter,
        }
    }
}

/// The identity a socket authenticated as.
#[derive(Debug, Clone)]
pub struct SocketSession {
    pub whisper_id: WhisperId,
    pub device_id: String,
    pub conn_id: Uuid,
}

/// Per-frame handler context: the socket's outbound channel plus the
/// requestId to echo on direct replies.
pub(crate) struct ConnCtx {
    pub out: mpsc::UnboundedSender<Outbound>,
    pub conn_id: Uuid,
    pub request_id: Option<String>,
}

impl ConnCtx {
    /// Direct reply on this socket, echoing the client's requestId.
    pub fn reply(&self, frame: &ServerFrame) {
        let _ = self
            .out
            .send(Outbound::Text(encode_server_frame(frame, self.request_id.as_deref())));
    }

    /// Unsolicited frame on this socket (no requestId).
    pub fn send(&self, frame: &ServerFrame) {
        let _ = self.out.send(Outbound::Text(encode_server_frame(frame, None)));
    }

    pub fn close(&self) {
        let _ = self.out.send(Outbound::Close);
    }
}

/// Load the socket's own identity; it must exist and be active.
pub(crate) async fn load_active_identity(
    db: &Database,
    whisper_id: &WhisperId,
) -> WhisperResult<IdentityRow> {
    let identity = identities::find_by_id(&db.pg, whisper_id.as_str())
        .await?
        .ok_or(WhisperError::NotRegistered)?;
    match IdentityStatus::from_str(&identity.status) {
        Some(IdentityStatus::Active) => Ok(identity),
        Some(IdentityStatus::Banned) => Err(WhisperError::Forbidden),
        _ => Err(WhisperError::NotRegistered),
    }
}

/// Load a routing target; unknown/deleted reads as NOT_FOUND, banned as
/// FORBIDDEN.
pub(crate) async fn load_recipient(
    db: &Database,
    whisper_id: &WhisperId,
) -> WhisperResult<IdentityRow> {
    let identity = identities::find_by_id(&db.pg, whisper_id.as_str())
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "identity".into() })?;
    match IdentityStatus::from_str(&identity.status) {
        Some(IdentityStatus::Active) => Ok(identity),
        Some(IdentityStatus::Banned) => Err(WhisperError::Forbidden),
        _ => Err(WhisperError::NotFound { resource: "identity".into() }),
    }
}

/// Sliding 60-second strike counter for malformed frames.
struct InvalidStrikes {
    events: Vec<Instant>,
}

impl InvalidStrikes {
    fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a strike; true means the socket has earned a close.
    fn strike(&mut self, now: Instant) -> bool {
        self.events.retain(|t| now.duration_since(*t) < STRIKE_WINDOW);
        self.events.push(now);
        self.events.len() > MAX_INVALID_STRIKES
    }
}

/// Build the gateway WebSocket router.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

/// Handle a single WebSocket connection.
async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = Uuid::new_v4();

    // Write task: the socket's single writer.
    let write_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut session: Option<SocketSession> = None;
    let mut strikes = InvalidStrikes::new();
    let mut deadline = tokio::time::Instant::now() + HEARTBEAT_IDLE;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        deadline = tokio::time::Instant::now() + HEARTBEAT_IDLE;
                        let keep_open = handle_frame(
                            &state, &out_tx, conn_id, addr, &mut session, &mut strikes, text.as_str(),
                        )
                        .await;
                        if !keep_open {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        deadline = tokio::time::Instant::now() + HEARTBEAT_IDLE;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames are not part of the protocol
                    Some(Err(_)) => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(conn_id = %conn_id, "Closing silent socket");
                let _ = out_tx.send(Outbound::Close);
                break;
            }
        }
    }

    // Cleanup — drop the registry entry unless a successor socket owns it now.
    if let Some(sess) = &session {
        state.registry.remove_if(sess.whisper_id.as_str(), sess.conn_id).await;
        tracing::info!(whisper_id = %sess.whisper_id, conn_id = %conn_id, "Client disconnected");
    } else {
        tracing::debug!(conn_id = %conn_id, "Unauthenticated socket closed");
    }
    write_task.abort();
}

/// Decode, rate-check, and dispatch one frame. Returns false to close.
async fn handle_frame(
    state: &Arc<GatewayState>,
    out: &mpsc::UnboundedSender<Outbound>,
    conn_id: Uuid,
    addr: SocketAddr,
    session: &mut Option<SocketSession>,
    strikes: &mut InvalidStrikes,
    text: &str,
) -> bool {
    let decoded = match decode_client_frame(text) {
        Ok(decoded) => decoded,
        Err(err) => {
            let ctx = ConnCtx { out: out.clone(), conn_id, request_id: None };
            ctx.reply(&ServerFrame::error(&err));
            if strikes.strike(Instant::now()) {
                tracing::warn!(conn_id = %conn_id, "Too many malformed frames — closing socket");
                ctx.close();
                return false;
            }
            return true;
        }
    };

    let ctx = ConnCtx { out: out.clone(), conn_id, request_id: decoded.request_id.clone() };

    // Pre-auth frames are limited by socket address, the rest per identity.
    let rate_key = match session.as_ref() {
        Some(sess) => sess.whisper_id.to_string(),
        None => addr.ip().to_string(),
    };
    if !state.limiter.check(&rate_key, decoded.frame_type).await {
        ctx.reply(&ServerFrame::error(&WhisperError::RateLimited));
        return true;
    }

    let frame_type = decoded.frame_type;
    if let Err(err) = dispatch(state, &ctx, session, decoded.frame).await {
        tracing::debug!(
            conn_id = %conn_id,
            frame_type,
            code = err.error_code(),
            "Frame rejected"
        );
        ctx.reply(&ServerFrame::error(&err));
    }
    true
}

async fn dispatch(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    session: &mut Option<SocketSession>,
    frame: ClientFrame,
) -> WhisperResult<()> {
    use ClientFrame::*;

    match frame {
        // Frames legal on an unauthenticated socket.
        RegisterBegin(p) => auth::handle_register_begin(state, ctx, p).await,
        RegisterProof(p) => auth::handle_register_proof(state, ctx, session, p).await,
        SessionRefresh(p) => auth::handle_session_refresh(state, ctx, session, p).await,
        Logout(p) => auth::handle_logout(state, ctx, session, p).await,
        Ping(p) => {
            router::handle_ping(ctx, p);
            Ok(())
        }

        // Everything else needs a bound identity.
        authed => {
            let sess = session.as_ref().ok_or(WhisperError::NotRegistered)?.clone();
            match authed {
                SendMessage(p) => router::handle_send_message(state, ctx, &sess, p).await,
                DeliveryReceipt(p) => router::handle_delivery_receipt(state, &sess, p).await,
                FetchPending(p) => pending::handle_fetch_pending(state, ctx, &sess, p).await,
                DeleteMessage(p) => router::handle_delete_message(state, ctx, &sess, p).await,
                GroupCreate(p) => groups::handle_group_create(state, ctx, &sess, p).await,
                GroupUpdate(p) => groups::handle_group_update(state, ctx, &sess, p).await,
                GroupSendMessage(p) => {
                    groups::handle_group_send_message(state, ctx, &sess, p).await
                }
                GetTurnCredentials(_) => calls::handle_get_turn_credentials(ctx, &sess).await,
                CallInitiate(p) => calls::handle_call_initiate(state, &sess, p).await,
                CallRinging(p) => calls::handle_call_ringing(state, &sess, p).await,
                CallAnswer(p) => calls::handle_call_answer(state, &sess, p).await,
                CallIceCandidate(p) => calls::handle_call_ice_candidate(state, &sess, p).await,
                CallEnd(p) => calls::handle_call_end(state, &sess, p).await,
                UpdateTokens(p) => router::handle_update_tokens(state, &sess, p).await,
                PresenceUpdate(p) => router::handle_presence_update(state, &sess, p).await,
                Typing(p) => router::handle_typing(state, &sess, p).await,
                DeleteAccount(p) => router::handle_delete_account(state, ctx, &sess, p).await,
                RegisterBegin(_) | RegisterProof(_) | SessionRefresh(_) | Logout(_)
                | Ping(_) => unreachable!("handled above"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_counter_closes_after_ten_in_window() {
        let mut strikes = InvalidStrikes::new();
        let now = Instant::now();
        for _ in 0..MAX_INVALID_STRIKES {
            assert!(!strikes.strike(now));
        }
        assert!(strikes.strike(now), "11th strike closes");
    }

    #[test]
    fn old_strikes_age_out() {
        let mut strikes = InvalidStrikes::new();
        let old = Instant::now();
        for _ in 0..MAX_INVALID_STRIKES {
            strikes.strike(old);
        }
        let later = old + STRIKE_WINDOW + Duration::from_secs(1);
        assert!(!strikes.strike(later), "window reset");
    }
}
