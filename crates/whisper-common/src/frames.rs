//! The wire frame catalog — every WebSocket frame in and out of the broker.
//!
//! All frames are UTF-8 JSON objects of shape `{type, requestId?, payload}`.
//! This module is the only place client bytes are JSON-parsed: the outer shape
//! is decoded once, then the `type` dispatches to a strict per-variant payload
//! struct (`deny_unknown_fields`, exact base64 lengths, UUID and `WSP-`
//! patterns). Everything behind the codec works with typed structs.
//!
//! Server frames serialize through [`encode_server_frame`], which echoes the
//! client's `requestId` when one was supplied. Envelopes forwarded to
//! recipients are typed such that session tokens and server-only fields cannot
//! structurally appear.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{invalid_payload, WhisperError, WhisperResult};
use crate::models::envelope::{AttachmentRef, Envelope};
use crate::models::call::CallEndReason;
use crate::models::group::GroupRole;
use crate::validation;
use crate::whisper_id::WhisperId;

/// Outer shape of every frame.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

// ============================================================
// Client → server payloads
// ============================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterBegin {
    pub device_id: String,
    pub platform: String,
    /// Present on recovery attempts only.
    pub whisper_id: Option<WhisperId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterProof {
    pub challenge_id: Uuid,
    pub device_id: String,
    pub platform: String,
    pub enc_public_key: String,
    pub sign_public_key: String,
    /// Ed25519 over SHA-256(challengeBytes), base64.
    pub signature: String,
    pub push_token: Option<String>,
    pub voip_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionRefresh {
    pub session_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Logout {
    pub session_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessage {
    pub message_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub msg_type: String,
    pub timestamp: i64,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
    pub reply_to: Option<Uuid>,
    pub attachment: Option<AttachmentRef>,
}

/// Receipt status — `delivered` drains the pending entry, `read` implies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeliveryReceipt {
    /// The message being acknowledged.
    pub message_id: Uuid,
    pub from: WhisperId,
    /// The original sender the receipt is forwarded to.
    pub to: WhisperId,
    pub status: ReceiptStatus,
    pub timestamp: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FetchPending {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteMessage {
    pub message_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub delete_for_everyone: bool,
    pub timestamp: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupCreate {
    pub title: String,
    pub member_ids: Vec<WhisperId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoleChange {
    pub whisper_id: WhisperId,
    /// Only admin/member are assignable; ownership never moves.
    pub role: GroupRole,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupUpdate {
    pub group_id: Uuid,
    pub title: Option<String>,
    pub add_members: Option<Vec<WhisperId>>,
    pub remove_members: Option<Vec<WhisperId>>,
    pub role_changes: Option<Vec<RoleChange>>,
}

/// One per-recipient sub-envelope of a pairwise group fanout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupSubEnvelope {
    pub to: WhisperId,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupSendMessage {
    pub group_id: Uuid,
    pub message_id: Uuid,
    pub from: WhisperId,
    pub msg_type: String,
    pub timestamp: i64,
    pub recipients: Vec<GroupSubEnvelope>,
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetTurnCredentials {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallInitiate {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub is_video: bool,
    pub timestamp: i64,
    /// Encrypted SDP offer; opaque.
    pub nonce: Option<String>,
    pub ciphertext: Option<String>,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallRinging {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub timestamp: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallAnswer {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub timestamp: i64,
    /// Encrypted SDP answer; opaque.
    pub nonce: Option<String>,
    pub ciphertext: Option<String>,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallIceCandidate {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub timestamp: i64,
    /// Encrypted ICE candidate; opaque.
    pub nonce: Option<String>,
    pub ciphertext: Option<String>,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallEnd {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub to: WhisperId,
    pub reason: CallEndReason,
    pub timestamp: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateTokens {
    pub push_token: Option<String>,
    pub voip_token: Option<String>,
}

/// Presence states a client may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Dnd,
    Offline,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PresenceUpdate {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Typing {
    pub to: WhisperId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Ping {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteAccount {
    pub op_id: Uuid,
    pub from: WhisperId,
    pub timestamp: i64,
    pub sig: String,
}

// ============================================================
// Client frame dispatch
// ============================================================

/// Every frame a client may send, fully validated.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    RegisterBegin(RegisterBegin),
    RegisterProof(RegisterProof),
    SessionRefresh(SessionRefresh),
    Logout(Logout),
    SendMessage(SendMessage),
    DeliveryReceipt(DeliveryReceipt),
    FetchPending(FetchPending),
    DeleteMessage(DeleteMessage),
    GroupCreate(GroupCreate),
    GroupUpdate(GroupUpdate),
    GroupSendMessage(GroupSendMessage),
    GetTurnCredentials(GetTurnCredentials),
    CallInitiate(CallInitiate),
    CallRinging(CallRinging),
    CallAnswer(CallAnswer),
    CallIceCandidate(CallIceCandidate),
    CallEnd(CallEnd),
    UpdateTokens(UpdateTokens),
    PresenceUpdate(PresenceUpdate),
    Typing(Typing),
    Ping(Ping),
    DeleteAccount(DeleteAccount),
}

/// A decoded client frame plus its envelope metadata.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame: ClientFrame,
    /// Echoed back on responses when present.
    pub request_id: Option<String>,
    /// Stable frame-type string, also the rate-limit key.
    pub frame_type: &'static str,
}

const MAX_FRAME_BYTES: usize = 512 * 1024;
const MAX_TOKEN_LEN: usize = 512;
const MAX_DEVICE_ID_LEN: usize = 128;
const MAX_PLATFORM_LEN: usize = 32;
const MAX_MSG_TYPE_LEN: usize = 32;
const MAX_TITLE_LEN: usize = 128;
/// `fetch_pending` page-size ceiling; the default page is 200.
pub const MAX_PENDING_PAGE: u32 = 500;

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> WhisperResult<T> {
    let payload = if payload.is_null() { Value::Object(Default::default()) } else { payload };
    serde_json::from_value(payload).map_err(|e| invalid_payload(format!("payload: {e}")))
}

fn check_attachment(att: &Option<AttachmentRef>) -> WhisperResult<()> {
    if let Some(att) = att {
        validation::check_object_key(&att.object_key)?;
    }
    Ok(())
}

fn check_timestamp(ts: i64) -> WhisperResult<()> {
    if ts <= 0 {
        return Err(invalid_payload("timestamp must be positive"));
    }
    Ok(())
}

/// Decode and validate one client frame.
///
/// Structural failures of any kind map to `INVALID_PAYLOAD`; the caller never
/// sees a parse error detail beyond a bounded message.
pub fn decode_client_frame(text: &str) -> WhisperResult<DecodedFrame> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(invalid_payload("frame exceeds size limit"));
    }
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| invalid_payload(format!("frame: {e}")))?;
    if let Some(rid) = &raw.request_id {
        if rid.len() > 64 {
            return Err(invalid_payload("requestId too long"));
        }
    }

    let (frame, frame_type): (ClientFrame, &'static str) = match raw.frame_type.as_str() {
        "register_begin" => {
            let p: RegisterBegin = parse_payload(raw.payload)?;
            validation::check_text(&p.device_id, MAX_DEVICE_ID_LEN, "deviceId")?;
            validation::check_text(&p.platform, MAX_PLATFORM_LEN, "platform")?;
            (ClientFrame::RegisterBegin(p), "register_begin")
        }
        "register_proof" => {
            let p: RegisterProof = parse_payload(raw.payload)?;
            validation::check_text(&p.device_id, MAX_DEVICE_ID_LEN, "deviceId")?;
            validation::check_text(&p.platform, MAX_PLATFORM_LEN, "platform")?;
            validation::check_public_key(&p.enc_public_key, "encPublicKey")?;
            validation::check_public_key(&p.sign_public_key, "signPublicKey")?;
            validation::check_signature(&p.signature, "signature")?;
            for tok in [&p.push_token, &p.voip_token].into_iter().flatten() {
                validation::check_text(tok, MAX_TOKEN_LEN, "token")?;
            }
            (ClientFrame::RegisterProof(p), "register_proof")
        }
        "session_refresh" => {
            let p: SessionRefresh = parse_payload(raw.payload)?;
            validation::check_text(&p.session_token, MAX_TOKEN_LEN, "sessionToken")?;
            (ClientFrame::SessionRefresh(p), "session_refresh")
        }
        "logout" => {
            let p: Logout = parse_payload(raw.payload)?;
            validation::check_text(&p.session_token, MAX_TOKEN_LEN, "sessionToken")?;
            (ClientFrame::Logout(p), "logout")
        }
        "send_message" => {
            let p: SendMessage = parse_payload(raw.payload)?;
            validation::check_text(&p.msg_type, MAX_MSG_TYPE_LEN, "msgType")?;
            check_timestamp(p.timestamp)?;
            validation::check_nonce(&p.nonce)?;
            validation::check_ciphertext(&p.ciphertext)?;
            validation::check_signature(&p.sig, "sig")?;
            check_attachment(&p.attachment)?;
            (ClientFrame::SendMessage(p), "send_message")
        }
        "delivery_receipt" => {
            let p: DeliveryReceipt = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::DeliveryReceipt(p), "delivery_receipt")
        }
        "fetch_pending" => {
            let p: FetchPending = parse_payload(raw.payload)?;
            if let Some(limit) = p.limit {
                if limit == 0 || limit > MAX_PENDING_PAGE {
                    return Err(invalid_payload("limit out of range"));
                }
            }
            if let Some(cursor) = &p.cursor {
                validation::check_text(cursor, 128, "cursor")?;
            }
            (ClientFrame::FetchPending(p), "fetch_pending")
        }
        "delete_message" => {
            let p: DeleteMessage = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::DeleteMessage(p), "delete_message")
        }
        "group_create" => {
            let p: GroupCreate = parse_payload(raw.payload)?;
            validation::check_text(&p.title, MAX_TITLE_LEN, "title")?;
            let mut seen = std::collections::HashSet::new();
            for id in &p.member_ids {
                if !seen.insert(id.as_str()) {
                    return Err(invalid_payload("memberIds contains duplicates"));
                }
            }
            (ClientFrame::GroupCreate(p), "group_create")
        }
        "group_update" => {
            let p: GroupUpdate = parse_payload(raw.payload)?;
            if let Some(title) = &p.title {
                validation::check_text(title, MAX_TITLE_LEN, "title")?;
            }
            if p.title.is_none()
                && p.add_members.is_none()
                && p.remove_members.is_none()
                && p.role_changes.is_none()
            {
                return Err(invalid_payload("group_update carries no change"));
            }
            if p.role_changes
                .as_deref()
                .is_some_and(|rc| rc.iter().any(|c| c.role == GroupRole::Owner))
            {
                return Err(invalid_payload("ownership is not assignable"));
            }
            (ClientFrame::GroupUpdate(p), "group_update")
        }
        "group_send_message" => {
            let p: GroupSendMessage = parse_payload(raw.payload)?;
            validation::check_text(&p.msg_type, MAX_MSG_TYPE_LEN, "msgType")?;
            check_timestamp(p.timestamp)?;
            if p.recipients.is_empty() {
                return Err(invalid_payload("recipients must not be empty"));
            }
            let mut seen = std::collections::HashSet::new();
            for sub in &p.recipients {
                if !seen.insert(sub.to.as_str()) {
                    return Err(invalid_payload("duplicate recipient"));
                }
                validation::check_nonce(&sub.nonce)?;
                validation::check_ciphertext(&sub.ciphertext)?;
                validation::check_signature(&sub.sig, "sig")?;
            }
            check_attachment(&p.attachment)?;
            (ClientFrame::GroupSendMessage(p), "group_send_message")
        }
        "get_turn_credentials" => {
            let p: GetTurnCredentials = parse_payload(raw.payload)?;
            (ClientFrame::GetTurnCredentials(p), "get_turn_credentials")
        }
        "call_initiate" => {
            let p: CallInitiate = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            if let Some(nonce) = &p.nonce {
                validation::check_nonce(nonce)?;
            }
            if let Some(ct) = &p.ciphertext {
                validation::check_ciphertext(ct)?;
            }
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::CallInitiate(p), "call_initiate")
        }
        "call_ringing" => {
            let p: CallRinging = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::CallRinging(p), "call_ringing")
        }
        "call_answer" => {
            let p: CallAnswer = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            if let Some(nonce) = &p.nonce {
                validation::check_nonce(nonce)?;
            }
            if let Some(ct) = &p.ciphertext {
                validation::check_ciphertext(ct)?;
            }
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::CallAnswer(p), "call_answer")
        }
        "call_ice_candidate" => {
            let p: CallIceCandidate = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            if let Some(nonce) = &p.nonce {
                validation::check_nonce(nonce)?;
            }
            if let Some(ct) = &p.ciphertext {
                validation::check_ciphertext(ct)?;
            }
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::CallIceCandidate(p), "call_ice_candidate")
        }
        "call_end" => {
            let p: CallEnd = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::CallEnd(p), "call_end")
        }
        "update_tokens" => {
            let p: UpdateTokens = parse_payload(raw.payload)?;
            if p.push_token.is_none() && p.voip_token.is_none() {
                return Err(invalid_payload("update_tokens carries no token"));
            }
            for tok in [&p.push_token, &p.voip_token].into_iter().flatten() {
                validation::check_text(tok, MAX_TOKEN_LEN, "token")?;
            }
            (ClientFrame::UpdateTokens(p), "update_tokens")
        }
        "presence_update" => {
            let p: PresenceUpdate = parse_payload(raw.payload)?;
            (ClientFrame::PresenceUpdate(p), "presence_update")
        }
        "typing" => {
            let p: Typing = parse_payload(raw.payload)?;
            (ClientFrame::Typing(p), "typing")
        }
        "ping" => {
            let p: Ping = parse_payload(raw.payload)?;
            (ClientFrame::Ping(p), "ping")
        }
        "delete_account" => {
            let p: DeleteAccount = parse_payload(raw.payload)?;
            check_timestamp(p.timestamp)?;
            validation::check_signature(&p.sig, "sig")?;
            (ClientFrame::DeleteAccount(p), "delete_account")
        }
        other => {
            return Err(invalid_payload(format!("unknown frame type '{other}'")));
        }
    };

    Ok(DecodedFrame { frame, request_id: raw.request_id, frame_type })
}

// ============================================================
// Server → client frames
// ============================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterChallenge {
    pub challenge_id: Uuid,
    /// 32 random bytes, base64.
    pub challenge: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    pub whisper_id: WhisperId,
    pub session_token: String,
    pub session_expires_at: i64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefreshAck {
    pub session_expires_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAccepted {
    pub message_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivered {
    pub message_id: Uuid,
    pub from: WhisperId,
    pub status: ReceiptStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessages {
    pub messages: Vec<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: Uuid,
    pub from: WhisperId,
}

/// Snapshot of a group carried in `group_event` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub group_id: Uuid,
    pub title: String,
    pub members: Vec<GroupMemberSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberSnapshot {
    pub whisper_id: WhisperId,
    pub role: GroupRole,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEvent {
    /// `created` | `updated`
    pub event: &'static str,
    pub group: GroupSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<WhisperId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<WhisperId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIncoming {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub is_video: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    pub sig: String,
}

/// Forwarded call signaling — same shape caller→callee and callee→caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: Uuid,
    pub from: WhisperId,
    pub reason: CallEndReason,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotification {
    pub from: WhisperId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub timestamp: i64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Every frame the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    RegisterChallenge(RegisterChallenge),
    RegisterAck(RegisterAck),
    SessionRefreshAck(SessionRefreshAck),
    MessageAccepted(MessageAccepted),
    MessageReceived(Envelope),
    MessageDelivered(MessageDelivered),
    PendingMessages(PendingMessages),
    MessageDeleted(MessageDeleted),
    GroupEvent(GroupEvent),
    TurnCredentials(TurnCredentials),
    CallIncoming(CallIncoming),
    CallRinging(CallSignal),
    CallAnswer(CallSignal),
    CallIceCandidate(CallSignal),
    CallEnd(CallEnded),
    TypingNotification(TypingNotification),
    Pong(Pong),
    Error(ErrorBody),
}

impl ServerFrame {
    /// Build the uniform error frame for a handler failure.
    pub fn error(err: &WhisperError) -> Self {
        Self::Error(ErrorBody { code: err.error_code(), message: err.client_message() })
    }
}

/// Serialize a server frame, echoing `requestId` when the client supplied one.
pub fn encode_server_frame(frame: &ServerFrame, request_id: Option<&str>) -> String {
    let mut value = serde_json::to_value(frame).expect("server frames serialize infallibly");
    if let (Some(rid), Some(obj)) = (request_id, value.as_object_mut()) {
        obj.insert("requestId".into(), Value::String(rid.to_owned()));
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

    fn b64(bytes: &[u8]) -> String {
        B64.encode(bytes)
    }

    fn wid(seed: u8) -> WhisperId {
        WhisperId::derive(&[seed; 32])
    }

    fn send_message_json() -> serde_json::Value {
        serde_json::json!({
            "type": "send_message",
            "requestId": "r1",
            "payload": {
                "messageId": "11111111-2222-3333-4444-555555555555",
                "from": wid(1).as_str(),
                "to": wid(2).as_str(),
                "msgType": "text",
                "timestamp": 1_700_000_000_000i64,
                "nonce": b64(&[0u8; 24]),
                "ciphertext": b64(b"opaque"),
                "sig": b64(&[0u8; 64]),
            }
        })
    }

    #[test]
    fn decodes_send_message() {
        let decoded = decode_client_frame(&send_message_json().to_string()).unwrap();
        assert_eq!(decoded.frame_type, "send_message");
        assert_eq!(decoded.request_id.as_deref(), Some("r1"));
        match decoded.frame {
            ClientFrame::SendMessage(p) => assert_eq!(p.msg_type, "text"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_invalid_payload() {
        let err = decode_client_frame(r#"{"type":"warp_drive","payload":{}}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn extra_fields_are_rejected() {
        let mut frame = send_message_json();
        frame["payload"]["sneaky"] = serde_json::json!(true);
        assert!(decode_client_frame(&frame.to_string()).is_err());
        // Top level too.
        let mut frame = send_message_json();
        frame["sessionToken"] = serde_json::json!("tok");
        assert!(decode_client_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let mut frame = send_message_json();
        frame["payload"]["to"] = serde_json::json!("WSP-not-a-real-id!");
        assert!(decode_client_frame(&frame.to_string()).is_err());

        let mut frame = send_message_json();
        frame["payload"]["nonce"] = serde_json::json!(b64(&[0u8; 12]));
        assert!(decode_client_frame(&frame.to_string()).is_err());

        let mut frame = send_message_json();
        frame["payload"]["messageId"] = serde_json::json!("not-a-uuid");
        assert!(decode_client_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn group_send_rejects_duplicate_recipients() {
        let sub = serde_json::json!({
            "to": wid(3).as_str(),
            "nonce": b64(&[0u8; 24]),
            "ciphertext": b64(b"ct"),
            "sig": b64(&[0u8; 64]),
        });
        let frame = serde_json::json!({
            "type": "group_send_message",
            "payload": {
                "groupId": "11111111-2222-3333-4444-555555555555",
                "messageId": "11111111-2222-3333-4444-555555555556",
                "from": wid(1).as_str(),
                "msgType": "text",
                "timestamp": 5,
                "recipients": [sub.clone(), sub],
            }
        });
        assert!(decode_client_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn group_update_must_change_something() {
        let frame = serde_json::json!({
            "type": "group_update",
            "payload": { "groupId": "11111111-2222-3333-4444-555555555555" }
        });
        assert!(decode_client_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn ownership_is_not_assignable() {
        let frame = serde_json::json!({
            "type": "group_update",
            "payload": {
                "groupId": "11111111-2222-3333-4444-555555555555",
                "roleChanges": [{"whisperId": wid(4).as_str(), "role": "owner"}],
            }
        });
        assert!(decode_client_frame(&frame.to_string()).is_err());
    }

    #[test]
    fn ping_round_trip_and_request_id_echo() {
        let decoded =
            decode_client_frame(r#"{"type":"ping","requestId":"abc","payload":{"timestamp":7}}"#)
                .unwrap();
        assert_eq!(decoded.frame_type, "ping");
        let pong = ServerFrame::Pong(Pong { timestamp: 7, server_time: 8 });
        let encoded = encode_server_frame(&pong, decoded.request_id.as_deref());
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["requestId"], "abc");
        assert_eq!(value["payload"]["timestamp"], 7);
    }

    #[test]
    fn error_frames_carry_stable_codes() {
        let frame = ServerFrame::error(&WhisperError::RateLimited);
        let value: serde_json::Value =
            serde_json::from_str(&encode_server_frame(&frame, None)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "RATE_LIMITED");
    }

    #[test]
    fn fetch_pending_limit_bounds() {
        let ok = r#"{"type":"fetch_pending","payload":{"limit":200}}"#;
        assert!(decode_client_frame(ok).is_ok());
        let too_big = r#"{"type":"fetch_pending","payload":{"limit":501}}"#;
        assert!(decode_client_frame(too_big).is_err());
        let zero = r#"{"type":"fetch_pending","payload":{"limit":0}}"#;
        assert!(decode_client_frame(zero).is_err());
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        assert!(decode_client_frame(r#"{"type":"get_turn_credentials"}"#).is_ok());
        // But frames with required fields still fail without a payload.
        assert!(decode_client_frame(r#"{"type":"send_message"}"#).is_err());
    }
}
