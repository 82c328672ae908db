//! Call model — per-call signaling state.
//!
//! Call state lives in gateway memory only; nothing about a call is durable.
//! SDP and ICE payloads are ciphertext to the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::whisper_id::WhisperId;

/// Signaling state machine: initiated → ringing → connected → ended.
/// Any non-terminal state may also jump straight to `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Initiated,
    Ringing,
    Connected,
    Ended,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallEndReason {
    Ended,
    Declined,
    Busy,
    Timeout,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_id: Uuid,
    pub caller_id: WhisperId,
    pub callee_id: WhisperId,
    pub is_video: bool,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<CallEndReason>,
}

impl Call {
    /// TTL: 180 s from creation unless connected, then 4 h from answer.
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self.connected_at {
            Some(t) => t + chrono::Duration::hours(4),
            None => self.created_at + chrono::Duration::seconds(180),
        }
    }

    pub fn is_party(&self, id: &WhisperId) -> bool {
        &self.caller_id == id || &self.callee_id == id
    }

    /// The counterpart of `id` on this call.
    pub fn peer_of(&self, id: &WhisperId) -> &WhisperId {
        if &self.caller_id == id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}
