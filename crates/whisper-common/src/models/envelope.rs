//! Envelope — the server-observable header of an encrypted message.
//!
//! `ciphertext` is opaque to every server component. This struct is both the
//! shape persisted into a recipient's pending queue and the payload of the
//! `message_received` frame, so a queued copy replays byte-identically.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::whisper_id::WhisperId;

/// Reference to an encrypted attachment riding inside an envelope.
///
/// `fileKeyBox` is E2E content (the per-file key, boxed to the recipient);
/// the server relays it untouched and only ever acts on `objectKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttachmentRef {
    pub object_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key_box: Option<String>,
}

/// A routed message envelope (1:1 or one group sub-envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub from: WhisperId,
    /// Set for 1:1 messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<WhisperId>,
    /// Set for group messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    pub msg_type: String,
    /// Sender-chosen timestamp, unix milliseconds. Orders (sender, recipient)
    /// delivery; `message_id` breaks ties.
    pub timestamp: i64,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    /// Included on forward iff the recipient has no contact hint for the
    /// sender yet, so a first contact can be decrypted without a key lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_enc_public_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whisper_id::WhisperId;

    #[test]
    fn pending_copy_replays_byte_identical() {
        let env = Envelope {
            message_id: Uuid::nil(),
            from: WhisperId::derive(&[1u8; 32]),
            to: Some(WhisperId::derive(&[2u8; 32])),
            group_id: None,
            msg_type: "text".into(),
            timestamp: 1_700_000_000_000,
            nonce: "bm9uY2U".into(),
            ciphertext: "Y2lwaGVydGV4dA==".into(),
            sig: "c2ln".into(),
            reply_to: None,
            attachment: None,
            sender_enc_public_key: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        let back: Envelope = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
        // Server-only fields never appear.
        assert!(json.get("sessionToken").is_none());
    }
}
