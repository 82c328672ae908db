//! The frozen wake payload and its content-leak guard.
//!
//! Pushes exist solely to prompt an offline client to pull `fetch_pending`.
//! The payload shape is frozen at `{type, reason, whisperId, hint?}` and a
//! validator independently rejects anything carrying a content-bearing field,
//! so even a future refactor of the coordinator cannot leak headers through a
//! provider.

use serde::Serialize;
use serde_json::Value;

use whisper_common::WhisperId;

/// Field names that must never appear anywhere in a push payload.
pub const FORBIDDEN_FIELDS: &[&str] = &[
    "ciphertext",
    "nonce",
    "messageId",
    "senderId",
    "groupId",
    "objectKey",
    "attachment",
    "content",
    "plaintext",
];

/// Why the recipient is being woken. Also the suppress-key dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeReason {
    Message,
    Call,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Call => "call",
        }
    }
}

/// The only payload shape the coordinator ever dispatches.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakePush {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub reason: WakeReason,
    pub whisper_id: WhisperId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl WakePush {
    pub fn new(reason: WakeReason, whisper_id: WhisperId) -> Self {
        Self { kind: "wake", reason, whisper_id, hint: None }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("push payload carries forbidden field '{0}'")]
pub struct ForbiddenField(pub String);

/// Reject any payload carrying a forbidden field name, at any nesting depth.
pub fn validate_payload(payload: &Value) -> Result<(), ForbiddenField> {
    match payload {
        Value::Object(map) => {
            for (key, value) in map {
                if FORBIDDEN_FIELDS.contains(&key.as_str()) {
                    return Err(ForbiddenField(key.clone()));
                }
                validate_payload(value)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_payload(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wid() -> WhisperId {
        WhisperId::derive(&[5u8; 32])
    }

    #[test]
    fn frozen_payload_passes() {
        let push = WakePush::new(WakeReason::Message, wid());
        let value = serde_json::to_value(&push).unwrap();
        validate_payload(&value).expect("frozen payload must validate");
        assert_eq!(value["type"], "wake");
        assert_eq!(value["reason"], "message");
        assert_eq!(value["whisperId"], wid().as_str());
        assert!(value.get("hint").is_none());
        // Exactly the frozen fields, nothing else.
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn every_forbidden_field_is_caught() {
        for field in FORBIDDEN_FIELDS {
            let mut value = serde_json::to_value(WakePush::new(WakeReason::Call, wid())).unwrap();
            value[*field] = serde_json::json!("leak");
            assert!(validate_payload(&value).is_err(), "{field} should be rejected");
        }
    }

    #[test]
    fn nested_leaks_are_caught() {
        let value = serde_json::json!({
            "type": "wake",
            "extra": { "deep": [ { "messageId": "m1" } ] },
        });
        assert!(validate_payload(&value).is_err());
    }
}
