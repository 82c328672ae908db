//! # whisper-push
//!
//! Wake-push coordination. The broker never pushes content: a push is a
//! contentless nudge telling an offline device to connect and pull. This
//! crate owns the trigger rules (queue-empty edge, suppress windows), the
//! frozen payload, and the provider sinks.

pub mod payload;
pub mod provider;
pub mod suppress;

use std::time::Duration;

use whisper_common::config::PushConfig;
use whisper_common::WhisperId;
use whisper_db::repository::identities;
use whisper_db::Database;

use payload::{validate_payload, WakePush, WakeReason};
use provider::{Channel, SendOutcome, WakeSender};
use suppress::SuppressStore;

#[derive(Clone)]
pub struct PushCoordinator {
    db: Database,
    sender: WakeSender,
    suppress: SuppressStore,
}

impl PushCoordinator {
    pub fn new(db: Database, cfg: &PushConfig) -> Self {
        Self {
            db,
            sender: WakeSender::new(
                cfg.apns_url.clone(),
                cfg.apns_voip_url.clone(),
                cfg.fcm_url.clone(),
            ),
            suppress: SuppressStore::new(Duration::from_secs(cfg.suppress_window_secs)),
        }
    }

    /// A message was enqueued for an offline recipient. Fires iff this
    /// enqueue took the pending queue from empty to non-empty and the
    /// (recipient, "message") suppress window has passed.
    pub async fn on_offline_message(&self, recipient: &WhisperId, queue_was_empty: bool) {
        if !queue_was_empty {
            return;
        }
        self.dispatch(recipient, WakeReason::Message).await;
    }

    /// An offline callee has an incoming call. Fires iff the
    /// (callee, "call") suppress window has passed.
    pub async fn on_incoming_call(&self, callee: &WhisperId) {
        self.dispatch(callee, WakeReason::Call).await;
    }

    /// Drop coordinator state for a deleted identity.
    pub async fn forget(&self, whisper_id: &WhisperId) {
        self.suppress.forget(whisper_id.as_str()).await;
    }

    async fn dispatch(&self, recipient: &WhisperId, reason: WakeReason) {
        let binding = match identities::find_binding(&self.db.pg, recipient.as_str()).await {
            Ok(Some(binding)) => binding,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(whisper_id = %recipient, error = %e, "Push skipped — binding lookup failed");
                return;
            }
        };

        let payload = match serde_json::to_value(WakePush::new(reason, recipient.clone())) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Wake payload failed to serialize");
                return;
            }
        };
        // Independent guard: nothing content-bearing leaves through a provider.
        if let Err(e) = validate_payload(&payload) {
            tracing::error!(error = %e, "Wake payload rejected by validator");
            return;
        }

        let (channel, token) = match (binding.platform.as_str(), reason) {
            // iOS call wakes prefer the VoIP token when present.
            ("ios", WakeReason::Call) => match (&binding.voip_token, &binding.push_token) {
                (Some(voip), _) => (Channel::ApnsVoip, voip.clone()),
                (None, Some(push)) => (Channel::Apns, push.clone()),
                (None, None) => return,
            },
            ("ios", WakeReason::Message) => match &binding.push_token {
                Some(push) => (Channel::Apns, push.clone()),
                None => return,
            },
            (_, WakeReason::Call) => match &binding.push_token {
                Some(push) => (Channel::FcmCall, push.clone()),
                None => return,
            },
            (_, WakeReason::Message) => match &binding.push_token {
                Some(push) => (Channel::Fcm, push.clone()),
                None => return,
            },
        };

        // The suppress timestamp records the last actual send, so the slot is
        // claimed only once a token is resolved and a dispatch will happen.
        if !self.suppress.try_claim(recipient.as_str(), reason).await {
            return;
        }

        match self.sender.send(channel, &token, &payload).await {
            SendOutcome::Sent => {
                tracing::debug!(whisper_id = %recipient, reason = reason.as_str(), "Wake push dispatched");
            }
            SendOutcome::InvalidToken => {
                let voip = channel == Channel::ApnsVoip;
                if let Err(e) =
                    identities::clear_push_token(&self.db.pg, recipient.as_str(), voip).await
                {
                    tracing::warn!(whisper_id = %recipient, error = %e, "Failed to clear invalid token");
                }
            }
            SendOutcome::Failed => {
                // Unreliable sink — the client pulls via fetch_pending anyway.
            }
        }
    }
}
