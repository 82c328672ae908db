//! Push provider sinks — APNs and FCM as write-only HTTP endpoints.
//!
//! Providers are unreliable by contract: a failed send is logged and
//! forgotten, because `fetch_pending` is the source of truth. The one
//! provider response the coordinator acts on is "invalid token", which
//! clears the stored token until the client re-registers.

use serde_json::Value;

/// What became of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The provider rejected the token; stop using it.
    InvalidToken,
    /// Transient failure — logged, not retried here.
    Failed,
}

/// Which provider endpoint a wake goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Apns,
    ApnsVoip,
    Fcm,
    /// FCM on the high-priority "calls" notification channel.
    FcmCall,
}

#[derive(Clone)]
pub struct WakeSender {
    http: reqwest::Client,
    apns_url: String,
    apns_voip_url: String,
    fcm_url: String,
}

impl WakeSender {
    pub fn new(apns_url: String, apns_voip_url: String, fcm_url: String) -> Self {
        Self { http: reqwest::Client::new(), apns_url, apns_voip_url, fcm_url }
    }

    /// Dispatch one validated wake payload. The payload object is carried
    /// verbatim; channel selection only shapes the provider wrapper.
    pub async fn send(&self, channel: Channel, token: &str, payload: &Value) -> SendOutcome {
        let (url, body) = match channel {
            Channel::Apns => (
                &self.apns_url,
                serde_json::json!({ "device_token": token, "aps": { "content-available": 1 }, "data": payload }),
            ),
            Channel::ApnsVoip => (
                &self.apns_voip_url,
                serde_json::json!({ "device_token": token, "data": payload }),
            ),
            Channel::Fcm => (
                &self.fcm_url,
                serde_json::json!({
                    "to": token,
                    "android": { "priority": "high" },
                    "data": payload,
                }),
            ),
            Channel::FcmCall => (
                &self.fcm_url,
                serde_json::json!({
                    "to": token,
                    "android": { "priority": "high", "channel_id": "calls" },
                    "data": payload,
                }),
            ),
        };
        if url.is_empty() {
            tracing::debug!(?channel, "Push provider not configured — skipping wake");
            return SendOutcome::Failed;
        }

        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => SendOutcome::Sent,
            Ok(resp) if resp.status() == reqwest::StatusCode::GONE
                || resp.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                tracing::info!(?channel, "Provider reported invalid push token");
                SendOutcome::InvalidToken
            }
            Ok(resp) => {
                tracing::warn!(?channel, status = %resp.status(), "Push provider rejected wake");
                SendOutcome::Failed
            }
            Err(e) => {
                tracing::warn!(?channel, error = %e, "Push provider unreachable");
                SendOutcome::Failed
            }
        }
    }
}
