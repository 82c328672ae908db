//! Suppress keys — per-recipient-per-reason wake coalescing.
//!
//! A burst of offline messages must wake the device once, not once per
//! message. The store remembers the last dispatch instant for each
//! (recipient, reason) pair; a send is admitted only when the window has
//! passed, and admission atomically claims the slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::payload::WakeReason;

#[derive(Clone)]
pub struct SuppressStore {
    window: Duration,
    last_sent: Arc<Mutex<HashMap<(String, WakeReason), Instant>>>,
}

impl SuppressStore {
    pub fn new(window: Duration) -> Self {
        Self { window, last_sent: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Try to claim a send slot. Returns true when the caller may dispatch.
    pub async fn try_claim(&self, recipient: &str, reason: WakeReason) -> bool {
        let mut map = self.last_sent.lock().await;
        let key = (recipient.to_owned(), reason);
        let now = Instant::now();
        match map.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Drop state for an identity (self-delete).
    pub async fn forget(&self, recipient: &str) {
        self.last_sent.lock().await.retain(|(id, _), _| id != recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_wins_then_window_suppresses() {
        let store = SuppressStore::new(Duration::from_secs(30));
        assert!(store.try_claim("WSP-A", WakeReason::Message).await);
        assert!(!store.try_claim("WSP-A", WakeReason::Message).await);
        assert!(!store.try_claim("WSP-A", WakeReason::Message).await);
    }

    #[tokio::test]
    async fn reasons_and_recipients_are_independent() {
        let store = SuppressStore::new(Duration::from_secs(30));
        assert!(store.try_claim("WSP-A", WakeReason::Message).await);
        assert!(store.try_claim("WSP-A", WakeReason::Call).await);
        assert!(store.try_claim("WSP-B", WakeReason::Message).await);
    }

    #[tokio::test]
    async fn window_elapse_readmits() {
        let store = SuppressStore::new(Duration::from_millis(10));
        assert!(store.try_claim("WSP-A", WakeReason::Message).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_claim("WSP-A", WakeReason::Message).await);
    }

    #[tokio::test]
    async fn forget_clears_state() {
        let store = SuppressStore::new(Duration::from_secs(30));
        assert!(store.try_claim("WSP-A", WakeReason::Call).await);
        store.forget("WSP-A").await;
        assert!(store.try_claim("WSP-A", WakeReason::Call).await);
    }
}
