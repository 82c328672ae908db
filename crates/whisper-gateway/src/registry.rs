//! Connection registry — `whisperId → live socket`.
//!
//! One entry per identity, ever. Inserting a handle for an identity that is
//! already connected evicts the prior handle and returns it so the caller can
//! deliver a `session_superseded` error before the close. Cleanup is keyed by
//! connection id, so an evicted socket's teardown can never remove its
//! successor's entry.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use whisper_common::frames::{encode_server_frame, PresenceStatus, ServerFrame};

/// What the per-socket write task consumes.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Handle to one live socket's outbound channel.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub conn_id: Uuid,
    out: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    pub fn new(conn_id: Uuid, out: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { conn_id, out }
    }

    /// Queue a frame on this socket. Returns false when the socket is gone.
    pub fn send(&self, frame: &ServerFrame, request_id: Option<&str>) -> bool {
        self.out.send(Outbound::Text(encode_server_frame(frame, request_id))).is_ok()
    }

    /// Ask the write task to close the socket.
    pub fn close(&self) {
        let _ = self.out.send(Outbound::Close);
    }
}

/// Outcome of a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Offline,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<RwLock<HashMap<String, ConnHandle>>>,
    presence: Arc<RwLock<HashMap<String, PresenceStatus>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for an identity, evicting any prior one.
    /// Returns the evicted handle, if there was one.
    pub async fn insert(&self, whisper_id: &str, handle: ConnHandle) -> Option<ConnHandle> {
        let prior = self.conns.write().await.insert(whisper_id.to_owned(), handle);
        self.presence
            .write()
            .await
            .insert(whisper_id.to_owned(), PresenceStatus::Online);
        prior
    }

    /// Remove the identity's entry iff it still belongs to `conn_id`.
    pub async fn remove_if(&self, whisper_id: &str, conn_id: Uuid) -> bool {
        let mut conns = self.conns.write().await;
        if conns.get(whisper_id).is_some_and(|h| h.conn_id == conn_id) {
            conns.remove(whisper_id);
            drop(conns);
            self.presence
                .write()
                .await
                .insert(whisper_id.to_owned(), PresenceStatus::Offline);
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, whisper_id: &str) -> bool {
        self.conns.read().await.contains_key(whisper_id)
    }

    /// Route a frame to an identity's live socket, if any. A dead channel
    /// counts as offline and is pruned.
    pub async fn send_frame(&self, whisper_id: &str, frame: &ServerFrame) -> Delivery {
        let handle = self.conns.read().await.get(whisper_id).cloned();
        match handle {
            Some(handle) if handle.send(frame, None) => Delivery::Delivered,
            Some(handle) => {
                self.remove_if(whisper_id, handle.conn_id).await;
                Delivery::Offline
            }
            None => Delivery::Offline,
        }
    }

    /// Client-advertised presence (informational; routing goes by the
    /// connection table, not by this).
    pub async fn set_presence(&self, whisper_id: &str, status: PresenceStatus) {
        self.presence.write().await.insert(whisper_id.to_owned(), status);
    }

    pub async fn active_count(&self) -> usize {
        self.conns.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whisper_common::frames::Pong;

    fn handle() -> (ConnHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnHandle::new(Uuid::new_v4(), tx), rx)
    }

    fn pong() -> ServerFrame {
        ServerFrame::Pong(Pong { timestamp: 1, server_time: 2 })
    }

    #[tokio::test]
    async fn at_most_one_entry_per_identity() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();

        assert!(registry.insert("WSP-A", first.clone()).await.is_none());
        let evicted = registry.insert("WSP-A", second.clone()).await.expect("prior evicted");
        assert_eq!(evicted.conn_id, first.conn_id);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn stale_cleanup_does_not_remove_successor() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();

        registry.insert("WSP-A", first.clone()).await;
        registry.insert("WSP-A", second.clone()).await;

        // The evicted socket's teardown runs late — it must be a no-op.
        assert!(!registry.remove_if("WSP-A", first.conn_id).await);
        assert!(registry.is_online("WSP-A").await);

        assert!(registry.remove_if("WSP-A", second.conn_id).await);
        assert!(!registry.is_online("WSP-A").await);
    }

    #[tokio::test]
    async fn send_frame_reports_offline_and_prunes_dead_channels() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.send_frame("WSP-A", &pong()).await, Delivery::Offline);

        let (h, rx) = handle();
        registry.insert("WSP-A", h).await;
        drop(rx); // socket died without cleanup
        assert_eq!(registry.send_frame("WSP-A", &pong()).await, Delivery::Offline);
        assert!(!registry.is_online("WSP-A").await);
    }

    #[tokio::test]
    async fn delivered_frames_reach_the_channel() {
        let registry = ConnectionRegistry::new();
        let (h, mut rx) = handle();
        registry.insert("WSP-A", h).await;
        assert_eq!(registry.send_frame("WSP-A", &pong()).await, Delivery::Delivered);
        match rx.recv().await {
            Some(Outbound::Text(text)) => assert!(text.contains("\"pong\"")),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}
