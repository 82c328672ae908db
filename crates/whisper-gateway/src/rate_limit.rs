//! Per-identity, per-frame-type rate limiting.
//!
//! Counters live in Redis when it is configured (shared across nodes via
//! INCR + EXPIRE windows); otherwise an in-process sliding window applies.
//! Frame types without an entry in the defaults table are not limited.
//! `limits.bypass_rate_limits` disables enforcement for test harnesses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use whisper_db::{redis_pool, Database};

/// (max events, window) per frame type.
fn default_limits() -> HashMap<&'static str, (u32, Duration)> {
    HashMap::from([
        ("register_begin", (10, Duration::from_secs(60))),
        ("register_proof", (10, Duration::from_secs(60))),
        ("send_message", (60, Duration::from_secs(60))),
        ("group_send_message", (30, Duration::from_secs(60))),
        ("group_create", (10, Duration::from_secs(60))),
        ("group_update", (20, Duration::from_secs(60))),
        ("call_initiate", (10, Duration::from_secs(60))),
        ("get_turn_credentials", (20, Duration::from_secs(60))),
        ("fetch_pending", (60, Duration::from_secs(60))),
    ])
}

#[derive(Clone)]
pub struct RateLimiter {
    limits: Arc<HashMap<&'static str, (u32, Duration)>>,
    windows: Arc<Mutex<HashMap<(String, &'static str), Vec<Instant>>>>,
    db: Option<Database>,
    bypass: bool,
}

impl RateLimiter {
    pub fn new(db: Option<Database>, bypass: bool) -> Self {
        Self {
            limits: Arc::new(default_limits()),
            windows: Arc::new(Mutex::new(HashMap::new())),
            db,
            bypass,
        }
    }

    /// Record one event and decide whether it is admitted.
    /// `key` is the identity (or socket address before authentication).
    pub async fn check(&self, key: &str, frame_type: &'static str) -> bool {
        if self.bypass {
            return true;
        }
        let Some(&(max, window)) = self.limits.get(frame_type) else {
            return true;
        };

        if let Some(db) = &self.db {
            if let Some(redis) = &db.redis {
                let mut conn = redis.clone();
                let redis_key = format!("rl:{frame_type}:{key}");
                match redis_pool::incr_expire(&mut conn, &redis_key, window.as_secs()).await {
                    Ok(count) => return count <= max as i64,
                    Err(e) => {
                        tracing::warn!(error = %e, "Rate counter unavailable — falling back in-process");
                    }
                }
            }
        }

        self.check_local(key, frame_type, max, window, Instant::now()).await
    }

    async fn check_local(
        &self,
        key: &str,
        frame_type: &'static str,
        max: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let mut windows = self.windows.lock().await;
        let events = windows.entry((key.to_owned(), frame_type)).or_default();
        events.retain(|t| now.duration_since(*t) < window);
        if events.len() >= max as usize {
            return false;
        }
        events.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(None, false);
        for _ in 0..10 {
            assert!(limiter.check("WSP-A", "call_initiate").await);
        }
        assert!(!limiter.check("WSP-A", "call_initiate").await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(None, false);
        for _ in 0..10 {
            assert!(limiter.check("WSP-A", "call_initiate").await);
        }
        assert!(limiter.check("WSP-B", "call_initiate").await);
        // A different frame type for the same key is its own window.
        assert!(limiter.check("WSP-A", "send_message").await);
    }

    #[tokio::test]
    async fn window_elapse_readmits() {
        let limiter = RateLimiter::new(None, false);
        let now = Instant::now();
        let window = Duration::from_secs(60);
        for _ in 0..10 {
            assert!(limiter.check_local("WSP-A", "call_initiate", 10, window, now).await);
        }
        assert!(!limiter.check_local("WSP-A", "call_initiate", 10, window, now).await);
        let later = now + Duration::from_secs(61);
        assert!(limiter.check_local("WSP-A", "call_initiate", 10, window, later).await);
    }

    #[tokio::test]
    async fn unlisted_types_and_bypass_are_unlimited() {
        let limiter = RateLimiter::new(None, false);
        for _ in 0..1000 {
            assert!(limiter.check("WSP-A", "ping").await);
        }
        let bypassed = RateLimiter::new(None, true);
        for _ in 0..100 {
            assert!(bypassed.check("WSP-A", "call_initiate").await);
        }
    }
}
