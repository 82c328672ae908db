//! Redis helpers — shared counters.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Increment a counter, setting the window TTL on first increment
/// (rate limiting).
pub async fn incr_expire(
    conn: &mut ConnectionManager,
    key: &str,
    ttl_secs: u64,
) -> Result<i64, redis::RedisError> {
    let count: i64 = conn.incr(key, 1).await?;
    if count == 1 {
        let _: () = conn.expire(key, ttl_secs as i64).await?;
    }
    Ok(count)
}
