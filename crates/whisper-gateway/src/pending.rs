//! Pending-queue drain — `fetch_pending` paging.
//!
//! Fetching pages without draining: only `delivery_receipt` deletes entries,
//! so a flapping connection re-fetches the same page instead of losing it.
//! Cursors are opaque `base64("<micros>:<messageId>")` over the stable
//! `(enqueued_at, message_id)` order.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use whisper_common::error::{invalid_payload, WhisperError, WhisperResult};
use whisper_common::frames::{self, PendingMessages, ServerFrame};
use whisper_common::models::Envelope;
use whisper_db::repository::pending;

use crate::{ConnCtx, GatewayState, SocketSession};

const DEFAULT_PAGE: u32 = 200;

fn encode_cursor(enqueued_at: DateTime<Utc>, message_id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{}", enqueued_at.timestamp_micros(), message_id))
}

fn decode_cursor(cursor: &str) -> WhisperResult<(DateTime<Utc>, Uuid)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid_payload("malformed cursor"))?;
    let text = String::from_utf8(bytes).map_err(|_| invalid_payload("malformed cursor"))?;
    let (micros, id) = text.split_once(':').ok_or_else(|| invalid_payload("malformed cursor"))?;
    let micros: i64 = micros.parse().map_err(|_| invalid_payload("malformed cursor"))?;
    let ts = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| invalid_payload("malformed cursor"))?;
    let id = Uuid::parse_str(id).map_err(|_| invalid_payload("malformed cursor"))?;
    Ok((ts, id))
}

pub(crate) async fn handle_fetch_pending(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::FetchPending,
) -> WhisperResult<()> {
    let limit = p.limit.unwrap_or(DEFAULT_PAGE) as i64;
    let after = p.cursor.as_deref().map(decode_cursor).transpose()?;

    let rows =
        pending::fetch_page(&state.db.pg, sess.whisper_id.as_str(), after, limit).await?;

    let next_cursor = (rows.len() as i64 == limit)
        .then(|| rows.last().map(|r| encode_cursor(r.enqueued_at, r.message_id)))
        .flatten();

    let messages = rows
        .into_iter()
        .map(|row| serde_json::from_value::<Envelope>(row.envelope))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WhisperError::Internal(e.into()))?;

    tracing::debug!(
        whisper_id = %sess.whisper_id,
        count = messages.len(),
        "Pending page served"
    );
    ctx.reply(&ServerFrame::PendingMessages(PendingMessages { messages, next_cursor }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let ts = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let id = Uuid::new_v4();
        let (back_ts, back_id) = decode_cursor(&encode_cursor(ts, id)).unwrap();
        assert_eq!(back_ts, ts);
        assert_eq!(back_id, id);
    }

    #[test]
    fn garbage_cursors_are_invalid_payload() {
        for bad in ["", "!!!", "bm90LWEtY3Vyc29y", "MTIzNA"] {
            let err = decode_cursor(bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_PAYLOAD", "cursor {bad:?}");
        }
    }
}
