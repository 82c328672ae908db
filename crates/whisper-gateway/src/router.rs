//! 1:1 message routing — send, receipts, deletes, typing, tokens, account
//! deletion.
//!
//! The durable envelope insert is the commit point of every send: the
//! sender's ack, the recipient fanout, and the wake push all happen after it,
//! so a disconnect mid-send leaves either nothing or a complete message.

use chrono::Utc;
use std::sync::Arc;

use whisper_common::canonical::{verify_fields, CanonicalFields};
use whisper_common::error::{WhisperError, WhisperResult};
use whisper_common::frames::{
    self, MessageAccepted, MessageDeleted, MessageDelivered, ServerFrame, TypingNotification,
};
use whisper_common::models::Envelope;
use whisper_db::repository::{attachments, contact_hints, envelopes, identities, pending};

use crate::registry::Delivery;
use crate::{load_active_identity, load_recipient, ConnCtx, GatewayState, SocketSession};

pub(crate) async fn handle_send_message(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::SendMessage,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;
    load_recipient(&state.db, &p.to).await?;

    verify_fields(
        &sender.sign_public_key,
        &p.sig,
        &CanonicalFields {
            message_type: &p.msg_type,
            message_id: &p.message_id.to_string(),
            from: p.from.as_str(),
            to_or_group_id: p.to.as_str(),
            timestamp: p.timestamp,
            nonce: Some(&p.nonce),
            ciphertext: Some(&p.ciphertext),
        },
    )?;

    // Dedup on (from, messageId): a retry gets its ack again, nothing fans
    // out twice.
    if envelopes::was_recently_sent(&state.db.pg, p.from.as_str(), p.message_id).await? {
        ctx.reply(&ServerFrame::MessageAccepted(MessageAccepted {
            message_id: p.message_id,
            status: "queued",
        }));
        return Ok(());
    }

    // An envelope may only reference an attachment its sender owns;
    // otherwise a send would mint grants on someone else's object.
    if let Some(att) = &p.attachment {
        let record = attachments::find(&state.db.pg, &att.object_key)
            .await?
            .ok_or_else(|| WhisperError::NotFound { resource: "attachment".into() })?;
        if record.owner_id != p.from.as_str() {
            return Err(WhisperError::Forbidden);
        }
    }

    let attachment_json = p
        .attachment
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| WhisperError::Internal(e.into()))?;

    envelopes::insert(
        &state.db.pg,
        envelopes::NewEnvelope {
            message_id: p.message_id,
            from_id: p.from.as_str(),
            to_id: p.to.as_str(),
            msg_type: &p.msg_type,
            timestamp_ms: p.timestamp,
            nonce: &p.nonce,
            ciphertext: &p.ciphertext,
            sig: &p.sig,
            reply_to: p.reply_to,
            attachment: attachment_json,
        },
    )
    .await?;

    if let Some(att) = &p.attachment {
        attachments::grant_access(&state.db.pg, &att.object_key, p.to.as_str()).await?;
    }

    ctx.reply(&ServerFrame::MessageAccepted(MessageAccepted {
        message_id: p.message_id,
        status: "queued",
    }));

    // First contact from a stranger carries the sender's encryption key.
    let needs_key =
        !contact_hints::exists(&state.db.pg, p.to.as_str(), p.from.as_str()).await?;
    let envelope = Envelope {
        message_id: p.message_id,
        from: p.from.clone(),
        to: Some(p.to.clone()),
        group_id: None,
        msg_type: p.msg_type.clone(),
        timestamp: p.timestamp,
        nonce: p.nonce.clone(),
        ciphertext: p.ciphertext.clone(),
        sig: p.sig.clone(),
        reply_to: p.reply_to,
        attachment: p.attachment.clone(),
        sender_enc_public_key: needs_key.then(|| sender.enc_public_key.clone()),
    };

    // Deliver iff still connected at the instant of send; else pending.
    match state
        .registry
        .send_frame(p.to.as_str(), &ServerFrame::MessageReceived(envelope.clone()))
        .await
    {
        Delivery::Delivered => {
            tracing::debug!(message_id = %p.message_id, to = %p.to, "Message forwarded");
        }
        Delivery::Offline => {
            let value =
                serde_json::to_value(&envelope).map_err(|e| WhisperError::Internal(e.into()))?;
            let outcome =
                pending::enqueue(&state.db.pg, p.to.as_str(), p.message_id, &value).await?;
            if outcome.inserted {
                state.push.on_offline_message(&p.to, outcome.was_empty).await;
            }
            tracing::debug!(message_id = %p.message_id, to = %p.to, "Message enqueued");
        }
    }
    if needs_key {
        contact_hints::record(&state.db.pg, p.to.as_str(), p.from.as_str()).await?;
    }

    Ok(())
}

pub(crate) async fn handle_delivery_receipt(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::DeliveryReceipt,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let signer = load_active_identity(&state.db, &p.from).await?;
    verify_fields(
        &signer.sign_public_key,
        &p.sig,
        &CanonicalFields {
            message_type: "delivery_receipt",
            message_id: &p.message_id.to_string(),
            from: p.from.as_str(),
            to_or_group_id: p.to.as_str(),
            timestamp: p.timestamp,
            nonce: None,
            ciphertext: None,
        },
    )?;

    // First receipt wins; repeats are no-ops.
    let changed =
        envelopes::apply_receipt(&state.db.pg, p.to.as_str(), p.message_id, p.status).await?;
    // Either receipt status drains the pending copy.
    pending::remove(&state.db.pg, p.from.as_str(), p.message_id).await?;

    if changed {
        state
            .registry
            .send_frame(
                p.to.as_str(),
                &ServerFrame::MessageDelivered(MessageDelivered {
                    message_id: p.message_id,
                    from: p.from,
                    status: p.status,
                }),
            )
            .await;
    }
    Ok(())
}

pub(crate) async fn handle_delete_message(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::DeleteMessage,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let signer = load_active_identity(&state.db, &p.from).await?;
    verify_fields(
        &signer.sign_public_key,
        &p.sig,
        &CanonicalFields {
            message_type: "delete_message",
            message_id: &p.message_id.to_string(),
            from: p.from.as_str(),
            to_or_group_id: p.to.as_str(),
            timestamp: p.timestamp,
            nonce: None,
            ciphertext: None,
        },
    )?;

    // The tombstone predicate matches only the original sender's row.
    let existed = envelopes::tombstone(&state.db.pg, p.from.as_str(), p.message_id).await?;
    if !existed {
        return Err(WhisperError::NotFound { resource: "message".into() });
    }

    if p.delete_for_everyone {
        // An undelivered copy is withdrawn outright; a delivered one gets
        // the deletion frame. Local-only deletes never notify the peer.
        pending::remove(&state.db.pg, p.to.as_str(), p.message_id).await?;
        state
            .registry
            .send_frame(
                p.to.as_str(),
                &ServerFrame::MessageDeleted(MessageDeleted {
                    message_id: p.message_id,
                    from: p.from.clone(),
                }),
            )
            .await;
    }

    ctx.reply(&ServerFrame::MessageDeleted(MessageDeleted {
        message_id: p.message_id,
        from: p.from,
    }));
    Ok(())
}

pub(crate) async fn handle_typing(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::Typing,
) -> WhisperResult<()> {
    // Session-authenticated only: no ciphertext rides on a typing signal.
    state
        .registry
        .send_frame(
            p.to.as_str(),
            &ServerFrame::TypingNotification(TypingNotification {
                from: sess.whisper_id.clone(),
            }),
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_presence_update(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::PresenceUpdate,
) -> WhisperResult<()> {
    state.registry.set_presence(sess.whisper_id.as_str(), p.status).await;
    Ok(())
}

pub(crate) async fn handle_update_tokens(
    state: &Arc<GatewayState>,
    sess: &SocketSession,
    p: frames::UpdateTokens,
) -> WhisperResult<()> {
    identities::update_tokens(
        &state.db.pg,
        sess.whisper_id.as_str(),
        p.push_token.as_deref(),
        p.voip_token.as_deref(),
    )
    .await?;
    Ok(())
}

pub(crate) async fn handle_delete_account(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::DeleteAccount,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let identity = load_active_identity(&state.db, &p.from).await?;
    verify_fields(
        &identity.sign_public_key,
        &p.sig,
        &CanonicalFields {
            message_type: "delete_account",
            message_id: &p.op_id.to_string(),
            from: p.from.as_str(),
            to_or_group_id: p.from.as_str(),
            timestamp: p.timestamp,
            nonce: None,
            ciphertext: None,
        },
    )?;

    identities::delete_identity(&state.db.pg, p.from.as_str()).await?;
    state.push.forget(&p.from).await;
    state.registry.remove_if(p.from.as_str(), ctx.conn_id).await;
    tracing::info!(whisper_id = %p.from, "Identity self-deleted");
    ctx.close();
    Ok(())
}

/// Answer `ping` with `pong` carrying both clocks.
pub(crate) fn handle_ping(ctx: &ConnCtx, p: frames::Ping) {
    ctx.reply(&ServerFrame::Pong(frames::Pong {
        timestamp: p.timestamp,
        server_time: Utc::now().timestamp_millis(),
    }));
}
