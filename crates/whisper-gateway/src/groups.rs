//! Group engine — lifecycle, roles, pairwise fanout.
//!
//! Delivery is pairwise: the sender encrypts separately for every active
//! member and the server distributes the list. Past-message isolation needs
//! no special casing — pending queues are per-recipient and attachment
//! grants are minted at send time for the then-active membership.

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use whisper_common::canonical::{verify_fields, CanonicalFields};
use whisper_common::config;
use whisper_common::error::{invalid_payload, WhisperError, WhisperResult};
use whisper_common::frames::{
    self, GroupEvent, GroupMemberSnapshot, GroupSnapshot, MessageAccepted, ServerFrame,
};
use whisper_common::models::{Envelope, GroupRole};
use whisper_common::WhisperId;
use whisper_db::repository::{attachments, envelopes, groups, pending};

use crate::registry::Delivery;
use crate::{load_active_identity, load_recipient, ConnCtx, GatewayState, SocketSession};

async fn snapshot(state: &GatewayState, group_id: Uuid) -> WhisperResult<GroupSnapshot> {
    let group = groups::find(&state.db.pg, group_id)
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "group".into() })?;
    let members = groups::active_members(&state.db.pg, group_id).await?;
    Ok(GroupSnapshot {
        group_id,
        title: group.title,
        members: members
            .into_iter()
            .filter_map(|m| {
                let role = GroupRole::from_str(&m.role)?;
                Some(GroupMemberSnapshot {
                    whisper_id: WhisperId::parse(&m.whisper_id).ok()?,
                    role,
                })
            })
            .collect(),
    })
}

/// Fan a group event out to a recipient set; the acting socket gets the
/// requestId echo, everyone else a bare frame.
async fn fan_out_event(
    state: &GatewayState,
    ctx: &ConnCtx,
    actor: &WhisperId,
    recipients: impl IntoIterator<Item = WhisperId>,
    event: &ServerFrame,
) {
    for member in recipients {
        if &member == actor {
            ctx.reply(event);
        } else {
            state.registry.send_frame(member.as_str(), event).await;
        }
    }
}

pub(crate) async fn handle_group_create(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::GroupCreate,
) -> WhisperResult<()> {
    let creator = &sess.whisper_id;
    let cfg = config::get();

    if p.member_ids.len() > cfg.limits.max_group_members {
        return Err(invalid_payload("too many members"));
    }
    if p.member_ids.iter().any(|m| m == creator) {
        return Err(invalid_payload("creator is an implicit member"));
    }
    for id in &p.member_ids {
        load_recipient(&state.db, id).await?;
    }

    let group_id = Uuid::new_v4();
    let member_strs: Vec<&str> = p.member_ids.iter().map(|m| m.as_str()).collect();
    groups::create(&state.db.pg, group_id, &p.title, creator.as_str(), &member_strs).await?;

    let event = ServerFrame::GroupEvent(GroupEvent {
        event: "created",
        group: snapshot(state, group_id).await?,
        added: vec![],
        removed: vec![],
    });
    let mut everyone = p.member_ids.clone();
    everyone.push(creator.clone());
    fan_out_event(state, ctx, creator, everyone, &event).await;

    tracing::info!(group_id = %group_id, owner = %creator, members = p.member_ids.len(), "Group created");
    Ok(())
}

pub(crate) async fn handle_group_update(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::GroupUpdate,
) -> WhisperResult<()> {
    let actor = &sess.whisper_id;
    let cfg = config::get();

    groups::find(&state.db.pg, p.group_id)
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "group".into() })?;
    let role = groups::member_role(&state.db.pg, p.group_id, actor.as_str())
        .await?
        .and_then(|r| GroupRole::from_str(&r))
        .ok_or(WhisperError::Forbidden)?;

    // Title and role changes are owner-only; membership needs owner or admin.
    if (p.title.is_some() || p.role_changes.is_some()) && role != GroupRole::Owner {
        return Err(WhisperError::Forbidden);
    }
    let touches_members = p.add_members.as_deref().is_some_and(|m| !m.is_empty())
        || p.remove_members.as_deref().is_some_and(|m| !m.is_empty());
    if touches_members && !role.may_manage_members() {
        return Err(WhisperError::Forbidden);
    }

    let add = p.add_members.unwrap_or_default();
    let remove = p.remove_members.unwrap_or_default();
    for id in &add {
        load_recipient(&state.db, id).await?;
    }
    // The owner cannot be removed or demoted; ownership never moves.
    let members_before = groups::active_members(&state.db.pg, p.group_id).await?;
    let owner = members_before
        .iter()
        .find(|m| m.role == "owner")
        .map(|m| m.whisper_id.clone())
        .ok_or_else(|| WhisperError::Internal(anyhow::anyhow!("group without owner")))?;
    if remove.iter().any(|m| m.as_str() == owner.as_str()) {
        return Err(WhisperError::Forbidden);
    }

    let add_strs: Vec<&str> = add.iter().map(|m| m.as_str()).collect();
    let remove_strs: Vec<&str> = remove.iter().map(|m| m.as_str()).collect();
    let role_changes: Vec<(&str, &str)> = p
        .role_changes
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|c| (c.whisper_id.as_str(), c.role.as_str()))
        .collect();

    groups::apply_delta(
        &state.db.pg,
        p.group_id,
        groups::GroupDelta {
            title: p.title.as_deref(),
            add_members: &add_strs,
            remove_members: &remove_strs,
            role_changes: &role_changes,
            max_members: cfg.limits.max_group_members as i64,
        },
    )
    .await
    .map_err(|e| match e {
        groups::GroupUpdateError::TooManyMembers => invalid_payload("too many members"),
        groups::GroupUpdateError::Db(e) => e.into(),
    })?;

    // Removed members get the delta too — it is how they learn they're out.
    let event = ServerFrame::GroupEvent(GroupEvent {
        event: "updated",
        group: snapshot(state, p.group_id).await?,
        added: add.clone(),
        removed: remove.clone(),
    });
    let mut audience: Vec<WhisperId> = groups::active_members(&state.db.pg, p.group_id)
        .await?
        .into_iter()
        .filter_map(|m| WhisperId::parse(&m.whisper_id).ok())
        .collect();
    audience.extend(remove);
    fan_out_event(state, ctx, actor, audience, &event).await;

    Ok(())
}

pub(crate) async fn handle_group_send_message(
    state: &Arc<GatewayState>,
    ctx: &ConnCtx,
    sess: &SocketSession,
    p: frames::GroupSendMessage,
) -> WhisperResult<()> {
    if sess.whisper_id != p.from {
        return Err(WhisperError::Forbidden);
    }
    let sender = load_active_identity(&state.db, &p.from).await?;

    groups::find(&state.db.pg, p.group_id)
        .await?
        .ok_or_else(|| WhisperError::NotFound { resource: "group".into() })?;
    let members = groups::active_members(&state.db.pg, p.group_id).await?;
    let active: HashSet<&str> = members.iter().map(|m| m.whisper_id.as_str()).collect();
    if !active.contains(p.from.as_str()) {
        return Err(WhisperError::Forbidden);
    }

    // The recipient list must exactly cover the active membership minus the
    // sender — a stale list (removed member, missed addition, stranger) is
    // rejected whole so no recipient is silently skipped.
    let expected: HashSet<&str> =
        active.iter().copied().filter(|m| *m != p.from.as_str()).collect();
    let given: HashSet<&str> = p.recipients.iter().map(|s| s.to.as_str()).collect();
    if given != expected {
        return Err(WhisperError::Forbidden);
    }

    let group_id_str = p.group_id.to_string();
    let message_id_str = p.message_id.to_string();
    for sub in &p.recipients {
        verify_fields(
            &sender.sign_public_key,
            &sub.sig,
            &CanonicalFields {
                message_type: &p.msg_type,
                message_id: &message_id_str,
                from: p.from.as_str(),
                to_or_group_id: &group_id_str,
                timestamp: p.timestamp,
                nonce: Some(&sub.nonce),
                ciphertext: Some(&sub.ciphertext),
            },
        )?;
    }

    if envelopes::was_recently_sent(&state.db.pg, p.from.as_str(), p.message_id).await? {
        ctx.reply(&ServerFrame::MessageAccepted(MessageAccepted {
            message_id: p.message_id,
            status: "queued",
        }));
        return Ok(());
    }

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

    // Commit point: header + every sub-envelope in one transaction.
    envelopes::insert_group(
        &state.db.pg,
        p.group_id,
        p.message_id,
        p.from.as_str(),
        &p.msg_type,
        p.timestamp,
        attachment_json,
        &p.recipients,
    )
    .await?;

    if let Some(att) = &p.attachment {
        for sub in &p.recipients {
            attachments::grant_access(&state.db.pg, &att.object_key, sub.to.as_str()).await?;
        }
    }

    ctx.reply(&ServerFrame::MessageAccepted(MessageAccepted {
        message_id: p.message_id,
        status: "queued",
    }));

    for sub in &p.recipients {
        let envelope = Envelope {
            message_id: p.message_id,
            from: p.from.clone(),
            to: None,
            group_id: Some(p.group_id),
            msg_type: p.msg_type.clone(),
            timestamp: p.timestamp,
            nonce: sub.nonce.clone(),
            ciphertext: sub.ciphertext.clone(),
            sig: sub.sig.clone(),
            reply_to: None,
            attachment: p.attachment.clone(),
            sender_enc_public_key: None,
        };
        match state
            .registry
            .send_frame(sub.to.as_str(), &ServerFrame::MessageReceived(envelope.clone()))
            .await
        {
            Delivery::Delivered => {}
            Delivery::Offline => {
                let value = serde_json::to_value(&envelope)
                    .map_err(|e| WhisperError::Internal(e.into()))?;
                let outcome =
                    pending::enqueue(&state.db.pg, sub.to.as_str(), p.message_id, &value).await?;
                if outcome.inserted {
                    state.push.on_offline_message(&sub.to, outcome.was_empty).await;
                }
            }
        }
    }

    tracing::debug!(
        group_id = %p.group_id,
        message_id = %p.message_id,
        recipients = p.recipients.len(),
        "Group message fanned out"
    );
    Ok(())
}
