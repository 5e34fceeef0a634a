//! Writer-loop event application.
//!
//! Every inbound client event is applied inside one transactional unit with
//! the room row locked, committed, and only then broadcast, so peers never
//! observe uncommitted state and events from one writer reach the bus in
//! commit order. Slow external work (AI answers, summary generation, push
//! delivery) is spawned off the lock and re-acquires it only for its own
//! short write.

use tracing::{debug, warn};

use anyhow::Result;

use agora_store::{RoomTx, StateStore};
use agora_types::events::{ClientEvent, ServerEvent};
use agora_types::models::{
    AI_USERNAME, Proposal, ReactionKind, RoomStatus, StoredMessage, SummaryPayload,
    SYSTEM_USERNAME, STANCE_AI_ANSWER, STANCE_AI_QUESTION, STANCE_PROPOSAL, STANCE_SUMMARY,
};

use crate::notify;
use crate::services::DiscussionContext;
use crate::RoomHub;

/// Apply one inbound event. Any error before commit rolls the transaction
/// back and emits no broadcast; the caller logs it and moves on.
pub(crate) async fn handle_event(
    hub: &RoomHub,
    room_id: &str,
    username: &str,
    event: ClientEvent,
) -> Result<()> {
    let Some(tx) = hub.store().begin_room(room_id).await? else {
        debug!("Room {} not found, dropping event", room_id);
        return Ok(());
    };

    match event {
        ClientEvent::Message {
            stance,
            content,
            reply_to_id,
            file_url,
            original_filename,
            attachment_ref,
        } => {
            let mut message = StoredMessage::new(room_id, username, content, stance.trim());
            message.file_url = file_url;
            message.original_filename = original_filename;
            message.attachment_ref = attachment_ref;
            message.reply_to_id = reply_to_id;
            apply_message(hub, tx, room_id, username, message).await
        }
        ClientEvent::Reaction { message_id, reaction } => {
            apply_reaction(hub, tx, room_id, username, &message_id, reaction).await
        }
        ClientEvent::DeleteMessage { message_id } => {
            apply_delete(hub, tx, room_id, username, &message_id).await
        }
        ClientEvent::ResolveProposal { message_id } => {
            apply_resolve(hub, tx, room_id, &message_id).await
        }
        ClientEvent::NoteUpdate { content } => {
            apply_note_update(hub, tx, room_id, username, content).await
        }
        ClientEvent::ProposalFormUpdate { proposals } => {
            apply_proposal_form_update(hub, tx, room_id, username, proposals).await
        }
        ClientEvent::Finish => apply_finish(hub, tx, room_id).await,
    }
}

async fn apply_message(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    username: &str,
    mut message: StoredMessage,
) -> Result<()> {
    if message.stance.is_empty() {
        debug!("Message without stance from {} ignored", username);
        return Ok(());
    }

    {
        let stats = tx.room_mut().analytics.ensure_user(username);
        stats.posts += 1;
        stats.count_stance(&message.stance);
    }

    // Resolve the reply target within the same room; an unknown or foreign
    // id is dropped rather than stored dangling.
    let reply_to = match message.reply_to_id.clone() {
        Some(id) => {
            let parent = tx.get_message(&id).await?.map(|m| m.snippet());
            if parent.is_none() {
                message.reply_to_id = None;
            }
            parent
        }
        None => None,
    };

    tx.insert_message(&message).await?;
    let subscriptions = tx.list_subscriptions().await?;
    tx.commit().await?;

    hub.publish(room_id, &ServerEvent::Message { message: message.view(reply_to) })
        .await?;

    notify::dispatch(hub, room_id, username, &message.content, subscriptions).await;

    if message.stance == STANCE_AI_QUESTION {
        let hub = hub.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            answer_question(hub, room_id, message).await;
        });
    }

    Ok(())
}

/// Off-lock AI answer: ask, then re-acquire the room for the answer's own
/// short insert-and-publish transaction.
async fn answer_question(hub: RoomHub, room_id: String, question: StoredMessage) {
    let refs: Vec<String> = question.attachment_ref.iter().cloned().collect();
    let answer = match hub.ai().answer(&question.content, &refs).await {
        Ok(text) => text,
        Err(e) => {
            warn!("AI answer failed (room {}): {:#}", room_id, e);
            format!("Sorry, I could not answer that question right now ({e}).")
        }
    };

    if let Err(e) = store_ai_answer(&hub, &room_id, answer).await {
        warn!("Failed to store AI answer (room {}): {:#}", room_id, e);
    }
}

async fn store_ai_answer(hub: &RoomHub, room_id: &str, content: String) -> Result<()> {
    let Some(mut tx) = hub.store().begin_room(room_id).await? else {
        return Ok(());
    };
    let message = StoredMessage::new(room_id, AI_USERNAME, content, STANCE_AI_ANSWER);
    tx.insert_message(&message).await?;
    tx.commit().await?;

    hub.publish(room_id, &ServerEvent::AiResponse { message: message.view(None) })
        .await
}

async fn apply_reaction(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    username: &str,
    message_id: &str,
    kind: ReactionKind,
) -> Result<()> {
    let Some(mut message) = tx.get_message(message_id).await? else {
        debug!("Reaction to unknown message {} ignored", message_id);
        return Ok(());
    };

    let (previous, added) = message.reactions.toggle(username, kind);
    let author = message.username.clone();

    {
        let analytics = &mut tx.room_mut().analytics;
        let reactor = analytics.ensure_user(username);
        if let Some(prev) = previous {
            reactor.reactions_given.decrement(prev);
        }
        if added {
            reactor.reactions_given.increment(kind);
        }
        // The author may be the AI or a user that never posted elsewhere;
        // received counters only track known participants.
        if let Some(author_stats) = analytics.users.get_mut(&author) {
            if let Some(prev) = previous {
                author_stats.reactions_received.decrement(prev);
            }
            if added {
                author_stats.reactions_received.increment(kind);
            }
        }
    }

    tx.update_message(&message).await?;
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::ReactionUpdate {
            message_id: message_id.to_string(),
            reactions: message.reactions.counts(),
        },
    )
    .await
}

async fn apply_delete(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    username: &str,
    message_id: &str,
) -> Result<()> {
    let Some(message) = tx.get_message(message_id).await? else {
        debug!("Delete of unknown message {} ignored", message_id);
        return Ok(());
    };
    if message.username != username {
        debug!("Delete of {} by non-author {} ignored", message_id, username);
        return Ok(());
    }

    {
        let stats = tx.room_mut().analytics.ensure_user(username);
        stats.posts = stats.posts.saturating_sub(1);
        stats.uncount_stance(&message.stance);
    }

    tx.delete_message(message_id).await?;
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::MessageDeleted { message_id: message_id.to_string() },
    )
    .await
}

async fn apply_resolve(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    message_id: &str,
) -> Result<()> {
    let Some(mut message) = tx.get_message(message_id).await? else {
        return Ok(());
    };
    if message.stance != STANCE_PROPOSAL {
        debug!("Resolve of non-proposal message {} ignored", message_id);
        return Ok(());
    }

    message.is_resolved = true;
    tx.update_message(&message).await?;
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::ProposalResolved { message_id: message_id.to_string() },
    )
    .await
}

async fn apply_note_update(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    username: &str,
    content: String,
) -> Result<()> {
    if tx.room().is_closed() {
        debug!("Note update on closed room {} ignored", room_id);
        return Ok(());
    }

    tx.room_mut().shared_note = content.clone();
    tx.room_mut().analytics.ensure_user(username).note_edits += 1;
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::NoteUpdate { content, sender: username.to_string() },
    )
    .await
}

async fn apply_proposal_form_update(
    hub: &RoomHub,
    mut tx: Box<dyn RoomTx>,
    room_id: &str,
    username: &str,
    proposals: Vec<Proposal>,
) -> Result<()> {
    if tx.room().is_closed() {
        debug!("Proposal form update on closed room {} ignored", room_id);
        return Ok(());
    }

    tx.room_mut().proposals = proposals.clone();
    tx.room_mut().analytics.ensure_user(username).proposal_form_edits += 1;
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::ProposalFormUpdate { proposals, sender: username.to_string() },
    )
    .await
}

async fn apply_finish(hub: &RoomHub, mut tx: Box<dyn RoomTx>, room_id: &str) -> Result<()> {
    tx.room_mut().status = RoomStatus::Closed;

    // Snapshot everything the off-lock summary work needs while we still
    // hold the lock.
    let topic = tx.room().topic.clone();
    let note = tx.room().shared_note.clone();
    let proposals = tx.room().proposals.clone();
    let participants: Vec<String> = tx.room().analytics.users.keys().cloned().collect();
    let messages: Vec<StoredMessage> = tx
        .list_messages()
        .await?
        .into_iter()
        .filter(|m| !m.is_summary())
        .collect();

    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::SystemMessage {
            content: "Generating the meeting minutes, please wait...".to_string(),
        },
    )
    .await?;

    let hub = hub.clone();
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        finish_pipeline(hub, room_id, topic, note, proposals, participants, messages).await;
    });

    Ok(())
}

/// Off-lock summary generation and minutes export, then the summary upsert
/// under a fresh lock.
async fn finish_pipeline(
    hub: RoomHub,
    room_id: String,
    topic: String,
    note: String,
    proposals: Vec<Proposal>,
    participants: Vec<String>,
    messages: Vec<StoredMessage>,
) {
    let attachment_refs: Vec<String> =
        messages.iter().filter_map(|m| m.attachment_ref.clone()).collect();
    let ctx = DiscussionContext {
        topic: &topic,
        note: &note,
        proposals: &proposals,
        messages: &messages,
    };

    let content = match hub.ai().summarize(ctx, &attachment_refs).await {
        Ok(text) => text,
        Err(e) => {
            warn!("Summary generation failed (room {}): {:#}", room_id, e);
            format!("Summary generation failed ({e}).")
        }
    };

    let minutes_url = match hub.exporter().render_minutes(&messages, &topic, &participants).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Minutes export failed (room {}): {:#}", room_id, e);
            None
        }
    };

    if let Err(e) = upsert_summary(&hub, &room_id, SummaryPayload { content, minutes_url }).await {
        warn!("Failed to store summary (room {}): {:#}", room_id, e);
    }
}

async fn upsert_summary(hub: &RoomHub, room_id: &str, payload: SummaryPayload) -> Result<()> {
    let body = serde_json::to_string(&payload)?;

    let Some(mut tx) = hub.store().begin_room(room_id).await? else {
        return Ok(());
    };
    match tx.find_summary_message().await? {
        Some(mut existing) => {
            existing.content = body;
            tx.update_message(&existing).await?;
        }
        None => {
            let message = StoredMessage::new(room_id, SYSTEM_USERNAME, body, STANCE_SUMMARY);
            tx.insert_message(&message).await?;
        }
    }
    tx.commit().await?;

    hub.publish(
        room_id,
        &ServerEvent::Summary {
            content: payload.content,
            minutes_url: payload.minutes_url,
        },
    )
    .await
}
