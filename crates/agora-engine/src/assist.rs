//! On-demand AI assistance: facilitation prompts and progress checks.
//!
//! Both are triggered over HTTP rather than through the session's event
//! stream, but mutate room analytics the same way: counter bump and context
//! snapshot under the room lock, AI call off the lock.

use anyhow::Result;

use agora_store::{RoomTx, StateStore};
use agora_types::events::ServerEvent;
use agora_types::models::{
    MessageView, Proposal, StoredMessage, AI_USERNAME, STANCE_FACILITATION,
};

use crate::services::DiscussionContext;
use crate::RoomHub;

struct Snapshot {
    topic: String,
    note: String,
    proposals: Vec<Proposal>,
    messages: Vec<StoredMessage>,
}

impl Snapshot {
    fn context(&self) -> DiscussionContext<'_> {
        DiscussionContext {
            topic: &self.topic,
            note: &self.note,
            proposals: &self.proposals,
            messages: &self.messages,
        }
    }

    fn attachment_refs(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| m.attachment_ref.clone())
            .collect()
    }
}

/// Generate a facilitation message for the room, store it as an AI message,
/// and broadcast it. Returns `None` if the room does not exist or is closed.
pub async fn facilitate(
    hub: &RoomHub,
    room_id: &str,
    username: &str,
) -> Result<Option<MessageView>> {
    let snapshot = {
        let Some(mut tx) = hub.store().begin_room(room_id).await? else {
            return Ok(None);
        };
        if tx.room().is_closed() {
            return Ok(None);
        }
        tx.room_mut().analytics.ensure_user(username).facilitator_uses += 1;
        let snapshot = snapshot_room(&mut *tx).await?;
        tx.commit().await?;
        snapshot
    };

    let content = hub.ai().facilitate(snapshot.context()).await?;

    let Some(mut tx) = hub.store().begin_room(room_id).await? else {
        return Ok(None);
    };
    let message = StoredMessage::new(room_id, AI_USERNAME, content, STANCE_FACILITATION);
    tx.insert_message(&message).await?;
    tx.commit().await?;

    let view = message.view(None);
    hub.publish(room_id, &ServerEvent::Message { message: view.clone() })
        .await?;

    Ok(Some(view))
}

/// Analyze how the discussion is going and return the analysis to the
/// requester only; nothing is stored or broadcast beyond the counter bump.
/// Returns `None` if the room does not exist.
pub async fn check_progress(
    hub: &RoomHub,
    room_id: &str,
    username: &str,
) -> Result<Option<String>> {
    let snapshot = {
        let Some(mut tx) = hub.store().begin_room(room_id).await? else {
            return Ok(None);
        };
        tx.room_mut().analytics.ensure_user(username).progress_check_uses += 1;
        let snapshot = snapshot_room(&mut *tx).await?;
        tx.commit().await?;
        snapshot
    };

    let text = hub
        .ai()
        .progress(snapshot.context(), &snapshot.attachment_refs())
        .await?;
    Ok(Some(text))
}

async fn snapshot_room(tx: &mut dyn RoomTx) -> Result<Snapshot> {
    let messages = tx
        .list_messages()
        .await?
        .into_iter()
        .filter(|m| !m.is_summary())
        .collect();
    Ok(Snapshot {
        topic: tx.room().topic.clone(),
        note: tx.room().shared_note.clone(),
        proposals: tx.room().proposals.clone(),
        messages,
    })
}
