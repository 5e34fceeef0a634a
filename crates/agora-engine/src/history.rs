//! History replay for freshly attached clients.

use std::collections::HashMap;

use anyhow::{bail, Result};

use agora_store::StateStore;
use agora_types::events::ServerEvent;
use agora_types::models::{ReplySnippet, SummaryPayload};

use crate::session::EventSink;
use crate::RoomHub;

/// Send the room's full past to one client, in storage order: every message
/// as a `history` event (the synthetic summary message replayed as a
/// `summary` event instead), then the current shared note and proposal form.
///
/// Replaying this stream leaves a client in the same state as having
/// witnessed every broadcast live.
///
/// The room record is read here, not passed in: callers must already hold a
/// bus subscription, so any edit committed after this read reaches the
/// client through the subscription stream instead of falling between an
/// earlier snapshot and the subscribe.
pub async fn replay(hub: &RoomHub, room_id: &str, sink: &mut dyn EventSink) -> Result<()> {
    let Some(room) = hub.store().get_room(room_id).await? else {
        bail!("room {} deleted during attach", room_id);
    };
    let messages = hub.store().list_messages(room_id).await?;

    let snippets: HashMap<String, ReplySnippet> = messages
        .iter()
        .map(|m| (m.message_id.clone(), m.snippet()))
        .collect();

    for message in &messages {
        let event = if message.is_summary() {
            // Stored as a JSON payload; older rooms may hold plain text.
            let payload: SummaryPayload = serde_json::from_str(&message.content)
                .unwrap_or_else(|_| SummaryPayload {
                    content: message.content.clone(),
                    minutes_url: None,
                });
            ServerEvent::Summary {
                content: payload.content,
                minutes_url: payload.minutes_url,
            }
        } else {
            let reply_to = message
                .reply_to_id
                .as_ref()
                .and_then(|id| snippets.get(id).cloned());
            ServerEvent::History { message: message.view(reply_to) }
        };
        sink.send(event.to_value()).await?;
    }

    sink.send(ServerEvent::NoteInitialState { content: room.shared_note.clone() }.to_value())
        .await?;
    sink.send(
        ServerEvent::ProposalFormInitialState { proposals: room.proposals.clone() }.to_value(),
    )
    .await?;

    Ok(())
}
