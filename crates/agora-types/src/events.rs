use serde::{Deserialize, Serialize};

use crate::models::{MessageView, Proposal, ReactionCounts, ReactionKind};

/// Events sent from a client into its room session's writer loop.
///
/// All variants are applied under the per-room lock; see the engine's writer
/// loop for the handling table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Message {
        stance: String,
        content: String,
        #[serde(default)]
        reply_to_id: Option<String>,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        original_filename: Option<String>,
        #[serde(default)]
        attachment_ref: Option<String>,
    },
    Reaction {
        message_id: String,
        reaction: ReactionKind,
    },
    DeleteMessage {
        message_id: String,
    },
    ResolveProposal {
        message_id: String,
    },
    NoteUpdate {
        content: String,
    },
    ProposalFormUpdate {
        proposals: Vec<Proposal>,
    },
    Finish,
}

/// Events broadcast to every subscriber of a room, and the replay/initial
/// events sent directly to a freshly attached client.
///
/// Broadcasts carry full resulting state (not deltas), so duplicate delivery
/// from the at-least-once bus is safe to apply; `reaction_update` carries
/// server-recomputed counts for the same reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A committed user (or AI facilitator) message.
    Message {
        #[serde(flatten)]
        message: MessageView,
    },
    /// The asynchronous AI answer to an `ai_question` message.
    AiResponse {
        #[serde(flatten)]
        message: MessageView,
    },
    ReactionUpdate {
        message_id: String,
        reactions: ReactionCounts,
    },
    MessageDeleted {
        message_id: String,
    },
    ProposalResolved {
        message_id: String,
    },
    NoteUpdate {
        content: String,
        sender: String,
    },
    ProposalFormUpdate {
        proposals: Vec<Proposal>,
        sender: String,
    },
    /// Current roster of connected usernames for the room.
    ParticipantUpdate {
        users: Vec<String>,
    },
    SystemMessage {
        content: String,
    },
    /// The latest generated meeting summary (broadcast on finish, and emitted
    /// during replay in place of the synthetic summary message).
    Summary {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minutes_url: Option<String>,
    },
    /// One past message, replayed at attach.
    History {
        #[serde(flatten)]
        message: MessageView,
    },
    NoteInitialState {
        content: String,
    },
    ProposalFormInitialState {
        proposals: Vec<Proposal>,
    },
}

impl ServerEvent {
    /// Serialize for bus publication / transport send.
    pub fn to_value(&self) -> serde_json::Value {
        // Serialization of these enums cannot fail: no non-string map keys,
        // no non-serializable fields.
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_message_event_parses() {
        let raw = json!({"type": "message", "stance": "意見", "content": "X"});
        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        match event {
            ClientEvent::Message { stance, content, reply_to_id, .. } => {
                assert_eq!(stance, "意見");
                assert_eq!(content, "X");
                assert_eq!(reply_to_id, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn broadcast_message_is_flat() {
        let msg = crate::models::StoredMessage::new("r1", "A", "X", "意見");
        let value = ServerEvent::Message { message: msg.view(None) }.to_value();

        assert_eq!(value["type"], "message");
        assert_eq!(value["username"], "A");
        assert_eq!(value["content"], "X");
        assert_eq!(value["is_resolved"], false);
        assert_eq!(value["reactions"]["agree"], json!([]));
    }

    #[test]
    fn reaction_update_carries_counts_only() {
        let value = ServerEvent::ReactionUpdate {
            message_id: "m1".into(),
            reactions: ReactionCounts { agree: 2, partial: 0, disagree: 1 },
        }
        .to_value();

        assert_eq!(value["type"], "reaction_update");
        assert_eq!(value["reactions"]["agree"], 2);
        assert!(value["reactions"]["agree"].is_u64());
    }
}
