use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stance marking a question addressed to the AI assistant. The writer loop
/// stores the user message first, then asks the AI off the room lock.
pub const STANCE_AI_QUESTION: &str = "ai_question";
/// Stance of the stored AI answer message.
pub const STANCE_AI_ANSWER: &str = "ai_answer";
/// Stance of a structured proposal message (the only kind that can be resolved).
pub const STANCE_PROPOSAL: &str = "proposal";
/// Stance of an AI facilitation message.
pub const STANCE_FACILITATION: &str = "facilitation";
/// Stance of the single synthetic meeting-summary message per room.
/// Upserted, never duplicated.
pub const STANCE_SUMMARY: &str = "summary";

pub const AI_USERNAME: &str = "Assistant";
pub const SYSTEM_USERNAME: &str = "System";

// -- Room --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Closed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A bounded deliberation session: one topic, one lock domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub topic: String,
    pub status: RoomStatus,
    #[serde(default)]
    pub shared_note: String,
    #[serde(default)]
    pub proposals: Vec<Proposal>,
    #[serde(default)]
    pub analytics: RoomAnalytics,
}

impl Room {
    pub fn new(room_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            topic: topic.into(),
            status: RoomStatus::Active,
            shared_note: String::new(),
            proposals: Vec::new(),
            analytics: RoomAnalytics::default(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == RoomStatus::Closed
    }
}

/// One entry of the shared proposal form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub how: String,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub who: String,
    /// "forecast" or "backcast", free text otherwise.
    #[serde(default)]
    pub approach: String,
}

// -- Reactions --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Agree,
    Partial,
    Disagree,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 3] = [Self::Agree, Self::Partial, Self::Disagree];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agree => "agree",
            Self::Partial => "partial",
            Self::Disagree => "disagree",
        }
    }
}

/// Which users hold which reaction on a message.
/// Invariant: a username appears in at most one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionTally {
    #[serde(default)]
    pub agree: Vec<String>,
    #[serde(default)]
    pub partial: Vec<String>,
    #[serde(default)]
    pub disagree: Vec<String>,
}

impl ReactionTally {
    pub fn users(&self, kind: ReactionKind) -> &Vec<String> {
        match kind {
            ReactionKind::Agree => &self.agree,
            ReactionKind::Partial => &self.partial,
            ReactionKind::Disagree => &self.disagree,
        }
    }

    fn users_mut(&mut self, kind: ReactionKind) -> &mut Vec<String> {
        match kind {
            ReactionKind::Agree => &mut self.agree,
            ReactionKind::Partial => &mut self.partial,
            ReactionKind::Disagree => &mut self.disagree,
        }
    }

    /// The kind this user currently holds, if any.
    pub fn kind_of(&self, username: &str) -> Option<ReactionKind> {
        ReactionKind::ALL
            .into_iter()
            .find(|k| self.users(*k).iter().any(|u| u == username))
    }

    /// Apply a reaction. Re-applying the held kind removes it (toggle-off);
    /// applying a different kind atomically switches to it.
    ///
    /// Returns `(previous, added)`: the kind removed, and whether `kind` was
    /// added.
    pub fn toggle(&mut self, username: &str, kind: ReactionKind) -> (Option<ReactionKind>, bool) {
        let previous = self.kind_of(username);
        if let Some(prev) = previous {
            self.users_mut(prev).retain(|u| u != username);
        }
        let added = previous != Some(kind);
        if added {
            self.users_mut(kind).push(username.to_string());
        }
        (previous, added)
    }

    /// Per-kind counts only, for `reaction_update` broadcasts.
    pub fn counts(&self) -> ReactionCounts {
        ReactionCounts {
            agree: self.agree.len() as u64,
            partial: self.partial.len() as u64,
            disagree: self.disagree.len() as u64,
        }
    }

    pub fn total(&self) -> usize {
        self.agree.len() + self.partial.len() + self.disagree.len()
    }
}

/// Fixed-shape per-kind counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCounts {
    #[serde(default)]
    pub agree: u64,
    #[serde(default)]
    pub partial: u64,
    #[serde(default)]
    pub disagree: u64,
}

impl ReactionCounts {
    pub fn increment(&mut self, kind: ReactionKind) {
        *self.slot(kind) += 1;
    }

    pub fn decrement(&mut self, kind: ReactionKind) {
        let slot = self.slot(kind);
        *slot = slot.saturating_sub(1);
    }

    pub fn add(&mut self, other: &ReactionCounts) {
        self.agree += other.agree;
        self.partial += other.partial;
        self.disagree += other.disagree;
    }

    fn slot(&mut self, kind: ReactionKind) -> &mut u64 {
        match kind {
            ReactionKind::Agree => &mut self.agree,
            ReactionKind::Partial => &mut self.partial,
            ReactionKind::Disagree => &mut self.disagree,
        }
    }
}

// -- Analytics --

/// Per-user activity counters. Every field defaults to zero so new users can
/// be inserted without presence checks before increments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub posts: u64,
    #[serde(default)]
    pub stances: BTreeMap<String, u64>,
    #[serde(default)]
    pub reactions_given: ReactionCounts,
    #[serde(default)]
    pub reactions_received: ReactionCounts,
    #[serde(default)]
    pub note_edits: u64,
    #[serde(default)]
    pub facilitator_uses: u64,
    #[serde(default)]
    pub proposal_form_edits: u64,
    #[serde(default)]
    pub progress_check_uses: u64,
}

impl UserStats {
    pub fn count_stance(&mut self, stance: &str) {
        *self.stances.entry(stance.to_string()).or_default() += 1;
    }

    pub fn uncount_stance(&mut self, stance: &str) {
        if let Some(n) = self.stances.get_mut(stance) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Room-level analytics. `users` is a superset of every username that has
/// posted, reacted, or edited state in the room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAnalytics {
    #[serde(default)]
    pub users: BTreeMap<String, UserStats>,
}

impl RoomAnalytics {
    /// Fetch the stats entry for a user, creating a zeroed one if absent.
    pub fn ensure_user(&mut self, username: &str) -> &mut UserStats {
        self.users.entry(username.to_string()).or_default()
    }

    pub fn contains_user(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }
}

// -- Messages --

/// A persisted room message. `created_at` is the sole ordering key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub room_id: String,
    pub username: String,
    pub content: String,
    pub stance: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub attachment_ref: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reactions: ReactionTally,
    #[serde(default)]
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        room_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
        stance: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            username: username.into(),
            content: content.into(),
            stance: stance.into(),
            file_url: None,
            original_filename: None,
            attachment_ref: None,
            reply_to_id: None,
            reactions: ReactionTally::default(),
            is_resolved: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_summary(&self) -> bool {
        self.stance == STANCE_SUMMARY
    }

    /// Wire view of this message, with the reply target already resolved to a
    /// snippet by the caller.
    pub fn view(&self, reply_to: Option<ReplySnippet>) -> MessageView {
        MessageView {
            message_id: self.message_id.clone(),
            username: self.username.clone(),
            content: self.content.clone(),
            stance: self.stance.clone(),
            file_url: self.file_url.clone(),
            original_filename: self.original_filename.clone(),
            attachment_ref: self.attachment_ref.clone(),
            reactions: self.reactions.clone(),
            reply_to,
            is_resolved: self.is_resolved,
        }
    }

    pub fn snippet(&self) -> ReplySnippet {
        ReplySnippet {
            id: self.message_id.clone(),
            username: self.username.clone(),
            content: self.content.clone(),
        }
    }
}

/// Message payload as broadcast to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub message_id: String,
    pub username: String,
    pub content: String,
    pub stance: String,
    pub file_url: Option<String>,
    pub original_filename: Option<String>,
    pub attachment_ref: Option<String>,
    pub reactions: ReactionTally,
    pub reply_to: Option<ReplySnippet>,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnippet {
    pub id: String,
    pub username: String,
    pub content: String,
}

/// Storage format of the synthetic summary message's content field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_url: Option<String>,
}

// -- Push subscriptions --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// A push delivery endpoint registered for a (room, user) pair.
/// Not deduplicated except by matching endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub room_id: String,
    pub username: String,
    pub endpoint: String,
    pub keys: PushKeys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_same_kind_twice_removes() {
        let mut tally = ReactionTally::default();

        let (prev, added) = tally.toggle("B", ReactionKind::Agree);
        assert_eq!(prev, None);
        assert!(added);
        assert_eq!(tally.counts().agree, 1);

        let (prev, added) = tally.toggle("B", ReactionKind::Agree);
        assert_eq!(prev, Some(ReactionKind::Agree));
        assert!(!added);
        assert_eq!(tally.total(), 0);
        assert_eq!(tally.kind_of("B"), None);
    }

    #[test]
    fn toggle_switch_is_atomic_remove_plus_add() {
        let mut tally = ReactionTally::default();
        tally.toggle("B", ReactionKind::Agree);

        let (prev, added) = tally.toggle("B", ReactionKind::Disagree);
        assert_eq!(prev, Some(ReactionKind::Agree));
        assert!(added);
        assert_eq!(tally.kind_of("B"), Some(ReactionKind::Disagree));
        assert_eq!(tally.total(), 1);
    }

    #[test]
    fn one_reaction_per_user_across_kinds() {
        let mut tally = ReactionTally::default();
        for kind in ReactionKind::ALL {
            tally.toggle("A", kind);
            assert!(tally.total() <= 1);
        }
    }

    #[test]
    fn reaction_counts_never_go_negative() {
        let mut counts = ReactionCounts::default();
        counts.decrement(ReactionKind::Partial);
        assert_eq!(counts.partial, 0);
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let mut analytics = RoomAnalytics::default();
        analytics.ensure_user("A").posts = 3;
        analytics.ensure_user("A");
        assert_eq!(analytics.users["A"].posts, 3);
    }
}
