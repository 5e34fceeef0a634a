//! Interfaces to the external services the engine orchestrates.
//!
//! All three are potentially slow and are invoked off the room lock; the
//! engine substitutes error text for failed AI calls and logs failed push
//! deliveries instead of propagating them (transient external failures never
//! abort a room transaction).

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use agora_types::models::{Proposal, PushSubscription, StoredMessage};

/// A discussion snapshot handed to the AI service: everything it needs to
/// reason about the room, gathered under the lock before the call.
#[derive(Debug, Clone, Copy)]
pub struct DiscussionContext<'a> {
    pub topic: &'a str,
    pub note: &'a str,
    pub proposals: &'a [Proposal],
    pub messages: &'a [StoredMessage],
}

/// Text-generation service (question answering, meeting summaries,
/// facilitation prompts, progress analysis).
#[async_trait]
pub trait AiService: Send + Sync {
    async fn answer(&self, question: &str, attachment_refs: &[String]) -> Result<String>;

    async fn summarize(
        &self,
        ctx: DiscussionContext<'_>,
        attachment_refs: &[String],
    ) -> Result<String>;

    async fn facilitate(&self, ctx: DiscussionContext<'_>) -> Result<String>;

    async fn progress(
        &self,
        ctx: DiscussionContext<'_>,
        attachment_refs: &[String],
    ) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

/// Fire-and-forget push notification delivery.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn send(&self, sub: &PushSubscription, payload: &PushPayload) -> Result<()>;
}

/// Renders the meeting minutes document and returns a URL clients can fetch
/// it from.
#[async_trait]
pub trait MinutesExporter: Send + Sync {
    async fn render_minutes(
        &self,
        messages: &[StoredMessage],
        topic: &str,
        participants: &[String],
    ) -> Result<String>;
}
