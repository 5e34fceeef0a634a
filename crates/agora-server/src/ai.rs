//! Gemini-backed text generation.

use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use agora_engine::services::{AiService, DiscussionContext};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiAi {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiAi {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_MODEL.into(),
        }
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("no AI API key configured"));
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("AI request failed")?
            .error_for_status()
            .context("AI request rejected")?;

        let value: Value = response.json().await.context("AI response was not JSON")?;
        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow!("AI response missing text candidate"))?;
        Ok(text.trim().to_string())
    }
}

/// One line per message, same shape the prompts reference.
fn transcript(ctx: &DiscussionContext<'_>) -> String {
    let mut out = String::new();
    for message in ctx.messages {
        let _ = writeln!(out, "{} ({}): {}", message.username, message.stance, message.content);
    }
    out
}

fn context_block(ctx: &DiscussionContext<'_>) -> String {
    let mut out = format!("Topic: {}\n", ctx.topic);
    if !ctx.note.is_empty() {
        let _ = writeln!(out, "Shared note:\n{}", ctx.note);
    }
    for (i, p) in ctx.proposals.iter().enumerate() {
        let _ = writeln!(
            out,
            "Proposal {}: what={} why={} how={} when={} place={} who={} approach={}",
            i + 1,
            p.what,
            p.why,
            p.how,
            p.when,
            p.place,
            p.who,
            p.approach
        );
    }
    let _ = writeln!(out, "Discussion so far:\n{}", transcript(ctx));
    out
}

fn attachment_note(refs: &[String]) -> String {
    if refs.is_empty() {
        String::new()
    } else {
        format!("\nReferenced attachments: {}\n", refs.join(", "))
    }
}

#[async_trait]
impl AiService for GeminiAi {
    async fn answer(&self, question: &str, attachment_refs: &[String]) -> Result<String> {
        let prompt = format!(
            "You are a helpful assistant in a group deliberation. \
             Answer the following question concisely.{}\nQuestion: {}",
            attachment_note(attachment_refs),
            question
        );
        self.generate(prompt).await
    }

    async fn summarize(
        &self,
        ctx: DiscussionContext<'_>,
        attachment_refs: &[String],
    ) -> Result<String> {
        let prompt = format!(
            "Summarize this deliberation: the main points raised, the areas of \
             agreement and disagreement, and the decisions reached.{}\n{}",
            attachment_note(attachment_refs),
            context_block(&ctx)
        );
        self.generate(prompt).await
    }

    async fn facilitate(&self, ctx: DiscussionContext<'_>) -> Result<String> {
        let prompt = format!(
            "You are facilitating a group deliberation. Based on the discussion \
             below, write one short intervention that moves the group forward: \
             surface an unheard perspective, or ask a clarifying question.\n{}",
            context_block(&ctx)
        );
        self.generate(prompt).await
    }

    async fn progress(
        &self,
        ctx: DiscussionContext<'_>,
        attachment_refs: &[String],
    ) -> Result<String> {
        let prompt = format!(
            "Assess how this deliberation is progressing: what has been settled, \
             what remains open, and what should be discussed next.{}\n{}",
            attachment_note(attachment_refs),
            context_block(&ctx)
        );
        self.generate(prompt).await
    }
}
