//! Best-effort push delivery over plain HTTP POST.
//!
//! Payloads are posted as JSON to the subscription's endpoint. VAPID signing
//! and payload encryption are left to a fronting push relay.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use agora_engine::services::{PushDelivery, PushPayload};
use agora_types::models::PushSubscription;

pub struct WebPushDelivery {
    client: reqwest::Client,
}

impl WebPushDelivery {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebPushDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushDelivery for WebPushDelivery {
    async fn send(&self, sub: &PushSubscription, payload: &PushPayload) -> Result<()> {
        self.client
            .post(&sub.endpoint)
            .header("TTL", "86400")
            .json(payload)
            .send()
            .await
            .context("push request failed")?
            .error_for_status()
            .context("push endpoint rejected request")?;
        Ok(())
    }
}
