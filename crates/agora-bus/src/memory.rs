//! In-process event bus for tests and single-process deployments.
//!
//! One `tokio::sync::broadcast` channel per room. Behavior is identical to
//! the Postgres bus from the engine's point of view: sessions publish and
//! receive their own events back through the subscription, never via a
//! local callback.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{BusStream, EventBus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<String, broadcast::Sender<Value>>,
    presence: HashMap<String, BTreeSet<String>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| anyhow!("bus lock poisoned: {}", e))?;
        Ok(f(&mut inner))
    }

    fn sender(&self, room_id: &str) -> Result<broadcast::Sender<Value>> {
        self.with_inner(|inner| {
            inner
                .channels
                .entry(room_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        })
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, room_id: &str, event: &Value) -> Result<()> {
        // send() errors when there are no subscribers; that's fine.
        let _ = self.sender(room_id)?.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self, room_id: &str) -> Result<Box<dyn BusStream>> {
        let rx = self.sender(room_id)?.subscribe();
        Ok(Box::new(MemoryBusStream { rx }))
    }

    async fn add_presence(&self, room_id: &str, username: &str) -> Result<()> {
        self.with_inner(|inner| {
            inner
                .presence
                .entry(room_id.to_string())
                .or_default()
                .insert(username.to_string());
        })
    }

    async fn remove_presence(&self, room_id: &str, username: &str) -> Result<()> {
        self.with_inner(|inner| {
            if let Some(users) = inner.presence.get_mut(room_id) {
                users.remove(username);
            }
        })
    }

    async fn list_presence(&self, room_id: &str) -> Result<Vec<String>> {
        self.with_inner(|inner| {
            inner
                .presence
                .get(room_id)
                .map(|users| users.iter().cloned().collect())
                .unwrap_or_default()
        })
    }
}

struct MemoryBusStream {
    rx: broadcast::Receiver<Value>,
}

#[async_trait]
impl BusStream for MemoryBusStream {
    async fn recv(&mut self) -> Result<Option<Value>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bus subscriber lagged by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let bus = MemoryBus::new();
        let mut sub_a = bus.subscribe("r1").await.unwrap();
        let mut sub_b = bus.subscribe("r1").await.unwrap();

        bus.publish("r1", &json!({"n": 1})).await.unwrap();
        bus.publish("r1", &json!({"n": 2})).await.unwrap();

        for sub in [&mut sub_a, &mut sub_b] {
            assert_eq!(sub.recv().await.unwrap().unwrap()["n"], 1);
            assert_eq!(sub.recv().await.unwrap().unwrap()["n"], 2);
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("r1").await.unwrap();

        bus.publish("r2", &json!({"other": true})).await.unwrap();
        bus.publish("r1", &json!({"mine": true})).await.unwrap();

        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event["mine"], true);
    }

    #[tokio::test]
    async fn presence_add_remove_list() {
        let bus = MemoryBus::new();
        bus.add_presence("r1", "A").await.unwrap();
        bus.add_presence("r1", "B").await.unwrap();
        bus.add_presence("r1", "A").await.unwrap(); // idempotent

        assert_eq!(bus.list_presence("r1").await.unwrap(), vec!["A", "B"]);

        bus.remove_presence("r1", "A").await.unwrap();
        assert_eq!(bus.list_presence("r1").await.unwrap(), vec!["B"]);
        assert!(bus.list_presence("r2").await.unwrap().is_empty());
    }
}
