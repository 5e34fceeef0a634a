pub mod memory;
pub mod pg;

pub use memory::MemoryBus;
pub use pg::PgBus;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Cross-process publish/subscribe channel keyed by room, plus the ephemeral
/// per-room presence roster (scoped to the bus, not the durable store).
///
/// Delivery is at-least-once to every process hosting subscribers of a room;
/// publish order is preserved per subscriber; there is no ordering guarantee
/// across rooms. Subscribers must tolerate duplicates, so every broadcast
/// event carries full resulting state rather than deltas.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, room_id: &str, event: &Value) -> Result<()>;

    /// Subscribe to a room's channel. The subscription ends when the returned
    /// stream is dropped.
    async fn subscribe(&self, room_id: &str) -> Result<Box<dyn BusStream>>;

    async fn add_presence(&self, room_id: &str, username: &str) -> Result<()>;

    async fn remove_presence(&self, room_id: &str, username: &str) -> Result<()>;

    async fn list_presence(&self, room_id: &str) -> Result<Vec<String>>;
}

/// A live subscription to one room's event channel.
#[async_trait]
pub trait BusStream: Send {
    /// Next event for the room. Blocks until an event arrives; returns
    /// `Ok(None)` when the channel is closed. There is no timeout; callers
    /// cancel by aborting the owning task.
    async fn recv(&mut self) -> Result<Option<Value>>;
}
