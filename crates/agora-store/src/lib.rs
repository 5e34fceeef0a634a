pub mod memory;
pub mod migrations;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use anyhow::Result;
use async_trait::async_trait;

use agora_types::models::{PushSubscription, Room, StoredMessage};

/// Durable repository of rooms, messages, and push subscriptions.
///
/// `begin_room` is the single serialization point for all mutating
/// operations on a room: it acquires an exclusive per-room lock that holds
/// across processes for the full read-decide-write span of the returned
/// transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_room(&self, room: &Room) -> Result<()>;

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>>;

    async fn list_rooms(&self) -> Result<Vec<Room>>;

    /// Administrative delete; cascades to messages and subscriptions.
    /// Returns false if the room did not exist.
    async fn delete_room(&self, room_id: &str) -> Result<bool>;

    /// All messages for a room, ordered by creation timestamp.
    async fn list_messages(&self, room_id: &str) -> Result<Vec<StoredMessage>>;

    async fn list_subscriptions(&self, room_id: &str) -> Result<Vec<PushSubscription>>;

    /// Register a push endpoint. A re-subscribe with the same (endpoint,
    /// room) pair updates the username instead of inserting a duplicate.
    async fn upsert_subscription(&self, sub: &PushSubscription) -> Result<()>;

    /// Open a transactional unit with the room row locked for update.
    /// Returns `None` if the room does not exist. Dropping the transaction
    /// without committing rolls back every staged mutation.
    async fn begin_room(&self, room_id: &str) -> Result<Option<Box<dyn RoomTx>>>;
}

/// One locked transactional unit against a single room.
///
/// The room snapshot read under the lock is available through `room` /
/// `room_mut`; mutations to it are written back on `commit`. Message and
/// subscription operations are visible to later reads within the same
/// transaction but only become visible to other writers after `commit`.
#[async_trait]
pub trait RoomTx: Send {
    fn room(&self) -> &Room;

    fn room_mut(&mut self) -> &mut Room;

    /// Look up a message by id within this room.
    async fn get_message(&mut self, message_id: &str) -> Result<Option<StoredMessage>>;

    async fn insert_message(&mut self, message: &StoredMessage) -> Result<()>;

    /// Persist updated reactions / resolved flag / content of an existing message.
    async fn update_message(&mut self, message: &StoredMessage) -> Result<()>;

    async fn delete_message(&mut self, message_id: &str) -> Result<()>;

    /// All messages of the room ordered by creation timestamp.
    async fn list_messages(&mut self) -> Result<Vec<StoredMessage>>;

    async fn list_subscriptions(&mut self) -> Result<Vec<PushSubscription>>;

    /// The room's synthetic summary message, if one was ever generated.
    async fn find_summary_message(&mut self) -> Result<Option<StoredMessage>>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
