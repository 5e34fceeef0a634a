//! In-memory state store used by tests and single-process deployments.
//!
//! The per-room lock is a `tokio::sync::Mutex` held by the transaction for
//! its whole lifetime, which gives the same total order of mutations per
//! room that the Postgres row lock gives across processes. Mutations are
//! staged on the transaction and only applied to the shared maps on commit,
//! so dropping a transaction rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use agora_types::models::{PushSubscription, Room, StoredMessage};

use crate::{RoomTx, StateStore};

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    data: StdMutex<Data>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

#[derive(Default)]
struct Data {
    rooms: HashMap<String, Room>,
    /// Room ids in creation order, matching the created_at ordering the
    /// Postgres backend returns.
    room_order: Vec<String>,
    /// Per-room messages in insertion order.
    messages: HashMap<String, Vec<StoredMessage>>,
    subscriptions: Vec<PushSubscription>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut Data) -> T) -> Result<T> {
        let mut data = self
            .shared
            .data
            .lock()
            .map_err(|e| anyhow!("store lock poisoned: {}", e))?;
        Ok(f(&mut data))
    }

    fn room_lock(&self, room_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .shared
            .locks
            .lock()
            .map_err(|e| anyhow!("store lock poisoned: {}", e))?;
        Ok(locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_room(&self, room: &Room) -> Result<()> {
        let room = room.clone();
        self.with_data(|data| {
            data.messages.entry(room.room_id.clone()).or_default();
            if data.rooms.insert(room.room_id.clone(), room.clone()).is_none() {
                data.room_order.push(room.room_id);
            }
        })
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.with_data(|data| data.rooms.get(room_id).cloned())
    }

    async fn list_rooms(&self) -> Result<Vec<Room>> {
        self.with_data(|data| {
            data.room_order
                .iter()
                .filter_map(|id| data.rooms.get(id).cloned())
                .collect()
        })
    }

    async fn delete_room(&self, room_id: &str) -> Result<bool> {
        // Take the room lock so the cascade cannot race a writer transaction.
        let lock = self.room_lock(room_id)?;
        let _guard = lock.lock().await;
        self.with_data(|data| {
            data.messages.remove(room_id);
            data.subscriptions.retain(|s| s.room_id != room_id);
            data.room_order.retain(|id| id != room_id);
            data.rooms.remove(room_id).is_some()
        })
    }

    async fn list_messages(&self, room_id: &str) -> Result<Vec<StoredMessage>> {
        self.with_data(|data| {
            let mut messages = data.messages.get(room_id).cloned().unwrap_or_default();
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            messages
        })
    }

    async fn list_subscriptions(&self, room_id: &str) -> Result<Vec<PushSubscription>> {
        self.with_data(|data| {
            data.subscriptions
                .iter()
                .filter(|s| s.room_id == room_id)
                .cloned()
                .collect()
        })
    }

    async fn upsert_subscription(&self, sub: &PushSubscription) -> Result<()> {
        let sub = sub.clone();
        self.with_data(|data| {
            if let Some(existing) = data
                .subscriptions
                .iter_mut()
                .find(|s| s.endpoint == sub.endpoint && s.room_id == sub.room_id)
            {
                existing.username = sub.username;
                existing.keys = sub.keys;
            } else {
                data.subscriptions.push(sub);
            }
        })
    }

    async fn begin_room(&self, room_id: &str) -> Result<Option<Box<dyn RoomTx>>> {
        let lock = self.room_lock(room_id)?;
        let guard = lock.lock_owned().await;

        let room = self.with_data(|data| data.rooms.get(room_id).cloned())?;
        let Some(room) = room else {
            return Ok(None);
        };

        Ok(Some(Box::new(MemoryRoomTx {
            store: self.clone(),
            _guard: guard,
            room,
            staged: Vec::new(),
        })))
    }
}

enum StagedOp {
    Insert(StoredMessage),
    Update(StoredMessage),
    Delete(String),
}

struct MemoryRoomTx {
    store: MemoryStore,
    _guard: OwnedMutexGuard<()>,
    room: Room,
    staged: Vec<StagedOp>,
}

impl MemoryRoomTx {
    /// Committed messages with staged operations overlaid, in created_at order.
    fn effective_messages(&self) -> Result<Vec<StoredMessage>> {
        let mut messages = self
            .store
            .with_data(|data| data.messages.get(&self.room.room_id).cloned())?
            .unwrap_or_default();
        for op in &self.staged {
            apply_op(&mut messages, op);
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

fn apply_op(messages: &mut Vec<StoredMessage>, op: &StagedOp) {
    match op {
        StagedOp::Insert(m) => messages.push(m.clone()),
        StagedOp::Update(m) => {
            if let Some(slot) = messages.iter_mut().find(|x| x.message_id == m.message_id) {
                *slot = m.clone();
            }
        }
        StagedOp::Delete(id) => messages.retain(|x| &x.message_id != id),
    }
}

#[async_trait]
impl RoomTx for MemoryRoomTx {
    fn room(&self) -> &Room {
        &self.room
    }

    fn room_mut(&mut self) -> &mut Room {
        &mut self.room
    }

    async fn get_message(&mut self, message_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .effective_messages()?
            .into_iter()
            .find(|m| m.message_id == message_id))
    }

    async fn insert_message(&mut self, message: &StoredMessage) -> Result<()> {
        self.staged.push(StagedOp::Insert(message.clone()));
        Ok(())
    }

    async fn update_message(&mut self, message: &StoredMessage) -> Result<()> {
        self.staged.push(StagedOp::Update(message.clone()));
        Ok(())
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        self.staged.push(StagedOp::Delete(message_id.to_string()));
        Ok(())
    }

    async fn list_messages(&mut self) -> Result<Vec<StoredMessage>> {
        self.effective_messages()
    }

    async fn list_subscriptions(&mut self) -> Result<Vec<PushSubscription>> {
        let room_id = self.room.room_id.clone();
        self.store.with_data(|data| {
            data.subscriptions
                .iter()
                .filter(|s| s.room_id == room_id)
                .cloned()
                .collect()
        })
    }

    async fn find_summary_message(&mut self) -> Result<Option<StoredMessage>> {
        Ok(self.effective_messages()?.into_iter().find(|m| m.is_summary()))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.store.with_data(|data| {
            data.rooms.insert(self.room.room_id.clone(), self.room.clone());
            let messages = data.messages.entry(self.room.room_id.clone()).or_default();
            for op in &self.staged {
                apply_op(messages, op);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::models::Room;

    #[tokio::test]
    async fn drop_without_commit_rolls_back() {
        let store = MemoryStore::new();
        store.create_room(&Room::new("r1", "topic")).await.unwrap();

        {
            let mut tx = store.begin_room("r1").await.unwrap().unwrap();
            tx.insert_message(&StoredMessage::new("r1", "A", "hello", "意見"))
                .await
                .unwrap();
            tx.room_mut().shared_note = "edited".into();
            // dropped here without commit
        }

        assert!(store.list_messages("r1").await.unwrap().is_empty());
        assert_eq!(store.get_room("r1").await.unwrap().unwrap().shared_note, "");
    }

    #[tokio::test]
    async fn staged_writes_visible_within_transaction() {
        let store = MemoryStore::new();
        store.create_room(&Room::new("r1", "topic")).await.unwrap();

        let mut tx = store.begin_room("r1").await.unwrap().unwrap();
        let msg = StoredMessage::new("r1", "A", "hello", "意見");
        tx.insert_message(&msg).await.unwrap();
        assert!(tx.get_message(&msg.message_id).await.unwrap().is_some());
        tx.delete_message(&msg.message_id).await.unwrap();
        assert!(tx.get_message(&msg.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn begin_room_serializes_writers() {
        let store = MemoryStore::new();
        store.create_room(&Room::new("r1", "topic")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let mut tx = store.begin_room("r1").await.unwrap().unwrap();
                    tx.room_mut().analytics.ensure_user("A").posts += 1;
                    tx.commit().await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let room = store.get_room("r1").await.unwrap().unwrap();
        assert_eq!(room.analytics.users["A"].posts, 100);
    }

    #[tokio::test]
    async fn list_rooms_returns_creation_order() {
        let store = MemoryStore::new();
        for id in ["zebra", "alpha", "mike"] {
            store.create_room(&Room::new(id, "t")).await.unwrap();
        }
        store.delete_room("alpha").await.unwrap();

        let ids: Vec<String> = store
            .list_rooms()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.room_id)
            .collect();
        assert_eq!(ids, ["zebra", "mike"]);
    }

    #[tokio::test]
    async fn delete_room_cascades() {
        let store = MemoryStore::new();
        store.create_room(&Room::new("r1", "topic")).await.unwrap();

        let mut tx = store.begin_room("r1").await.unwrap().unwrap();
        tx.insert_message(&StoredMessage::new("r1", "A", "hello", "意見"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        store
            .upsert_subscription(&PushSubscription {
                room_id: "r1".into(),
                username: "A".into(),
                endpoint: "https://push.example/1".into(),
                keys: agora_types::models::PushKeys {
                    p256dh: "k".into(),
                    auth: "a".into(),
                },
            })
            .await
            .unwrap();

        assert!(store.delete_room("r1").await.unwrap());
        assert!(store.get_room("r1").await.unwrap().is_none());
        assert!(store.list_messages("r1").await.unwrap().is_empty());
        assert!(store.list_subscriptions("r1").await.unwrap().is_empty());
        assert!(!store.delete_room("r1").await.unwrap());
    }

    #[tokio::test]
    async fn resubscribe_same_endpoint_updates_username() {
        let store = MemoryStore::new();
        let keys = agora_types::models::PushKeys { p256dh: "k".into(), auth: "a".into() };
        let sub = PushSubscription {
            room_id: "r1".into(),
            username: "A".into(),
            endpoint: "https://push.example/1".into(),
            keys: keys.clone(),
        };
        store.upsert_subscription(&sub).await.unwrap();
        store
            .upsert_subscription(&PushSubscription { username: "B".into(), ..sub })
            .await
            .unwrap();

        let subs = store.list_subscriptions("r1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].username, "B");
    }
}
