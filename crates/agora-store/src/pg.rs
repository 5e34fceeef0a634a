//! Postgres state store.
//!
//! The per-room lock required by the engine is a plain row lock:
//! `begin_room` opens a transaction and selects the room row `FOR UPDATE`,
//! which serializes writer transactions for that room across every process
//! sharing the database. Dropping the transaction without committing rolls
//! back (sqlx rolls back unfinished transactions on drop).

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use agora_types::models::{
    PushKeys, PushSubscription, Room, RoomStatus, StoredMessage,
};

use crate::{RoomTx, StateStore, migrations};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ROOM_COLUMNS: &str = "room_id, topic, status, shared_note, proposals, analytics";
const MESSAGE_COLUMNS: &str = "message_id, room_id, username, content, stance, file_url, \
     original_filename, attachment_ref, reply_to_id, reactions, is_resolved, created_at";

fn room_from_row(row: &PgRow) -> Result<Room> {
    let status_raw: String = row.try_get("status")?;
    let status = RoomStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown room status: {}", status_raw))?;
    Ok(Room {
        room_id: row.try_get("room_id")?,
        topic: row.try_get("topic")?,
        status,
        shared_note: row.try_get("shared_note")?,
        proposals: serde_json::from_value(row.try_get("proposals")?)?,
        analytics: serde_json::from_value(row.try_get("analytics")?)?,
    })
}

fn message_from_row(row: &PgRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: row.try_get("message_id")?,
        room_id: row.try_get("room_id")?,
        username: row.try_get("username")?,
        content: row.try_get("content")?,
        stance: row.try_get("stance")?,
        file_url: row.try_get("file_url")?,
        original_filename: row.try_get("original_filename")?,
        attachment_ref: row.try_get("attachment_ref")?,
        reply_to_id: row.try_get("reply_to_id")?,
        reactions: serde_json::from_value(row.try_get("reactions")?)?,
        is_resolved: row.try_get("is_resolved")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<PushSubscription> {
    let keys: PushKeys = serde_json::from_value(row.try_get("keys")?)?;
    Ok(PushSubscription {
        room_id: row.try_get("room_id")?,
        username: row.try_get("username")?,
        endpoint: row.try_get("endpoint")?,
        keys,
    })
}

#[async_trait]
impl StateStore for PgStore {
    async fn create_room(&self, room: &Room) -> Result<()> {
        sqlx::query(
            "INSERT INTO rooms (room_id, topic, status, shared_note, proposals, analytics)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&room.room_id)
        .bind(&room.topic)
        .bind(room.status.as_str())
        .bind(&room.shared_note)
        .bind(serde_json::to_value(&room.proposals)?)
        .bind(serde_json::to_value(&room.analytics)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = $1"
        ))
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn list_rooms(&self) -> Result<Vec<Room>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(room_from_row).collect()
    }

    async fn delete_room(&self, room_id: &str) -> Result<bool> {
        // Messages and subscriptions cascade via their foreign keys.
        let result = sqlx::query("DELETE FROM rooms WHERE room_id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_messages(&self, room_id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 ORDER BY created_at"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_subscriptions(&self, room_id: &str) -> Result<Vec<PushSubscription>> {
        let rows = sqlx::query(
            "SELECT room_id, username, endpoint, keys FROM push_subscriptions WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn upsert_subscription(&self, sub: &PushSubscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO push_subscriptions (room_id, username, endpoint, keys)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (endpoint, room_id)
             DO UPDATE SET username = EXCLUDED.username, keys = EXCLUDED.keys",
        )
        .bind(&sub.room_id)
        .bind(&sub.username)
        .bind(&sub.endpoint)
        .bind(serde_json::to_value(&sub.keys)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_room(&self, room_id: &str) -> Result<Option<Box<dyn RoomTx>>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = $1 FOR UPDATE"
        ))
        .bind(room_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let room = room_from_row(&row)?;

        Ok(Some(Box::new(PgRoomTx { tx, room })))
    }
}

struct PgRoomTx {
    tx: Transaction<'static, Postgres>,
    room: Room,
}

#[async_trait]
impl RoomTx for PgRoomTx {
    fn room(&self) -> &Room {
        &self.room
    }

    fn room_mut(&mut self) -> &mut Room {
        &mut self.room
    }

    async fn get_message(&mut self, message_id: &str) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1 AND room_id = $2"
        ))
        .bind(message_id)
        .bind(&self.room.room_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn insert_message(&mut self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (message_id, room_id, username, content, stance, file_url,
                 original_filename, attachment_ref, reply_to_id, reactions, is_resolved, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&message.message_id)
        .bind(&message.room_id)
        .bind(&message.username)
        .bind(&message.content)
        .bind(&message.stance)
        .bind(&message.file_url)
        .bind(&message.original_filename)
        .bind(&message.attachment_ref)
        .bind(&message.reply_to_id)
        .bind(serde_json::to_value(&message.reactions)?)
        .bind(message.is_resolved)
        .bind(message.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_message(&mut self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET content = $3, reactions = $4, is_resolved = $5
             WHERE message_id = $1 AND room_id = $2",
        )
        .bind(&message.message_id)
        .bind(&message.room_id)
        .bind(&message.content)
        .bind(serde_json::to_value(&message.reactions)?)
        .bind(message.is_resolved)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE message_id = $1 AND room_id = $2")
            .bind(message_id)
            .bind(&self.room.room_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_messages(&mut self) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 ORDER BY created_at"
        ))
        .bind(&self.room.room_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list_subscriptions(&mut self) -> Result<Vec<PushSubscription>> {
        let rows = sqlx::query(
            "SELECT room_id, username, endpoint, keys FROM push_subscriptions WHERE room_id = $1",
        )
        .bind(&self.room.room_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn find_summary_message(&mut self) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 AND stance = $2"
        ))
        .bind(&self.room.room_id)
        .bind(agora_types::models::STANCE_SUMMARY)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET topic = $2, status = $3, shared_note = $4,
                 proposals = $5, analytics = $6
             WHERE room_id = $1",
        )
        .bind(&self.room.room_id)
        .bind(&self.room.topic)
        .bind(self.room.status.as_str())
        .bind(&self.room.shared_note)
        .bind(serde_json::to_value(&self.room.proposals)?)
        .bind(serde_json::to_value(&self.room.analytics)?)
        .execute(&mut *self.tx)
        .await?;

        self.tx.commit().await?;
        Ok(())
    }
}
