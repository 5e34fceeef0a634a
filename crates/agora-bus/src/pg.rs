//! Postgres event bus built on LISTEN/NOTIFY.
//!
//! NOTIFY payloads are capped at 8000 bytes, so events are not sent inline:
//! `publish` inserts the payload into `bus_events` and notifies the room
//! channel with the row id; each subscriber fetches the payload by id. The
//! notification and the insert commit together, so subscribers never see an
//! id before its row is visible. Presence lives in an UNLOGGED table; it is
//! rebuilt from live sessions and has no durability requirement.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::Row;
use tracing::{info, warn};

use crate::{BusStream, EventBus};

#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
}

fn channel_name(room_id: &str) -> String {
    format!("agora_room_{}", room_id)
}

impl PgBus {
    /// Ensure the bus tables exist and prune stale event rows.
    pub async fn connect(pool: PgPool) -> Result<Self> {
        sqlx::raw_sql(
            "
            CREATE TABLE IF NOT EXISTS bus_events (
                id           BIGSERIAL PRIMARY KEY,
                channel      TEXT NOT NULL,
                payload      JSONB NOT NULL,
                published_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE UNLOGGED TABLE IF NOT EXISTS bus_presence (
                room_id  TEXT NOT NULL,
                username TEXT NOT NULL,
                PRIMARY KEY (room_id, username)
            );
            ",
        )
        .execute(&pool)
        .await?;

        // Delivered events are only needed while a notification is in
        // flight; anything older than a day is garbage from past runs.
        let pruned = sqlx::query("DELETE FROM bus_events WHERE published_at < now() - interval '1 day'")
            .execute(&pool)
            .await?
            .rows_affected();
        if pruned > 0 {
            info!("Pruned {} stale bus events", pruned);
        }

        Ok(Self { pool })
    }
}

#[async_trait]
impl EventBus for PgBus {
    async fn publish(&self, room_id: &str, event: &Value) -> Result<()> {
        let channel = channel_name(room_id);
        sqlx::query(
            "WITH ev AS (
                 INSERT INTO bus_events (channel, payload) VALUES ($1, $2) RETURNING id
             )
             SELECT pg_notify($1, (SELECT id::text FROM ev))",
        )
        .bind(&channel)
        .bind(event)
        .fetch_one(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscribe(&self, room_id: &str) -> Result<Box<dyn BusStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&channel_name(room_id)).await?;
        Ok(Box::new(PgBusStream {
            listener,
            pool: self.pool.clone(),
        }))
    }

    async fn add_presence(&self, room_id: &str, username: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO bus_presence (room_id, username) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(room_id)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_presence(&self, room_id: &str, username: &str) -> Result<()> {
        sqlx::query("DELETE FROM bus_presence WHERE room_id = $1 AND username = $2")
            .bind(room_id)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_presence(&self, room_id: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT username FROM bus_presence WHERE room_id = $1 ORDER BY username")
                .bind(room_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("username").map_err(Into::into))
            .collect()
    }
}

struct PgBusStream {
    listener: PgListener,
    pool: PgPool,
}

#[async_trait]
impl BusStream for PgBusStream {
    async fn recv(&mut self) -> Result<Option<Value>> {
        loop {
            let notification = match self.listener.recv().await {
                Ok(n) => n,
                Err(e) => return Err(anyhow!("bus listener closed: {}", e)),
            };

            let id: i64 = match notification.payload().parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!("Ignoring malformed bus notification: {}", notification.payload());
                    continue;
                }
            };

            let row = sqlx::query("SELECT payload FROM bus_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => return Ok(Some(row.try_get("payload")?)),
                // Pruned before we got to it; skip rather than fail the reader.
                None => continue,
            }
        }
    }
}
