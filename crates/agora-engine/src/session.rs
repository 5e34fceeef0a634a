//! Per-connection room session: attach, concurrent reader/writer loops, and
//! teardown.
//!
//! The transport is abstracted behind [`EventSink`] / [`EventSource`] so the
//! session logic runs identically under an axum WebSocket and under the
//! channel-backed doubles the integration tests use.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use agora_bus::{BusStream, EventBus};
use agora_store::StateStore;
use agora_types::events::{ClientEvent, ServerEvent};

use crate::{history, RoomHub};

/// Outbound half of a client transport. Receives both direct replay events
/// and relayed bus broadcasts as already-serialized JSON values.
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn send(&mut self, event: Value) -> Result<()>;
}

/// Inbound half of a client transport. Yields raw text frames; `Ok(None)`
/// means the client disconnected cleanly.
#[async_trait]
pub trait EventSource: Send + 'static {
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// One attached client in one room.
pub struct RoomSession {
    hub: RoomHub,
    room_id: String,
    username: String,
}

impl RoomSession {
    pub fn new(hub: RoomHub, room_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hub,
            room_id: room_id.into(),
            username: username.into(),
        }
    }

    /// Drive the session to completion: attach, run the reader and writer
    /// loops until either side ends, then tear down.
    ///
    /// Closed rooms still accept sessions (read-only in practice: the writer
    /// loop ignores mutations the room status forbids).
    pub async fn run(
        self,
        mut sink: Box<dyn EventSink>,
        source: Box<dyn EventSource>,
    ) -> Result<()> {
        if self.hub.store().get_room(&self.room_id).await?.is_none() {
            bail!("room {} not found", self.room_id);
        }

        self.register_participant().await?;

        // Subscribe before announcing presence so this session sees its own
        // join broadcast; events published during replay queue up in the
        // stream and are relayed once the reader loop starts.
        let stream = self.hub.bus().subscribe(&self.room_id).await?;
        self.hub.bus().add_presence(&self.room_id, &self.username).await?;
        let roster = self.hub.bus().list_presence(&self.room_id).await?;
        self.hub
            .publish(&self.room_id, &ServerEvent::ParticipantUpdate { users: roster })
            .await?;

        // Replay reads the room fresh now that the subscription exists, so a
        // note or proposal edit committed during attach lands in exactly one
        // of the two paths, never in neither.
        history::replay(&self.hub, &self.room_id, sink.as_mut()).await?;

        info!("{} attached to room {}", self.username, self.room_id);

        let mut reader = tokio::spawn(reader_loop(stream, sink));
        let mut writer = tokio::spawn(writer_loop(
            self.hub.clone(),
            self.room_id.clone(),
            self.username.clone(),
            source,
        ));

        tokio::select! {
            _ = &mut reader => writer.abort(),
            _ = &mut writer => reader.abort(),
        }

        self.teardown().await;
        Ok(())
    }

    /// Make sure the user has an analytics entry before their first event.
    /// Re-checked under the lock: two simultaneous attaches for the same name
    /// must not clobber existing counters.
    async fn register_participant(&self) -> Result<()> {
        if let Some(mut tx) = self.hub.store().begin_room(&self.room_id).await? {
            if !tx.room().analytics.contains_user(&self.username) {
                tx.room_mut().analytics.ensure_user(&self.username);
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        info!("{} detached from room {}", self.username, self.room_id);

        if let Err(e) = self.hub.bus().remove_presence(&self.room_id, &self.username).await {
            warn!("Failed to remove presence for {}: {:#}", self.username, e);
            return;
        }
        let roster = match self.hub.bus().list_presence(&self.room_id).await {
            Ok(roster) => roster,
            Err(e) => {
                warn!("Failed to list presence for room {}: {:#}", self.room_id, e);
                return;
            }
        };
        // Nobody left to tell.
        if roster.is_empty() {
            return;
        }
        if let Err(e) = self
            .hub
            .publish(&self.room_id, &ServerEvent::ParticipantUpdate { users: roster })
            .await
        {
            warn!("Failed to broadcast roster for room {}: {:#}", self.room_id, e);
        }
    }
}

/// Relay bus broadcasts to the client until either side closes.
async fn reader_loop(mut stream: Box<dyn BusStream>, mut sink: Box<dyn EventSink>) {
    loop {
        match stream.recv().await {
            Ok(Some(event)) => {
                if let Err(e) = sink.send(event).await {
                    debug!("Client send failed, ending reader: {:#}", e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Bus receive failed, ending reader: {:#}", e);
                break;
            }
        }
    }
}

/// Parse and apply client frames until disconnect. Malformed frames and
/// per-event store errors are logged and skipped; the session stays up.
async fn writer_loop(
    hub: RoomHub,
    room_id: String,
    username: String,
    mut source: Box<dyn EventSource>,
) {
    loop {
        let text = match source.recv().await {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(e) => {
                debug!("Client receive failed, ending writer: {:#}", e);
                break;
            }
        };

        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!("Dropping malformed event from {}: {} ({})", username, e, preview);
                continue;
            }
        };

        if let Err(e) = hub.apply_event(&room_id, &username, event).await {
            warn!(
                "Failed to apply event from {} in room {}: {:#}",
                username, room_id, e
            );
        }
    }
}
