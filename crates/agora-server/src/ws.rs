//! WebSocket transport: adapts a split axum socket to the engine's session
//! sink/source traits.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::info;

use agora_engine::session::{EventSink, EventSource, RoomSession};

use crate::ServerState;

pub async fn ws_upgrade(
    State(state): State<ServerState>,
    Path((room_id, username)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, username))
}

async fn handle_socket(socket: WebSocket, state: ServerState, room_id: String, username: String) {
    let (sender, receiver) = socket.split();
    let session = RoomSession::new(state.hub, room_id.clone(), username.clone());
    let result = session
        .run(Box::new(WsSink { sender }), Box::new(WsSource { receiver }))
        .await;
    if let Err(e) = result {
        // Typically a connection to a room that doesn't exist.
        info!("Session for {} in room {} refused: {:#}", username, room_id, e);
    }
}

struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&mut self, event: Value) -> Result<()> {
        self.sender
            .send(Message::Text(event.to_string().into()))
            .await
            .map_err(anyhow::Error::from)
    }
}

struct WsSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl EventSource for WsSource {
    async fn recv(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(text.to_string())),
                Ok(Message::Close(_)) => return Ok(None),
                // Pings and pongs are handled by axum; binary frames are not
                // part of the protocol.
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}
