//! Room management, push subscription, assistance, and analytics endpoints.
//!
//! Everything real-time goes through the WebSocket route; these handlers
//! cover the JSON surface around it.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use agora_engine::{analytics, assist};
use agora_store::StateStore;
use agora_types::models::{PushSubscription, Room, RoomStatus};

use crate::ServerState;

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub topic: String,
}

#[derive(Debug, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub topic: String,
    pub status: RoomStatus,
}

impl From<&Room> for RoomInfo {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.room_id.clone(),
            topic: room.topic.clone(),
            status: room.status,
        }
    }
}

pub async fn create_room(
    State(state): State<ServerState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.topic.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let room_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let room = Room::new(room_id, req.topic.trim());
    state.hub.store().create_room(&room).await.map_err(|e| {
        error!("Failed to create room: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("Created room {} ({})", room.room_id, room.topic);
    Ok((StatusCode::CREATED, Json(RoomInfo::from(&room))))
}

pub async fn list_rooms(
    State(state): State<ServerState>,
) -> Result<impl IntoResponse, StatusCode> {
    let rooms = state.hub.store().list_rooms().await.map_err(|e| {
        error!("Failed to list rooms: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let infos: Vec<RoomInfo> = rooms.iter().map(RoomInfo::from).collect();
    Ok(Json(infos))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRoomRequest {
    pub password: String,
}

pub async fn delete_room(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Json(req): Json<DeleteRoomRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.password != *state.admin_password {
        return Err(StatusCode::FORBIDDEN);
    }

    let deleted = state.hub.store().delete_room(&room_id).await.map_err(|e| {
        error!("Failed to delete room {}: {:#}", room_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }

    info!("Deleted room {}", room_id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn subscribe(
    State(state): State<ServerState>,
    Json(sub): Json<PushSubscription>,
) -> Result<impl IntoResponse, StatusCode> {
    state.hub.store().upsert_subscription(&sub).await.map_err(|e| {
        error!("Failed to store subscription: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(StatusCode::CREATED)
}

pub async fn analytics(
    State(state): State<ServerState>,
) -> Result<impl IntoResponse, StatusCode> {
    let rooms = state.hub.store().list_rooms().await.map_err(|e| {
        error!("Failed to list rooms for analytics: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(analytics::aggregate(&rooms)))
}

#[derive(Debug, Deserialize)]
pub struct AssistRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct AssistResponse {
    pub content: String,
}

pub async fn facilitate(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Json(req): Json<AssistRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let view = assist::facilitate(&state.hub, &room_id, &req.username)
        .await
        .map_err(|e| {
            error!("Facilitation failed for room {}: {:#}", room_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(AssistResponse { content: view.content }))
}

pub async fn check_progress(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Json(req): Json<AssistRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let content = assist::check_progress(&state.hub, &room_id, &req.username)
        .await
        .map_err(|e| {
            error!("Progress check failed for room {}: {:#}", room_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(AssistResponse { content }))
}
