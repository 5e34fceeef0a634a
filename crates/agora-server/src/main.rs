use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agora_bus::{EventBus, MemoryBus, PgBus};
use agora_engine::RoomHub;
use agora_store::{MemoryStore, PgStore, StateStore};

mod ai;
mod minutes;
mod push;
mod rooms;
mod ws;

#[derive(Clone)]
struct ServerState {
    hub: RoomHub,
    admin_password: Arc<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let database_url = std::env::var("AGORA_DATABASE_URL").ok();
    let host = std::env::var("AGORA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("AGORA_PORT")
        .unwrap_or_else(|_| "8000".into())
        .parse()?;
    let ai_api_key = std::env::var("AGORA_AI_API_KEY").unwrap_or_default();
    let minutes_dir =
        PathBuf::from(std::env::var("AGORA_MINUTES_DIR").unwrap_or_else(|_| "minutes".into()));
    let admin_password =
        std::env::var("AGORA_ADMIN_PASSWORD").unwrap_or_else(|_| "change-me".into());

    if ai_api_key.is_empty() {
        warn!("AGORA_AI_API_KEY not set; AI calls will fail and be replaced by error text");
    }

    // Store and bus: Postgres when configured, in-process otherwise
    let (store, bus): (Arc<dyn StateStore>, Arc<dyn EventBus>) = match database_url {
        Some(url) => {
            let store = PgStore::connect(&url).await?;
            let bus = PgBus::connect(store.pool().clone()).await?;
            info!("Using Postgres store and bus");
            (Arc::new(store), Arc::new(bus))
        }
        None => {
            info!("AGORA_DATABASE_URL not set; using in-process store and bus");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryBus::new()))
        }
    };

    tokio::fs::create_dir_all(&minutes_dir).await?;

    let hub = RoomHub::new(
        store,
        bus,
        Arc::new(ai::GeminiAi::new(ai_api_key)),
        Arc::new(push::WebPushDelivery::new()),
        Arc::new(minutes::CsvMinutesExporter::new(minutes_dir.clone())),
    );

    let state = ServerState {
        hub,
        admin_password: Arc::new(admin_password),
    };

    // Routes
    let app = Router::new()
        .route("/rooms", post(rooms::create_room))
        .route("/rooms", get(rooms::list_rooms))
        .route("/rooms/{room_id}/delete", post(rooms::delete_room))
        .route("/subscribe", post(rooms::subscribe))
        .route("/api/analytics", get(rooms::analytics))
        .route("/facilitate/{room_id}", post(rooms::facilitate))
        .route("/check_progress/{room_id}", post(rooms::check_progress))
        .route("/ws/{room_id}/{username}", get(ws::ws_upgrade))
        .nest_service("/minutes", ServeDir::new(minutes_dir))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Agora server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
