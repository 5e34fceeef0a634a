pub mod analytics;
pub mod assist;
pub mod history;
pub mod services;
pub mod session;

mod apply;
mod notify;

use std::sync::Arc;

use anyhow::Result;

use agora_bus::EventBus;
use agora_store::StateStore;
use agora_types::events::{ClientEvent, ServerEvent};

use crate::services::{AiService, MinutesExporter, PushDelivery};

/// Shared handles for every room session hosted by this process: the durable
/// store, the cross-process event bus, and the external services the engine
/// invokes as black boxes. Cloneable; store one in the server state.
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    ai: Arc<dyn AiService>,
    push: Arc<dyn PushDelivery>,
    exporter: Arc<dyn MinutesExporter>,
}

impl RoomHub {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        ai: Arc<dyn AiService>,
        push: Arc<dyn PushDelivery>,
        exporter: Arc<dyn MinutesExporter>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner { store, bus, ai, push, exporter }),
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.inner.store.as_ref()
    }

    pub fn bus(&self) -> &dyn EventBus {
        self.inner.bus.as_ref()
    }

    pub fn ai(&self) -> Arc<dyn AiService> {
        self.inner.ai.clone()
    }

    pub fn push(&self) -> Arc<dyn PushDelivery> {
        self.inner.push.clone()
    }

    pub fn exporter(&self) -> Arc<dyn MinutesExporter> {
        self.inner.exporter.clone()
    }

    /// Publish a broadcast event to the room's bus channel. The publishing
    /// session receives it back through its own subscription like everyone
    /// else; there is no local echo path.
    pub async fn publish(&self, room_id: &str, event: &ServerEvent) -> Result<()> {
        self.inner.bus.publish(room_id, &event.to_value()).await
    }

    /// Apply one client event under the room lock and broadcast the result.
    /// Unknown rooms and disallowed operations are ignored, not errors.
    pub async fn apply_event(
        &self,
        room_id: &str,
        username: &str,
        event: ClientEvent,
    ) -> Result<()> {
        apply::handle_event(self, room_id, username, event).await
    }
}
