//! Push notification fan-out for new messages.

use tracing::{debug, warn};

use agora_bus::EventBus;
use agora_types::models::PushSubscription;

use crate::services::PushPayload;
use crate::RoomHub;

/// Notify subscribed users about a new message. The sender and everyone
/// currently connected to the room are skipped; they already see it live.
/// Delivery runs on a detached task and never blocks the writer loop.
pub(crate) async fn dispatch(
    hub: &RoomHub,
    room_id: &str,
    sender: &str,
    content: &str,
    subscriptions: Vec<PushSubscription>,
) {
    if subscriptions.is_empty() {
        return;
    }

    let present = match hub.bus().list_presence(room_id).await {
        Ok(present) => present,
        Err(e) => {
            warn!("Presence lookup failed for room {}: {:#}", room_id, e);
            return;
        }
    };

    let targets: Vec<PushSubscription> = subscriptions
        .into_iter()
        .filter(|s| s.username != sender && !present.contains(&s.username))
        .collect();
    if targets.is_empty() {
        return;
    }

    let payload = PushPayload {
        title: format!("New message from {}", sender),
        body: content.chars().take(100).collect(),
        url: format!("/room/{}", room_id),
    };

    let push = hub.push();
    tokio::spawn(async move {
        for sub in &targets {
            if let Err(e) = push.send(sub, &payload).await {
                debug!("Push to {} failed: {:#}", sub.username, e);
            }
        }
    });
}
