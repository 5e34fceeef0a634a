//! End-to-end engine tests over the in-memory store and bus, with channel
//! transports standing in for WebSockets and scripted service doubles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use agora_bus::{BusStream, EventBus, MemoryBus};
use agora_engine::services::{AiService, DiscussionContext, MinutesExporter, PushDelivery, PushPayload};
use agora_engine::session::{EventSink, EventSource, RoomSession};
use agora_engine::RoomHub;
use agora_store::{MemoryStore, RoomTx, StateStore};
use agora_types::events::ClientEvent;
use agora_types::models::{
    PushKeys, PushSubscription, ReactionKind, Room, RoomStatus, StoredMessage, SummaryPayload,
    AI_USERNAME, STANCE_AI_QUESTION, STANCE_PROPOSAL, STANCE_SUMMARY, SYSTEM_USERNAME,
};

struct ScriptedAi;

#[async_trait]
impl AiService for ScriptedAi {
    async fn answer(&self, question: &str, _refs: &[String]) -> Result<String> {
        Ok(format!("Answer to: {question}"))
    }

    async fn summarize(&self, ctx: DiscussionContext<'_>, _refs: &[String]) -> Result<String> {
        Ok(format!("Summary of {} messages", ctx.messages.len()))
    }

    async fn facilitate(&self, _ctx: DiscussionContext<'_>) -> Result<String> {
        Ok("Let's hear from those who haven't spoken yet.".into())
    }

    async fn progress(&self, ctx: DiscussionContext<'_>, _refs: &[String]) -> Result<String> {
        Ok(format!("{} messages so far", ctx.messages.len()))
    }
}

#[derive(Clone, Default)]
struct RecordingPush {
    sent: Arc<Mutex<Vec<String>>>,
}

impl RecordingPush {
    fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushDelivery for RecordingPush {
    async fn send(&self, sub: &PushSubscription, _payload: &PushPayload) -> Result<()> {
        self.sent.lock().unwrap().push(sub.username.clone());
        Ok(())
    }
}

struct StubExporter;

#[async_trait]
impl MinutesExporter for StubExporter {
    async fn render_minutes(
        &self,
        _messages: &[StoredMessage],
        _topic: &str,
        _participants: &[String],
    ) -> Result<String> {
        Ok("/minutes/test.csv".into())
    }
}

struct ChannelSink(mpsc::UnboundedSender<Value>);

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: Value) -> Result<()> {
        self.0.send(event).map_err(|_| anyhow!("client gone"))
    }
}

struct ChannelSource(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl EventSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.0.recv().await)
    }
}

/// Store wrapper that commits a note edit right after the first room read,
/// standing in for a writer on another process landing mid-attach.
struct RacingNoteStore {
    inner: MemoryStore,
    fired: AtomicBool,
}

#[async_trait]
impl StateStore for RacingNoteStore {
    async fn create_room(&self, room: &Room) -> Result<()> {
        self.inner.create_room(room).await
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let room = self.inner.get_room(room_id).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(mut tx) = self.inner.begin_room(room_id).await? {
                tx.room_mut().shared_note = "edited mid-attach".into();
                tx.commit().await?;
            }
        }
        Ok(room)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>> {
        self.inner.list_rooms().await
    }

    async fn delete_room(&self, room_id: &str) -> Result<bool> {
        self.inner.delete_room(room_id).await
    }

    async fn list_messages(&self, room_id: &str) -> Result<Vec<StoredMessage>> {
        self.inner.list_messages(room_id).await
    }

    async fn list_subscriptions(&self, room_id: &str) -> Result<Vec<PushSubscription>> {
        self.inner.list_subscriptions(room_id).await
    }

    async fn upsert_subscription(&self, sub: &PushSubscription) -> Result<()> {
        self.inner.upsert_subscription(sub).await
    }

    async fn begin_room(&self, room_id: &str) -> Result<Option<Box<dyn RoomTx>>> {
        self.inner.begin_room(room_id).await
    }
}

struct Harness {
    hub: RoomHub,
    store: MemoryStore,
    bus: MemoryBus,
    push: RecordingPush,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let bus = MemoryBus::new();
    let push = RecordingPush::default();
    let hub = RoomHub::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        Arc::new(ScriptedAi),
        Arc::new(push.clone()),
        Arc::new(StubExporter),
    );
    Harness { hub, store, bus, push }
}

fn message_event(stance: &str, content: &str) -> ClientEvent {
    ClientEvent::Message {
        stance: stance.into(),
        content: content.into(),
        reply_to_id: None,
        file_url: None,
        original_filename: None,
        attachment_ref: None,
    }
}

fn subscription(room_id: &str, username: &str) -> PushSubscription {
    PushSubscription {
        room_id: room_id.into(),
        username: username.into(),
        endpoint: format!("https://push.example/{username}"),
        keys: PushKeys { p256dh: "k".into(), auth: "a".into() },
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("transport closed")
}

/// Poll until `check` passes or two seconds elapse.
async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

async fn wait_for_messages(store: &MemoryStore, room_id: &str, count: usize) -> Vec<StoredMessage> {
    for _ in 0..200 {
        let messages = store.list_messages(room_id).await.unwrap();
        if messages.len() >= count {
            return messages;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room_id} never reached {count} messages");
}

#[tokio::test]
async fn attach_replays_history_then_relays_live_events() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "budget")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "first")).await.unwrap();
    h.hub.apply_event("r1", "B", message_event("question", "second")).await.unwrap();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let (source_tx, source_rx) = mpsc::unbounded_channel();
    let session = RoomSession::new(h.hub.clone(), "r1", "C");
    let handle = tokio::spawn(session.run(
        Box::new(ChannelSink(sink_tx)),
        Box::new(ChannelSource(source_rx)),
    ));

    let first = next_event(&mut sink_rx).await;
    assert_eq!(first["type"], "history");
    assert_eq!(first["content"], "first");
    let second = next_event(&mut sink_rx).await;
    assert_eq!(second["type"], "history");
    assert_eq!(second["content"], "second");
    assert_eq!(next_event(&mut sink_rx).await["type"], "note_initial_state");
    assert_eq!(next_event(&mut sink_rx).await["type"], "proposal_form_initial_state");

    // The join broadcast was queued during replay and is relayed first.
    let roster = next_event(&mut sink_rx).await;
    assert_eq!(roster["type"], "participant_update");
    assert_eq!(roster["users"], json!(["C"]));

    // A live frame comes back through the bus, not a local echo.
    source_tx
        .send(json!({"type": "message", "stance": "opinion", "content": "hello"}).to_string())
        .unwrap();
    let live = next_event(&mut sink_rx).await;
    assert_eq!(live["type"], "message");
    assert_eq!(live["username"], "C");
    assert_eq!(live["content"], "hello");

    drop(source_tx);
    handle.await.unwrap().unwrap();
    assert!(h.bus.list_presence("r1").await.unwrap().is_empty());

    let messages = h.store.list_messages("r1").await.unwrap();
    assert_eq!(messages.len(), 3);
    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.analytics.users["C"].posts, 1);
}

#[tokio::test]
async fn replay_substitutes_summary_event_for_summary_message() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();

    let mut tx = h.store.begin_room("r1").await.unwrap().unwrap();
    tx.insert_message(&StoredMessage::new("r1", "A", "hello", "opinion")).await.unwrap();
    let payload = SummaryPayload {
        content: "We agreed.".into(),
        minutes_url: Some("/minutes/test.csv".into()),
    };
    tx.insert_message(&StoredMessage::new(
        "r1",
        SYSTEM_USERNAME,
        serde_json::to_string(&payload).unwrap(),
        STANCE_SUMMARY,
    ))
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let (source_tx, source_rx) = mpsc::unbounded_channel();
    let session = RoomSession::new(h.hub.clone(), "r1", "B");
    let handle = tokio::spawn(session.run(
        Box::new(ChannelSink(sink_tx)),
        Box::new(ChannelSource(source_rx)),
    ));

    assert_eq!(next_event(&mut sink_rx).await["type"], "history");
    let summary = next_event(&mut sink_rx).await;
    assert_eq!(summary["type"], "summary");
    assert_eq!(summary["content"], "We agreed.");
    assert_eq!(summary["minutes_url"], "/minutes/test.csv");

    drop(source_tx);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn replay_sees_edits_committed_during_attach() {
    let inner = MemoryStore::new();
    inner.create_room(&Room::new("r1", "t")).await.unwrap();
    let store = RacingNoteStore { inner, fired: AtomicBool::new(false) };
    let hub = RoomHub::new(
        Arc::new(store),
        Arc::new(MemoryBus::new()),
        Arc::new(ScriptedAi),
        Arc::new(RecordingPush::default()),
        Arc::new(StubExporter),
    );

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let (source_tx, source_rx) = mpsc::unbounded_channel();
    let session = RoomSession::new(hub, "r1", "A");
    let handle = tokio::spawn(session.run(
        Box::new(ChannelSink(sink_tx)),
        Box::new(ChannelSource(source_rx)),
    ));

    // The note committed between the existence check and the subscription
    // must still reach the client, through replay's own room read.
    let note = next_event(&mut sink_rx).await;
    assert_eq!(note["type"], "note_initial_state");
    assert_eq!(note["content"], "edited mid-attach");

    drop(source_tx);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn attaching_to_unknown_room_fails() {
    let h = harness();
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
    let (_source_tx, source_rx) = mpsc::unbounded_channel();

    let session = RoomSession::new(h.hub.clone(), "nope", "A");
    let result = session
        .run(Box::new(ChannelSink(sink_tx)), Box::new(ChannelSource(source_rx)))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reaction_toggles_off_and_switches_atomically() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();
    let id = h.store.list_messages("r1").await.unwrap()[0].message_id.clone();

    let react = |kind| ClientEvent::Reaction { message_id: id.clone(), reaction: kind };

    h.hub.apply_event("r1", "B", react(ReactionKind::Agree)).await.unwrap();
    let msg = &h.store.list_messages("r1").await.unwrap()[0];
    assert_eq!(msg.reactions.agree, vec!["B"]);

    // Switching kinds never leaves B counted twice.
    h.hub.apply_event("r1", "B", react(ReactionKind::Disagree)).await.unwrap();
    let msg = &h.store.list_messages("r1").await.unwrap()[0];
    assert!(msg.reactions.agree.is_empty());
    assert_eq!(msg.reactions.disagree, vec!["B"]);
    assert_eq!(msg.reactions.total(), 1);

    // Re-applying the held kind removes it.
    h.hub.apply_event("r1", "B", react(ReactionKind::Disagree)).await.unwrap();
    let msg = &h.store.list_messages("r1").await.unwrap()[0];
    assert_eq!(msg.reactions.total(), 0);

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    let given = &room.analytics.users["B"].reactions_given;
    assert_eq!((given.agree, given.partial, given.disagree), (0, 0, 0));
    let received = &room.analytics.users["A"].reactions_received;
    assert_eq!((received.agree, received.partial, received.disagree), (0, 0, 0));
}

#[tokio::test]
async fn reaction_updates_author_counters() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();
    let id = h.store.list_messages("r1").await.unwrap()[0].message_id.clone();

    h.hub
        .apply_event("r1", "B", ClientEvent::Reaction {
            message_id: id,
            reaction: ReactionKind::Partial,
        })
        .await
        .unwrap();

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.analytics.users["B"].reactions_given.partial, 1);
    assert_eq!(room.analytics.users["A"].reactions_received.partial, 1);
}

#[tokio::test]
async fn delete_by_author_restores_counters() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();
    let id = h.store.list_messages("r1").await.unwrap()[0].message_id.clone();

    // Someone else's delete is ignored.
    h.hub
        .apply_event("r1", "B", ClientEvent::DeleteMessage { message_id: id.clone() })
        .await
        .unwrap();
    assert_eq!(h.store.list_messages("r1").await.unwrap().len(), 1);

    h.hub
        .apply_event("r1", "A", ClientEvent::DeleteMessage { message_id: id })
        .await
        .unwrap();
    assert!(h.store.list_messages("r1").await.unwrap().is_empty());

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    let stats = &room.analytics.users["A"];
    assert_eq!(stats.posts, 0);
    assert_eq!(stats.stances.get("opinion"), Some(&0));
}

#[tokio::test]
async fn only_proposals_can_be_resolved() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event(STANCE_PROPOSAL, "plan")).await.unwrap();

    let messages = h.store.list_messages("r1").await.unwrap();
    for msg in &messages {
        h.hub
            .apply_event("r1", "B", ClientEvent::ResolveProposal {
                message_id: msg.message_id.clone(),
            })
            .await
            .unwrap();
    }

    let messages = h.store.list_messages("r1").await.unwrap();
    let by_stance = |s: &str| messages.iter().find(|m| m.stance == s).unwrap();
    assert!(!by_stance("opinion").is_resolved);
    assert!(by_stance(STANCE_PROPOSAL).is_resolved);
}

#[tokio::test]
async fn reply_snippet_resolved_and_dangling_reference_dropped() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "parent")).await.unwrap();
    let parent_id = h.store.list_messages("r1").await.unwrap()[0].message_id.clone();

    let mut sub = h.bus.subscribe("r1").await.unwrap();

    h.hub
        .apply_event("r1", "B", ClientEvent::Message {
            stance: "question".into(),
            content: "really?".into(),
            reply_to_id: Some(parent_id.clone()),
            file_url: None,
            original_filename: None,
            attachment_ref: None,
        })
        .await
        .unwrap();
    let event = sub.recv().await.unwrap().unwrap();
    assert_eq!(event["reply_to"]["id"], parent_id.as_str());
    assert_eq!(event["reply_to"]["content"], "parent");

    h.hub
        .apply_event("r1", "B", ClientEvent::Message {
            stance: "question".into(),
            content: "reply to nothing".into(),
            reply_to_id: Some("missing".into()),
            file_url: None,
            original_filename: None,
            attachment_ref: None,
        })
        .await
        .unwrap();
    let event = sub.recv().await.unwrap().unwrap();
    assert_eq!(event["reply_to"], Value::Null);

    let stored = h.store.list_messages("r1").await.unwrap();
    assert_eq!(stored[2].reply_to_id, None);
}

#[tokio::test]
async fn ai_question_stores_and_broadcasts_an_answer() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    let mut sub = h.bus.subscribe("r1").await.unwrap();

    h.hub
        .apply_event("r1", "A", message_event(STANCE_AI_QUESTION, "what next?"))
        .await
        .unwrap();

    let first = sub.recv().await.unwrap().unwrap();
    assert_eq!(first["type"], "message");
    let second = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(second["type"], "ai_response");
    assert_eq!(second["username"], AI_USERNAME);
    assert_eq!(second["content"], "Answer to: what next?");

    let messages = wait_for_messages(&h.store, "r1", 2).await;
    assert_eq!(messages[1].username, AI_USERNAME);
}

#[tokio::test]
async fn finish_closes_room_and_upserts_summary() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();

    h.hub.apply_event("r1", "A", ClientEvent::Finish).await.unwrap();

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.status, RoomStatus::Closed);

    let messages = wait_for_messages(&h.store, "r1", 2).await;
    let summary = messages.iter().find(|m| m.is_summary()).unwrap();
    let payload: SummaryPayload = serde_json::from_str(&summary.content).unwrap();
    assert_eq!(payload.content, "Summary of 1 messages");
    assert_eq!(payload.minutes_url.as_deref(), Some("/minutes/test.csv"));

    // A second finish regenerates in place instead of appending.
    h.hub.apply_event("r1", "A", ClientEvent::Finish).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    let messages = h.store.list_messages("r1").await.unwrap();
    assert_eq!(messages.iter().filter(|m| m.is_summary()).count(), 1);
}

#[tokio::test]
async fn closed_room_ignores_note_and_form_updates() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub
        .apply_event("r1", "A", ClientEvent::NoteUpdate { content: "draft".into() })
        .await
        .unwrap();
    h.hub.apply_event("r1", "A", ClientEvent::Finish).await.unwrap();

    h.hub
        .apply_event("r1", "A", ClientEvent::NoteUpdate { content: "late edit".into() })
        .await
        .unwrap();
    h.hub
        .apply_event("r1", "A", ClientEvent::ProposalFormUpdate { proposals: vec![Default::default()] })
        .await
        .unwrap();

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.shared_note, "draft");
    assert!(room.proposals.is_empty());
}

#[tokio::test]
async fn push_skips_sender_and_connected_users() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    for user in ["A", "B", "C"] {
        h.store.upsert_subscription(&subscription("r1", user)).await.unwrap();
    }
    h.bus.add_presence("r1", "B").await.unwrap();

    h.hub.apply_event("r1", "A", message_event("opinion", "ping")).await.unwrap();

    let push = h.push.clone();
    wait_for(|| !push.recipients().is_empty()).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.push.recipients(), vec!["C"]);
}

#[tokio::test]
async fn concurrent_writers_all_commit() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();

    let mut handles = Vec::new();
    for user in ["A", "B", "C", "D"] {
        let hub = h.hub.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                hub.apply_event("r1", user, message_event("opinion", &format!("{user}-{i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(h.store.list_messages("r1").await.unwrap().len(), 40);
    let room = h.store.get_room("r1").await.unwrap().unwrap();
    for user in ["A", "B", "C", "D"] {
        assert_eq!(room.analytics.users[user].posts, 10);
    }
}

#[tokio::test]
async fn facilitate_stores_and_broadcasts_ai_message() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    let mut sub = h.bus.subscribe("r1").await.unwrap();

    let view = agora_engine::assist::facilitate(&h.hub, "r1", "A").await.unwrap().unwrap();
    assert_eq!(view.username, AI_USERNAME);

    let event = sub.recv().await.unwrap().unwrap();
    assert_eq!(event["type"], "message");
    assert_eq!(event["stance"], "facilitation");

    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.analytics.users["A"].facilitator_uses, 1);
    assert!(agora_engine::assist::facilitate(&h.hub, "missing", "A").await.unwrap().is_none());
}

#[tokio::test]
async fn check_progress_returns_text_without_broadcasting() {
    let h = harness();
    h.store.create_room(&Room::new("r1", "t")).await.unwrap();
    h.hub.apply_event("r1", "A", message_event("opinion", "x")).await.unwrap();

    let text = agora_engine::assist::check_progress(&h.hub, "r1", "B").await.unwrap().unwrap();
    assert_eq!(text, "1 messages so far");

    // Counter bumped, no message stored.
    let room = h.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.analytics.users["B"].progress_check_uses, 1);
    assert_eq!(h.store.list_messages("r1").await.unwrap().len(), 1);
}
