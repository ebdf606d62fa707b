use std::sync::Arc;
use std::time::Duration;

use huddle::groups::{room_group, GroupEvent, GroupLayer, LocalGroups};
use huddle::room::{DistributedLock, MemoryLockBackend, MemoryRoomStore, RoomRegistry};
use huddle::signaling::RoomHub;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Client {
    hub: RoomHub,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    outgoing: mpsc::UnboundedReceiver<Value>,
}

impl Client {
    async fn connect(registry: &Arc<RoomRegistry>, groups: &Arc<LocalGroups>, room: &str) -> Self {
        let (tx, outgoing) = mpsc::unbounded_channel();
        let groups: Arc<dyn GroupLayer> = groups.clone();
        let (hub, events) = RoomHub::connect(registry, groups, room, tx).await.unwrap();
        Self {
            hub,
            events,
            outgoing,
        }
    }

    async fn send(&mut self, message: Value) {
        self.hub.handle_text(&message.to_string()).await;
    }

    async fn authenticate(&mut self, user_id: &str, username: &str, password: &str) -> Value {
        self.send(json!({
            "type": "authentication",
            "user_id": user_id,
            "username": username,
            "password": password,
        }))
        .await;
        let replies = self.received();
        assert_eq!(replies.len(), 1, "expected one reply, got {:?}", replies);
        replies.into_iter().next().unwrap()
    }

    /// Routes pending group events and drains everything sent to the client.
    fn received(&mut self) -> Vec<Value> {
        while let Ok(event) = self.events.try_recv() {
            self.hub.handle_group_event(event);
        }
        let mut messages = Vec::new();
        while let Ok(message) = self.outgoing.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn disconnect(self) {
        self.hub.disconnect().await;
    }
}

fn setup() -> (Arc<RoomRegistry>, Arc<LocalGroups>) {
    setup_with_lock(DistributedLock::new(Arc::new(MemoryLockBackend::new())))
}

fn setup_with_lock(lock: DistributedLock) -> (Arc<RoomRegistry>, Arc<LocalGroups>) {
    let registry = Arc::new(RoomRegistry::new(
        Arc::new(MemoryRoomStore::new()),
        lock,
        "test",
    ));
    (registry, Arc::new(LocalGroups::new()))
}

async fn participant_ids(registry: &Arc<RoomRegistry>, room: &str) -> Vec<String> {
    let room = registry.service(room).get_room_info().await.unwrap().unwrap();
    room.participants.into_iter().map(|p| p.user_id).collect()
}

#[tokio::test]
async fn test_first_authentication_creates_room() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;

    let reply = alice.authenticate("u1", "alice", "pw").await;
    assert_eq!(reply["type"], "authentication");
    assert_eq!(reply["result"], true);
    assert_eq!(reply["data"][0]["user_id"], "u1");
    assert_eq!(reply["data"][0]["audio_on"], false);

    let room = registry.service("standup").get_room_info().await.unwrap().unwrap();
    assert_eq!(room.owner, "u1");
    assert_eq!(room.password.as_deref(), Some("pw"));
    assert!(alice.hub.is_authenticated());
}

#[tokio::test]
async fn test_join_is_not_announced() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "r3").await;
    let mut bob = Client::connect(&registry, &groups, "r3").await;

    let reply = alice.authenticate("u1", "alice", "").await;
    assert_eq!(reply["data"].as_array().unwrap().len(), 1);
    let reply = bob.authenticate("u2", "bob", "").await;
    assert_eq!(reply["data"][1]["user_id"], "u2");

    assert!(alice.received().is_empty());
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "pw").await;

    let reply = bob.authenticate("u2", "bob", "nope").await;
    assert_eq!(reply, json!({"type": "authentication", "result": false, "data": {}}));
    assert!(!bob.hub.is_authenticated());

    let room = registry.service("standup").get_room_info().await.unwrap().unwrap();
    assert_eq!(room.participants.len(), 1);
}

#[tokio::test]
async fn test_sdp_reaches_only_the_receiver() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    let mut carol = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "pw").await;
    let reply = bob.authenticate("u2", "bob", "pw").await;
    assert_eq!(reply["data"].as_array().unwrap().len(), 2);
    carol.authenticate("u3", "carol", "pw").await;

    let offer = json!({"type": "sendsdp", "sender": "u1", "receiver": "u2", "sdp": "v=0"});
    alice.send(offer.clone()).await;

    assert_eq!(bob.received(), vec![offer]);
    assert!(carol.received().is_empty());
    assert!(alice.received().is_empty());

    let answer = json!({"type": "answersdp", "sender": "u2", "receiver": "u1", "sdp": "v=0"});
    bob.send(answer.clone()).await;
    assert_eq!(alice.received(), vec![answer]);
    assert!(carol.received().is_empty());
}

#[tokio::test]
async fn test_candidate_relay_preserves_payload() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    let candidate = json!({
        "type": "sendcandidate",
        "sender": "u2",
        "receiver": "u1",
        "candidate": {"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host", "sdpMLineIndex": 0},
        "extra": "kept"
    });
    bob.send(candidate.clone()).await;
    assert_eq!(alice.received(), vec![candidate]);
    assert!(bob.received().is_empty());
}

#[tokio::test]
async fn test_stream_status_skips_the_sender() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    let mut lurker = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    let status = json!({"type": "streamstatus", "sender": "u1", "media": "audio", "status": true});
    alice.send(status.clone()).await;

    assert_eq!(bob.received(), vec![status]);
    assert!(alice.received().is_empty());
    assert!(lurker.received().is_empty());
}

#[tokio::test]
async fn test_notify_participant_reaches_everyone() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    let notice = json!({"type": "notifyparticipant", "user_id": "u2", "username": "bob"});
    bob.send(notice.clone()).await;

    assert_eq!(alice.received(), vec![notice.clone()]);
    assert_eq!(bob.received(), vec![notice]);
}

#[tokio::test]
async fn test_unauthenticated_connection_cannot_signal() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut stranger = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;

    stranger
        .send(json!({"type": "sendsdp", "sender": "u9", "receiver": "u1", "sdp": "v=0"}))
        .await;
    stranger
        .send(json!({"type": "notifyparticipant", "user_id": "u9", "username": "x"}))
        .await;
    assert!(alice.received().is_empty());

    alice
        .send(json!({"type": "sendsdp", "sender": "u1", "receiver": "u9", "sdp": "v=0"}))
        .await;
    assert!(stranger.received().is_empty());
}

#[tokio::test]
async fn test_connection_cannot_impersonate_another_user() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    bob.send(json!({"type": "sendsdp", "sender": "u3", "receiver": "u1", "sdp": "v=0"}))
        .await;
    bob.send(json!({"type": "streamstatus", "sender": "u1", "media": "video", "status": false}))
        .await;
    assert!(alice.received().is_empty());
}

#[tokio::test]
async fn test_garbage_frames_are_ignored() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    alice.hub.handle_text("not json").await;
    alice.hub.handle_text("[1,2,3]").await;
    alice.send(json!({"type": "dance"})).await;
    alice.send(json!({"type": "sendsdp"})).await;
    assert!(alice.received().is_empty());
    assert!(!alice.hub.is_authenticated());
}

#[tokio::test]
async fn test_disconnect_removes_participant_and_notifies() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    bob.disconnect().await;

    assert_eq!(
        alice.received(),
        vec![json!({"type": "userdisconnected", "user_id": "u2"})]
    );
    let room = registry.service("standup").get_room_info().await.unwrap().unwrap();
    let ids: Vec<_> = room.participants.iter().map(|p| p.user_id.as_str()).collect();
    assert_eq!(ids, vec!["u1"]);
    assert_eq!(groups.member_count(&room_group("standup")), 1);
}

#[tokio::test]
async fn test_unauthenticated_disconnect_is_silent() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let lurker = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;

    lurker.disconnect().await;
    assert!(alice.received().is_empty());
    assert_eq!(groups.member_count(&room_group("standup")), 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "one").await;
    let mut bob = Client::connect(&registry, &groups, "two").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    alice
        .send(json!({"type": "notifyparticipant", "user_id": "u1", "username": "alice"}))
        .await;
    assert!(bob.received().is_empty());
    assert_eq!(alice.received().len(), 1);
}

#[tokio::test]
async fn test_reauthentication_as_other_user_releases_previous() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut watcher = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    watcher.authenticate("u3", "carol", "").await;

    alice
        .send(json!({"type": "authentication", "user_id": "u2", "username": "bob", "password": ""}))
        .await;
    let replies = alice.received();
    assert_eq!(replies[0]["result"], true);
    let listed: Vec<_> = replies[0]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["user_id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec!["u3", "u2"]);
    assert_eq!(alice.hub.user_id(), Some("u2"));
    assert_eq!(
        watcher.received(),
        vec![json!({"type": "userdisconnected", "user_id": "u1"})]
    );
    assert_eq!(participant_ids(&registry, "standup").await, vec!["u3", "u2"]);

    alice.disconnect().await;
    assert_eq!(participant_ids(&registry, "standup").await, vec!["u3"]);
}

#[tokio::test]
async fn test_reauthentication_as_same_user_keeps_entry() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut watcher = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    watcher.authenticate("u3", "carol", "").await;

    let reply = alice.authenticate("u1", "alice", "").await;
    assert_eq!(reply["result"], true);
    assert!(watcher.received().is_empty());
    assert_eq!(participant_ids(&registry, "standup").await, vec!["u1", "u3"]);
}

#[tokio::test]
async fn test_dropped_hub_still_cleans_up() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    drop(bob);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        alice.received(),
        vec![json!({"type": "userdisconnected", "user_id": "u2"})]
    );
    assert_eq!(participant_ids(&registry, "standup").await, vec!["u1"]);
    assert_eq!(groups.member_count(&room_group("standup")), 1);
}

#[tokio::test]
async fn test_disconnect_after_room_dropped_still_notifies() {
    let (registry, groups) = setup();
    let mut alice = Client::connect(&registry, &groups, "standup").await;
    let mut bob = Client::connect(&registry, &groups, "standup").await;
    alice.authenticate("u1", "alice", "").await;
    bob.authenticate("u2", "bob", "").await;

    registry.service("standup").drop_room().await.unwrap();
    bob.disconnect().await;

    assert_eq!(
        alice.received(),
        vec![json!({"type": "userdisconnected", "user_id": "u2"})]
    );
    assert_eq!(groups.member_count(&room_group("standup")), 1);
    assert!(registry.service("standup").get_room_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_timeout_is_reported_on_socket() {
    let backend = Arc::new(MemoryLockBackend::new());
    let lock = DistributedLock::new(backend).with_blocking_timeout(Duration::from_millis(50));
    let (registry, groups) = setup_with_lock(lock.clone());
    let held = lock
        .acquire(&format!("lock:{}", registry.room_key("busy")))
        .await
        .unwrap();

    let mut alice = Client::connect(&registry, &groups, "busy").await;
    let reply = alice.authenticate("u1", "alice", "").await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "lock_timeout");
    assert!(!alice.hub.is_authenticated());

    held.release().await;
    let reply = alice.authenticate("u1", "alice", "").await;
    assert_eq!(reply["result"], true);
}
