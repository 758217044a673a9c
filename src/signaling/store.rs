//! Signaling over a shared document store.
//!
//! Each room holds a set of participant documents and an append-only log of
//! message documents. A watcher first receives a snapshot (present
//! participants and every logged message visible to it) and then live
//! changes. Removing a participant purges the negotiation documents it sent
//! or was sent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ChannelEvent, SignalingChannel, Subscription};
use crate::auth::Identity;
use crate::error::SignalingError;
use crate::protocol::{Presence, PresenceEvent, PresenceInfo, SignalingMessage};
use crate::room::is_valid_room_id;

struct Watcher {
  participant_id: String,
  tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct RoomDocs {
  participants: Vec<PresenceInfo>,
  messages: Vec<SignalingMessage>,
  watchers: HashMap<u64, Watcher>,
}

impl RoomDocs {
  fn notify(&mut self, message: &SignalingMessage) {
    self.watchers.retain(|_, watcher| {
      if !visible_to(message, &watcher.participant_id) {
        return true;
      }
      watcher.tx.send(ChannelEvent::Message(message.clone())).is_ok()
    });
  }
}

#[derive(Default)]
struct StoreInner {
  next_watch_id: u64,
  rooms: HashMap<String, RoomDocs>,
}

#[derive(Clone, Default)]
pub struct DocumentStore {
  inner: Arc<Mutex<StoreInner>>,
}

impl DocumentStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn participants(&self, room: &str) -> Vec<PresenceInfo> {
    let guard = self.inner.lock();
    guard.rooms.get(room).map(|docs| docs.participants.clone()).unwrap_or_default()
  }

  /// Number of logged message documents in `room`.
  pub fn message_count(&self, room: &str) -> usize {
    let guard = self.inner.lock();
    guard.rooms.get(room).map(|docs| docs.messages.len()).unwrap_or(0)
  }

  pub fn watcher_count(&self, room: &str) -> usize {
    let guard = self.inner.lock();
    guard.rooms.get(room).map(|docs| docs.watchers.len()).unwrap_or(0)
  }

  /// Starts a live query for `participant_id`. A previous watch by the same
  /// participant in the room is closed.
  pub fn watch(&self, room: &str, participant_id: &str) -> (u64, mpsc::UnboundedReceiver<ChannelEvent>) {
    let mut guard = self.inner.lock();
    guard.next_watch_id += 1;
    let watch_id = guard.next_watch_id;
    let docs = guard.rooms.entry(room.to_string()).or_default();

    docs.watchers.retain(|_, watcher| {
      if watcher.participant_id != participant_id {
        return true;
      }
      info!(room, participant = participant_id, "superseding previous subscription");
      let _ = watcher
        .tx
        .send(ChannelEvent::Closed(Some("superseded by a newer subscription".to_string())));
      false
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let present = docs
      .participants
      .iter()
      .filter(|info| info.participant_id != participant_id)
      .map(|info| SignalingMessage::Presence(Presence::joined(info.clone())));
    let logged = docs
      .messages
      .iter()
      .filter(|message| visible_to(message, participant_id))
      .cloned();
    for message in present.chain(logged) {
      let _ = tx.send(ChannelEvent::Message(message));
    }

    docs.watchers.insert(
      watch_id,
      Watcher {
        participant_id: participant_id.to_string(),
        tx,
      },
    );
    (watch_id, rx)
  }

  pub fn unwatch(&self, room: &str, watch_id: u64) {
    let mut guard = self.inner.lock();
    if let Some(docs) = guard.rooms.get_mut(room) {
      docs.watchers.remove(&watch_id);
    }
  }

  /// Writes (or overwrites) a participant document.
  pub fn add_participant(&self, room: &str, info: PresenceInfo) {
    let mut guard = self.inner.lock();
    let docs = guard.rooms.entry(room.to_string()).or_default();

    if let Some(index) = docs
      .participants
      .iter()
      .position(|existing| existing.participant_id == info.participant_id)
    {
      docs.participants.remove(index);
      docs.notify(&SignalingMessage::Presence(Presence::left(info.participant_id.clone())));
    }
    docs.participants.push(info.clone());
    docs.notify(&SignalingMessage::Presence(Presence::joined(info)));
  }

  /// Deletes a participant document along with the negotiation documents it
  /// sent or was sent.
  pub fn remove_participant(&self, room: &str, participant_id: &str) {
    let mut guard = self.inner.lock();
    let Some(docs) = guard.rooms.get_mut(room) else { return };

    let before = docs.messages.len();
    docs.messages.retain(|message| match message {
      SignalingMessage::Negotiation(envelope) => envelope.from != participant_id && envelope.to != participant_id,
      SignalingMessage::MediaState(state) => state.from != participant_id,
      _ => true,
    });
    debug!(
      room,
      participant = participant_id,
      purged = before - docs.messages.len(),
      "purged documents"
    );

    let present = docs.participants.len();
    docs.participants.retain(|info| info.participant_id != participant_id);
    if docs.participants.len() != present {
      docs.notify(&SignalingMessage::Presence(Presence::left(participant_id)));
    }

    if docs.participants.is_empty() && docs.watchers.is_empty() {
      guard.rooms.remove(room);
    }
  }

  /// Appends a message document and delivers it to matching watchers.
  pub fn append(&self, room: &str, message: SignalingMessage) {
    let mut guard = self.inner.lock();
    let docs = guard.rooms.entry(room.to_string()).or_default();
    docs.messages.push(message.clone());
    docs.notify(&message);
  }
}

/// Negotiation documents are filtered by recipient; media state goes to
/// everyone but its sender; chat goes to everyone.
fn visible_to(message: &SignalingMessage, participant_id: &str) -> bool {
  if message.recipient().is_some_and(|recipient| recipient != participant_id) {
    return false;
  }
  match message {
    SignalingMessage::Negotiation(envelope) => envelope.from != participant_id,
    SignalingMessage::Presence(presence) => presence.info.participant_id != participant_id,
    SignalingMessage::MediaState(state) => state.from != participant_id,
    SignalingMessage::Chat(_) => true,
  }
}

struct Joined {
  room: String,
  identity: Identity,
}

/// A [`SignalingChannel`] for one participant over a [`DocumentStore`].
pub struct StoreChannel {
  store: DocumentStore,
  joined: Mutex<Option<Joined>>,
}

impl StoreChannel {
  pub fn new(store: DocumentStore) -> Self {
    Self {
      store,
      joined: Mutex::new(None),
    }
  }
}

#[async_trait]
impl SignalingChannel for StoreChannel {
  async fn subscribe(&self, room: &str, me: &Identity) -> Result<Subscription, SignalingError> {
    if !is_valid_room_id(room) {
      return Err(SignalingError::Endpoint(format!("invalid room id {room:?}")));
    }
    let (watch_id, events) = self.store.watch(room, &me.id);
    *self.joined.lock() = Some(Joined {
      room: room.to_string(),
      identity: me.clone(),
    });

    let store = self.store.clone();
    let room = room.to_string();
    Ok(Subscription::new(events, move || store.unwatch(&room, watch_id)))
  }

  async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
    let guard = self.joined.lock();
    let joined = guard.as_ref().ok_or(SignalingError::NotSubscribed)?;

    match message {
      SignalingMessage::Presence(Presence {
        event: PresenceEvent::Joined,
        ..
      }) => self.store.add_participant(&joined.room, joined.identity.presence()),
      SignalingMessage::Presence(Presence {
        event: PresenceEvent::Left,
        ..
      }) => self.store.remove_participant(&joined.room, &joined.identity.id),
      message => self.store.append(&joined.room, stamp_sender(message, &joined.identity.id)),
    }
    Ok(())
  }
}

/// Documents always carry the writer's own id as sender.
fn stamp_sender(mut message: SignalingMessage, sender: &str) -> SignalingMessage {
  match &mut message {
    SignalingMessage::Negotiation(envelope) => envelope.from = sender.to_string(),
    SignalingMessage::MediaState(state) => state.from = sender.to_string(),
    SignalingMessage::Chat(chat) => chat.from = sender.to_string(),
    SignalingMessage::Presence(_) => {}
  }
  message
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{Envelope, SessionDescription};

  fn drain(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  fn info(id: &str) -> PresenceInfo {
    Identity::new(id).presence()
  }

  #[test]
  fn test_snapshot_then_live_changes() {
    let store = DocumentStore::new();
    store.add_participant("room", info("alice"));
    store.append(
      "room",
      SignalingMessage::Negotiation(Envelope::offer("alice", "bob", SessionDescription::offer("v=0"))),
    );
    store.append(
      "room",
      SignalingMessage::Negotiation(Envelope::offer("alice", "carol", SessionDescription::offer("v=0"))),
    );

    let (_, mut rx) = store.watch("room", "bob");
    let snapshot = drain(&mut rx);
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
      snapshot[0],
      ChannelEvent::Message(SignalingMessage::Presence(Presence::joined(info("alice"))))
    );
    assert!(matches!(
      &snapshot[1],
      ChannelEvent::Message(SignalingMessage::Negotiation(envelope)) if envelope.to == "bob"
    ));

    store.add_participant("room", info("carol"));
    assert_eq!(
      drain(&mut rx),
      vec![ChannelEvent::Message(SignalingMessage::Presence(Presence::joined(info("carol"))))]
    );
  }

  #[test]
  fn test_leaving_purges_negotiation_documents() {
    let store = DocumentStore::new();
    store.add_participant("room", info("alice"));
    store.add_participant("room", info("bob"));
    store.append(
      "room",
      SignalingMessage::Negotiation(Envelope::offer("alice", "bob", SessionDescription::offer("v=0"))),
    );
    store.append(
      "room",
      SignalingMessage::Negotiation(Envelope::answer("bob", "alice", SessionDescription::answer("v=0"))),
    );
    assert_eq!(store.message_count("room"), 2);

    let (_, mut rx) = store.watch("room", "alice");
    drain(&mut rx);
    store.remove_participant("room", "bob");

    assert_eq!(store.message_count("room"), 0);
    assert_eq!(store.participants("room"), vec![info("alice")]);
    assert_eq!(
      drain(&mut rx),
      vec![ChannelEvent::Message(SignalingMessage::Presence(Presence::left("bob")))]
    );
  }

  #[test]
  fn test_second_watch_supersedes_first() {
    let store = DocumentStore::new();
    let (_, mut first) = store.watch("room", "alice");
    let (_, _second) = store.watch("room", "alice");

    assert!(matches!(drain(&mut first).as_slice(), [ChannelEvent::Closed(Some(_))]));
    assert_eq!(store.watcher_count("room"), 1);
  }

  #[tokio::test]
  async fn test_channel_stamps_sender_and_unsubscribes() {
    let store = DocumentStore::new();
    let alice = StoreChannel::new(store.clone());
    let bob = StoreChannel::new(store.clone());

    assert!(matches!(
      alice
        .send(SignalingMessage::Presence(Presence::left("alice")))
        .await,
      Err(SignalingError::NotSubscribed)
    ));

    let mut alice_sub = alice.subscribe("room", &Identity::new("alice")).await.unwrap();
    let mut bob_sub = bob.subscribe("room", &Identity::new("bob")).await.unwrap();
    bob.send(SignalingMessage::Presence(Presence::joined(info("bob")))).await.unwrap();

    let forged = Envelope::offer("mallory", "alice", SessionDescription::offer("v=0"));
    bob.send(SignalingMessage::Negotiation(forged)).await.unwrap();

    assert!(matches!(
      alice_sub.recv().await,
      Some(ChannelEvent::Message(SignalingMessage::Presence(_)))
    ));
    match alice_sub.recv().await {
      Some(ChannelEvent::Message(SignalingMessage::Negotiation(envelope))) => assert_eq!(envelope.from, "bob"),
      other => panic!("unexpected {other:?}"),
    }

    bob_sub.unsubscribe();
    assert!(bob_sub.recv().await.is_none());
    assert_eq!(store.watcher_count("room"), 1);
  }
}
