//! One participant's meeting: media, signaling, peer connections and the
//! participant registry, driven by a single task.
//!
//! Every signaling message, peer event and user command is handled in turn
//! by that task, so no two handlers ever interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::auth::Identity;
use crate::config::RetryPolicy;
use crate::error::SessionError;
use crate::media::{self, Capabilities, LocalStream, MediaDevices, TrackKind};
use crate::peer::{ConnectionState, PeerConnectionManager, PeerEvent, TransportFactory};
use crate::protocol::{ChatMessage, MediaState, Presence, PresenceEvent, PresenceInfo, SignalingMessage};
use crate::registry::{Participant, ParticipantPatch, ParticipantRegistry};
use crate::room::is_valid_room_id;
use crate::signaling::{ChannelEvent, SignalingChannel, Subscription};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub room: String,
  pub identity: Identity,
  pub audio: bool,
  pub video: bool,
  pub retry: RetryPolicy,
}

impl SessionOptions {
  pub fn new(room: impl Into<String>, identity: Identity) -> Self {
    Self {
      room: room.into(),
      identity,
      audio: true,
      video: true,
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_media(mut self, audio: bool, video: bool) -> Self {
    self.audio = audio;
    self.video = video;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
  ParticipantJoined(String),
  ParticipantLeft(String),
  Chat(ChatMessage),
  /// A signaling failure. The session keeps running but does not reconnect.
  Error(String),
  Ended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
  pub participants: usize,
  pub connections: usize,
  pub live_local_tracks: usize,
}

enum Command {
  Toggle(TrackKind, oneshot::Sender<bool>),
  Chat(String, oneshot::Sender<Result<(), SessionError>>),
  Stats(oneshot::Sender<SessionStats>),
  ConnectionStates(oneshot::Sender<Vec<(String, ConnectionState)>>),
  Leave(oneshot::Sender<()>),
}

pub struct MeetingSession {
  room: String,
  identity: Identity,
  stream: LocalStream,
  capabilities: Capabilities,
  audio_enabled: bool,
  video_enabled: bool,
  channel: Arc<dyn SignalingChannel>,
  subscription: Subscription,
  signaling_open: bool,
  manager: PeerConnectionManager,
  peer_events: mpsc::UnboundedReceiver<PeerEvent>,
  outbound: mpsc::UnboundedReceiver<SignalingMessage>,
  registry: ParticipantRegistry,
  commands: mpsc::UnboundedReceiver<Command>,
  events: broadcast::Sender<SessionEvent>,
}

impl MeetingSession {
  /// Acquires local media, subscribes to the room, announces this
  /// participant and starts the session task.
  #[instrument(level = "debug", skip_all, fields(room = %options.room, participant = %options.identity.id))]
  pub async fn join(
    options: SessionOptions,
    channel: Arc<dyn SignalingChannel>,
    devices: &dyn MediaDevices,
    factory: Arc<dyn TransportFactory>,
  ) -> Result<MeetingHandle, SessionError> {
    if !is_valid_room_id(&options.room) {
      return Err(SessionError::InvalidRoom(options.room));
    }
    let SessionOptions {
      room,
      identity,
      audio,
      video,
      retry,
    } = options;

    let acquired = media::acquire(devices, audio, video).await;
    let stream = acquired.stream;
    let capabilities = acquired.capabilities;

    let mut registry = ParticipantRegistry::new();
    registry.upsert(
      &identity.id,
      ParticipantPatch {
        display_name: identity.display_name.clone(),
        photo_url: identity.photo_url.clone(),
        stream: (!stream.tracks().is_empty()).then(|| stream.stream_ref()),
        audio_enabled: Some(capabilities.audio),
        video_enabled: Some(capabilities.video),
        is_local: Some(true),
      },
    );

    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (mut manager, peer_events) = PeerConnectionManager::new(identity.id.clone(), factory, outbound_tx, retry);
    manager.set_local_tracks(stream.tracks().to_vec());

    let mut subscription = match channel.subscribe(&room, &identity).await {
      Ok(subscription) => subscription,
      Err(err) => {
        stream.stop();
        return Err(err.into());
      }
    };
    if let Err(err) = channel
      .send(SignalingMessage::Presence(Presence::joined(identity.presence())))
      .await
    {
      stream.stop();
      subscription.unsubscribe();
      return Err(err.into());
    }
    info!(room = %room, participant = %identity.id, "joined meeting");

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let participants = registry.subscribe();

    let session = MeetingSession {
      room: room.clone(),
      identity: identity.clone(),
      stream,
      capabilities,
      audio_enabled: capabilities.audio,
      video_enabled: capabilities.video,
      channel,
      subscription,
      signaling_open: true,
      manager,
      peer_events,
      outbound,
      registry,
      commands,
      events: events.clone(),
    };
    let task = tokio::spawn(session.run());

    Ok(MeetingHandle {
      participant_id: identity.id,
      room,
      capabilities,
      commands: commands_tx,
      participants,
      events,
      task: Mutex::new(Some(task)),
      left: AtomicBool::new(false),
    })
  }

  async fn run(mut self) {
    loop {
      tokio::select! {
        event = self.subscription.recv(), if self.signaling_open => {
          self.on_channel_event(event).await;
        }
        Some(event) = self.peer_events.recv() => {
          let participant_id = event.participant_id.clone();
          match self.manager.handle_event(event).await {
            Ok(Some(track)) => self.registry.attach_track(&participant_id, &track),
            Ok(None) => {}
            Err(err) => warn!(participant = %participant_id, "peer event: {err}"),
          }
        }
        Some(message) = self.outbound.recv() => {
          self.publish(message).await;
        }
        command = self.commands.recv() => match command {
          Some(Command::Leave(done)) => {
            self.shutdown().await;
            let _ = done.send(());
            break;
          }
          Some(command) => self.on_command(command).await,
          None => {
            debug!("meeting handle dropped");
            self.shutdown().await;
            break;
          }
        }
      }
    }
  }

  async fn on_channel_event(&mut self, event: Option<ChannelEvent>) {
    match event {
      Some(ChannelEvent::Message(message)) => self.on_signal(message).await,
      Some(ChannelEvent::Error(message)) => {
        warn!(room = %self.room, "signaling error: {message}");
        let _ = self.events.send(SessionEvent::Error(message));
      }
      Some(ChannelEvent::Closed(reason)) => {
        let reason = reason.unwrap_or_else(|| "signaling channel closed".to_string());
        warn!(room = %self.room, "signaling closed: {reason}");
        self.signaling_open = false;
        let _ = self.events.send(SessionEvent::Error(reason));
      }
      None => {
        self.signaling_open = false;
        let _ = self.events.send(SessionEvent::Error("signaling channel closed".to_string()));
      }
    }
  }

  async fn on_signal(&mut self, message: SignalingMessage) {
    match message {
      SignalingMessage::Presence(Presence {
        info,
        event: PresenceEvent::Joined,
      }) => self.on_joined(info).await,
      SignalingMessage::Presence(Presence {
        info,
        event: PresenceEvent::Left,
      }) => self.on_left(&info.participant_id).await,
      SignalingMessage::Negotiation(envelope) => {
        let from = envelope.from.clone();
        if let Err(err) = self.manager.handle_signal(envelope).await {
          warn!(participant = %from, "negotiation failed: {err}");
        }
      }
      SignalingMessage::MediaState(state) => {
        if state.from != self.identity.id {
          self
            .registry
            .upsert(&state.from, ParticipantPatch::media(state.audio_enabled, state.video_enabled));
        }
      }
      SignalingMessage::Chat(chat) => {
        let _ = self.events.send(SessionEvent::Chat(chat));
      }
    }
  }

  async fn on_joined(&mut self, info: PresenceInfo) {
    let participant_id = info.participant_id.clone();
    if participant_id == self.identity.id {
      return;
    }
    let is_new = self.registry.get(&participant_id).is_none();
    self.registry.upsert(
      &participant_id,
      ParticipantPatch {
        display_name: info.display_name,
        photo_url: info.photo_url,
        ..Default::default()
      },
    );
    if is_new {
      info!(participant = %participant_id, "participant joined");
      let _ = self.events.send(SessionEvent::ParticipantJoined(participant_id.clone()));
      // Late joiners have not seen our earlier media-state broadcasts.
      self.publish(self.media_state()).await;
    }
    if let Err(err) = self.manager.connect(&participant_id).await {
      warn!(participant = %participant_id, "connect failed: {err}");
    }
  }

  async fn on_left(&mut self, participant_id: &str) {
    if participant_id == self.identity.id {
      return;
    }
    self.manager.close_connection(participant_id).await;
    if self.registry.remove(participant_id) {
      info!(participant = participant_id, "participant left");
      let _ = self.events.send(SessionEvent::ParticipantLeft(participant_id.to_string()));
    }
  }

  async fn on_command(&mut self, command: Command) {
    match command {
      Command::Toggle(kind, reply) => {
        let enabled = self.toggle(kind).await;
        let _ = reply.send(enabled);
      }
      Command::Chat(text, reply) => {
        let message = SignalingMessage::Chat(ChatMessage {
          from: self.identity.id.clone(),
          display_name: self.identity.display_name.clone(),
          text,
          timestamp: Utc::now(),
        });
        let result = self.channel.send(message).await.map_err(SessionError::from);
        let _ = reply.send(result);
      }
      Command::Stats(reply) => {
        let _ = reply.send(SessionStats {
          participants: self.registry.len(),
          connections: self.manager.connection_count(),
          live_local_tracks: self.stream.active_track_count(),
        });
      }
      Command::ConnectionStates(reply) => {
        let _ = reply.send(self.manager.connection_states());
      }
      Command::Leave(_) => {}
    }
  }

  /// Flips the local flag for `kind`. Tracks are muted in place; no
  /// connection is renegotiated.
  async fn toggle(&mut self, kind: TrackKind) -> bool {
    let (available, enabled) = match kind {
      TrackKind::Audio => (self.capabilities.audio, &mut self.audio_enabled),
      TrackKind::Video => (self.capabilities.video, &mut self.video_enabled),
    };
    if !available {
      debug!(%kind, "no local track to toggle");
      return false;
    }
    *enabled = !*enabled;
    let enabled = *enabled;

    self.stream.set_track_enabled(kind, enabled);
    self.registry.upsert(
      &self.identity.id,
      ParticipantPatch::media(self.audio_enabled, self.video_enabled),
    );
    info!(%kind, enabled, "local track toggled");
    self.publish(self.media_state()).await;
    enabled
  }

  fn media_state(&self) -> SignalingMessage {
    SignalingMessage::MediaState(MediaState {
      from: self.identity.id.clone(),
      audio_enabled: self.audio_enabled,
      video_enabled: self.video_enabled,
      timestamp: Utc::now(),
    })
  }

  async fn publish(&mut self, message: SignalingMessage) {
    if let Err(err) = self.channel.send(message).await {
      warn!(room = %self.room, "signaling send failed: {err}");
      let _ = self.events.send(SessionEvent::Error(err.to_string()));
    }
  }

  async fn shutdown(&mut self) {
    self.stream.stop();
    self.manager.close_all().await;
    if let Err(err) = self
      .channel
      .send(SignalingMessage::Presence(Presence::left(self.identity.id.clone())))
      .await
    {
      debug!("could not announce leaving: {err}");
    }
    self.subscription.unsubscribe();
    self.signaling_open = false;
    self.registry.clear();
    info!(room = %self.room, participant = %self.identity.id, "left meeting");
    let _ = self.events.send(SessionEvent::Ended);
  }
}

/// Control surface of a running meeting. Dropping it leaves the meeting.
pub struct MeetingHandle {
  participant_id: String,
  room: String,
  capabilities: Capabilities,
  commands: mpsc::UnboundedSender<Command>,
  participants: watch::Receiver<Vec<Participant>>,
  events: broadcast::Sender<SessionEvent>,
  task: Mutex<Option<JoinHandle<()>>>,
  left: AtomicBool,
}

impl MeetingHandle {
  pub fn participant_id(&self) -> &str {
    &self.participant_id
  }

  pub fn room(&self) -> &str {
    &self.room
  }

  /// Which toggles make sense; a kind without a track cannot be enabled.
  pub fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  /// Returns whether audio is enabled afterwards.
  pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
    self.request(|reply| Command::Toggle(TrackKind::Audio, reply)).await
  }

  /// Returns whether video is enabled afterwards.
  pub async fn toggle_video(&self) -> Result<bool, SessionError> {
    self.request(|reply| Command::Toggle(TrackKind::Video, reply)).await
  }

  pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
    let text = text.into();
    self.request(|reply| Command::Chat(text, reply)).await?
  }

  pub async fn stats(&self) -> Result<SessionStats, SessionError> {
    self.request(Command::Stats).await
  }

  pub async fn connection_states(&self) -> Result<Vec<(String, ConnectionState)>, SessionError> {
    self.request(Command::ConnectionStates).await
  }

  pub fn participants(&self) -> Vec<Participant> {
    self.participants.borrow().clone()
  }

  pub fn subscribe_participants(&self) -> watch::Receiver<Vec<Participant>> {
    self.participants.clone()
  }

  pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
    self.events.subscribe()
  }

  pub fn has_left(&self) -> bool {
    self.left.load(Ordering::SeqCst)
  }

  /// Stops local media, closes every connection, announces leaving and
  /// unsubscribes. Later calls do nothing.
  pub async fn leave(&self) {
    if self.left.swap(true, Ordering::SeqCst) {
      return;
    }
    let (done_tx, done_rx) = oneshot::channel();
    if self.commands.send(Command::Leave(done_tx)).is_ok() {
      let _ = done_rx.await;
    }
    let task = self.task.lock().take();
    if let Some(task) = task {
      let _ = task.await;
    }
  }

  async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
    if self.has_left() {
      return Err(SessionError::Ended);
    }
    let (reply_tx, reply_rx) = oneshot::channel();
    self.commands.send(command(reply_tx)).map_err(|_| SessionError::Ended)?;
    reply_rx.await.map_err(|_| SessionError::Ended)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::media::SyntheticDevices;
  use crate::peer::sim::SimNetwork;
  use crate::signaling::{DocumentStore, StoreChannel};

  async fn join(store: &DocumentStore, network: &SimNetwork, id: &str, devices: SyntheticDevices) -> MeetingHandle {
    MeetingSession::join(
      SessionOptions::new("room", Identity::new(id)).with_retry(RetryPolicy::immediate()),
      Arc::new(StoreChannel::new(store.clone())),
      &devices,
      Arc::new(network.factory(id)),
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_invalid_room_is_rejected() {
    let result = MeetingSession::join(
      SessionOptions::new("not a room", Identity::new("alice")),
      Arc::new(StoreChannel::new(DocumentStore::new())),
      &SyntheticDevices::new(true, true),
      Arc::new(SimNetwork::new().factory("alice")),
    )
    .await;
    assert!(matches!(result, Err(SessionError::InvalidRoom(_))));
  }

  #[tokio::test]
  async fn test_local_participant_is_registered() {
    let store = DocumentStore::new();
    let network = SimNetwork::new();
    let handle = join(&store, &network, "alice", SyntheticDevices::new(true, false)).await;

    let participants = handle.participants();
    assert_eq!(participants.len(), 1);
    assert!(participants[0].is_local);
    assert!(participants[0].audio_enabled);
    assert!(!participants[0].video_enabled);
    assert_eq!(handle.capabilities(), Capabilities { audio: true, video: false });

    // No video track, so the toggle stays off.
    assert!(!handle.toggle_video().await.unwrap());
    handle.leave().await;
  }

  #[tokio::test]
  async fn test_leave_is_idempotent() {
    let store = DocumentStore::new();
    let network = SimNetwork::new();
    let handle = join(&store, &network, "alice", SyntheticDevices::new(true, true)).await;
    assert_eq!(store.participants("room").len(), 1);

    handle.leave().await;
    handle.leave().await;

    assert!(handle.has_left());
    assert!(store.participants("room").is_empty());
    assert_eq!(store.watcher_count("room"), 0);
    assert!(matches!(handle.stats().await, Err(SessionError::Ended)));
  }

  #[tokio::test]
  async fn test_dropping_the_handle_leaves() {
    let store = DocumentStore::new();
    let network = SimNetwork::new();
    let handle = join(&store, &network, "alice", SyntheticDevices::new(true, true)).await;
    let mut events = handle.subscribe_events();
    drop(handle);

    loop {
      match events.recv().await {
        Ok(SessionEvent::Ended) => break,
        Ok(_) => continue,
        Err(err) => panic!("event stream ended early: {err}"),
      }
    }
    assert!(store.participants("room").is_empty());
  }
}
