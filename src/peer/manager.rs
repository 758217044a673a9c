//! Offer/answer negotiation over one transport per remote participant.
//!
//! Every handler reads the transport's state fresh before acting on it. When
//! both sides offer at the same time the lexicographically smaller participant
//! id is the initiator: its offer wins and only it re-offers after a conflict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
  ConnectionState, PeerEvent, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack, SignalingState,
  TransportFactory,
};
use crate::config::RetryPolicy;
use crate::error::TransportError;
use crate::media::LocalTrack;
use crate::protocol::{Envelope, IceCandidate, Payload, SdpKind, SessionDescription, SignalingMessage};

struct PeerEntry {
  transport: Arc<dyn PeerTransport>,
  generation: u64,
}

pub struct PeerConnectionManager {
  local_id: String,
  factory: Arc<dyn TransportFactory>,
  local_tracks: Vec<Arc<LocalTrack>>,
  entries: HashMap<String, PeerEntry>,
  outbound: mpsc::UnboundedSender<SignalingMessage>,
  events_tx: mpsc::UnboundedSender<PeerEvent>,
  retry: RetryPolicy,
  next_generation: u64,
  timers: Vec<JoinHandle<()>>,
}

impl PeerConnectionManager {
  /// Returns the manager and the receiving end of its peer event stream.
  /// Every event read from it must be handed back to [`Self::handle_event`].
  pub fn new(
    local_id: impl Into<String>,
    factory: Arc<dyn TransportFactory>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    retry: RetryPolicy,
  ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = Self {
      local_id: local_id.into(),
      factory,
      local_tracks: Vec::new(),
      entries: HashMap::new(),
      outbound,
      events_tx,
      retry,
      next_generation: 0,
      timers: Vec::new(),
    };
    (manager, events_rx)
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }

  /// Tracks attached to every connection created from now on.
  pub fn set_local_tracks(&mut self, tracks: Vec<Arc<LocalTrack>>) {
    self.local_tracks = tracks;
  }

  pub fn connection_count(&self) -> usize {
    self.entries.len()
  }

  pub fn connection(&self, participant_id: &str) -> Option<Arc<dyn PeerTransport>> {
    self.entries.get(participant_id).map(|entry| entry.transport.clone())
  }

  pub fn generation(&self, participant_id: &str) -> Option<u64> {
    self.entries.get(participant_id).map(|entry| entry.generation)
  }

  pub fn connection_states(&self) -> Vec<(String, ConnectionState)> {
    let mut states: Vec<(String, ConnectionState)> = self
      .entries
      .iter()
      .map(|(id, entry)| (id.clone(), entry.transport.connection_state()))
      .collect();
    states.sort_by(|a, b| a.0.cmp(&b.0));
    states
  }

  /// Whether this side issues the offer when negotiation with `remote_id`
  /// has to be restarted.
  pub fn is_initiator_for(&self, remote_id: &str) -> bool {
    self.local_id.as_str() < remote_id
  }

  /// Returns the live connection for `participant_id`, building one if there
  /// is none or the existing one can no longer be used.
  pub async fn create_connection(&mut self, participant_id: &str) -> Result<Arc<dyn PeerTransport>, TransportError> {
    if let Some(entry) = self.entries.get(participant_id) {
      let signaling = entry.transport.signaling_state();
      let network = entry.transport.connection_state();
      if signaling != SignalingState::Closed && !network.is_unusable() {
        return Ok(entry.transport.clone());
      }
      info!(participant = participant_id, %signaling, %network, "connection unusable, recreating");
      self.discard(participant_id).await;
    }
    self.build(participant_id).await
  }

  /// Opens a connection to a newly observed participant and offers if the
  /// connection has not negotiated anything yet.
  pub async fn connect(&mut self, participant_id: &str) -> Result<(), TransportError> {
    if participant_id == self.local_id {
      return Ok(());
    }
    let transport = self.create_connection(participant_id).await?;
    if transport.signaling_state() == SignalingState::New {
      self.send_offer(participant_id, &transport).await?;
    } else {
      debug!(participant = participant_id, state = %transport.signaling_state(), "already negotiating");
    }
    Ok(())
  }

  pub async fn handle_signal(&mut self, envelope: Envelope) -> Result<(), TransportError> {
    if envelope.to != self.local_id || envelope.from == self.local_id {
      debug!(from = %envelope.from, to = %envelope.to, kind = envelope.payload.label(), "not addressed to us");
      return Ok(());
    }
    match envelope.payload {
      Payload::Offer(description) => self.handle_offer(&envelope.from, description).await,
      Payload::Answer(description) => self.handle_answer(&envelope.from, description).await,
      Payload::Candidate(candidate) => self.handle_candidate(&envelope.from, candidate).await,
    }
  }

  pub async fn handle_offer(&mut self, from: &str, description: SessionDescription) -> Result<(), TransportError> {
    if description.kind != SdpKind::Offer {
      warn!(participant = from, "offer message carries an {:?} description", description.kind);
      return Ok(());
    }

    let mut transport = self.create_connection(from).await?;
    let state = transport.signaling_state();
    match state {
      SignalingState::New | SignalingState::Stable => {}
      SignalingState::HaveLocalOffer if self.is_initiator_for(from) => {
        info!(participant = from, "offer collision, keeping our offer");
        return Ok(());
      }
      SignalingState::HaveLocalOffer => {
        info!(participant = from, "offer collision, dropping our unanswered offer");
        transport = self.recreate(from).await?;
      }
      _ => {
        warn!(participant = from, %state, "cannot apply remote offer, dropping it");
        return Ok(());
      }
    }

    transport.set_remote_description(description).await?;
    let answer = transport.create_answer().await?;

    let state = transport.signaling_state();
    if state != SignalingState::HaveRemoteOffer {
      warn!(participant = from, %state, "connection changed while answering, dropping answer");
      return Ok(());
    }
    transport.set_local_description(answer.clone()).await?;
    self.emit(Envelope::answer(&self.local_id, from, answer));
    Ok(())
  }

  pub async fn handle_answer(&mut self, from: &str, description: SessionDescription) -> Result<(), TransportError> {
    if description.kind != SdpKind::Answer {
      warn!(participant = from, "answer message carries an {:?} description", description.kind);
      return Ok(());
    }
    let Some(transport) = self.connection(from) else {
      warn!(participant = from, "no connection to apply answer to");
      return Ok(());
    };

    let state = transport.signaling_state();
    match state {
      SignalingState::HaveLocalOffer => {
        transport.set_remote_description(description).await?;
        debug!(participant = from, "remote answer applied");
      }
      SignalingState::HaveRemoteOffer => {
        info!(participant = from, "answer while holding a remote offer, restarting negotiation");
        self.recreate(from).await?;
        if self.is_initiator_for(from) {
          let delay = self.retry.glare_delay();
          self.schedule_offer(from, delay);
        } else {
          debug!(participant = from, "waiting for the initiator's offer");
        }
      }
      SignalingState::Stable => {
        debug!(participant = from, "stale answer ignored");
      }
      _ => {
        warn!(participant = from, %state, "cannot apply answer, resetting connection");
        self.recreate(from).await?;
        if self.is_initiator_for(from) {
          self.schedule_offer(from, self.retry.reset_delay);
        }
      }
    }
    Ok(())
  }

  /// Candidates that arrive before a remote description are dropped; the
  /// remaining candidates usually still find a path.
  pub async fn handle_candidate(&mut self, from: &str, candidate: IceCandidate) -> Result<(), TransportError> {
    let Some(transport) = self.connection(from) else {
      debug!(participant = from, "candidate for unknown connection dropped");
      return Ok(());
    };
    if !transport.has_remote_description().await {
      debug!(participant = from, "candidate before remote description dropped");
      return Ok(());
    }
    if let Err(err) = transport.add_ice_candidate(candidate).await {
      warn!(participant = from, "add candidate: {err}");
    }
    Ok(())
  }

  /// Applies an event from the peer event stream. Remote tracks are handed
  /// back to the caller for the participant registry.
  pub async fn handle_event(&mut self, event: PeerEvent) -> Result<Option<RemoteTrack>, TransportError> {
    let participant_id = event.participant_id;
    let transport = match self.entries.get(&participant_id) {
      Some(entry) if entry.generation == event.generation => entry.transport.clone(),
      _ => {
        debug!(participant = %participant_id, generation = event.generation, "event from a discarded connection");
        return Ok(None);
      }
    };

    match event.kind {
      PeerEventKind::LocalCandidate(candidate) => {
        self.emit(Envelope::candidate(&self.local_id, &participant_id, candidate));
      }
      PeerEventKind::RemoteTrack(track) => {
        debug!(participant = %participant_id, track = %track.track_id, kind = %track.kind, "remote track");
        return Ok(Some(track));
      }
      PeerEventKind::ConnectionStateChanged(state) => {
        info!(participant = %participant_id, %state, "connection state changed");
        if state == ConnectionState::Failed {
          warn!(participant = %participant_id, "connection failed, discarding it");
          self.discard(&participant_id).await;
        }
      }
      PeerEventKind::OfferDue => {
        if transport.signaling_state() == SignalingState::New {
          self.send_offer(&participant_id, &transport).await?;
        } else {
          debug!(participant = %participant_id, "scheduled offer no longer needed");
        }
      }
    }
    Ok(None)
  }

  pub async fn close_connection(&mut self, participant_id: &str) -> bool {
    let closed = self.discard(participant_id).await;
    if closed {
      info!(participant = participant_id, "connection closed");
    }
    closed
  }

  pub async fn close_all(&mut self) {
    for timer in self.timers.drain(..) {
      timer.abort();
    }
    let ids: Vec<String> = self.entries.keys().cloned().collect();
    for id in ids {
      self.discard(&id).await;
    }
  }

  async fn send_offer(&mut self, participant_id: &str, transport: &Arc<dyn PeerTransport>) -> Result<(), TransportError> {
    let offer = transport.create_offer().await?;
    let state = transport.signaling_state();
    if !matches!(state, SignalingState::New | SignalingState::Stable) {
      debug!(participant = participant_id, %state, "connection changed while offering");
      return Ok(());
    }
    transport.set_local_description(offer.clone()).await?;
    info!(participant = participant_id, "offer sent");
    self.emit(Envelope::offer(&self.local_id, participant_id, offer));
    Ok(())
  }

  fn schedule_offer(&mut self, participant_id: &str, delay: Duration) {
    let Some(generation) = self.generation(participant_id) else { return };
    debug!(participant = participant_id, ?delay, "offer scheduled");
    let sink = PeerEventSink::new(participant_id, generation, self.events_tx.clone());
    let timer = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      sink.emit(PeerEventKind::OfferDue);
    });
    self.timers.retain(|timer| !timer.is_finished());
    self.timers.push(timer);
  }

  async fn build(&mut self, participant_id: &str) -> Result<Arc<dyn PeerTransport>, TransportError> {
    self.next_generation += 1;
    let generation = self.next_generation;
    let sink = PeerEventSink::new(participant_id, generation, self.events_tx.clone());
    let transport = self.factory.create(sink).await?;
    for track in self.local_tracks.iter().filter(|track| track.is_live()) {
      if let Err(err) = transport.add_track(track).await {
        warn!(participant = participant_id, track = track.id(), "attach local track: {err}");
      }
    }
    debug!(participant = participant_id, generation, "connection created");
    self.entries.insert(
      participant_id.to_string(),
      PeerEntry {
        transport: transport.clone(),
        generation,
      },
    );
    Ok(transport)
  }

  async fn recreate(&mut self, participant_id: &str) -> Result<Arc<dyn PeerTransport>, TransportError> {
    self.discard(participant_id).await;
    self.build(participant_id).await
  }

  async fn discard(&mut self, participant_id: &str) -> bool {
    let Some(entry) = self.entries.remove(participant_id) else {
      return false;
    };
    if let Err(err) = entry.transport.close().await {
      debug!(participant = participant_id, "close connection: {err}");
    }
    true
  }

  fn emit(&self, envelope: Envelope) {
    if self.outbound.send(SignalingMessage::Negotiation(envelope)).is_err() {
      debug!("signaling outbound closed, message dropped");
    }
  }
}

impl Drop for PeerConnectionManager {
  fn drop(&mut self) {
    for timer in self.timers.drain(..) {
      timer.abort();
    }
  }
}
