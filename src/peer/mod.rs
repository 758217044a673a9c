//! Peer connections: the transport seam, its event stream and the manager
//! that runs offer/answer negotiation on top of it.

pub mod manager;
pub mod rtc;
pub mod sim;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription};

pub use manager::PeerConnectionManager;

/// The offer/answer signaling state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
  New,
  HaveLocalOffer,
  HaveRemoteOffer,
  Stable,
  Closed,
}

impl fmt::Display for SignalingState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      SignalingState::New => "new",
      SignalingState::HaveLocalOffer => "have-local-offer",
      SignalingState::HaveRemoteOffer => "have-remote-offer",
      SignalingState::Stable => "stable",
      SignalingState::Closed => "closed",
    })
  }
}

/// Network connectivity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  New,
  Checking,
  Connected,
  Failed,
  Disconnected,
  Closed,
}

impl ConnectionState {
  /// A connection in one of these states is never reused.
  pub fn is_unusable(&self) -> bool {
    matches!(
      self,
      ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed
    )
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ConnectionState::New => "new",
      ConnectionState::Checking => "checking",
      ConnectionState::Connected => "connected",
      ConnectionState::Failed => "failed",
      ConnectionState::Disconnected => "disconnected",
      ConnectionState::Closed => "closed",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
  pub stream_id: String,
  pub track_id: String,
  pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
  LocalCandidate(IceCandidate),
  RemoteTrack(RemoteTrack),
  ConnectionStateChanged(ConnectionState),
  /// A delayed re-offer scheduled after a negotiation conflict is due.
  OfferDue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
  pub participant_id: String,
  pub generation: u64,
  pub kind: PeerEventKind,
}

/// Where a transport reports what happens on its connection. Every event is
/// stamped with the generation of the connection that produced it.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
  participant_id: String,
  generation: u64,
  tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
  pub fn new(participant_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
    Self {
      participant_id: participant_id.into(),
      generation,
      tx,
    }
  }

  pub fn participant_id(&self) -> &str {
    &self.participant_id
  }

  pub fn emit(&self, kind: PeerEventKind) {
    let _ = self.tx.send(PeerEvent {
      participant_id: self.participant_id.clone(),
      generation: self.generation,
      kind,
    });
  }
}

/// One negotiation-capable connection to a single remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
  fn signaling_state(&self) -> SignalingState;
  fn connection_state(&self) -> ConnectionState;
  async fn has_remote_description(&self) -> bool;
  async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError>;
  async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
  async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
  async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;
  async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;
  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
  async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
  async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
