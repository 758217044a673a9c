//! An in-process stand-in for a real peer connection.
//!
//! Transports created from the same [`SimNetwork`] follow the standard
//! offer/answer signaling-state transitions (without implicit rollback) and
//! report `connected` once both ends of a link hold complementary
//! descriptions. Session descriptions are short SDP-like texts carrying the
//! author in the `o=` line and one `m=` line per attached track.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
  ConnectionState, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack, SignalingState, TransportFactory,
};
use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

type LinkKey = (String, String);

struct SimLink {
  id: u64,
  events: PeerEventSink,
  signaling: SignalingState,
  connection: ConnectionState,
  local: Option<SessionDescription>,
  remote: Option<SessionDescription>,
  tracks: Vec<(TrackKind, String, String)>,
  candidates: usize,
}

#[derive(Default)]
struct NetworkInner {
  next_id: u64,
  links: HashMap<LinkKey, SimLink>,
}

#[derive(Clone, Default)]
pub struct SimNetwork {
  inner: Arc<Mutex<NetworkInner>>,
}

impl SimNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn factory(&self, owner: &str) -> SimTransportFactory {
    SimTransportFactory {
      network: self.clone(),
      owner: owner.to_string(),
    }
  }

  pub fn connection_state(&self, owner: &str, remote: &str) -> Option<ConnectionState> {
    self.with_link(owner, remote, |link| link.connection)
  }

  pub fn signaling_state(&self, owner: &str, remote: &str) -> Option<SignalingState> {
    self.with_link(owner, remote, |link| link.signaling)
  }

  pub fn local_description(&self, owner: &str, remote: &str) -> Option<SessionDescription> {
    self.with_link(owner, remote, |link| link.local.clone()).flatten()
  }

  pub fn remote_description(&self, owner: &str, remote: &str) -> Option<SessionDescription> {
    self.with_link(owner, remote, |link| link.remote.clone()).flatten()
  }

  pub fn applied_candidates(&self, owner: &str, remote: &str) -> usize {
    self.with_link(owner, remote, |link| link.candidates).unwrap_or(0)
  }

  /// Number of open transports owned by `owner`.
  pub fn open_links(&self, owner: &str) -> usize {
    self.inner.lock().links.keys().filter(|(from, _)| from == owner).count()
  }

  /// Drives both ends of a link into the `failed` network state.
  pub fn fail_link(&self, a: &str, b: &str) {
    let mut inner = self.inner.lock();
    for key in [key(a, b), key(b, a)] {
      if let Some(link) = inner.links.get_mut(&key) {
        link.connection = ConnectionState::Failed;
        link.events.emit(PeerEventKind::ConnectionStateChanged(ConnectionState::Failed));
      }
    }
  }

  fn with_link<T>(&self, owner: &str, remote: &str, f: impl FnOnce(&SimLink) -> T) -> Option<T> {
    self.inner.lock().links.get(&key(owner, remote)).map(f)
  }
}

pub struct SimTransportFactory {
  network: SimNetwork,
  owner: String,
}

#[async_trait]
impl TransportFactory for SimTransportFactory {
  async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, TransportError> {
    let remote = events.participant_id().to_string();
    let mut inner = self.network.inner.lock();
    inner.next_id += 1;
    let id = inner.next_id;
    inner.links.insert(
      key(&self.owner, &remote),
      SimLink {
        id,
        events,
        signaling: SignalingState::New,
        connection: ConnectionState::New,
        local: None,
        remote: None,
        tracks: Vec::new(),
        candidates: 0,
      },
    );
    Ok(Arc::new(SimTransport {
      network: self.network.clone(),
      owner: self.owner.clone(),
      remote,
      id,
    }))
  }
}

pub struct SimTransport {
  network: SimNetwork,
  owner: String,
  remote: String,
  id: u64,
}

impl SimTransport {
  fn key(&self) -> LinkKey {
    key(&self.owner, &self.remote)
  }

  fn with_link<T>(&self, f: impl FnOnce(&mut SimLink) -> T) -> Option<T> {
    let mut inner = self.network.inner.lock();
    match inner.links.get_mut(&self.key()) {
      Some(link) if link.id == self.id => Some(f(link)),
      _ => None,
    }
  }

  fn describe(&self, kind: SdpKind, link: &SimLink, nonce: u64) -> SessionDescription {
    let mut sdp = format!(
      "v=0\r\no={} {} 1 IN IP4 0.0.0.0\r\ns=-\r\na=sim-type:{:?}\r\n",
      self.owner, nonce, kind
    );
    for (kind, track_id, stream_id) in &link.tracks {
      sdp.push_str(&format!("m={kind} {track_id} {stream_id}\r\n"));
    }
    SessionDescription { kind, sdp }
  }

  fn next_nonce(&self) -> u64 {
    let mut inner = self.network.inner.lock();
    inner.next_id += 1;
    inner.next_id
  }

  /// Marks both ends connected when they hold each other's descriptions.
  fn try_pair(&self) {
    let mut inner = self.network.inner.lock();
    let mine = self.key();
    let theirs = key(&self.remote, &self.owner);

    let complementary = match (inner.links.get(&mine), inner.links.get(&theirs)) {
      (Some(a), Some(b)) => {
        a.id == self.id
          && a.signaling == SignalingState::Stable
          && b.signaling == SignalingState::Stable
          && a.local.is_some()
          && a.local == b.remote
          && a.remote == b.local
      }
      _ => false,
    };
    if !complementary {
      return;
    }

    for link_key in [mine, theirs] {
      if let Some(link) = inner.links.get_mut(&link_key) {
        if link.connection == ConnectionState::Connected {
          continue;
        }
        link.connection = ConnectionState::Connected;
        if let Some(remote) = &link.remote {
          for track in parse_tracks(&remote.sdp) {
            link.events.emit(PeerEventKind::RemoteTrack(track));
          }
        }
        link.events.emit(PeerEventKind::ConnectionStateChanged(ConnectionState::Connected));
      }
    }
  }
}

#[async_trait]
impl PeerTransport for SimTransport {
  fn signaling_state(&self) -> SignalingState {
    self.with_link(|link| link.signaling).unwrap_or(SignalingState::Closed)
  }

  fn connection_state(&self) -> ConnectionState {
    self.with_link(|link| link.connection).unwrap_or(ConnectionState::Closed)
  }

  async fn has_remote_description(&self) -> bool {
    self.with_link(|link| link.remote.is_some()).unwrap_or(false)
  }

  async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
    self
      .with_link(|link| {
        link
          .tracks
          .push((track.kind(), track.id().to_string(), track.stream_id().to_string()))
      })
      .ok_or(TransportError::Closed)
  }

  async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
    let nonce = self.next_nonce();
    self
      .with_link(|link| match link.signaling {
        SignalingState::New | SignalingState::Stable | SignalingState::HaveLocalOffer => {
          Ok(self.describe(SdpKind::Offer, link, nonce))
        }
        state => Err(TransportError::InvalidState { op: "create offer", state }),
      })
      .unwrap_or(Err(TransportError::Closed))
  }

  async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
    let nonce = self.next_nonce();
    self
      .with_link(|link| match link.signaling {
        SignalingState::HaveRemoteOffer => Ok(self.describe(SdpKind::Answer, link, nonce)),
        state => Err(TransportError::InvalidState { op: "create answer", state }),
      })
      .unwrap_or(Err(TransportError::Closed))
  }

  async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
    let owner = self.owner.clone();
    let stable = self
      .with_link(|link| {
        let next = match (description.kind, link.signaling) {
          (SdpKind::Offer, SignalingState::New | SignalingState::Stable | SignalingState::HaveLocalOffer) => {
            SignalingState::HaveLocalOffer
          }
          (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
          (_, state) => return Err(TransportError::InvalidState { op: "set local description", state }),
        };
        link.signaling = next;
        link.local = Some(description);
        link.events.emit(PeerEventKind::LocalCandidate(IceCandidate {
          candidate: format!("candidate:sim 1 udp 2130706431 {owner}.sim 9 typ host"),
          sdp_mid: Some("0".to_string()),
          sdp_mline_index: Some(0),
          username_fragment: None,
        }));
        Ok(next == SignalingState::Stable)
      })
      .unwrap_or(Err(TransportError::Closed))?;

    if stable {
      self.enter_checking();
      self.try_pair();
    }
    Ok(())
  }

  async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
    if sdp_origin(&description.sdp).is_none() {
      return Err(TransportError::Description("missing origin line".to_string()));
    }
    let stable = self
      .with_link(|link| {
        let next = match (description.kind, link.signaling) {
          (SdpKind::Offer, SignalingState::New | SignalingState::Stable) => SignalingState::HaveRemoteOffer,
          (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
          (_, state) => return Err(TransportError::InvalidState { op: "set remote description", state }),
        };
        link.signaling = next;
        link.remote = Some(description);
        Ok(next == SignalingState::Stable)
      })
      .unwrap_or(Err(TransportError::Closed))?;

    if stable {
      self.enter_checking();
      self.try_pair();
    }
    Ok(())
  }

  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
    if candidate.candidate.is_empty() {
      return Ok(());
    }
    self
      .with_link(|link| {
        if link.remote.is_none() {
          return Err(TransportError::InvalidState {
            op: "add candidate",
            state: link.signaling,
          });
        }
        link.candidates += 1;
        Ok(())
      })
      .unwrap_or(Err(TransportError::Closed))
  }

  async fn close(&self) -> Result<(), TransportError> {
    let mut inner = self.network.inner.lock();
    let mine = self.key();
    let was_connected = match inner.links.get(&mine) {
      Some(link) if link.id == self.id => link.connection == ConnectionState::Connected,
      _ => return Ok(()),
    };
    inner.links.remove(&mine);

    if was_connected {
      if let Some(peer) = inner.links.get_mut(&key(&self.remote, &self.owner)) {
        if peer.connection == ConnectionState::Connected {
          peer.connection = ConnectionState::Disconnected;
          peer
            .events
            .emit(PeerEventKind::ConnectionStateChanged(ConnectionState::Disconnected));
        }
      }
    }
    Ok(())
  }
}

impl SimTransport {
  fn enter_checking(&self) {
    self.with_link(|link| {
      if link.connection == ConnectionState::New {
        link.connection = ConnectionState::Checking;
        link
          .events
          .emit(PeerEventKind::ConnectionStateChanged(ConnectionState::Checking));
      }
    });
  }
}

fn key(owner: &str, remote: &str) -> LinkKey {
  (owner.to_string(), remote.to_string())
}

/// The author named in a description's `o=` line.
pub fn sdp_origin(sdp: &str) -> Option<&str> {
  sdp
    .lines()
    .find_map(|line| line.strip_prefix("o="))
    .and_then(|origin| origin.split_whitespace().next())
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
  sdp
    .lines()
    .filter_map(|line| line.strip_prefix("m="))
    .filter_map(|media| {
      let mut parts = media.split_whitespace();
      let kind = match parts.next()? {
        "audio" => TrackKind::Audio,
        "video" => TrackKind::Video,
        _ => return None,
      };
      Some(RemoteTrack {
        track_id: parts.next()?.to_string(),
        stream_id: parts.next()?.to_string(),
        kind,
      })
    })
    .collect()
}
