//! Transport-agnostic signaling messages and their JSON shape.
//!
//! Negotiation messages travel as an [`Envelope`]:
//! `{"from": .., "to": .., "kind": "offer"|"answer"|"candidate", "payload": .., "timestamp": ..}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
  Offer,
  Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
  #[serde(rename = "type")]
  pub kind: SdpKind,
  pub sdp: String,
}

impl SessionDescription {
  pub fn offer(sdp: impl Into<String>) -> Self {
    Self { kind: SdpKind::Offer, sdp: sdp.into() }
  }

  pub fn answer(sdp: impl Into<String>) -> Self {
    Self { kind: SdpKind::Answer, sdp: sdp.into() }
  }
}

/// Same field names as the browser's `RTCIceCandidateInit` JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
  pub candidate: String,
  #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
  pub sdp_mid: Option<String>,
  #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
  pub sdp_mline_index: Option<u16>,
  #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
  pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum Payload {
  Offer(SessionDescription),
  Answer(SessionDescription),
  Candidate(IceCandidate),
}

impl Payload {
  pub fn label(&self) -> &'static str {
    match self {
      Payload::Offer(_) => "offer",
      Payload::Answer(_) => "answer",
      Payload::Candidate(_) => "candidate",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub from: String,
  pub to: String,
  #[serde(flatten)]
  pub payload: Payload,
  pub timestamp: DateTime<Utc>,
}

impl Envelope {
  pub fn new(from: impl Into<String>, to: impl Into<String>, payload: Payload) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
      payload,
      timestamp: Utc::now(),
    }
  }

  pub fn offer(from: &str, to: &str, description: SessionDescription) -> Self {
    Self::new(from, to, Payload::Offer(description))
  }

  pub fn answer(from: &str, to: &str, description: SessionDescription) -> Self {
    Self::new(from, to, Payload::Answer(description))
  }

  pub fn candidate(from: &str, to: &str, candidate: IceCandidate) -> Self {
    Self::new(from, to, Payload::Candidate(candidate))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
  Joined,
  Left,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
  #[serde(rename = "participantId")]
  pub participant_id: String,
  #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
  pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
  #[serde(flatten)]
  pub info: PresenceInfo,
  pub event: PresenceEvent,
}

impl Presence {
  pub fn joined(info: PresenceInfo) -> Self {
    Self { info, event: PresenceEvent::Joined }
  }

  pub fn left(participant_id: impl Into<String>) -> Self {
    Self {
      info: PresenceInfo {
        participant_id: participant_id.into(),
        display_name: None,
        photo_url: None,
      },
      event: PresenceEvent::Left,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
  pub from: String,
  #[serde(rename = "audioEnabled")]
  pub audio_enabled: bool,
  #[serde(rename = "videoEnabled")]
  pub video_enabled: bool,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
  pub from: String,
  #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  pub text: String,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
  Negotiation(Envelope),
  Presence(Presence),
  MediaState(MediaState),
  Chat(ChatMessage),
}

impl SignalingMessage {
  /// The participant a message is addressed to, if it is not a room broadcast.
  pub fn recipient(&self) -> Option<&str> {
    match self {
      SignalingMessage::Negotiation(envelope) => Some(&envelope.to),
      _ => None,
    }
  }
}

/// Frames a client sends to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  #[serde(rename = "signal")]
  Signal(Envelope),
  #[serde(rename = "media-state")]
  MediaState {
    #[serde(rename = "audioEnabled")]
    audio_enabled: bool,
    #[serde(rename = "videoEnabled")]
    video_enabled: bool,
  },
  #[serde(rename = "chat")]
  Chat { text: String },
  #[serde(rename = "leave")]
  Leave,
}

/// Frames the signaling server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
  #[serde(rename = "welcome")]
  Welcome {
    #[serde(rename = "participantId")]
    participant_id: String,
    participants: Vec<PresenceInfo>,
  },
  #[serde(rename = "peer-joined")]
  PeerJoined(PresenceInfo),
  #[serde(rename = "peer-left")]
  PeerLeft {
    #[serde(rename = "participantId")]
    participant_id: String,
  },
  #[serde(rename = "signal")]
  Signal(Envelope),
  #[serde(rename = "media-state")]
  MediaState(MediaState),
  #[serde(rename = "chat")]
  Chat(ChatMessage),
  #[serde(rename = "error")]
  Error { message: String },
}
