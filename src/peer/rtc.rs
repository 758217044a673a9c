//! Peer transport backed by webrtc-rs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
  ConnectionState, PeerEventKind, PeerEventSink, PeerTransport, RemoteTrack, SignalingState, TransportFactory,
};
use crate::config::RtcConfig;
use crate::error::TransportError;
use crate::media::{LocalTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

pub struct RtcTransportFactory {
  api: API,
  config: RtcConfig,
}

impl RtcTransportFactory {
  pub fn new(config: RtcConfig) -> Result<Self, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
      .with_media_engine(media_engine)
      .with_interceptor_registry(registry)
      .build();

    Ok(Self { api, config })
  }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
  async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, TransportError> {
    let config = RTCConfiguration {
      ice_servers: self.config.rtc_ice_servers(),
      ..Default::default()
    };
    let pc = Arc::new(self.api.new_peer_connection(config).await?);

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
      let sink = sink.clone();
      Box::pin(async move {
        let Some(candidate) = candidate else { return };
        match candidate.to_json() {
          Ok(init) => sink.emit(PeerEventKind::LocalCandidate(init.into())),
          Err(err) => warn!(participant = %sink.participant_id(), "serialize candidate: {err}"),
        }
      })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
      let sink = sink.clone();
      Box::pin(async move {
        let kind = match track.kind() {
          RTPCodecType::Audio => TrackKind::Audio,
          RTPCodecType::Video => TrackKind::Video,
          _ => return,
        };
        sink.emit(PeerEventKind::RemoteTrack(RemoteTrack {
          stream_id: track.stream_id(),
          track_id: track.id(),
          kind,
        }));
      })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
      let sink = sink.clone();
      Box::pin(async move {
        debug!(participant = %sink.participant_id(), %state, "peer connection state");
        sink.emit(PeerEventKind::ConnectionStateChanged(connection_state(state)));
      })
    }));

    Ok(Arc::new(RtcTransport {
      pc,
      negotiated: AtomicBool::new(false),
    }))
  }
}

pub struct RtcTransport {
  pc: Arc<RTCPeerConnection>,
  /// webrtc-rs reports a fresh connection as `stable`; this separates the two.
  negotiated: AtomicBool,
}

#[async_trait]
impl PeerTransport for RtcTransport {
  fn signaling_state(&self) -> SignalingState {
    match self.pc.signaling_state() {
      RTCSignalingState::Stable if !self.negotiated.load(Ordering::SeqCst) => SignalingState::New,
      RTCSignalingState::Unspecified => SignalingState::New,
      RTCSignalingState::Stable => SignalingState::Stable,
      RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalOffer,
      RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemoteOffer,
      RTCSignalingState::Closed => SignalingState::Closed,
    }
  }

  fn connection_state(&self) -> ConnectionState {
    connection_state(self.pc.connection_state())
  }

  async fn has_remote_description(&self) -> bool {
    self.pc.remote_description().await.is_some()
  }

  async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
    let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
    let sender = self.pc.add_track(rtc_track).await?;

    // RTCP has to be drained for the interceptors to work.
    tokio::spawn(async move {
      let mut buf = vec![0u8; 1500];
      while sender.read(&mut buf).await.is_ok() {}
    });
    Ok(())
  }

  async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
    let offer = self.pc.create_offer(None).await?;
    Ok(SessionDescription::offer(offer.sdp))
  }

  async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
    let answer = self.pc.create_answer(None).await?;
    Ok(SessionDescription::answer(answer.sdp))
  }

  async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
    self.pc.set_local_description(to_rtc(description)?).await?;
    self.negotiated.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
    self.pc.set_remote_description(to_rtc(description)?).await?;
    self.negotiated.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
    self.pc.add_ice_candidate(candidate.into()).await?;
    Ok(())
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.pc.close().await?;
    Ok(())
  }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
  match state {
    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
    RTCPeerConnectionState::Connecting => ConnectionState::Checking,
    RTCPeerConnectionState::Connected => ConnectionState::Connected,
    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
    RTCPeerConnectionState::Failed => ConnectionState::Failed,
    RTCPeerConnectionState::Closed => ConnectionState::Closed,
  }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
  let result = match description.kind {
    SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
    SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
  };
  result.map_err(|err| TransportError::Description(err.to_string()))
}

impl From<RTCIceCandidateInit> for IceCandidate {
  fn from(init: RTCIceCandidateInit) -> Self {
    Self {
      candidate: init.candidate,
      sdp_mid: init.sdp_mid,
      sdp_mline_index: init.sdp_mline_index,
      username_fragment: init.username_fragment,
    }
  }
}

impl From<IceCandidate> for RTCIceCandidateInit {
  fn from(candidate: IceCandidate) -> Self {
    Self {
      candidate: candidate.candidate,
      sdp_mid: candidate.sdp_mid,
      sdp_mline_index: candidate.sdp_mline_index,
      username_fragment: candidate.username_fragment,
    }
  }
}
