use crate::peer::SignalingState;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
  #[error("no {0} device available")]
  Unavailable(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("cannot {op} in signaling state {state}")]
  InvalidState { op: &'static str, state: SignalingState },

  #[error("connection is closed")]
  Closed,

  #[error("malformed session description: {0}")]
  Description(String),

  #[error(transparent)]
  Rtc(#[from] webrtc::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
  #[error("signaling endpoint rejected the connection ({status})")]
  Rejected { status: u16 },

  #[error("invalid signaling endpoint: {0}")]
  Endpoint(String),

  #[error("signaling channel is not subscribed")]
  NotSubscribed,

  #[error("signaling channel closed")]
  Closed,

  #[error(transparent)]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("meeting session has ended")]
  Ended,

  #[error("invalid room id: {0:?}")]
  InvalidRoom(String),

  #[error(transparent)]
  Signaling(#[from] SignalingError),
}
