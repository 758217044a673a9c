//! WebSocket client for [`super::SignalingServer`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::{ChannelEvent, SignalingChannel, Subscription};
use crate::auth::Identity;
use crate::error::SignalingError;
use crate::protocol::{ClientMessage, Presence, PresenceEvent, ServerMessage, SignalingMessage};
use crate::room::{build_ws_url, is_valid_room_id};

struct Connection {
  outbound: mpsc::UnboundedSender<ClientMessage>,
  reader: JoinHandle<()>,
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.reader.abort();
  }
}

pub struct WsSignalingChannel {
  endpoint: Option<String>,
  token: String,
  connection: Arc<Mutex<Option<Connection>>>,
}

impl WsSignalingChannel {
  pub fn new(endpoint: Option<String>, token: impl Into<String>) -> Self {
    Self {
      endpoint,
      token: token.into(),
      connection: Arc::new(Mutex::new(None)),
    }
  }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
  async fn subscribe(&self, room: &str, me: &Identity) -> Result<Subscription, SignalingError> {
    if !is_valid_room_id(room) {
      return Err(SignalingError::Endpoint(format!("invalid room id {room:?}")));
    }
    let url = build_ws_url(self.endpoint.as_deref(), room).map_err(|err| SignalingError::Endpoint(err.to_string()))?;

    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
      .map_err(|_| SignalingError::Endpoint("token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    info!(%url, participant = %me.id, "connecting to signaling server");
    let ws_stream = match connect_async(request).await {
      Ok((stream, _)) => stream,
      Err(tungstenite::Error::Http(response)) => {
        return Err(SignalingError::Rejected {
          status: response.status().as_u16(),
        })
      }
      Err(err) => return Err(err.into()),
    };
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientMessage>();
    tokio::spawn(async move {
      while let Some(msg) = signal_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
          Ok(text) => text,
          Err(err) => {
            warn!("encode signaling message: {err}");
            continue;
          }
        };
        if let Err(err) = ws_write.send(Message::Text(text)).await {
          warn!("signaling write failed: {err}");
          return;
        }
      }
      let _ = ws_write.close().await;
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
      let reason = loop {
        let msg = match ws_read.next().await {
          Some(Ok(msg)) => msg,
          Some(Err(err)) => {
            let _ = events_tx.send(ChannelEvent::Error(err.to_string()));
            break Some(err.to_string());
          }
          None => break None,
        };
        let text = match msg {
          Message::Text(text) => text,
          Message::Close(frame) => break frame.map(|frame| frame.reason.to_string()),
          _ => continue,
        };
        let parsed: ServerMessage = match serde_json::from_str(&text) {
          Ok(msg) => msg,
          Err(err) => {
            debug!("ignoring unparseable server message: {err}");
            continue;
          }
        };
        for event in into_channel_events(parsed) {
          if events_tx.send(event).is_err() {
            return;
          }
        }
      };
      let _ = events_tx.send(ChannelEvent::Closed(reason));
    });

    *self.connection.lock() = Some(Connection {
      outbound: signal_tx,
      reader,
    });

    let connection = self.connection.clone();
    Ok(Subscription::new(events_rx, move || {
      // Dropping the sender lets the writer flush and close the socket.
      connection.lock().take();
    }))
  }

  async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
    let frame = match message {
      SignalingMessage::Negotiation(envelope) => ClientMessage::Signal(envelope),
      SignalingMessage::MediaState(state) => ClientMessage::MediaState {
        audio_enabled: state.audio_enabled,
        video_enabled: state.video_enabled,
      },
      SignalingMessage::Chat(chat) => ClientMessage::Chat { text: chat.text },
      SignalingMessage::Presence(Presence {
        event: PresenceEvent::Left,
        ..
      }) => ClientMessage::Leave,
      // The server announces us when the socket is accepted.
      SignalingMessage::Presence(_) => return Ok(()),
    };

    let guard = self.connection.lock();
    let connection = guard.as_ref().ok_or(SignalingError::NotSubscribed)?;
    connection.outbound.send(frame).map_err(|_| SignalingError::Closed)
  }
}

fn into_channel_events(message: ServerMessage) -> Vec<ChannelEvent> {
  match message {
    ServerMessage::Welcome { participants, .. } => participants
      .into_iter()
      .map(|info| ChannelEvent::Message(SignalingMessage::Presence(Presence::joined(info))))
      .collect(),
    ServerMessage::PeerJoined(info) => vec![ChannelEvent::Message(SignalingMessage::Presence(Presence::joined(info)))],
    ServerMessage::PeerLeft { participant_id } => {
      vec![ChannelEvent::Message(SignalingMessage::Presence(Presence::left(participant_id)))]
    }
    ServerMessage::Signal(envelope) => vec![ChannelEvent::Message(SignalingMessage::Negotiation(envelope))],
    ServerMessage::MediaState(state) => vec![ChannelEvent::Message(SignalingMessage::MediaState(state))],
    ServerMessage::Chat(chat) => vec![ChannelEvent::Message(SignalingMessage::Chat(chat))],
    ServerMessage::Error { message } => vec![ChannelEvent::Error(message)],
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::PresenceInfo;

  #[test]
  fn test_welcome_reports_existing_participants() {
    let events = into_channel_events(ServerMessage::Welcome {
      participant_id: "carol".into(),
      participants: vec![
        PresenceInfo {
          participant_id: "alice".into(),
          display_name: Some("Alice".into()),
          photo_url: None,
        },
        PresenceInfo {
          participant_id: "bob".into(),
          display_name: None,
          photo_url: None,
        },
      ],
    });

    assert_eq!(events.len(), 2);
    assert!(matches!(
      &events[0],
      ChannelEvent::Message(SignalingMessage::Presence(Presence { info, event: PresenceEvent::Joined }))
        if info.participant_id == "alice"
    ));
  }

  #[test]
  fn test_peer_left_becomes_presence_left() {
    let events = into_channel_events(ServerMessage::PeerLeft {
      participant_id: "bob".into(),
    });
    assert_eq!(
      events,
      vec![ChannelEvent::Message(SignalingMessage::Presence(Presence::left("bob")))]
    );
  }

  #[tokio::test]
  async fn test_send_before_subscribe() {
    let channel = WsSignalingChannel::new(Some("http://127.0.0.1:1".into()), "token");
    let result = channel.send(SignalingMessage::Presence(Presence::left("me"))).await;
    assert!(matches!(result, Err(SignalingError::NotSubscribed)));
  }
}
