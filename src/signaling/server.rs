//! Room-multiplexing WebSocket signaling server.
//!
//! Clients connect to `/ws/<room>` with a bearer token, either in the
//! `Authorization` header or as `?token=`. The token is validated once before
//! the upgrade; the identity it carries becomes the `from` of everything the
//! socket sends.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, instrument, warn};
use url::form_urlencoded;

use crate::auth::{bearer_token, AuthError, Identity, TokenValidator};
use crate::protocol::{ChatMessage, ClientMessage, MediaState, PresenceInfo, ServerMessage};
use crate::room::is_valid_room_id;

const KEEPALIVE: Duration = Duration::from_secs(30);

struct Member {
  conn_id: u64,
  info: PresenceInfo,
  tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct Rooms {
  next_conn_id: u64,
  rooms: HashMap<String, HashMap<String, Member>>,
}

struct ServerState {
  validator: TokenValidator,
  rooms: Mutex<Rooms>,
}

impl ServerState {
  /// Registers a connection and returns its id. An earlier connection with the
  /// same identity in the room is superseded.
  fn join(&self, room: &str, identity: &Identity, tx: mpsc::UnboundedSender<ServerMessage>) -> u64 {
    let mut guard = self.rooms.lock();
    guard.next_conn_id += 1;
    let conn_id = guard.next_conn_id;
    let members = guard.rooms.entry(room.to_string()).or_default();

    if let Some(previous) = members.remove(&identity.id) {
      info!(room, participant = %identity.id, "superseding previous connection");
      let _ = previous.tx.send(ServerMessage::Error {
        message: "superseded by a newer connection".to_string(),
      });
      broadcast(members, None, ServerMessage::PeerLeft {
        participant_id: identity.id.clone(),
      });
    }

    let participants = members.values().map(|member| member.info.clone()).collect();
    let _ = tx.send(ServerMessage::Welcome {
      participant_id: identity.id.clone(),
      participants,
    });
    broadcast(members, None, ServerMessage::PeerJoined(identity.presence()));

    members.insert(
      identity.id.clone(),
      Member {
        conn_id,
        info: identity.presence(),
        tx,
      },
    );
    conn_id
  }

  fn leave(&self, room: &str, participant_id: &str, conn_id: u64) {
    let mut guard = self.rooms.lock();
    let Some(members) = guard.rooms.get_mut(room) else { return };
    if members.get(participant_id).map(|member| member.conn_id) != Some(conn_id) {
      return;
    }
    members.remove(participant_id);
    broadcast(members, None, ServerMessage::PeerLeft {
      participant_id: participant_id.to_string(),
    });
    if members.is_empty() {
      guard.rooms.remove(room);
    }
  }

  fn dispatch(&self, room: &str, identity: &Identity, conn_id: u64, message: ClientMessage) {
    let guard = self.rooms.lock();
    let Some(members) = guard.rooms.get(room) else { return };
    if members.get(&identity.id).map(|member| member.conn_id) != Some(conn_id) {
      return;
    }

    match message {
      ClientMessage::Signal(mut envelope) => {
        envelope.from = identity.id.clone();
        match members.get(&envelope.to) {
          Some(target) => {
            let _ = target.tx.send(ServerMessage::Signal(envelope));
          }
          None => debug!(room, from = %identity.id, to = %envelope.to, "dropping signal for absent participant"),
        }
      }
      ClientMessage::MediaState {
        audio_enabled,
        video_enabled,
      } => broadcast(
        members,
        Some(&identity.id),
        ServerMessage::MediaState(MediaState {
          from: identity.id.clone(),
          audio_enabled,
          video_enabled,
          timestamp: Utc::now(),
        }),
      ),
      ClientMessage::Chat { text } => broadcast(
        members,
        None,
        ServerMessage::Chat(ChatMessage {
          from: identity.id.clone(),
          display_name: identity.display_name.clone(),
          text,
          timestamp: Utc::now(),
        }),
      ),
      ClientMessage::Leave => {}
    }
  }

  fn participants(&self, room: &str) -> Vec<String> {
    let guard = self.rooms.lock();
    let mut ids: Vec<String> = guard
      .rooms
      .get(room)
      .map(|members| members.keys().cloned().collect())
      .unwrap_or_default();
    ids.sort();
    ids
  }
}

fn broadcast(members: &HashMap<String, Member>, except: Option<&str>, message: ServerMessage) {
  for (id, member) in members {
    if Some(id.as_str()) != except {
      let _ = member.tx.send(message.clone());
    }
  }
}

pub struct SignalingServer {
  listener: TcpListener,
  state: Arc<ServerState>,
}

impl SignalingServer {
  pub async fn bind(addr: impl ToSocketAddrs, validator: TokenValidator) -> io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self {
      listener,
      state: Arc::new(ServerState {
        validator,
        rooms: Mutex::new(Rooms::default()),
      }),
    })
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub async fn run(self) -> io::Result<()> {
    info!(addr = ?self.listener.local_addr()?, "signaling server listening");
    loop {
      let (stream, address) = self.listener.accept().await?;
      debug!("accepting connection from {address}");
      tokio::spawn(accept_connection(self.state.clone(), stream, address));
    }
  }

  /// Runs the accept loop on a background task.
  pub fn spawn(self) -> io::Result<RunningServer> {
    let addr = self.local_addr()?;
    let state = self.state.clone();
    let handle = tokio::spawn(async move {
      if let Err(err) = self.run().await {
        warn!("signaling server stopped: {err}");
      }
    });
    Ok(RunningServer {
      addr,
      state,
      handle: Some(handle),
    })
  }
}

pub struct RunningServer {
  addr: SocketAddr,
  state: Arc<ServerState>,
  handle: Option<JoinHandle<()>>,
}

impl RunningServer {
  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn endpoint(&self) -> String {
    format!("http://{}", self.addr)
  }

  /// Participant ids currently connected to `room`, sorted.
  pub fn participants(&self, room: &str) -> Vec<String> {
    self.state.participants(room)
  }
}

impl Drop for RunningServer {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

#[instrument(level = "debug", skip(state, stream))]
async fn accept_connection(state: Arc<ServerState>, stream: TcpStream, address: SocketAddr) {
  let mut admitted = None;
  let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
    match authorize(&state.validator, request) {
      Ok(accepted) => {
        admitted = Some(accepted);
        Ok(response)
      }
      Err((status, message)) => {
        warn!(%status, "rejecting signaling connection: {message}");
        Err(reject(status, message))
      }
    }
  };

  let ws = match accept_hdr_async(stream, callback).await {
    Ok(ws) => ws,
    Err(err) => {
      debug!("websocket handshake failed: {err}");
      return;
    }
  };
  let Some((room, identity)) = admitted else { return };
  handle_connection(state, ws, room, identity).await;
}

fn authorize(validator: &TokenValidator, request: &Request) -> Result<(String, Identity), (StatusCode, String)> {
  let room = request
    .uri()
    .path()
    .strip_prefix("/ws/")
    .map(|room| room.trim_end_matches('/'))
    .ok_or((StatusCode::NOT_FOUND, "unknown path".to_string()))?;
  if !is_valid_room_id(room) {
    return Err((StatusCode::BAD_REQUEST, format!("invalid room id {room:?}")));
  }

  let header_token = request
    .headers()
    .get(AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(bearer_token)
    .map(str::to_string);
  let query_token = request.uri().query().and_then(|query| {
    form_urlencoded::parse(query.as_bytes())
      .find(|(key, _)| key == "token")
      .map(|(_, value)| value.into_owned())
  });
  let token = header_token.or(query_token).unwrap_or_default();

  let identity = validator.validate(&token).map_err(|err| {
    let status = match err {
      AuthError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
      _ => StatusCode::UNAUTHORIZED,
    };
    (status, err.to_string())
  })?;
  Ok((room.to_string(), identity))
}

fn reject(status: StatusCode, message: String) -> ErrorResponse {
  let mut response = ErrorResponse::new(Some(message));
  *response.status_mut() = status;
  response
}

#[instrument(level = "debug", skip(state, ws, identity), fields(participant = %identity.id))]
async fn handle_connection(state: Arc<ServerState>, ws: WebSocketStream<TcpStream>, room: String, identity: Identity) {
  info!(room, participant = %identity.id, "participant connected");
  let (mut ws_sink, mut ws_stream) = ws.split();

  // Only the room table holds the sender, so leaving (or being superseded)
  // ends the writer.
  let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
  let conn_id = state.join(&room, &identity, tx);

  let writer = tokio::spawn(async move {
    loop {
      match tokio::time::timeout(KEEPALIVE, rx.recv()).await {
        Ok(Some(message)) => {
          let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
              warn!("encode server message: {err}");
              continue;
            }
          };
          if ws_sink.send(Message::Text(text)).await.is_err() {
            return;
          }
        }
        Ok(None) => break,
        Err(_elapsed) => {
          if ws_sink.send(Message::Ping(Vec::new())).await.is_err() {
            return;
          }
        }
      }
    }
    let _ = ws_sink.send(Message::Close(None)).await;
    let _ = ws_sink.close().await;
  });

  while let Some(msg) = ws_stream.next().await {
    let text = match msg {
      Ok(Message::Text(text)) => text,
      Ok(Message::Close(_)) => break,
      Ok(_) => continue,
      Err(err) => {
        debug!("websocket read failed: {err}");
        break;
      }
    };
    let message: ClientMessage = match serde_json::from_str(&text) {
      Ok(message) => message,
      Err(err) => {
        debug!("ignoring malformed client message: {err}");
        continue;
      }
    };
    if matches!(message, ClientMessage::Leave) {
      break;
    }
    state.dispatch(&room, &identity, conn_id, message);
  }

  state.leave(&room, &identity.id, conn_id);
  let _ = writer.await;
  info!(room, participant = %identity.id, "participant disconnected");
}
