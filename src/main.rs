use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use confer::auth::{peek_identity, Identity, TokenValidator};
use confer::config::{IceServerConfig, RetryPolicy, RtcConfig};
use confer::media::SyntheticDevices;
use confer::peer::rtc::RtcTransportFactory;
use confer::room::{build_room_url, generate_room_id, parse_room_input};
use confer::signaling::{SignalingServer, WsSignalingChannel};
use confer::{logger, MeetingSession, SessionEvent, SessionOptions};

#[derive(Parser, Debug)]
#[command(name = "confer")]
#[command(about = "Meeting signaling server and headless participant")]
struct Cli {
  #[arg(short, long, global = true, help = "Debug logging (RUST_LOG overrides)")]
  verbose: bool,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the WebSocket signaling server
  Serve {
    #[arg(long, env = "CONFER_LISTEN", default_value = "127.0.0.1:8787", value_name = "ADDR")]
    listen: String,
    #[arg(long, env = "CONFER_JWT_SECRET", value_name = "SECRET", help = "HS256 secret for bearer tokens")]
    jwt_secret: String,
  },
  /// Mint a bearer token for a participant
  Token {
    #[arg(long, env = "CONFER_JWT_SECRET", value_name = "SECRET")]
    jwt_secret: String,
    #[arg(long, value_name = "ID")]
    user_id: String,
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
    #[arg(long, value_name = "URL")]
    picture: Option<String>,
    #[arg(long, default_value_t = 3600, value_name = "SECS")]
    ttl: i64,
  },
  /// Generate a room id and print its URL
  NewRoom {
    #[arg(long, env = "CONFER_ENDPOINT", value_name = "URL", help = "Signaling endpoint")]
    endpoint: Option<String>,
  },
  /// Join a room with synthetic audio/video until Ctrl-C
  Join {
    #[arg(value_name = "ROOM_ID_OR_URL", help = "Room ID or full room URL")]
    room_input: String,
    #[arg(long, env = "CONFER_ENDPOINT", value_name = "URL", help = "Override signaling endpoint")]
    endpoint: Option<String>,
    #[arg(long, env = "CONFER_TOKEN", value_name = "TOKEN", help = "Bearer token")]
    token: String,
    #[arg(long, help = "Join without audio")]
    no_audio: bool,
    #[arg(long, help = "Join without video")]
    no_video: bool,
    #[arg(long, value_name = "FILE", help = "JSON file with {\"iceServers\": [...]}")]
    ice_config: Option<PathBuf>,
    #[arg(long = "stun", value_name = "URL", help = "Additional STUN server")]
    stun: Vec<String>,
    #[arg(long, value_name = "URL", requires_all = ["turn_username", "turn_credential"])]
    turn: Option<String>,
    #[arg(long, value_name = "USER")]
    turn_username: Option<String>,
    #[arg(long, value_name = "SECRET")]
    turn_credential: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  logger::init(cli.verbose);

  match cli.command {
    Command::Serve { listen, jwt_secret } => run_serve(&listen, &jwt_secret).await,
    Command::Token {
      jwt_secret,
      user_id,
      name,
      picture,
      ttl,
    } => {
      let mut identity = Identity::new(user_id);
      if let Some(name) = name {
        identity = identity.with_display_name(name);
      }
      if let Some(picture) = picture {
        identity = identity.with_photo_url(picture);
      }
      let token = TokenValidator::new(jwt_secret)
        .issue(&identity, ttl)
        .context("issue token")?;
      println!("{token}");
      Ok(())
    }
    Command::NewRoom { endpoint } => {
      let room_id = generate_room_id();
      log_line("[room] id", &room_id);
      log_line("[room] url", &build_room_url(endpoint.as_deref(), &room_id)?);
      Ok(())
    }
    Command::Join {
      room_input,
      endpoint,
      token,
      no_audio,
      no_video,
      ice_config,
      stun,
      turn,
      turn_username,
      turn_credential,
    } => {
      let mut rtc_config = match ice_config {
        Some(path) => RtcConfig::from_json_file(&path).await?,
        None => RtcConfig::default(),
      };
      rtc_config.ice_servers.extend(stun.into_iter().map(IceServerConfig::stun));
      if let (Some(url), Some(username), Some(credential)) = (turn, turn_username, turn_credential) {
        rtc_config.ice_servers.push(IceServerConfig::turn(url, username, credential));
      }
      run_join(&room_input, endpoint, &token, !no_audio, !no_video, rtc_config).await
    }
  }
}

async fn run_serve(listen: &str, jwt_secret: &str) -> Result<()> {
  let server = SignalingServer::bind(listen, TokenValidator::new(jwt_secret))
    .await
    .with_context(|| format!("bind {listen}"))?;
  log_line("[server] listening", &server.local_addr()?.to_string());

  tokio::select! {
    result = server.run() => result.context("signaling server")?,
    _ = tokio::signal::ctrl_c() => info!("shutting down"),
  }
  Ok(())
}

async fn run_join(
  room_input: &str,
  endpoint: Option<String>,
  token: &str,
  audio: bool,
  video: bool,
  rtc_config: RtcConfig,
) -> Result<()> {
  let parsed = parse_room_input(room_input)?;
  let endpoint = endpoint.or(parsed.endpoint);
  let identity = peek_identity(token).context("read bearer token")?;

  log_line("[room] id", &parsed.room_id);
  log_line("[room] url", &build_room_url(endpoint.as_deref(), &parsed.room_id)?);
  log_line("[me] id", &identity.id);

  let factory = Arc::new(RtcTransportFactory::new(rtc_config).context("create webrtc api")?);
  let channel = Arc::new(WsSignalingChannel::new(endpoint, token));
  let options = SessionOptions::new(parsed.room_id, identity)
    .with_media(audio, video)
    .with_retry(RetryPolicy::default());
  let handle = MeetingSession::join(options, channel, &SyntheticDevices::new(true, true), factory)
    .await
    .context("join meeting")?;

  let mut events = handle.subscribe_events();
  let mut participants = handle.subscribe_participants();
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(SessionEvent::ParticipantJoined(id)) => log_line("[peer] joined", &id),
        Ok(SessionEvent::ParticipantLeft(id)) => log_line("[peer] left", &id),
        Ok(SessionEvent::Chat(chat)) => {
          let name = chat.display_name.unwrap_or(chat.from);
          log_line(&format!("[chat] {name}"), &chat.text);
        }
        Ok(SessionEvent::Error(message)) => warn!("{message}"),
        Ok(SessionEvent::Ended) | Err(RecvError::Closed) => break,
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
      },
      changed = participants.changed() => {
        if changed.is_err() {
          break;
        }
        let names: Vec<String> = participants
          .borrow_and_update()
          .iter()
          .map(|participant| participant.label().to_string())
          .collect();
        log_line("[room] participants", &names.join(", "));
      }
    }
  }

  if let Ok(states) = handle.connection_states().await {
    for (participant, state) in states {
      log_line(&format!("[rtc] {participant}"), &state.to_string());
    }
  }
  handle.leave().await;
  log_line("[room] left", handle.room());
  Ok(())
}

fn log_line(label: &str, value: &str) {
  let now = chrono::Utc::now().format("%H:%M:%S%.3f");
  println!("[{now}] {label}: {value}");
}
