//! Room ids, room URLs and signaling endpoint URLs.

use std::env;

use anyhow::{anyhow, Result};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787";
pub const ENDPOINT_ENV: &str = "CONFER_ENDPOINT";

const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInput {
  pub room_id: String,
  pub endpoint: Option<String>,
}

/// Room ids travel in URL paths, so only URL-safe characters are accepted.
pub fn is_valid_room_id(room_id: &str) -> bool {
  !room_id.is_empty()
    && room_id.len() <= MAX_ROOM_ID_LEN
    && room_id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn generate_room_id() -> String {
  Uuid::new_v4().simple().to_string()
}

/// Accepts a bare room id or a room URL (`https://host/r/<room>`).
pub fn parse_room_input(value: &str) -> Result<RoomInput> {
  if let Ok(url) = Url::parse(value) {
    let room_id = extract_room_id_from_url(&url)?;
    let endpoint = Some(base_endpoint_url(Some(url.as_str()))?.to_string());
    return Ok(RoomInput { room_id, endpoint });
  }
  let room_id = value.trim();
  if room_id.is_empty() {
    return Err(anyhow!("Room ID is required"));
  }
  if !is_valid_room_id(room_id) {
    return Err(anyhow!("Invalid room ID: {room_id}"));
  }
  Ok(RoomInput {
    room_id: room_id.to_string(),
    endpoint: None,
  })
}

fn extract_room_id_from_url(url: &Url) -> Result<String> {
  let segments: Vec<_> = url
    .path_segments()
    .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
    .unwrap_or_default();
  let room_id = match segments.as_slice() {
    ["r", room_id, ..] | ["ws", room_id, ..] => room_id.to_string(),
    [room_id] => room_id.to_string(),
    _ => return Err(anyhow!("Room ID not found in URL path")),
  };
  if !is_valid_room_id(&room_id) {
    return Err(anyhow!("Invalid room ID: {room_id}"));
  }
  Ok(room_id)
}

/// Normalizes an endpoint (explicit, `CONFER_ENDPOINT`, or the default) to
/// its `http`/`https` origin.
pub fn base_endpoint_url(endpoint: Option<&str>) -> Result<Url> {
  let endpoint = endpoint
    .map(|value| value.to_string())
    .or_else(|| env::var(ENDPOINT_ENV).ok())
    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

  let mut url = Url::parse(&endpoint)?;
  let scheme = match url.scheme() {
    "https" | "http" => url.scheme().to_string(),
    "wss" => "https".to_string(),
    "ws" => "http".to_string(),
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(&scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path("");
  url.set_query(None);
  url.set_fragment(None);
  Ok(url)
}

pub fn build_ws_url(endpoint: Option<&str>, room_id: &str) -> Result<Url> {
  let mut url = base_endpoint_url(endpoint)?;
  let scheme = match url.scheme() {
    "https" => "wss",
    _ => "ws",
  };
  url.set_scheme(scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path(&format!("/ws/{room_id}"));
  Ok(url)
}

pub fn build_room_url(endpoint: Option<&str>, room_id: &str) -> Result<String> {
  let mut url = base_endpoint_url(endpoint)?;
  url.set_path(&format!("/r/{room_id}"));
  Ok(url.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_bare_room_id() {
    let parsed = parse_room_input(" standup-42 ").unwrap();
    assert_eq!(parsed.room_id, "standup-42");
    assert_eq!(parsed.endpoint, None);

    assert!(parse_room_input("").is_err());
    assert!(parse_room_input("has space").is_err());
  }

  #[test]
  fn test_parse_room_url() {
    let parsed = parse_room_input("https://meet.example.com/r/abc_123?x=1#frag").unwrap();
    assert_eq!(parsed.room_id, "abc_123");
    assert_eq!(parsed.endpoint.as_deref(), Some("https://meet.example.com/"));

    assert!(parse_room_input("https://meet.example.com/").is_err());
  }

  #[test]
  fn test_ws_url_follows_endpoint_scheme() {
    let url = build_ws_url(Some("https://meet.example.com/some/path"), "room1").unwrap();
    assert_eq!(url.as_str(), "wss://meet.example.com/ws/room1");

    let url = build_ws_url(Some("ws://127.0.0.1:9000"), "room1").unwrap();
    assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws/room1");

    assert!(build_ws_url(Some("ftp://example.com"), "room1").is_err());
  }

  #[test]
  fn test_room_url_and_generated_ids() {
    let room_id = generate_room_id();
    assert!(is_valid_room_id(&room_id));
    assert_eq!(
      build_room_url(Some("http://localhost:8787"), &room_id).unwrap(),
      format!("http://localhost:8787/r/{room_id}")
    );
    assert!(!is_valid_room_id(&"x".repeat(129)));
  }
}
