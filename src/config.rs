use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
  pub urls: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub credential: Option<String>,
}

impl IceServerConfig {
  pub fn stun(url: impl Into<String>) -> Self {
    Self {
      urls: vec![url.into()],
      username: None,
      credential: None,
    }
  }

  pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
    Self {
      urls: vec![url.into()],
      username: Some(username.into()),
      credential: Some(credential.into()),
    }
  }
}

impl From<&IceServerConfig> for RTCIceServer {
  fn from(server: &IceServerConfig) -> Self {
    RTCIceServer {
      urls: server.urls.clone(),
      username: server.username.clone().unwrap_or_default(),
      credential: server.credential.clone().unwrap_or_default(),
      ..Default::default()
    }
  }
}

/// Relay configuration handed to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
  #[serde(rename = "iceServers")]
  pub ice_servers: Vec<IceServerConfig>,
}

impl Default for RtcConfig {
  fn default() -> Self {
    Self {
      ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| IceServerConfig::stun(*url)).collect(),
    }
  }
}

impl RtcConfig {
  /// Reads `{"iceServers": [{"urls": [..], "username": .., "credential": ..}]}`.
  pub async fn from_json_file(path: &Path) -> Result<Self> {
    let text = tokio::fs::read_to_string(path)
      .await
      .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
  }

  pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
    self.ice_servers.iter().map(RTCIceServer::from).collect()
  }
}

/// Delays used when a negotiation conflict forces a fresh offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub glare_base: Duration,
  pub glare_jitter: Duration,
  pub reset_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      glare_base: Duration::from_millis(2000),
      glare_jitter: Duration::from_millis(1000),
      reset_delay: Duration::from_millis(2000),
    }
  }
}

impl RetryPolicy {
  pub fn immediate() -> Self {
    Self {
      glare_base: Duration::from_millis(1),
      glare_jitter: Duration::from_millis(5),
      reset_delay: Duration::from_millis(1),
    }
  }

  pub fn glare_delay(&self) -> Duration {
    let jitter_ms = self.glare_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
      0
    } else {
      rand::Rng::gen_range(&mut rand::thread_rng(), 0..=jitter_ms)
    };
    self.glare_base + Duration::from_millis(jitter)
  }
}
