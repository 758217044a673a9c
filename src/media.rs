//! Local camera/microphone capture.
//!
//! [`acquire`] never fails: it walks down from audio+video to audio-only,
//! video-only and finally an empty stream, and reports what it could not get
//! through [`Capabilities`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
  Audio,
  Video,
}

impl TrackKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      TrackKind::Audio => "audio",
      TrackKind::Video => "video",
    }
  }

  fn mime_type(&self) -> &'static str {
    match self {
      TrackKind::Audio => MIME_TYPE_OPUS,
      TrackKind::Video => MIME_TYPE_VP8,
    }
  }
}

impl std::fmt::Display for TrackKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
  pub id: String,
  pub kind: TrackKind,
}

/// What a renderer needs to know about a stream: its id and its tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRef {
  pub id: String,
  pub tracks: Vec<TrackInfo>,
}

pub struct LocalTrack {
  id: String,
  kind: TrackKind,
  stream_id: String,
  enabled: AtomicBool,
  live: AtomicBool,
  rtc: Arc<TrackLocalStaticSample>,
  pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalTrack {
  pub fn new(kind: TrackKind, stream_id: &str) -> Arc<Self> {
    let id = format!("{}-{}", kind, Uuid::new_v4().simple());
    let rtc = Arc::new(TrackLocalStaticSample::new(
      RTCRtpCodecCapability {
        mime_type: kind.mime_type().to_string(),
        ..Default::default()
      },
      id.clone(),
      stream_id.to_string(),
    ));
    Arc::new(Self {
      id,
      kind,
      stream_id: stream_id.to_string(),
      enabled: AtomicBool::new(true),
      live: AtomicBool::new(true),
      rtc,
      pump: Mutex::new(None),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn kind(&self) -> TrackKind {
    self.kind
  }

  pub fn stream_id(&self) -> &str {
    &self.stream_id
  }

  pub fn info(&self) -> TrackInfo {
    TrackInfo {
      id: self.id.clone(),
      kind: self.kind,
    }
  }

  pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
    self.rtc.clone()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.store(enabled, Ordering::SeqCst);
  }

  pub fn is_live(&self) -> bool {
    self.live.load(Ordering::SeqCst)
  }

  /// Releases the capture device. Safe to call more than once.
  pub fn stop(&self) {
    if self.live.swap(false, Ordering::SeqCst) {
      if let Some(pump) = self.pump.lock().take() {
        pump.abort();
      }
      debug!(track = %self.id, kind = %self.kind, "track stopped");
    }
  }

  /// Feeds placeholder frames (Opus silence, a dummy VP8 payload) into the
  /// track while it is live and enabled.
  fn start_synthetic_pump(self: &Arc<Self>) {
    let track = Arc::downgrade(self);
    let (payload, frame) = match self.kind {
      TrackKind::Audio => (Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
      TrackKind::Video => (Bytes::from_static(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]), VIDEO_FRAME),
    };
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(frame);
      loop {
        ticker.tick().await;
        let Some(track) = track.upgrade() else { break };
        if !track.is_live() {
          break;
        }
        if !track.is_enabled() {
          continue;
        }
        let sample = Sample {
          data: payload.clone(),
          duration: frame,
          ..Default::default()
        };
        if let Err(err) = track.rtc.write_sample(&sample).await {
          debug!(track = %track.id, "write sample: {err}");
        }
      }
    });
    *self.pump.lock() = Some(handle);
  }
}

impl Drop for LocalTrack {
  fn drop(&mut self) {
    if let Some(pump) = self.pump.get_mut().take() {
      pump.abort();
    }
  }
}

impl std::fmt::Debug for LocalTrack {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LocalTrack")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("enabled", &self.is_enabled())
      .field("live", &self.is_live())
      .finish()
  }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
  id: String,
  tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
  pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
    Self { id: id.into(), tracks }
  }

  pub fn empty(id: impl Into<String>) -> Self {
    Self::new(id, Vec::new())
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn tracks(&self) -> &[Arc<LocalTrack>] {
    &self.tracks
  }

  pub fn has(&self, kind: TrackKind) -> bool {
    self.tracks.iter().any(|track| track.kind() == kind)
  }

  /// Mutes or unmutes every track of `kind` without touching any peer
  /// connection. Returns how many tracks were changed.
  pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
    let mut changed = 0;
    for track in self.tracks.iter().filter(|track| track.kind() == kind) {
      track.set_enabled(enabled);
      changed += 1;
    }
    changed
  }

  pub fn is_enabled(&self, kind: TrackKind) -> bool {
    self
      .tracks
      .iter()
      .any(|track| track.kind() == kind && track.is_live() && track.is_enabled())
  }

  pub fn stop(&self) {
    for track in &self.tracks {
      track.stop();
    }
  }

  pub fn active_track_count(&self) -> usize {
    self.tracks.iter().filter(|track| track.is_live()).count()
  }

  pub fn stream_ref(&self) -> StreamRef {
    StreamRef {
      id: self.id.clone(),
      tracks: self.tracks.iter().map(|track| track.info()).collect(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
  pub audio: bool,
  pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  pub audio: bool,
  pub video: bool,
}

#[derive(Debug)]
pub struct Acquired {
  pub stream: LocalStream,
  pub capabilities: Capabilities,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
  /// Opens every requested kind or fails as a whole.
  async fn open(&self, constraints: Constraints, stream_id: &str) -> Result<Vec<Arc<LocalTrack>>, MediaError>;
}

pub async fn acquire(devices: &dyn MediaDevices, want_audio: bool, want_video: bool) -> Acquired {
  let stream_id = format!("stream-{}", Uuid::new_v4().simple());
  let attempts = [
    Constraints { audio: true, video: true },
    Constraints { audio: true, video: false },
    Constraints { audio: false, video: true },
  ];

  let mut tried = Vec::with_capacity(attempts.len());
  for constraints in attempts {
    let constraints = Constraints {
      audio: constraints.audio && want_audio,
      video: constraints.video && want_video,
    };
    if (!constraints.audio && !constraints.video) || tried.contains(&constraints) {
      continue;
    }
    tried.push(constraints);
    match devices.open(constraints, &stream_id).await {
      Ok(tracks) => {
        let stream = LocalStream::new(stream_id, tracks);
        let capabilities = Capabilities {
          audio: stream.has(TrackKind::Audio),
          video: stream.has(TrackKind::Video),
        };
        info!(audio = capabilities.audio, video = capabilities.video, "local media acquired");
        return Acquired { stream, capabilities };
      }
      Err(err) => {
        warn!(audio = constraints.audio, video = constraints.video, "media capture failed: {err}");
      }
    }
  }

  warn!("no media devices available, continuing with an empty stream");
  Acquired {
    stream: LocalStream::empty(stream_id),
    capabilities: Capabilities { audio: false, video: false },
  }
}

/// Software capture source. A kind set to `false` behaves like a missing or
/// denied device.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticDevices {
  pub audio: bool,
  pub video: bool,
}

impl SyntheticDevices {
  pub fn new(audio: bool, video: bool) -> Self {
    Self { audio, video }
  }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
  async fn open(&self, constraints: Constraints, stream_id: &str) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
    if constraints.audio && !self.audio {
      return Err(MediaError::Unavailable("audio"));
    }
    if constraints.video && !self.video {
      return Err(MediaError::Unavailable("video"));
    }

    let mut tracks = Vec::new();
    if constraints.audio {
      tracks.push(LocalTrack::new(TrackKind::Audio, stream_id));
    }
    if constraints.video {
      tracks.push(LocalTrack::new(TrackKind::Video, stream_id));
    }
    for track in &tracks {
      track.start_synthetic_pump();
    }
    Ok(tracks)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_full_capture() {
    let acquired = acquire(&SyntheticDevices::new(true, true), true, true).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: true, video: true });
    assert_eq!(acquired.stream.active_track_count(), 2);
    acquired.stream.stop();
  }

  #[tokio::test]
  async fn test_falls_back_to_audio_only() {
    let acquired = acquire(&SyntheticDevices::new(true, false), true, true).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: true, video: false });
    assert!(acquired.stream.has(TrackKind::Audio));
    assert!(!acquired.stream.has(TrackKind::Video));
    acquired.stream.stop();
  }

  #[tokio::test]
  async fn test_falls_back_to_video_only() {
    let acquired = acquire(&SyntheticDevices::new(false, true), true, true).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: false, video: true });
    acquired.stream.stop();
  }

  #[tokio::test]
  async fn test_no_devices_yields_empty_stream() {
    let acquired = acquire(&SyntheticDevices::new(false, false), true, true).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: false, video: false });
    assert!(acquired.stream.tracks().is_empty());
  }

  #[tokio::test]
  async fn test_unwanted_kinds_are_not_opened() {
    let acquired = acquire(&SyntheticDevices::new(true, true), false, true).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: false, video: true });
    acquired.stream.stop();
  }

  struct RecordingDevices {
    inner: SyntheticDevices,
    attempts: Mutex<Vec<Constraints>>,
  }

  #[async_trait]
  impl MediaDevices for RecordingDevices {
    async fn open(&self, constraints: Constraints, stream_id: &str) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
      self.attempts.lock().push(constraints);
      self.inner.open(constraints, stream_id).await
    }
  }

  #[tokio::test]
  async fn test_each_constraint_set_is_tried_once() {
    let devices = RecordingDevices {
      inner: SyntheticDevices::new(false, true),
      attempts: Mutex::new(Vec::new()),
    };
    let acquired = acquire(&devices, true, false).await;

    assert_eq!(acquired.capabilities, Capabilities { audio: false, video: false });
    assert_eq!(
      *devices.attempts.lock(),
      vec![Constraints { audio: true, video: false }]
    );
  }

  #[tokio::test]
  async fn test_mute_and_stop() {
    let acquired = acquire(&SyntheticDevices::new(true, true), true, true).await;
    let stream = acquired.stream;

    assert_eq!(stream.set_track_enabled(TrackKind::Video, false), 1);
    assert!(!stream.is_enabled(TrackKind::Video));
    assert!(stream.is_enabled(TrackKind::Audio));
    assert_eq!(stream.active_track_count(), 2);

    stream.stop();
    stream.stop();
    assert_eq!(stream.active_track_count(), 0);
    assert!(!stream.is_enabled(TrackKind::Audio));
  }
}
