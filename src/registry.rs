//! The set of participants a meeting renders, published as whole snapshots.

use tokio::sync::watch;

use crate::media::{StreamRef, TrackInfo};
use crate::peer::RemoteTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
  pub id: String,
  pub display_name: Option<String>,
  pub photo_url: Option<String>,
  pub stream: Option<StreamRef>,
  pub audio_enabled: bool,
  pub video_enabled: bool,
  pub is_local: bool,
}

impl Participant {
  fn new(id: &str) -> Self {
    Self {
      id: id.to_string(),
      display_name: None,
      photo_url: None,
      stream: None,
      audio_enabled: true,
      video_enabled: true,
      is_local: false,
    }
  }

  /// The name to show, falling back to the id.
  pub fn label(&self) -> &str {
    self.display_name.as_deref().unwrap_or(&self.id)
  }
}

/// Fields to merge into a participant; `None` leaves the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantPatch {
  pub display_name: Option<String>,
  pub photo_url: Option<String>,
  pub stream: Option<StreamRef>,
  pub audio_enabled: Option<bool>,
  pub video_enabled: Option<bool>,
  pub is_local: Option<bool>,
}

impl ParticipantPatch {
  pub fn media(audio_enabled: bool, video_enabled: bool) -> Self {
    Self {
      audio_enabled: Some(audio_enabled),
      video_enabled: Some(video_enabled),
      ..Default::default()
    }
  }
}

pub struct ParticipantRegistry {
  entries: Vec<Participant>,
  tx: watch::Sender<Vec<Participant>>,
}

impl Default for ParticipantRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ParticipantRegistry {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(Vec::new());
    Self { entries: Vec::new(), tx }
  }

  pub fn subscribe(&self) -> watch::Receiver<Vec<Participant>> {
    self.tx.subscribe()
  }

  /// Participants in the order they were first seen.
  pub fn list(&self) -> Vec<Participant> {
    self.entries.clone()
  }

  pub fn get(&self, id: &str) -> Option<&Participant> {
    self.entries.iter().find(|participant| participant.id == id)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Merges `patch` into the entry for `id`, creating it if needed.
  pub fn upsert(&mut self, id: &str, patch: ParticipantPatch) {
    let participant = self.entry(id);
    if let Some(name) = patch.display_name {
      participant.display_name = Some(name);
    }
    if let Some(url) = patch.photo_url {
      participant.photo_url = Some(url);
    }
    if let Some(stream) = patch.stream {
      participant.stream = Some(stream);
    }
    if let Some(enabled) = patch.audio_enabled {
      participant.audio_enabled = enabled;
    }
    if let Some(enabled) = patch.video_enabled {
      participant.video_enabled = enabled;
    }
    if let Some(is_local) = patch.is_local {
      participant.is_local = is_local;
    }
    self.publish();
  }

  /// Adds a remote track to the participant's stream. A track may arrive
  /// before the participant's presence, so the entry is created if missing.
  pub fn attach_track(&mut self, id: &str, track: &RemoteTrack) {
    let participant = self.entry(id);
    let info = TrackInfo {
      id: track.track_id.clone(),
      kind: track.kind,
    };
    match &mut participant.stream {
      Some(stream) if stream.id == track.stream_id => {
        if !stream.tracks.iter().any(|existing| existing.id == info.id) {
          stream.tracks.push(info);
        }
      }
      stream => {
        *stream = Some(StreamRef {
          id: track.stream_id.clone(),
          tracks: vec![info],
        })
      }
    }
    self.publish();
  }

  pub fn remove(&mut self, id: &str) -> bool {
    let before = self.entries.len();
    self.entries.retain(|participant| participant.id != id);
    let removed = self.entries.len() != before;
    if removed {
      self.publish();
    }
    removed
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.publish();
  }

  fn entry(&mut self, id: &str) -> &mut Participant {
    let index = match self.entries.iter().position(|participant| participant.id == id) {
      Some(index) => index,
      None => {
        self.entries.push(Participant::new(id));
        self.entries.len() - 1
      }
    };
    &mut self.entries[index]
  }

  fn publish(&self) {
    self.tx.send_replace(self.entries.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::media::TrackKind;

  fn track(stream: &str, id: &str, kind: TrackKind) -> RemoteTrack {
    RemoteTrack {
      stream_id: stream.into(),
      track_id: id.into(),
      kind,
    }
  }

  #[test]
  fn test_upsert_merges_without_duplicates() {
    let mut registry = ParticipantRegistry::new();
    registry.upsert(
      "bob",
      ParticipantPatch {
        display_name: Some("Bob".into()),
        ..Default::default()
      },
    );
    registry.upsert("bob", ParticipantPatch::media(false, true));

    let list = registry.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].label(), "Bob");
    assert!(!list[0].audio_enabled);
    assert!(list[0].video_enabled);
  }

  #[test]
  fn test_track_before_presence() {
    let mut registry = ParticipantRegistry::new();
    registry.attach_track("bob", &track("s1", "a1", TrackKind::Audio));
    registry.attach_track("bob", &track("s1", "v1", TrackKind::Video));
    registry.attach_track("bob", &track("s1", "v1", TrackKind::Video));
    registry.upsert(
      "bob",
      ParticipantPatch {
        display_name: Some("Bob".into()),
        ..Default::default()
      },
    );

    let bob = registry.get("bob").unwrap();
    let stream = bob.stream.as_ref().unwrap();
    assert_eq!(stream.id, "s1");
    assert_eq!(stream.tracks.len(), 2);
    assert_eq!(bob.display_name.as_deref(), Some("Bob"));
  }

  #[test]
  fn test_new_stream_replaces_old() {
    let mut registry = ParticipantRegistry::new();
    registry.attach_track("bob", &track("s1", "a1", TrackKind::Audio));
    registry.attach_track("bob", &track("s2", "a2", TrackKind::Audio));

    let stream = registry.get("bob").unwrap().stream.clone().unwrap();
    assert_eq!(stream.id, "s2");
    assert_eq!(stream.tracks.len(), 1);
  }

  #[test]
  fn test_snapshots_follow_mutations() {
    let mut registry = ParticipantRegistry::new();
    let rx = registry.subscribe();

    registry.upsert("me", ParticipantPatch::default());
    registry.upsert("bob", ParticipantPatch::default());
    assert_eq!(
      rx.borrow().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
      vec!["me", "bob"]
    );

    assert!(registry.remove("bob"));
    assert!(!registry.remove("bob"));
    assert_eq!(rx.borrow().len(), 1);

    registry.clear();
    assert!(rx.borrow().is_empty());
    assert!(registry.is_empty());
  }
}
