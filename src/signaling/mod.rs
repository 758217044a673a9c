//! Room-scoped signaling: presence, targeted negotiation messages, media
//! state and chat, behind one transport-agnostic trait.
//!
//! Delivery is at-least-once and ordered per sender. Negotiation messages
//! reach only the participant named in their `to` field.

pub mod server;
pub mod store;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::error::SignalingError;
use crate::protocol::SignalingMessage;

pub use server::SignalingServer;
pub use store::{DocumentStore, StoreChannel};
pub use ws::WsSignalingChannel;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
  Message(SignalingMessage),
  /// The channel reported a problem; the subscription may still be alive.
  Error(String),
  /// The channel ended and will deliver nothing more.
  Closed(Option<String>),
}

/// A live subscription to one room. Dropping it unsubscribes.
pub struct Subscription {
  events: mpsc::UnboundedReceiver<ChannelEvent>,
  on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub fn new(events: mpsc::UnboundedReceiver<ChannelEvent>, on_unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      events,
      on_unsubscribe: Some(Box::new(on_unsubscribe)),
    }
  }

  pub async fn recv(&mut self) -> Option<ChannelEvent> {
    if self.on_unsubscribe.is_none() {
      return None;
    }
    self.events.recv().await
  }

  pub fn is_active(&self) -> bool {
    self.on_unsubscribe.is_some()
  }

  pub fn unsubscribe(&mut self) {
    if let Some(hook) = self.on_unsubscribe.take() {
      hook();
      self.events.close();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("active", &self.is_active()).finish()
  }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
  /// Starts delivering messages for `room` addressed to `me` (or broadcast).
  /// Peers already present are reported as `joined` presence first.
  async fn subscribe(&self, room: &str, me: &Identity) -> Result<Subscription, SignalingError>;

  /// Publishes a message into the subscribed room.
  async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}
