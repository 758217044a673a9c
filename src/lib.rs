//! Signaling and peer negotiation for small-group video meetings.
//!
//! A [`session::MeetingSession`] joins a room over a
//! [`signaling::SignalingChannel`], opens one peer connection per remote
//! participant and keeps a [`registry::ParticipantRegistry`] of who is in the
//! room and which media they publish.

pub mod auth;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod session;
pub mod signaling;

pub use error::{MediaError, SessionError, SignalingError, TransportError};
pub use session::{MeetingHandle, MeetingSession, SessionEvent, SessionOptions};
