//! Encore: client runtime for AI-performed live streams.
//!
//! A backend performs a scripted show as a stream of *steps*: each one carries
//! an avatar cue, a line of speech and the synthesized audio for it. This crate
//! follows that stream and performs it locally:
//!
//! ```text
//! Step stream → Router → Playback queue → Speaker
//!                  ↘ Avatar driver (cues, captions, speaking state)
//! ```
//!
//! # Architecture
//!
//! - **Step channel**: self-healing WebSocket client with backoff and replay suppression
//! - **Playback queue**: ordered, gapless playback with one decode of look-ahead
//! - **Router**: dedups steps, forwards cues and paces captions by the audio
//! - **Control client**: HTTP calls that start performances and relay chat

pub mod avatar;
pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod playback;
pub mod router;
pub mod session;
pub mod step;

pub use avatar::{AvatarDriver, LoggingAvatarDriver, NoopAvatarDriver};
pub use channel::{ChannelEvent, ChannelSnapshot, ConnectionState, StepChannel, StreamPhase};
pub use config::LiveConfig;
pub use control::ControlClient;
pub use error::{LiveError, Result};
pub use playback::{PlaybackEvent, PlaybackQueue, QueueStatus, UnitId};
pub use router::{RouteOutcome, StepRouter};
pub use session::LiveSession;
pub use step::{AudioPayload, Cue, Step, StepKey};
