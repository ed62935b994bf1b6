//! The avatar driver seam.
//!
//! The router tells an [`AvatarDriver`] what the performer is doing; how that
//! becomes motion (VRM blend shapes, a 2D rig, a log line) is up to the driver.
//!
//! All methods take `&self` and default to doing nothing, so a driver only
//! implements what it renders.

use std::time::Duration;

use tracing::info;

use crate::step::Cue;

/// Receives performance cues, captions and speaking state.
pub trait AvatarDriver: Send + Sync {
    /// Apply a motion/expression cue. Repeated identical cues may arrive.
    fn apply_cue(&self, _cue: &Cue) {}

    /// Whether the performer is currently speaking.
    fn set_speaking(&self, _speaking: bool) {}

    /// Show a caption. `duration` is how long the matching audio plays; `None`
    /// means there is no audio to pace it by.
    fn show_caption(&self, _text: &str, _duration: Option<Duration>) {}

    /// Output level of the current speech, roughly 0.0..=1.0.
    fn set_mouth_level(&self, _rms: f32) {}
}

/// A driver that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAvatarDriver;

impl AvatarDriver for NoopAvatarDriver {}

/// A driver that logs what it is told, for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAvatarDriver;

impl AvatarDriver for LoggingAvatarDriver {
    fn apply_cue(&self, cue: &Cue) {
        let emotion = cue
            .emotion
            .as_ref()
            .map(|e| e.key.as_str())
            .or(cue.tag.as_deref())
            .unwrap_or("-");
        let gesture = cue.gesture.as_ref().map_or("-", |g| g.clip.as_str());
        info!("cue: emotion={emotion} gesture={gesture}");
    }

    fn set_speaking(&self, speaking: bool) {
        info!("speaking: {speaking}");
    }

    fn show_caption(&self, text: &str, duration: Option<Duration>) {
        match duration {
            Some(d) => info!("caption ({:.1}s): {text}", d.as_secs_f32()),
            None => info!("caption: {text}"),
        }
    }
}
