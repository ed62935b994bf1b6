//! Step-to-queue routing.
//!
//! [`StepRouter`] sits between the [`StepChannel`](crate::channel::StepChannel)
//! and the [`PlaybackQueue`]. It owns neither: it forwards cues to the avatar
//! driver, enqueues each step's audio exactly once and keeps captions in step
//! with the audio they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::avatar::AvatarDriver;
use crate::channel::{ChannelEvent, ConnectionState};
use crate::playback::{PlaybackEvent, PlaybackQueue, UnitId};
use crate::step::{SeenSteps, Step};

/// Step identities remembered for dedup.
const FORWARDED_WINDOW: usize = 4096;

/// What the router did with a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Audio was queued as this unit.
    Enqueued(UnitId),
    /// Same index and audio as a routed step; only the cue was forwarded.
    Duplicate,
    /// Neither speech nor audio; only the cue (if any) was forwarded.
    CueOnly,
    /// Arrived while not connected; only the cue was forwarded.
    Stale,
    /// Speech without audio; caption shown, nothing queued.
    MissingAudio,
    /// The queue refused the audio.
    Rejected,
}

/// Bridges steps to the playback queue and the avatar driver.
pub struct StepRouter {
    queue: Arc<PlaybackQueue>,
    driver: Arc<dyn AvatarDriver>,
    character_name: String,
    forwarded: SeenSteps,
    /// Captions waiting for their unit to start sounding.
    captions: HashMap<UnitId, String>,
}

impl StepRouter {
    pub fn new(
        queue: Arc<PlaybackQueue>,
        driver: Arc<dyn AvatarDriver>,
        character_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            driver,
            character_name: character_name.into(),
            forwarded: SeenSteps::new(FORWARDED_WINDOW),
            captions: HashMap::new(),
        }
    }

    /// Handle one step observed while the channel was in `state`.
    pub fn route(&mut self, step: &Step, state: ConnectionState) -> RouteOutcome {
        // Every step that reaches the router forwards its cue, including
        // enqueue duplicates and stale steps.
        if let Some(cue) = step.cue.as_ref() {
            self.driver.apply_cue(cue);
        }

        if state != ConnectionState::Connected {
            debug!("step {} is stale ({state}); cue only", step.index);
            return RouteOutcome::Stale;
        }

        let key = step.key();
        if !self.forwarded.insert(key.clone()) {
            debug!("dropping duplicate step {key}");
            return RouteOutcome::Duplicate;
        }

        let caption = step.speech.as_deref().map(|s| self.caption(s));

        match (step.audio.as_ref(), caption) {
            (Some(audio), caption) => match self.queue.enqueue(audio.clone()) {
                Ok(unit) => {
                    if let Some(caption) = caption {
                        self.captions.insert(unit, caption);
                    }
                    RouteOutcome::Enqueued(unit)
                }
                Err(e) => {
                    warn!("step {}: audio rejected: {e}", step.index);
                    if let Some(caption) = caption {
                        self.driver.show_caption(&caption, None);
                    }
                    RouteOutcome::Rejected
                }
            },
            (None, Some(caption)) => {
                warn!(
                    "step {} has speech but no audio; upstream speech synthesis may have failed",
                    step.index
                );
                self.driver.show_caption(&caption, None);
                RouteOutcome::MissingAudio
            }
            (None, None) => RouteOutcome::CueOnly,
        }
    }

    /// React to playback progress.
    pub fn on_playback(&mut self, event: &PlaybackEvent) {
        match event {
            PlaybackEvent::Started => self.driver.set_speaking(true),
            PlaybackEvent::SegmentDuration { unit, duration } => {
                if let Some(caption) = self.captions.remove(unit) {
                    self.driver.show_caption(&caption, Some(*duration));
                }
            }
            PlaybackEvent::Error { unit, .. } => {
                if let Some(caption) = self.captions.remove(unit) {
                    self.driver.show_caption(&caption, None);
                }
            }
            PlaybackEvent::Ended { interrupted } => {
                self.driver.set_speaking(false);
                if *interrupted {
                    self.captions.clear();
                }
            }
            PlaybackEvent::Level { rms } => self.driver.set_mouth_level(*rms),
            PlaybackEvent::SegmentEnded { .. } => {}
        }
    }

    /// Forget forwarded identities and pending captions (new performance).
    pub fn reset(&mut self) {
        self.forwarded.clear();
        self.captions.clear();
    }

    fn caption(&self, speech: &str) -> String {
        if self.character_name.is_empty() {
            speech.to_owned()
        } else {
            format!("{}: {speech}", self.character_name)
        }
    }

    /// Route channel and playback events until cancelled or either source closes.
    ///
    /// `state` is the channel state at the time `steps` was subscribed.
    pub async fn run(
        mut self,
        mut steps: broadcast::Receiver<ChannelEvent>,
        mut playback: broadcast::Receiver<PlaybackEvent>,
        mut state: ConnectionState,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Apply whatever playback already reported, e.g. the
                    // `Ended` from a stop that preceded the cancel.
                    while let Ok(event) = playback.try_recv() {
                        self.on_playback(&event);
                    }
                    break;
                }
                event = steps.recv() => match event {
                    Ok(ChannelEvent::State(next)) => state = next,
                    Ok(ChannelEvent::Step(step)) => {
                        let outcome = self.route(&step, state);
                        debug!("step {} routed: {outcome:?}", step.index);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("router fell behind; {n} channel events lost");
                    }
                    Err(RecvError::Closed) => break,
                },
                event = playback.recv() => match event {
                    Ok(event) => self.on_playback(&event),
                    Err(RecvError::Lagged(n)) => {
                        warn!("router fell behind; {n} playback events lost");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("step router stopped");
    }
}
