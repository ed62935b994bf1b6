//! Output seam of the playback queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::unit::{DecodedClip, UnitId};
use crate::error::Result;

/// Progress reported by an output device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkEvent {
    /// The first sample of the unit reached the device.
    Started(UnitId),
    /// The last sample of the unit reached the device.
    Finished(UnitId),
    /// Output level over the last window, for mouth animation.
    Level(f32),
}

/// An audio output device.
///
/// Clips are played strictly in the order they are scheduled, each one
/// starting on the sample after the previous one ends.
pub trait AudioSink: Send {
    /// Route progress events to `events`. Called once before any `schedule`.
    fn attach(&mut self, events: mpsc::UnboundedSender<SinkEvent>);

    /// Queue `clip` to play right after whatever is already scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`crate::LiveError::Audio`] if the device cannot accept the clip.
    fn schedule(&mut self, unit: UnitId, clip: DecodedClip) -> Result<()>;

    /// Silence output immediately and forget every scheduled clip.
    fn halt(&mut self);
}

/// One segment of output as observed by a [`SilentSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub unit: UnitId,
    pub started_at: Instant,
    /// `None` while still sounding.
    pub ended_at: Option<Instant>,
}

/// Shared record of everything a [`SilentSink`] played.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    segments: Arc<Mutex<Vec<Segment>>>,
}

impl Timeline {
    pub fn segments(&self) -> Vec<Segment> {
        match self.segments.lock() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Units in the order they started.
    pub fn order(&self) -> Vec<UnitId> {
        self.segments().iter().map(|s| s.unit).collect()
    }

    /// Largest silence between one segment's end and the next one's start.
    pub fn max_gap(&self) -> Duration {
        self.segments()
            .windows(2)
            .filter_map(|w| {
                w[0].ended_at
                    .map(|end| w[1].started_at.saturating_duration_since(end))
            })
            .max()
            .unwrap_or_default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<Segment>) -> R) -> R {
        let mut guard = match self.segments.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut guard)
    }
}

/// A clock-driven output that produces no sound.
///
/// Each clip occupies the output for exactly its duration. Used for headless
/// runs and wherever real timing matters but a device does not.
pub struct SilentSink {
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
    clips: Option<mpsc::UnboundedSender<(UnitId, Duration)>>,
    driver: Option<JoinHandle<()>>,
    timeline: Timeline,
}

impl SilentSink {
    pub fn new() -> Self {
        Self {
            events: None,
            clips: None,
            driver: None,
            timeline: Timeline::default(),
        }
    }

    /// Handle onto the record of played segments.
    pub fn timeline(&self) -> Timeline {
        self.timeline.clone()
    }

    fn spawn_driver(&mut self) -> mpsc::UnboundedSender<(UnitId, Duration)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(UnitId, Duration)>();
        let events = self.events.clone();
        let timeline = self.timeline.clone();

        self.driver = Some(tokio::spawn(async move {
            let mut free_at = Instant::now();
            while let Some((unit, duration)) = rx.recv().await {
                let start = free_at.max(Instant::now());
                tokio::time::sleep_until(start).await;
                timeline.with(|s| {
                    s.push(Segment {
                        unit,
                        started_at: start,
                        ended_at: None,
                    });
                });
                if let Some(tx) = events.as_ref() {
                    let _ = tx.send(SinkEvent::Started(unit));
                }

                let end = start + duration;
                tokio::time::sleep_until(end).await;
                timeline.with(|s| {
                    if let Some(seg) = s.last_mut() {
                        seg.ended_at = Some(end);
                    }
                });
                if let Some(tx) = events.as_ref() {
                    let _ = tx.send(SinkEvent::Finished(unit));
                }
                free_at = end;
            }
        }));
        self.clips = Some(tx.clone());
        tx
    }
}

impl Default for SilentSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for SilentSink {
    fn attach(&mut self, events: mpsc::UnboundedSender<SinkEvent>) {
        self.halt();
        self.events = Some(events);
    }

    fn schedule(&mut self, unit: UnitId, clip: DecodedClip) -> Result<()> {
        let tx = match self.clips.as_ref() {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => self.spawn_driver(),
        };
        tx.send((unit, clip.duration()))
            .map_err(|_| crate::LiveError::Audio("silent output stopped".into()))
    }

    fn halt(&mut self) {
        self.clips = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        let now = Instant::now();
        self.timeline.with(|s| {
            for seg in s.iter_mut().filter(|seg| seg.ended_at.is_none()) {
                seg.ended_at = Some(now.max(seg.started_at));
            }
        });
    }
}

impl Drop for SilentSink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
