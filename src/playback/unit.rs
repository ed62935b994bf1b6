//! Playback units and their lifecycle.

use std::fmt;
use std::time::Duration;

use crate::step::AudioPayload;

/// Identity of one enqueued payload, unique for the lifetime of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) u64);

impl UnitId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a playback unit.
///
/// ```text
/// Queued → Decoding → Decoded → Playing → Finished
///             ↓          ↓
///           Failed     Failed
/// ```
///
/// Any non-terminal state may also become `Dropped` when the queue is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Queued,
    Decoding,
    /// Decoded and handed to the output, waiting for the previous unit to end.
    Decoded,
    Playing,
    Finished,
    Failed,
    Dropped,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Dropped)
    }

    fn can_advance_to(self, next: Self) -> bool {
        use UnitState::*;
        match (self, next) {
            (Queued, Decoding) => true,
            (Decoding, Decoded | Failed) => true,
            (Decoded, Playing | Failed) => true,
            (Playing, Finished) => true,
            (from, Dropped) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// One enqueued payload moving through the pipeline.
#[derive(Debug)]
pub(crate) struct Unit {
    pub(crate) id: UnitId,
    /// Released once decoded.
    pub(crate) payload: Option<AudioPayload>,
    state: UnitState,
}

impl Unit {
    pub(crate) fn new(id: UnitId, payload: AudioPayload) -> Self {
        Self {
            id,
            payload: Some(payload),
            state: UnitState::Queued,
        }
    }

    pub(crate) fn state(&self) -> UnitState {
        self.state
    }

    /// Move to `next`. Invalid transitions are refused and logged.
    pub(crate) fn advance(&mut self, next: UnitState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                "unit {}: refusing transition {:?} -> {next:?}",
                self.id,
                self.state
            );
            return false;
        }
        tracing::trace!("unit {}: {:?} -> {next:?}", self.id, self.state);
        self.state = next;
        if next != UnitState::Queued && next != UnitState::Decoding {
            self.payload = None;
        }
        true
    }
}

/// Mono PCM ready for output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A silent clip of the given length.
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        Self::new(vec![0.0; frames], sample_rate)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.samples.len() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
