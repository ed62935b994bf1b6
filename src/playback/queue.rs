//! The playback queue and its pump.
//!
//! A single actor task owns the queue, the decoder hand-off and the output
//! sink. Callers talk to it through [`PlaybackQueue`]; it reacts to three
//! inputs (commands, decode completions and sink progress) one at a time, so
//! the pump can never run concurrently with itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::decode::ClipDecoder;
use super::sink::{AudioSink, SinkEvent};
use super::unit::{DecodedClip, Unit, UnitId, UnitState};
use crate::config::PlaybackConfig;
use crate::error::{LiveError, Result};
use crate::step::AudioPayload;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The first unit since the queue was last idle started sounding.
    /// Always follows that unit's `SegmentDuration`.
    Started,
    /// A unit started sounding; `duration` is its decoded length.
    SegmentDuration { unit: UnitId, duration: Duration },
    /// A unit finished sounding.
    SegmentEnded { unit: UnitId },
    /// The queue went idle. `interrupted` is set when caused by `stop()`.
    Ended { interrupted: bool },
    /// A unit was skipped because it could not be decoded or played.
    Error { unit: UnitId, reason: String },
    /// Output level while sounding.
    Level { rms: f32 },
}

/// Observable state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Anything queued, decoding or sounding.
    pub busy: bool,
    /// Units accepted but not yet sounding.
    pub pending: usize,
    pub playing: Option<UnitId>,
}

enum Command {
    Enqueue(Unit),
    Stop(oneshot::Sender<()>),
}

/// Ordered, gapless audio playback.
///
/// The queue is the only component that drives the output device. Dropping
/// it stops playback and releases the device.
pub struct PlaybackQueue {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PlaybackEvent>,
    status: watch::Receiver<QueueStatus>,
    next_id: AtomicU64,
    max_payload_bytes: usize,
    cancel: CancellationToken,
}

impl PlaybackQueue {
    /// Start the queue's actor task. Must be called within a tokio runtime.
    pub fn new(
        config: &PlaybackConfig,
        decoder: Arc<dyn ClipDecoder>,
        mut sink: Box<dyn AudioSink>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(QueueStatus::default());
        let (decode_tx, decode_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        sink.attach(sink_tx);

        let pump = Pump {
            decoder,
            sink,
            events: events.clone(),
            status: status_tx,
            max_depth: config.max_queue_depth.max(1),
            queued: VecDeque::new(),
            decoding: None,
            in_sink: VecDeque::new(),
            generation: 0,
            announced: false,
            busy: false,
            decode_tx,
        };
        let cancel = CancellationToken::new();
        tokio::spawn(run_pump(pump, command_rx, decode_rx, sink_rx, cancel.clone()));

        Self {
            commands,
            events,
            status,
            next_id: AtomicU64::new(1),
            max_payload_bytes: config.max_payload_bytes,
            cancel,
        }
    }

    /// Append a payload to the tail of the queue. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::InvalidPayload`] for empty or oversized payloads
    /// (nothing is queued), or [`LiveError::Channel`] if the queue has shut down.
    pub fn enqueue(&self, payload: impl Into<AudioPayload>) -> Result<UnitId> {
        let payload = payload.into();
        if payload.is_empty() {
            warn!("rejecting empty audio payload");
            return Err(LiveError::InvalidPayload("empty audio payload".into()));
        }
        if payload.len() > self.max_payload_bytes {
            warn!(
                "rejecting {} byte audio payload (limit {})",
                payload.len(),
                self.max_payload_bytes
            );
            return Err(LiveError::InvalidPayload(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let id = UnitId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.commands
            .send(Command::Enqueue(Unit::new(id, payload)))
            .map_err(|_| LiveError::Channel("playback queue is shut down".into()))?;
        debug!("enqueued unit {id}");
        Ok(id)
    }

    /// Halt playback, discard everything queued and abandon in-flight decodes.
    ///
    /// When this returns the output is silent and no event for a discarded
    /// unit will follow. Safe to call in any state.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.status.borrow().busy
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

struct InFlight {
    unit: Unit,
    task: JoinHandle<()>,
}

struct Scheduled {
    unit: Unit,
    duration: Duration,
}

struct DecodeDone {
    generation: u64,
    unit: UnitId,
    result: Result<DecodedClip>,
}

struct Pump {
    decoder: Arc<dyn ClipDecoder>,
    sink: Box<dyn AudioSink>,
    events: broadcast::Sender<PlaybackEvent>,
    status: watch::Sender<QueueStatus>,
    max_depth: usize,
    queued: VecDeque<Unit>,
    /// At most one decode at a time, always for the oldest undecoded unit.
    decoding: Option<InFlight>,
    /// Units handed to the sink: the sounding one, then at most one waiting.
    in_sink: VecDeque<Scheduled>,
    /// Bumped by `stop()`; completions from older generations are ignored.
    generation: u64,
    /// `Started` already emitted since the queue was last idle.
    announced: bool,
    busy: bool,
    decode_tx: mpsc::UnboundedSender<DecodeDone>,
}

async fn run_pump(
    mut pump: Pump,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut decodes: mpsc::UnboundedReceiver<DecodeDone>,
    mut sink_events: mpsc::UnboundedReceiver<SinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(event) = sink_events.recv() => pump.on_sink_event(event),
            Some(done) = decodes.recv() => pump.on_decoded(done),
            cmd = commands.recv() => match cmd {
                Some(Command::Enqueue(unit)) => pump.on_enqueue(unit),
                Some(Command::Stop(ack)) => {
                    pump.stop();
                    let _ = ack.send(());
                }
                None => break,
            },
        }
        pump.settle();
    }
    pump.shutdown();
}

impl Pump {
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    fn on_enqueue(&mut self, mut unit: Unit) {
        if self.queued.len() >= self.max_depth {
            warn!(
                "playback queue full ({} waiting); dropping unit {}",
                self.queued.len(),
                unit.id
            );
            unit.advance(UnitState::Dropped);
            self.emit(PlaybackEvent::Error {
                unit: unit.id,
                reason: "playback queue full".into(),
            });
            return;
        }
        self.queued.push_back(unit);
    }

    /// Start decoding the head unit if the look-ahead slot is free.
    fn pump_next(&mut self) {
        let armed = self
            .in_sink
            .iter()
            .any(|s| s.unit.state() == UnitState::Decoded);
        if self.decoding.is_some() || armed {
            return;
        }
        let Some(mut unit) = self.queued.pop_front() else {
            return;
        };
        let Some(payload) = unit.payload.clone() else {
            self.fail(unit, "payload missing".into());
            return;
        };
        unit.advance(UnitState::Decoding);

        let decoder = Arc::clone(&self.decoder);
        let tx = self.decode_tx.clone();
        let generation = self.generation;
        let id = unit.id;
        let task = tokio::spawn(async move {
            let result = decoder.decode(&payload).await;
            let _ = tx.send(DecodeDone {
                generation,
                unit: id,
                result,
            });
        });
        self.decoding = Some(InFlight { unit, task });
    }

    fn on_decoded(&mut self, done: DecodeDone) {
        if done.generation != self.generation {
            debug!("ignoring stale decode of unit {}", done.unit);
            return;
        }
        let Some(InFlight { mut unit, .. }) = self.decoding.take_if(|f| f.unit.id == done.unit)
        else {
            return;
        };

        let clip = match done.result {
            Ok(clip) if !clip.is_empty() => clip,
            Ok(_) => {
                unit.advance(UnitState::Failed);
                self.fail(unit, "decoded clip is empty".into());
                return;
            }
            Err(e) => {
                unit.advance(UnitState::Failed);
                self.fail(unit, e.to_string());
                return;
            }
        };

        unit.advance(UnitState::Decoded);
        let duration = clip.duration();
        match self.sink.schedule(unit.id, clip) {
            Ok(()) => self.in_sink.push_back(Scheduled { unit, duration }),
            Err(e) => {
                unit.advance(UnitState::Failed);
                self.fail(unit, e.to_string());
            }
        }
    }

    fn fail(&mut self, unit: Unit, reason: String) {
        warn!("skipping unit {}: {reason}", unit.id);
        self.emit(PlaybackEvent::Error {
            unit: unit.id,
            reason,
        });
    }

    fn on_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::Started(id) => {
                let Some(entry) = self.in_sink.iter_mut().find(|s| s.unit.id == id) else {
                    return;
                };
                entry.unit.advance(UnitState::Playing);
                let duration = entry.duration;
                self.emit(PlaybackEvent::SegmentDuration { unit: id, duration });
                if !self.announced {
                    self.announced = true;
                    self.emit(PlaybackEvent::Started);
                }
            }
            SinkEvent::Finished(id) => {
                let Some(pos) = self.in_sink.iter().position(|s| s.unit.id == id) else {
                    return;
                };
                if let Some(mut entry) = self.in_sink.remove(pos) {
                    entry.unit.advance(UnitState::Finished);
                }
                self.emit(PlaybackEvent::SegmentEnded { unit: id });
            }
            SinkEvent::Level(rms) => {
                if !self.in_sink.is_empty() {
                    self.emit(PlaybackEvent::Level { rms });
                }
            }
        }
    }

    /// Advance the pipeline and report a transition to idle.
    fn settle(&mut self) {
        self.pump_next();

        let busy = !self.queued.is_empty() || self.decoding.is_some() || !self.in_sink.is_empty();
        if self.busy && !busy {
            self.announced = false;
            self.emit(PlaybackEvent::Ended { interrupted: false });
        }
        self.busy = busy;
        self.publish_status();
    }

    fn stop(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.sink.halt();

        let mut dropped = 0usize;
        if let Some(InFlight { mut unit, task }) = self.decoding.take() {
            task.abort();
            unit.advance(UnitState::Dropped);
            dropped += 1;
        }
        for mut entry in self.in_sink.drain(..) {
            entry.unit.advance(UnitState::Dropped);
            dropped += 1;
        }
        for mut unit in self.queued.drain(..) {
            unit.advance(UnitState::Dropped);
            dropped += 1;
        }
        debug!("playback stopped, {dropped} unit(s) discarded");

        let was_busy = self.busy;
        self.busy = false;
        self.announced = false;
        if was_busy {
            self.emit(PlaybackEvent::Ended { interrupted: true });
        }
        self.publish_status();
    }

    fn shutdown(&mut self) {
        if let Some(InFlight { task, .. }) = self.decoding.take() {
            task.abort();
        }
        self.sink.halt();
        self.queued.clear();
        self.in_sink.clear();
        self.busy = false;
        self.publish_status();
    }

    fn publish_status(&self) {
        let armed = self
            .in_sink
            .iter()
            .filter(|s| s.unit.state() == UnitState::Decoded)
            .count();
        let next = QueueStatus {
            busy: self.busy,
            pending: self.queued.len() + usize::from(self.decoding.is_some()) + armed,
            playing: self
                .in_sink
                .iter()
                .find(|s| s.unit.state() == UnitState::Playing)
                .map(|s| s.unit.id),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}
