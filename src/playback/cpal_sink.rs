//! Speaker output via cpal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::decode::resample_linear_mono;
use super::sink::{AudioSink, SinkEvent};
use super::unit::{DecodedClip, UnitId};
use crate::config::PlaybackConfig;
use crate::error::{LiveError, Result};

/// Level reports per second while sounding.
const LEVEL_RATE_HZ: u32 = 20;

/// Persistent mono output stream.
///
/// The stream lives on its own thread for the lifetime of the sink. Clips are
/// switched inside the device callback, so consecutive clips are contiguous to
/// the sample.
pub struct CpalSink {
    deck: Arc<Mutex<Deck>>,
    sample_rate: u32,
    shutdown: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Audio`] if no device is available or the stream
    /// cannot be started.
    pub fn new(config: &PlaybackConfig) -> Result<Self> {
        let sample_rate = config.sample_rate;
        let deck = Arc::new(Mutex::new(Deck::new(sample_rate)));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let device_name = config.output_device.clone();
        let deck_for_stream = Arc::clone(&deck);
        let thread = std::thread::Builder::new()
            .name("encore-audio-out".into())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), sample_rate, deck_for_stream)
                {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(LiveError::Audio(format!(
                        "failed to start output stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| LiveError::Audio(format!("failed to spawn output thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| LiveError::Audio("output thread exited during startup".into()))??;

        Ok(Self {
            deck,
            sample_rate,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn lock_deck(&self) -> std::sync::MutexGuard<'_, Deck> {
        match self.deck.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl AudioSink for CpalSink {
    fn attach(&mut self, events: mpsc::UnboundedSender<SinkEvent>) {
        self.lock_deck().events = Some(events);
    }

    fn schedule(&mut self, unit: UnitId, clip: DecodedClip) -> Result<()> {
        let samples = if clip.sample_rate == self.sample_rate {
            clip.samples
        } else {
            resample_linear_mono(&clip.samples, clip.sample_rate, self.sample_rate)
        };
        self.lock_deck().upcoming.push_back(DeckClip {
            unit,
            samples,
            pos: 0,
        });
        Ok(())
    }

    fn halt(&mut self) {
        self.lock_deck().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.lock_deck().clear();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("audio output thread panicked");
        }
    }
}

fn open_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    deck: Arc<Mutex<Deck>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = select_device(&host, device_name)?;

    let label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {label}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut deck = match deck.lock() {
                    Ok(d) => d,
                    Err(p) => p.into_inner(),
                };
                deck.fill(data);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| LiveError::Audio(format!("failed to build output stream: {e}")))
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| LiveError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|desc| desc.name() == name)
            })
            .ok_or_else(|| LiveError::Audio(format!("output device '{name}' not found"))),
        None => host
            .default_output_device()
            .ok_or_else(|| LiveError::Audio("no default output device".into())),
    }
}

/// List available output devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| LiveError::Audio(format!("cannot enumerate devices: {e}")))?;

    Ok(devices
        .filter_map(|device| device.description().ok().map(|d| d.name().to_owned()))
        .collect())
}

// ---------------------------------------------------------------------------
// Deck: what the device callback reads from
// ---------------------------------------------------------------------------

struct DeckClip {
    unit: UnitId,
    samples: Vec<f32>,
    pos: usize,
}

struct Deck {
    current: Option<DeckClip>,
    upcoming: VecDeque<DeckClip>,
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
    meter: LevelMeter,
}

impl Deck {
    fn new(sample_rate: u32) -> Self {
        Self {
            current: None,
            upcoming: VecDeque::new(),
            events: None,
            meter: LevelMeter::new((sample_rate / LEVEL_RATE_HZ).max(1) as usize),
        }
    }

    fn fill(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.next_sample();
        }
    }

    fn next_sample(&mut self) -> f32 {
        loop {
            if self.current.is_none() {
                let Some(next) = self.upcoming.pop_front() else {
                    return 0.0;
                };
                self.notify(SinkEvent::Started(next.unit));
                self.current = Some(next);
            }

            if let Some(clip) = self.current.as_mut()
                && let Some(&s) = clip.samples.get(clip.pos)
            {
                clip.pos += 1;
                if let Some(rms) = self.meter.push(s) {
                    self.notify(SinkEvent::Level(rms));
                }
                return s;
            }

            if let Some(done) = self.current.take() {
                self.notify(SinkEvent::Finished(done.unit));
            }
            if self.upcoming.is_empty() {
                self.meter.reset();
                self.notify(SinkEvent::Level(0.0));
            }
        }
    }

    fn clear(&mut self) {
        self.current = None;
        self.upcoming.clear();
        self.meter.reset();
    }

    fn notify(&self, event: SinkEvent) {
        if let Some(tx) = self.events.as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Windowed RMS of the output signal.
struct LevelMeter {
    window: usize,
    sum_sq: f32,
    count: usize,
}

impl LevelMeter {
    fn new(window: usize) -> Self {
        Self {
            window,
            sum_sq: 0.0,
            count: 0,
        }
    }

    fn push(&mut self, sample: f32) -> Option<f32> {
        self.sum_sq += sample * sample;
        self.count += 1;
        if self.count < self.window {
            return None;
        }
        let rms = (self.sum_sq / self.count as f32).sqrt();
        self.reset();
        Some(rms)
    }

    fn reset(&mut self) {
        self.sum_sq = 0.0;
        self.count = 0;
    }
}
