//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use encore::channel::{ChannelEvent, ChannelSnapshot, ConnectionState};
use encore::config::{LiveConfig, ReconnectConfig};
use encore::playback::{ClipDecoder, DecodedClip, PlaybackEvent};
use encore::step::{AudioPayload, Cue, Step};
use encore::{AvatarDriver, LiveError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

/// Generous bound for anything that should happen "soon" in real time.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Decoder driven by the payload text: `"<name>:<decode_ms>:<audio_ms>"`, or
/// `"<name>:<decode_ms>:fail"` for a payload that fails after the delay.
///
/// Output is 1 kHz mono silence, so one sample is one millisecond.
#[derive(Default)]
pub(crate) struct ScriptedDecoder {
    started: Mutex<Vec<String>>,
}

impl ScriptedDecoder {
    /// Names of payloads whose decode has started, in order.
    pub(crate) fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClipDecoder for ScriptedDecoder {
    async fn decode(&self, payload: &AudioPayload) -> encore::Result<DecodedClip> {
        let mut parts = payload.as_str().split(':');
        let name = parts.next().unwrap_or_default().to_owned();
        let decode_ms: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let audio = parts.next().unwrap_or("fail").to_owned();

        self.started.lock().unwrap().push(name.clone());
        tokio::time::sleep(Duration::from_millis(decode_ms)).await;

        match audio.parse::<u64>() {
            Ok(ms) => Ok(DecodedClip::silence(Duration::from_millis(ms), 1_000)),
            Err(_) => Err(LiveError::Decode(format!("{name} is corrupt"))),
        }
    }
}

/// Playback events up to and including the next `Ended`, without level reports.
pub(crate) async fn collect_until_ended(
    rx: &mut broadcast::Receiver<PlaybackEvent>,
) -> Vec<PlaybackEvent> {
    let mut out = Vec::new();
    loop {
        let event = rx.recv().await.expect("playback event");
        let done = matches!(event, PlaybackEvent::Ended { .. });
        if !matches!(event, PlaybackEvent::Level { .. }) {
            out.push(event);
        }
        if done {
            return out;
        }
    }
}

/// Everything already waiting in the receiver.
pub(crate) fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// ---------------------------------------------------------------------------
// Avatar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AvatarCall {
    Cue(Cue),
    Speaking(bool),
    Caption(String, Option<Duration>),
}

/// Records every call it receives.
#[derive(Default)]
pub(crate) struct RecordingDriver {
    calls: Mutex<Vec<AvatarCall>>,
}

impl RecordingDriver {
    pub(crate) fn calls(&self) -> Vec<AvatarCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn captions(&self) -> Vec<(String, Option<Duration>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AvatarCall::Caption(text, d) => Some((text, d)),
                _ => None,
            })
            .collect()
    }
}

impl AvatarDriver for RecordingDriver {
    fn apply_cue(&self, cue: &Cue) {
        self.calls.lock().unwrap().push(AvatarCall::Cue(cue.clone()));
    }

    fn set_speaking(&self, speaking: bool) {
        self.calls.lock().unwrap().push(AvatarCall::Speaking(speaking));
    }

    fn show_caption(&self, text: &str, duration: Option<Duration>) {
        self.calls
            .lock()
            .unwrap()
            .push(AvatarCall::Caption(text.to_owned(), duration));
    }
}

// ---------------------------------------------------------------------------
// Step stream server
// ---------------------------------------------------------------------------

/// What the test server does with one incoming connection.
#[derive(Debug, Clone)]
pub(crate) enum ConnPlan {
    /// Drop the TCP stream before the WebSocket handshake.
    Refuse,
    /// Complete the handshake, send `frames`, then either close or stay open.
    Serve { frames: Vec<String>, close: bool },
}

impl ConnPlan {
    pub(crate) fn open(frames: Vec<String>) -> Self {
        Self::Serve {
            frames,
            close: false,
        }
    }

    pub(crate) fn then_close(frames: Vec<String>) -> Self {
        Self::Serve {
            frames,
            close: true,
        }
    }
}

/// Local WebSocket server playing one [`ConnPlan`] per accepted connection.
/// Connections beyond the plan are served with no frames and kept open.
pub(crate) struct StepServer {
    pub(crate) addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    /// Text frames received from clients.
    pub(crate) inbound: mpsc::UnboundedReceiver<String>,
    task: tokio::task::JoinHandle<()>,
}

impl StepServer {
    pub(crate) async fn start(plans: Vec<ConnPlan>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let plan = plans
                    .get(n)
                    .cloned()
                    .unwrap_or_else(|| ConnPlan::open(Vec::new()));
                let inbound_tx = inbound_tx.clone();

                tokio::spawn(async move {
                    let (frames, close) = match plan {
                        ConnPlan::Refuse => {
                            drop(stream);
                            return;
                        }
                        ConnPlan::Serve { frames, close } => (frames, close),
                    };
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    for frame in frames {
                        if write.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    if close {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            Message::Text(text) => {
                                let _ = inbound_tx.send(text);
                            }
                            Message::Close(_) => return,
                            _ => {}
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            inbound,
            task,
        }
    }

    pub(crate) fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Connections accepted so far, including refused ones.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for StepServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reconnect settings fast enough for tests.
pub(crate) fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay_ms: 10,
        max_delay_ms: 40,
        jitter_ms: 0,
        keepalive_secs: 30,
    }
}

/// A config pointing at `server` with fast reconnects.
pub(crate) fn config_for(server: &StepServer) -> LiveConfig {
    let mut config = LiveConfig::default();
    config.server.base_url = server.base_url();
    config.reconnect = fast_reconnect();
    config
}

/// A `step` frame as the backend sends it.
pub(crate) fn step_frame(index: u64, speech: Option<&str>, audio: Option<&str>) -> String {
    let mut msg = serde_json::json!({ "type": "step", "step": index, "stage": "Hook" });
    if let Some(speech) = speech {
        msg["speech"] = speech.into();
    }
    if let Some(audio) = audio {
        msg["audio_b64"] = audio.into();
    }
    msg.to_string()
}

/// Wait until the snapshot reports `state`.
pub(crate) async fn wait_for_state(
    rx: &mut watch::Receiver<ChannelSnapshot>,
    state: ConnectionState,
) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("channel dropped");
}

/// The next step event, skipping everything else.
pub(crate) async fn next_step(rx: &mut broadcast::Receiver<ChannelEvent>) -> Step {
    tokio::time::timeout(WAIT, async {
        loop {
            if let ChannelEvent::Step(step) = rx.recv().await.expect("channel event") {
                return step;
            }
        }
    })
    .await
    .expect("timed out waiting for a step")
}
