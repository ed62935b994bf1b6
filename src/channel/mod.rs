//! Step channel: WebSocket client for the performance backend's step stream.
//!
//! [`StepChannel`] owns one logical connection, normalizes inbound messages
//! into [`Step`]s and reconnects on failure with capped exponential backoff.
//! Consumers observe it two ways:
//! - [`StepChannel::subscribe`] for an ordered event stream (fan-out, every
//!   subscriber sees every event)
//! - [`StepChannel::watch`] / [`StepChannel::snapshot`] for the latest state

pub mod backoff;
pub mod protocol;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{LiveConfig, ReconnectConfig};
use crate::error::{LiveError, Result};
use crate::step::{SeenSteps, Step, StepDigest};

use backoff::Backoff;
use protocol::{ClientMessage, ServerMessage, parse_server_message, phase_hint};
pub use protocol::DEFAULT_VIEWER;
pub use state::{ChannelSnapshot, ChatMessage, ConnectionState, LatestStep, StreamPhase};

/// Capacity of the event broadcast buffer.
const EVENT_CAPACITY: usize = 1024;
/// Step identities remembered for replay suppression.
const REPLAY_WINDOW: usize = 1024;

/// Events fanned out to every subscriber, in transport order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection state changed.
    State(ConnectionState),
    /// A new (not previously delivered) step arrived.
    Step(Step),
    /// Performance phase changed.
    Phase(StreamPhase),
    /// Chat line (performer speech or audience message).
    Chat(ChatMessage),
    OnlineCount(u32),
    /// Informational text from the backend.
    Info(String),
    /// The backend reported an error for the performance.
    BackendError(String),
}

// ---------------------------------------------------------------------------
// Shared state between the channel handle and the background WS task
// ---------------------------------------------------------------------------

struct Shared {
    snapshot: watch::Sender<ChannelSnapshot>,
    events: broadcast::Sender<ChannelEvent>,
    /// Keys of steps already delivered, across reconnects.
    delivered: Mutex<SeenSteps<StepDigest>>,
    /// Sender into the live connection, present only while connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState, attempt: u32) {
        let mut changed = false;
        self.snapshot.send_if_modified(|s| {
            changed = s.state != state;
            let modified = changed || s.reconnect_attempt != attempt;
            s.state = state;
            s.reconnect_attempt = attempt;
            modified
        });
        if changed {
            tracing::debug!("step channel {state}");
            self.emit(ChannelEvent::State(state));
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        let mut guard = match self.outbound.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *guard = tx;
    }

    fn set_phase(&self, phase: StreamPhase) {
        let changed = self.snapshot.send_if_modified(|s| {
            let changed = s.phase != phase;
            s.phase = phase;
            changed
        });
        if changed {
            self.emit(ChannelEvent::Phase(phase));
        }
    }
}

/// A running connection task.
struct Connection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// StepChannel
// ---------------------------------------------------------------------------

/// Persistent, self-healing connection to the step stream.
///
/// Dropping the channel releases the connection.
pub struct StepChannel {
    url: String,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
    conn: Mutex<Option<Connection>>,
}

impl StepChannel {
    /// Create a channel for `url` (e.g. `ws://localhost:8000/ws`). Does not connect.
    pub fn new(url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        let (snapshot, _) = watch::channel(ChannelSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            url: url.into(),
            reconnect,
            shared: Arc::new(Shared {
                snapshot,
                events,
                delivered: Mutex::new(SeenSteps::new(REPLAY_WINDOW)),
                outbound: Mutex::new(None),
            }),
            conn: Mutex::new(None),
        }
    }

    /// Create a channel from the stream URL and reconnect settings in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] if the base URL is invalid.
    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        Ok(Self::new(
            config.server.stream_url()?,
            config.reconnect.clone(),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start the background connection task.
    ///
    /// A no-op while a connection task is already running (connecting,
    /// connected or waiting to retry). Must be called within a tokio runtime.
    pub fn connect(&self) {
        let mut conn = self.lock_conn();
        if let Some(existing) = conn.as_ref()
            && !existing.task.is_finished()
        {
            tracing::debug!("connect ignored: step channel already active");
            return;
        }

        self.shared.set_state(ConnectionState::Connecting, 0);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            self.url.clone(),
            self.reconnect.clone(),
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        *conn = Some(Connection { cancel, task });
    }

    /// Stop the connection and any pending retry immediately.
    ///
    /// Safe to call at any time, including from `Drop`. The socket is
    /// released without waiting for a close handshake.
    pub fn disconnect(&self) {
        if let Some(conn) = self.lock_conn().take() {
            conn.cancel.cancel();
            conn.task.abort();
        }
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected, 0);
    }

    /// Stop the connection, sending a close frame and waiting for the task to exit.
    pub async fn shutdown(&self) {
        let conn = self.lock_conn().take();
        if let Some(conn) = conn {
            conn.cancel.cancel();
            if let Err(e) = conn.task.await
                && !e.is_cancelled()
            {
                tracing::warn!("step channel task ended abnormally: {e}");
            }
        }
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected, 0);
    }

    /// Subscribe to channel events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Watch the channel snapshot.
    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().state
    }

    /// The most recent step, marked stale when not connected.
    pub fn latest_step(&self) -> Option<LatestStep> {
        self.shared.snapshot.borrow().latest()
    }

    /// Send an audience chat message to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::NotConnected`] unless the channel is connected.
    pub fn send_danmaku(&self, text: &str, user: Option<&str>) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(LiveError::NotConnected);
        }
        let msg = ClientMessage::Danmaku {
            text: text.to_owned(),
            user: user.unwrap_or(DEFAULT_VIEWER).to_owned(),
        };
        let json = serde_json::to_string(&msg)
            .map_err(|e| LiveError::Protocol(format!("serialize danmaku: {e}")))?;

        let guard = match self.shared.outbound.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.send(json).map_err(|_| LiveError::NotConnected),
            None => Err(LiveError::NotConnected),
        }
    }

    /// Forget the current performance (latest step, history, chat, phase and
    /// replay window). The connection is left alone.
    pub fn reset(&self) {
        let mut delivered = match self.shared.delivered.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        delivered.clear();
        drop(delivered);
        self.shared
            .snapshot
            .send_modify(ChannelSnapshot::clear_performance);
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Drop for StepChannel {
    fn drop(&mut self) {
        let conn = match self.conn.get_mut() {
            Ok(c) => c.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(conn) = conn {
            conn.cancel.cancel();
            conn.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background WebSocket connection loop
// ---------------------------------------------------------------------------

/// Run the WebSocket connection loop with automatic reconnection.
async fn connection_loop(
    url: String,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(&reconnect);
    let keepalive = reconnect.keepalive();

    loop {
        shared.set_state(ConnectionState::Connecting, backoff.attempt());

        match try_connect(&url, keepalive, &shared, &cancel, &mut backoff).await {
            Ok(()) => break,
            Err(e) => {
                shared.set_outbound(None);
                let delay = backoff.next_delay();
                shared.set_state(ConnectionState::Disconnected, backoff.attempt());
                tracing::warn!(
                    "step stream failed (attempt {}): {e}; retrying in {delay:?}",
                    backoff.attempt()
                );

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.set_outbound(None);
    shared.set_state(ConnectionState::Disconnected, 0);
}

/// Run a single WebSocket connection. Returns `Ok(())` when cancelled,
/// `Err` on connection failure or any disconnect (including a server close).
async fn try_connect(
    url: &str,
    keepalive: Duration,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        r = connect_async(url) => r.map_err(|e| LiveError::Transport(format!("connect: {e}")))?,
    };

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    backoff.reset();
    shared.set_outbound(Some(outbound_tx));
    shared.set_state(ConnectionState::Connected, 0);
    tracing::info!("step stream connected: {url}");

    let mut ping_interval = tokio::time::interval(keepalive);
    // Skip the first immediate tick.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            // Inbound from server.
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_server_message(&text, shared),
                    Some(Ok(Message::Ping(_))) => {
                        // Flush the queued pong.
                        write
                            .flush()
                            .await
                            .map_err(|e| LiveError::Transport(format!("pong: {e}")))?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(LiveError::Transport("connection closed by server".into()));
                    }
                    Some(Err(e)) => return Err(LiveError::Transport(format!("read: {e}"))),
                    Some(Ok(_)) => tracing::debug!("ignoring non-text frame"),
                }
            }
            // Outbound from the application.
            Some(json) = outbound_rx.recv() => {
                write
                    .send(Message::Text(json))
                    .await
                    .map_err(|e| LiveError::Transport(format!("send: {e}")))?;
            }
            _ = ping_interval.tick() => {
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| LiveError::Transport(format!("ping: {e}")))?;
            }
        }
    }
}

/// Process one text frame and update shared state. Malformed frames are dropped.
fn handle_server_message(text: &str, shared: &Shared) {
    let msg = match parse_server_message(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("dropping malformed message: {e}");
            return;
        }
    };

    match msg {
        ServerMessage::Step(step) => handle_step(step, shared),
        ServerMessage::Info(content) => {
            shared.snapshot.send_modify(|s| s.info.clone_from(&content));
            if let Some(phase) = phase_hint(&content) {
                shared.set_phase(phase);
            }
            shared.emit(ChannelEvent::Info(content));
        }
        ServerMessage::ScriptReady {
            total_steps,
            script_preview,
            content,
        } => {
            shared.snapshot.send_modify(|s| {
                s.total_steps = total_steps;
                s.script_preview = script_preview;
                s.info.clone_from(&content);
            });
            shared.set_phase(StreamPhase::Performing);
        }
        ServerMessage::UserCount(count) => {
            shared.snapshot.send_modify(|s| s.online_count = count);
            shared.emit(ChannelEvent::OnlineCount(count));
        }
        ServerMessage::Danmaku { text, user } => {
            let message = ChatMessage::audience(text, user);
            shared.snapshot.send_modify(|s| s.push_chat(message.clone()));
            shared.emit(ChannelEvent::Chat(message));
        }
        ServerMessage::Success(content) => {
            shared.snapshot.send_modify(|s| s.info = content);
            shared.set_phase(StreamPhase::Finished);
        }
        ServerMessage::Error(message) => {
            tracing::warn!("backend reported error: {message}");
            shared
                .snapshot
                .send_modify(|s| s.error = Some(message.clone()));
            shared.set_phase(StreamPhase::Error);
            shared.emit(ChannelEvent::BackendError(message));
        }
        ServerMessage::System => {}
    }
}

fn handle_step(step: Step, shared: &Shared) {
    {
        let mut delivered = match shared.delivered.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if !delivered.insert(step.digest()) {
            tracing::debug!("suppressing replayed step {}", step.index);
            return;
        }
    }

    let speech = step.speech.clone().map(ChatMessage::performer);
    shared.snapshot.send_modify(|s| {
        if let Some(prev) = s.latest_step.as_ref()
            && step.index > prev.index.saturating_add(1)
        {
            tracing::debug!("step index gap: {} -> {}", prev.index, step.index);
        }
        s.latest_step = Some(step.clone());
        s.push_history(&step);
        if let Some(line) = speech.as_ref() {
            s.push_chat(line.clone());
        }
    });

    shared.emit(ChannelEvent::Step(step));
    if let Some(line) = speech {
        shared.emit(ChannelEvent::Chat(line));
    }
}
