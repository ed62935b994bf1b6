//! Observable state of the step channel.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::Step;

/// Chat entries retained in the snapshot.
pub const CHAT_CAPACITY: usize = 200;
/// Steps retained in the snapshot history.
pub const HISTORY_CAPACITY: usize = 500;

/// Connection lifecycle of the step stream.
///
/// `Disconnected → Connecting → Connected → (Disconnected | Connecting)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Progress of the performance as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    #[default]
    Idle,
    Initializing,
    GeneratingScript,
    Performing,
    Finished,
    Error,
}

/// A line in the live chat: either the performer's speech or an audience message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub user: String,
    /// `true` when the line is the performer's own speech.
    pub is_ai: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn audience(text: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user: user.into(),
            is_ai: false,
            timestamp: Utc::now(),
        }
    }

    pub fn performer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user: "AI".to_owned(),
            is_ai: true,
            timestamp: Utc::now(),
        }
    }
}

/// The most recent step together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestStep {
    pub step: Step,
    /// `true` when the channel is not currently connected.
    pub stale: bool,
}

/// Point-in-time view of everything the channel knows.
///
/// The latest step survives disconnects; use [`ChannelSnapshot::latest`] to
/// get it together with its staleness.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub state: ConnectionState,
    /// Consecutive failed connection attempts since the last handshake.
    pub reconnect_attempt: u32,
    pub phase: StreamPhase,
    pub latest_step: Option<Step>,
    pub total_steps: u32,
    pub script_preview: Vec<String>,
    pub online_count: u32,
    pub info: String,
    pub error: Option<String>,
    pub chat: VecDeque<ChatMessage>,
    /// Recent steps, oldest first, with audio payloads stripped.
    pub history: VecDeque<Step>,
}

impl ChannelSnapshot {
    pub fn latest(&self) -> Option<LatestStep> {
        self.latest_step.as_ref().map(|step| LatestStep {
            step: step.clone(),
            stale: self.state != ConnectionState::Connected,
        })
    }

    pub(crate) fn push_chat(&mut self, message: ChatMessage) {
        if self.chat.len() == CHAT_CAPACITY {
            self.chat.pop_front();
        }
        self.chat.push_back(message);
    }

    pub(crate) fn push_history(&mut self, step: &Step) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        let mut record = step.clone();
        record.audio = None;
        self.history.push_back(record);
    }

    /// Forget the current performance, keeping connection fields.
    pub(crate) fn clear_performance(&mut self) {
        self.phase = StreamPhase::Idle;
        self.latest_step = None;
        self.total_steps = 0;
        self.script_preview.clear();
        self.info.clear();
        self.error = None;
        self.chat.clear();
        self.history.clear();
    }
}
