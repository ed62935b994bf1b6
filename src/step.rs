//! Step data model: one unit of backend-produced performance output.
//!
//! The backend is not consistent about field names and value types, so
//! [`Step::from_json`] normalizes every known shape into a single [`Step`].

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LiveError, Result};

/// Number of hex characters kept from the payload digest.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Encoded audio attached to a step (base64 text, optionally a `data:` URI).
///
/// Cheap to clone; `Debug` prints the size only.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioPayload(Arc<str>);

impl AudioPayload {
    pub fn new(encoded: impl Into<Arc<str>>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Short content fingerprint used for step identity.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        let mut hex = hash.to_hex().to_string();
        hex.truncate(FINGERPRINT_HEX_LEN);
        hex
    }
}

impl fmt::Debug for AudioPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioPayload({} bytes)", self.0.len())
    }
}

impl From<&str> for AudioPayload {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AudioPayload {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Facial expression instruction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionCue {
    pub key: String,
    pub intensity: f32,
    pub attack: Option<f32>,
    pub release: Option<f32>,
}

/// Body animation clip to blend in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureCue {
    pub clip: String,
    pub weight: Option<f32>,
    pub duration: Option<f32>,
}

/// Gaze target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LookCue {
    pub target: String,
    pub strength: Option<f32>,
}

/// Blink behaviour override.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkCue {
    pub mode: String,
    pub extra: Option<f32>,
}

/// Mouth shape weights (VRM viseme names).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LipsyncCue {
    pub enabled: bool,
    pub aa: Option<f32>,
    pub ih: Option<f32>,
    pub ou: Option<f32>,
    pub ee: Option<f32>,
    pub oh: Option<f32>,
}

/// Symbolic marker describing what the avatar should do during a step.
///
/// The backend sends either a structured object or a bare string tag; a bare
/// tag lands in [`Cue::tag`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionCue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gesture: Option<GestureCue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub look: Option<LookCue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blink: Option<BlinkCue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lipsync: Option<LipsyncCue>,
}

impl Cue {
    /// A cue consisting of a bare tag.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.emotion.is_none()
            && self.gesture.is_none()
            && self.look.is_none()
            && self.blink.is_none()
            && self.lipsync.is_none()
    }

    fn from_value(value: &Value) -> Option<Self> {
        let cue = match value {
            Value::String(s) if !s.trim().is_empty() => Self::tag(s.trim()),
            Value::Object(_) => match serde_json::from_value::<Cue>(value.clone()) {
                Ok(cue) => cue,
                Err(e) => {
                    tracing::debug!("ignoring malformed cue: {e}");
                    return None;
                }
            },
            _ => return None,
        };
        (!cue.is_empty()).then_some(cue)
    }
}

/// One unit of performance output.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Position in the performance. Non-decreasing, not strictly increasing.
    pub index: u64,
    /// Script stage label (informational).
    pub stage: Option<String>,
    /// Backend action hint, e.g. `continue`.
    pub action: Option<String>,
    pub cue: Option<Cue>,
    /// Transcript of the spoken content.
    pub speech: Option<String>,
    pub audio: Option<AudioPayload>,
    /// Audience message the step is reacting to.
    pub danmaku: Option<String>,
    pub emotion_break: Option<Value>,
}

impl Step {
    /// A step with only an index set.
    pub fn new(index: u64) -> Self {
        Self {
            index,
            stage: None,
            action: None,
            cue: None,
            speech: None,
            audio: None,
            danmaku: None,
            emotion_break: None,
        }
    }

    #[must_use]
    pub fn with_speech(mut self, speech: impl Into<String>) -> Self {
        self.speech = Some(speech.into());
        self
    }

    #[must_use]
    pub fn with_audio(mut self, audio: impl Into<AudioPayload>) -> Self {
        self.audio = Some(audio.into());
        self
    }

    #[must_use]
    pub fn with_cue(mut self, cue: Cue) -> Self {
        self.cue = Some(cue);
        self
    }

    /// Normalize a `step` message body into a [`Step`].
    ///
    /// Accepted shapes:
    /// - index under `step`, `step_index` or `stepIndex`, as a number or numeric string
    /// - audio under `audio_b64` or `audio`
    /// - cue as an object or a bare string
    ///
    /// Empty strings are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Protocol`] if the message is not an object or has
    /// no usable step index.
    pub fn from_json(msg: &Value) -> Result<Self> {
        let obj = msg
            .as_object()
            .ok_or_else(|| LiveError::Protocol("step message is not an object".into()))?;

        let index = ["step", "step_index", "stepIndex"]
            .iter()
            .find_map(|k| obj.get(*k))
            .ok_or_else(|| LiveError::Protocol("step message has no index".into()))
            .and_then(parse_index)?;

        let audio = ["audio_b64", "audio"]
            .iter()
            .find_map(|k| non_empty_str(obj.get(*k)))
            .map(AudioPayload::new);

        Ok(Self {
            index,
            stage: non_empty_str(obj.get("stage")),
            action: non_empty_str(obj.get("action")),
            cue: obj.get("cue").and_then(Cue::from_value),
            speech: non_empty_str(obj.get("speech")),
            audio,
            danmaku: non_empty_str(obj.get("danmaku")),
            emotion_break: obj.get("emotion_break").filter(|v| !v.is_null()).cloned(),
        })
    }

    /// Identity used for deduplication.
    pub fn key(&self) -> StepKey {
        StepKey {
            index: self.index,
            audio: self.audio.as_ref().map(AudioPayload::fingerprint),
        }
    }

    /// Digest of every field. Two deliveries share it only when one is an
    /// exact replay of the other.
    pub fn digest(&self) -> StepDigest {
        let cue = self
            .cue
            .as_ref()
            .map(|c| serde_json::to_vec(c).unwrap_or_default());
        let emotion_break = self.emotion_break.as_ref().map(Value::to_string);

        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.index.to_le_bytes());
        for field in [
            self.stage.as_deref().map(str::as_bytes),
            self.action.as_deref().map(str::as_bytes),
            cue.as_deref(),
            self.speech.as_deref().map(str::as_bytes),
            self.audio.as_ref().map(|a| a.as_str().as_bytes()),
            self.danmaku.as_deref().map(str::as_bytes),
            emotion_break.as_deref().map(str::as_bytes),
        ] {
            match field {
                Some(bytes) => {
                    hasher.update(&[1]);
                    hasher.update(&(bytes.len() as u64).to_le_bytes());
                    hasher.update(bytes);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        StepDigest(*hasher.finalize().as_bytes())
    }
}

/// Content digest of a whole step, see [`Step::digest`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepDigest([u8; 32]);

impl fmt::Debug for StepDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepDigest(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

fn parse_index(value: &Value) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| LiveError::Protocol(format!("invalid step index: {value}")))
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Deduplication identity of a step: index plus audio fingerprint.
///
/// `audio == None` is the "no audio" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub index: u64,
    pub audio: Option<String>,
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.audio {
            Some(fp) => write!(f, "{}-{fp}", self.index),
            None => write!(f, "{}-no-audio", self.index),
        }
    }
}

/// Bounded window of step identities already acted on.
///
/// Oldest keys are forgotten once `capacity` is reached.
#[derive(Debug)]
pub struct SeenSteps<K = StepKey> {
    order: VecDeque<K>,
    keys: HashSet<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash> SeenSteps<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.keys.remove(&evicted);
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}
