//! HTTP client for the backend's control API.
//!
//! These calls start performances and relay audience input. Their only effect
//! on the live pipeline is that new steps appear on the step stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::channel::DEFAULT_VIEWER;
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A freshly created room. The owner token is required to start a live in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub owner_token: String,
}

/// Parameters of a performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartLiveRequest {
    pub character_name: String,
    pub persona: String,
    pub background: String,
    pub topic: String,
    /// Audience messages to seed the performance with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub danmaku: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Script language (`en`, `zh`, `ja`); detected by the backend when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Character field the backend can suggest text for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestField {
    Persona,
    Background,
    Topic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiSuggestRequest {
    pub field: SuggestField,
    pub context: SuggestContext,
}

#[derive(Serialize)]
struct StartBody<'a> {
    #[serde(flatten)]
    config: &'a StartLiveRequest,
    room_id: &'a str,
    owner_token: &'a str,
}

/// Client for the control endpoints.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    /// Create a client for `base_url` (e.g. `http://localhost:8000`).
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LiveError::Http(format!("failed to build client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        Self::new(config.server.base_url.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Whether the backend answers at all. Never fails.
    pub async fn health(&self) -> bool {
        match self.client.head(self.url("/docs")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("backend health check failed: {e}");
                false
            }
        }
    }

    /// Create a room.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Http`] on transport failure or a non-success status.
    pub async fn create_room(&self) -> Result<Room> {
        let resp = self
            .client
            .post(self.url("/api/room"))
            .send()
            .await
            .map_err(transport)?;
        json_body(check(resp).await?).await
    }

    /// Start a performance in `room`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Http`] carrying the backend's `detail` when rejected.
    pub async fn start_live(&self, config: &StartLiveRequest, room: &Room) -> Result<Value> {
        let body = StartBody {
            config,
            room_id: &room.room_id,
            owner_token: &room.owner_token,
        };
        let resp = self
            .client
            .post(self.url("/api/start"))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        json_body(check(resp).await?).await
    }

    /// Number of viewers in `room_id`. An empty room id yields 0 without a request.
    pub async fn online_count(&self, room_id: &str) -> Result<u32> {
        if room_id.is_empty() {
            return Ok(0);
        }
        let resp = self
            .client
            .get(self.url("/api/online-count"))
            .query(&[("room_id", room_id)])
            .send()
            .await
            .map_err(transport)?;
        let body: Value = json_body(check(resp).await?).await?;
        Ok(body
            .get("count")
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX)))
    }

    /// Post an audience message to `room_id`.
    pub async fn send_danmaku(
        &self,
        room_id: &str,
        text: &str,
        user: Option<&str>,
    ) -> Result<Value> {
        let resp = self
            .client
            .post(self.url("/api/danmaku"))
            .json(&serde_json::json!({
                "room_id": room_id,
                "text": text,
                "user": user.unwrap_or(DEFAULT_VIEWER),
            }))
            .send()
            .await
            .map_err(transport)?;
        json_body(check(resp).await?).await
    }

    /// Raw status document of `room_id`.
    pub async fn status(&self, room_id: &str) -> Result<Value> {
        let resp = self
            .client
            .get(self.url("/api/status"))
            .query(&[("room_id", room_id)])
            .send()
            .await
            .map_err(transport)?;
        json_body(check(resp).await?).await
    }

    /// Whether `room_id` exists and is accessible. Never fails.
    pub async fn room_exists(&self, room_id: &str) -> bool {
        if room_id.is_empty() {
            return false;
        }
        match self
            .client
            .get(self.url("/api/status"))
            .query(&[("room_id", room_id)])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("room lookup failed: {e}");
                false
            }
        }
    }

    /// Past performances.
    pub async fn history(&self) -> Result<Value> {
        let resp = self
            .client
            .get(self.url("/api/history"))
            .send()
            .await
            .map_err(transport)?;
        json_body(check(resp).await?).await
    }

    /// Ask the backend to draft a character field. Returns an empty string when
    /// it has no suggestion.
    pub async fn ai_suggest(&self, request: &AiSuggestRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/api/ai-suggest"))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let body: Value = json_body(check(resp).await?).await?;
        Ok(body
            .get("suggestion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }
}

fn transport(e: reqwest::Error) -> LiveError {
    LiveError::Http(format!("request failed: {e}"))
}

/// Turn a non-success response into an error, preferring the backend's `detail`.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_owned());
    Err(LiveError::Http(format!("{}: {detail}", status.as_u16())))
}

async fn json_body<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| LiveError::Http(format!("invalid response body: {e}")))
}
