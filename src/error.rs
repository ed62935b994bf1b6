//! Error types for the live performance client.

/// Top-level error type for the step channel, playback queue and control API.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// WebSocket connect, read or write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound message could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio payload could not be decoded into samples.
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Payload rejected at the enqueue boundary (empty or oversized).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Control API request failed or returned a non-success status.
    #[error("http error: {0}")]
    Http(String),

    /// Channel send/receive error (component already shut down).
    #[error("channel error: {0}")]
    Channel(String),

    /// Outbound message attempted while the step stream is not connected.
    #[error("step stream is not connected")]
    NotConnected,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;
