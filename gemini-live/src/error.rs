//! Error types for Gemini Live sessions.

use thiserror::Error;

/// Result type for Gemini Live operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using a Gemini Live session.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport could not be established, the handshake was rejected,
    /// or the connection dropped unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unrecognised frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A send was attempted outside the `Active` state.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a session is already live.
    #[error("session already connected")]
    AlreadyConnected,

    /// A tool response referenced ids that are not pending.
    #[error("unknown invocation: {}", .0.join(", "))]
    UnknownInvocation(Vec<String>),

    /// Capture or playback device failure.
    #[error("audio pipeline error: {0}")]
    AudioPipeline(String),

    /// Session is closed.
    #[error("session closed")]
    SessionClosed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates an audio pipeline error.
    pub fn audio(msg: impl Into<String>) -> Self {
        Self::AudioPipeline(msg.into())
    }

    /// Returns true if the error ends the session.
    ///
    /// Everything else is recoverable: the frame, chunk or call is dropped
    /// and the session keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::WebSocket(_) | Error::SessionClosed
        )
    }
}
