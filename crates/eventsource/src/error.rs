//! EventSource error types.

use thiserror::Error;

use crate::event::ErrorKind;

/// Errors that can occur while connecting to or reading an event stream.
#[derive(Debug, Error)]
pub enum EventSourceError {
    /// HTTP transport error.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A custom transport reported a connection failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No response headers arrived within the connect timeout.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    InvalidStatus(u16),

    /// The server answered with something other than `text/event-stream`.
    #[error("unexpected content type: {0}")]
    InvalidContentType(String),

    /// The server closed the stream.
    #[error("stream closed by server")]
    StreamEnded,

    /// URL parsing error.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A request header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Configuration values are inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The OS refused to start a delivery worker thread.
    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(std::io::Error),

    /// The client was created outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
}

impl EventSourceError {
    /// Classify the error for listeners.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStatus(_) | Self::InvalidContentType(_) => ErrorKind::Protocol,
            Self::StreamEnded => ErrorKind::StreamEnded,
            _ => ErrorKind::Transport,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::InvalidStatus(status) => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// EventSource Result type alias.
pub type EventSourceResult<T> = Result<T, EventSourceError>;
