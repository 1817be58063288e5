//! Event: the record delivered to listeners.
//!
//! Events either come from the wire (one per dispatched SSE block) or are
//! synthesized by the client to report lifecycle changes:
//!
//! ```text
//! open() ──► CONNECTING ──(headers ok)──► OPEN ──(failure)──► CONNECTING ──► ...
//!                 │                         │
//!                 └───────(close)───────────┴──► CLOSED
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sse_wire::ParsedEvent;

use crate::error::EventSourceError;

/// Reserved listener names.
pub mod names {
    /// Server events without an explicit `event:` field.
    pub const MESSAGE: &str = "message";
    /// Fired on every ready-state transition.
    pub const READY_STATE: &str = "readyState";
    /// Fired on entering [`ReadyState::Open`](super::ReadyState::Open).
    pub const OPEN: &str = "open";
    /// Fired on transport or protocol failure.
    pub const ERROR: &str = "error";
}

// ── Event Name ───────────────────────────────────────────────

/// Name a listener is registered under.
///
/// An open set: the reserved [`names`] plus any name a server sends in an
/// `event:` field. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventName(Arc<str>);

impl EventName {
    /// Create an event name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The `message` name.
    pub fn message() -> Self {
        Self::new(names::MESSAGE)
    }

    /// The `readyState` name.
    pub fn ready_state() -> Self {
        Self::new(names::READY_STATE)
    }

    /// The `open` name.
    pub fn open() -> Self {
        Self::new(names::OPEN)
    }

    /// The `error` name.
    pub fn error() -> Self {
        Self::new(names::ERROR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this names a client-generated lifecycle event.
    pub fn is_lifecycle(&self) -> bool {
        is_lifecycle_name(&self.0)
    }
}

pub(crate) fn is_lifecycle_name(name: &str) -> bool {
    matches!(name, names::READY_STATE | names::OPEN | names::ERROR)
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EventName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl PartialEq<str> for EventName {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for EventName {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

// ── Ready State ──────────────────────────────────────────────

/// Connection status as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadyState {
    /// Connecting, or waiting to reconnect.
    Connecting,

    /// Receiving events.
    Open,

    /// Closed; no reconnection will happen until `open()`.
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Connecting => write!(f, "CONNECTING"),
            ReadyState::Open => write!(f, "OPEN"),
            ReadyState::Closed => write!(f, "CLOSED"),
        }
    }
}

// ── Error Info ───────────────────────────────────────────────

/// Broad class of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, TLS or timeout failure.
    Transport,

    /// Bad status or content type.
    Protocol,

    /// The server ended the stream.
    StreamEnded,
}

/// Snapshot of the failure attached to an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl From<&EventSourceError> for ErrorInfo {
    fn from(error: &EventSourceError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            status: error.status(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ── Event ────────────────────────────────────────────────────

/// One delivered event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Id sent with this event, if any.
    pub id: Option<String>,

    /// Name from the `event:` field, or the lifecycle name for synthetic
    /// events. `None` means `message`.
    pub event_name: Option<EventName>,

    /// Data lines joined with `\n`.
    pub data: Option<String>,

    /// Connection state at delivery time.
    pub ready_state: ReadyState,

    /// Set on `error` lifecycle events only.
    pub error: Option<ErrorInfo>,
}

impl Event {
    /// Build an event from a wire block.
    pub fn from_parsed(parsed: ParsedEvent, ready_state: ReadyState) -> Self {
        Self {
            id: parsed.id,
            event_name: parsed.event.map(EventName::from),
            data: parsed.data,
            ready_state,
            error: None,
        }
    }

    /// A synthetic lifecycle event.
    pub fn lifecycle(name: EventName, ready_state: ReadyState) -> Self {
        Self {
            id: None,
            event_name: Some(name),
            data: None,
            ready_state,
            error: None,
        }
    }

    /// A synthetic `error` event.
    pub fn failure(ready_state: ReadyState, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::lifecycle(EventName::error(), ready_state)
        }
    }

    /// Event name, defaulting to `message`.
    pub fn name(&self) -> &str {
        self.event_name
            .as_ref()
            .map(EventName::as_str)
            .unwrap_or(names::MESSAGE)
    }

    /// Decode the data payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.data.as_deref().unwrap_or_default())
    }
}
