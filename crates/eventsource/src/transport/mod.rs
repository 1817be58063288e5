//! Transport layer: how bytes reach the connection state machine.
//!
//! The state machine never speaks HTTP itself. A [`Transport`] starts one
//! request per connection attempt and reports back through
//! [`TransportCallbacks`]:
//!
//! ```text
//! start(request, last_event_id) ──► on_connected()
//!                                   on_data(bytes)*
//!                                   on_terminated(error?)   (exactly once)
//! ```
//!
//! - [`http`]: `reqwest`-backed transport for real servers
//! - [`manual`]: in-memory transport driven by hand, for tests

pub mod http;
pub mod manual;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use url::Url;

use crate::error::{EventSourceError, EventSourceResult};

pub use http::HttpTransport;
pub use manual::{Attempt, ManualTransport};

/// Starts and cancels connection attempts.
pub trait Transport: Send + Sync + 'static {
    /// Begin one connection attempt. Must not block.
    fn start(
        &self,
        request: &RequestTemplate,
        last_event_id: Option<&str>,
        callbacks: TransportCallbacks,
    ) -> TransportHandle;

    /// Abort an attempt started by this transport.
    fn cancel(&self, handle: TransportHandle) {
        handle.cancel();
    }
}

// ── Request Template ─────────────────────────────────────────

/// The request issued for every connection attempt.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl RequestTemplate {
    /// A GET request for `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Parse `url` and build a GET request.
    pub fn get(url: &str) -> EventSourceResult<Self> {
        Ok(Self::new(Url::parse(url)?))
    }

    /// Set the HTTP method (some APIs stream from POST).
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header from strings.
    pub fn header_str(self, name: &str, value: &str) -> EventSourceResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EventSourceError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| EventSourceError::InvalidHeader(format!("{name}: {e}")))?;
        Ok(self.header(name, value))
    }

    /// Set a bearer token.
    pub fn bearer_auth(self, token: &str) -> EventSourceResult<Self> {
        self.header_str("authorization", &format!("Bearer {token}"))
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Limit how long to wait for response headers.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn http_method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn request_body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ── Sessions & Signals ───────────────────────────────────────

/// Identity of one connection attempt. Strictly increasing per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a transport reported.
#[derive(Debug)]
pub(crate) enum SignalKind {
    Connected,
    Data(Bytes),
    Terminated(Option<EventSourceError>),
}

/// A transport report tagged with its session.
#[derive(Debug)]
pub(crate) struct Signal {
    pub(crate) session: SessionId,
    pub(crate) kind: SignalKind,
}

/// Callback sink handed to [`Transport::start`].
///
/// Every report is tagged with the attempt's session id; reports for a
/// superseded session are discarded by the state machine. Only the first
/// `on_terminated` is forwarded.
#[derive(Clone)]
pub struct TransportCallbacks {
    session: SessionId,
    tx: mpsc::UnboundedSender<Signal>,
    terminated: Arc<AtomicBool>,
}

impl TransportCallbacks {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            session,
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Response headers arrived with a success status.
    pub fn on_connected(&self) {
        self.send(SignalKind::Connected);
    }

    /// A chunk of body bytes arrived.
    pub fn on_data(&self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.send(SignalKind::Data(bytes));
        }
    }

    /// The attempt ended: `None` for a clean end of stream.
    pub fn on_terminated(&self, error: Option<EventSourceError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            tracing::trace!(session = %self.session, "Duplicate termination ignored");
            return;
        }
        self.send(SignalKind::Terminated(error));
    }

    fn send(&self, kind: SignalKind) {
        if self.terminated.load(Ordering::Acquire) && !matches!(kind, SignalKind::Terminated(_)) {
            return;
        }
        // The receiver is gone once the client is dropped.
        let _ = self.tx.send(Signal {
            session: self.session,
            kind,
        });
    }
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCallbacks")
            .field("session", &self.session)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

// ── Handle ───────────────────────────────────────────────────

/// Owned handle to an in-flight attempt.
///
/// Dropping the handle does not cancel; pass it to [`Transport::cancel`].
pub struct TransportHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportHandle {
    /// A handle that runs `cancel` when cancelled.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle that aborts a tokio task.
    pub fn from_task(task: AbortHandle) -> Self {
        Self::new(move || task.abort())
    }

    /// A handle with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
