//! Connection state machine.
//!
//! One actor task per [`EventSource`](crate::EventSource) owns every piece of
//! session state. The facade talks to it over a command channel; transports
//! talk to it over a signal channel, each signal tagged with the session it
//! belongs to. Nothing else mutates the session, so no lock is held while
//! listeners run.
//!
//! ```text
//!  facade ──Command──┐
//!                    ▼
//!              ConnectionMachine ──► EventDispatcher ──► listeners
//!                    ▲
//!  transport ─Signal─┘   (stale session ids dropped)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sse_wire::StreamParser;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::dispatcher::EventDispatcher;
use crate::error::EventSourceError;
use crate::event::{names, ErrorInfo, Event, EventName, ReadyState};
use crate::transport::{
    RequestTemplate, SessionId, Signal, SignalKind, Transport, TransportCallbacks, TransportHandle,
};

/// Requests from the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Open,
    Close,
}

/// Reconnection timing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    /// Delay used until the server sends `retry:`.
    pub(crate) default_delay: Duration,
    /// Lower bound on any delay.
    pub(crate) min_delay: Duration,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub(crate) max_retries: Option<u32>,
}

// ── Shared Status ────────────────────────────────────────────

/// State published by the actor for the facade to read.
#[derive(Debug)]
pub(crate) struct ConnectionStatus {
    state: watch::Sender<ReadyState>,
    last_event_id: RwLock<Option<String>>,
    /// Bumped for every command sent. A change mid-chunk tells the actor a
    /// command is waiting and the rest of the chunk should not be delivered.
    requested: AtomicU64,
}

impl ConnectionStatus {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ReadyState::Connecting);
        Self {
            state,
            last_event_id: RwLock::new(None),
            requested: AtomicU64::new(0),
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReadyState> {
        self.state.subscribe()
    }

    pub(crate) fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().clone()
    }

    pub(crate) fn note_command(&self) {
        self.requested.fetch_add(1, Ordering::AcqRel);
    }

    fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }
}

// ── Machine ──────────────────────────────────────────────────

struct ActiveSession {
    id: SessionId,
    handle: TransportHandle,
    parser: StreamParser,
}

pub(crate) struct ConnectionMachine {
    request: RequestTemplate,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    policy: RetryPolicy,
    ignore_retry: Arc<AtomicBool>,
    status: Arc<ConnectionStatus>,
    signal_tx: mpsc::UnboundedSender<Signal>,

    /// `None` until the first `open()`.
    state: Option<ReadyState>,
    last_event_id: Option<String>,
    retry_delay: Duration,
    failures: u32,
    active: Option<ActiveSession>,
    retry_at: Option<Instant>,
    next_session: u64,
}

impl ConnectionMachine {
    pub(crate) fn new(
        request: RequestTemplate,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        policy: RetryPolicy,
        ignore_retry: Arc<AtomicBool>,
        status: Arc<ConnectionStatus>,
        signal_tx: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            request,
            transport,
            dispatcher,
            retry_delay: policy.default_delay,
            policy,
            ignore_retry,
            status,
            signal_tx,
            state: None,
            last_event_id: None,
            failures: 0,
            active: None,
            retry_at: None,
            next_session: 0,
        }
    }

    /// Drive the machine until the facade goes away.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Open) => self.open(),
                    Some(Command::Close) => self.close(),
                    None => break,
                },

                Some(signal) = signals.recv() => self.handle_signal(signal),

                _ = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    self.reconnect();
                }
            }
        }

        self.teardown();
    }

    fn open(&mut self) {
        self.retry_at = None;
        if let Some(session) = self.active.take() {
            tracing::debug!(session = %session.id, "Restarting live session");
            self.transport.cancel(session.handle);
        }

        self.failures = 0;
        self.transition(ReadyState::Connecting);
        self.connect();
    }

    fn close(&mut self) {
        if matches!(self.state, None | Some(ReadyState::Closed)) {
            tracing::trace!("Close ignored, nothing to close");
            return;
        }

        self.retry_at = None;
        if let Some(session) = self.active.take() {
            self.transport.cancel(session.handle);
        }
        tracing::info!(url = %self.request.url(), "Event source closed");
        self.transition(ReadyState::Closed);
    }

    fn connect(&mut self) {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let callbacks = TransportCallbacks::new(id, self.signal_tx.clone());

        tracing::debug!(
            url = %self.request.url(),
            session = %id,
            last_event_id = self.last_event_id.as_deref(),
            "Starting connection attempt"
        );
        let handle = self
            .transport
            .start(&self.request, self.last_event_id.as_deref(), callbacks);

        self.active = Some(ActiveSession {
            id,
            handle,
            parser: StreamParser::new(),
        });
    }

    fn reconnect(&mut self) {
        if self.state == Some(ReadyState::Connecting) && self.active.is_none() {
            self.connect();
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        let live = self.active.as_ref().map(|session| session.id);
        if live != Some(signal.session) {
            tracing::trace!(session = %signal.session, "Discarding signal from stale session");
            return;
        }

        match signal.kind {
            SignalKind::Connected => self.on_connected(),
            SignalKind::Data(bytes) => self.on_data(&bytes),
            SignalKind::Terminated(error) => {
                self.active = None;
                self.fail(error.unwrap_or(EventSourceError::StreamEnded));
            }
        }
    }

    fn on_connected(&mut self) {
        if self.state != Some(ReadyState::Connecting) {
            return;
        }

        tracing::info!(url = %self.request.url(), "Event source open");
        self.failures = 0;
        self.transition(ReadyState::Open);
        self.dispatcher
            .dispatch(&Event::lifecycle(EventName::open(), ReadyState::Open));
    }

    fn on_data(&mut self, bytes: &[u8]) {
        // Body bytes imply the stream began.
        if self.state == Some(ReadyState::Connecting) {
            self.on_connected();
        }

        let requested = self.status.requested();
        let Some(session) = self.active.as_mut() else {
            return;
        };

        for parsed in session.parser.feed(bytes) {
            if let Some(id) = &parsed.id {
                if self.last_event_id.as_ref() != Some(id) {
                    self.last_event_id = Some(id.clone());
                    *self.status.last_event_id.write() = Some(id.clone());
                }
            }

            let event = Event::from_parsed(parsed, ReadyState::Open);
            self.dispatcher.dispatch_as(route(&event), &event);

            if self.status.requested() != requested {
                tracing::debug!(session = %session.id, "Command pending, deferring rest of chunk");
                break;
            }
        }

        if let Some(retry) = session.parser.retry() {
            if retry != self.retry_delay {
                tracing::debug!(delay_ms = retry.as_millis() as u64, "Server set retry delay");
                self.retry_delay = retry;
            }
        }

        // Id-only blocks move the id without dispatching anything. The parser
        // commits an id only once its block is complete.
        if let Some(id) = session.parser.last_event_id() {
            if self.last_event_id.as_deref() != Some(id) {
                self.last_event_id = Some(id.to_owned());
                *self.status.last_event_id.write() = Some(id.to_owned());
            }
        }
    }

    fn fail(&mut self, error: EventSourceError) {
        self.failures += 1;
        let info = ErrorInfo::from(&error);
        let exhausted = self
            .policy
            .max_retries
            .is_some_and(|max| self.failures > max);

        if self.ignore_retry.load(Ordering::Acquire) || exhausted {
            tracing::warn!(
                url = %self.request.url(),
                error = %error,
                failures = self.failures,
                "Connection failed, not retrying"
            );
            self.transition(ReadyState::Closed);
            self.dispatcher
                .dispatch(&Event::failure(ReadyState::Closed, info));
            return;
        }

        let delay = self.retry_delay.max(self.policy.min_delay);
        tracing::warn!(
            url = %self.request.url(),
            error = %error,
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Connection failed, scheduling reconnect"
        );
        self.transition(ReadyState::Connecting);
        self.dispatcher
            .dispatch(&Event::failure(ReadyState::Connecting, info));
        self.retry_at = Some(Instant::now() + delay);
    }

    fn transition(&mut self, next: ReadyState) {
        if self.state == Some(next) {
            return;
        }

        tracing::debug!(from = ?self.state, to = %next, "Ready state changed");
        self.state = Some(next);
        self.status.state.send_replace(next);
        self.dispatcher
            .dispatch(&Event::lifecycle(EventName::ready_state(), next));
    }

    fn teardown(&mut self) {
        self.retry_at = None;
        if let Some(session) = self.active.take() {
            tracing::debug!(session = %session.id, "Event source dropped, cancelling");
            self.transport.cancel(session.handle);
        }
    }
}

/// Listener name a server event is delivered under. Lifecycle names stay
/// reserved for client-generated events.
fn route(event: &Event) -> &str {
    match &event.event_name {
        Some(name) if !name.is_lifecycle() => name.as_str(),
        _ => names::MESSAGE,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
