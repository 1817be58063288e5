//! EventSource: the public client.
//!
//! Wires the listener registry, the connection actor and a transport
//! together. All calls return immediately; outcomes surface as events.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::WatchStream;
use url::Url;

use crate::config::EventSourceConfig;
use crate::context::ExecutionContext;
use crate::dispatcher::{EventDispatcher, ListenerId};
use crate::error::{EventSourceError, EventSourceResult};
use crate::event::{Event, EventName, ReadyState};
use crate::machine::{Command, ConnectionMachine, ConnectionStatus, RetryPolicy};
use crate::transport::{HttpTransport, RequestTemplate, Transport};

/// A reconnecting Server-Sent Events client.
///
/// Dropping the client stops its connection without emitting any events.
pub struct EventSource {
    url: Url,
    dispatcher: Arc<EventDispatcher>,
    status: Arc<ConnectionStatus>,
    ignore_retry: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl EventSource {
    /// Create a client with default configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(request: RequestTemplate, transport: impl Transport) -> EventSourceResult<Self> {
        Self::with_config(request, transport, &EventSourceConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(
        request: RequestTemplate,
        transport: impl Transport,
        config: &EventSourceConfig,
    ) -> EventSourceResult<Self> {
        config.validate()?;
        let runtime =
            Handle::try_current().map_err(|e| EventSourceError::NoRuntime(e.to_string()))?;

        let url = request.url().clone();
        let dispatcher = Arc::new(EventDispatcher::new());
        let status = Arc::new(ConnectionStatus::new());
        let ignore_retry = Arc::new(AtomicBool::new(config.ignore_retry_action));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let policy = RetryPolicy {
            default_delay: config.retry_delay(),
            min_delay: config.min_retry_delay(),
            max_retries: config.max_retries,
        };
        let machine = ConnectionMachine::new(
            request,
            Arc::new(transport),
            Arc::clone(&dispatcher),
            policy,
            Arc::clone(&ignore_retry),
            Arc::clone(&status),
            signal_tx,
        );
        runtime.spawn(machine.run(command_rx, signal_rx));

        tracing::debug!(url = %url, "Event source created");
        Ok(Self {
            url,
            dispatcher,
            status,
            ignore_retry,
            commands,
        })
    }

    /// Create a client speaking HTTP through `reqwest`.
    pub fn http(request: RequestTemplate) -> EventSourceResult<Self> {
        Self::http_with_config(request, &EventSourceConfig::default())
    }

    /// [`http`](Self::http) with explicit configuration.
    pub fn http_with_config(
        request: RequestTemplate,
        config: &EventSourceConfig,
    ) -> EventSourceResult<Self> {
        let transport = HttpTransport::with_connect_timeout(config.connect_timeout())?;
        Self::with_config(request, transport, config)
    }

    // ── Listeners ────────────────────────────────────────────

    /// Register `callback` for events named `name`.
    ///
    /// With a `context`, each delivery is handed to it; otherwise the
    /// callback runs on the connection task and must not block. Takes
    /// effect for events dispatched after this call.
    pub fn add_listener<F>(
        &self,
        callback: F,
        name: impl Into<EventName>,
        context: Option<Arc<dyn ExecutionContext>>,
    ) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.register(name, context, callback)
    }

    /// Register an inline listener.
    pub fn on<F>(&self, name: impl Into<EventName>, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.register(name, None, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove(id)
    }

    // ── Control ──────────────────────────────────────────────

    /// Connect, or restart the connection if one is live.
    pub fn open(&self) {
        send(&self.commands, &self.status, Command::Open);
    }

    /// Disconnect and stop reconnecting. No-op if not connected.
    pub fn close(&self) {
        send(&self.commands, &self.status, Command::Close);
    }

    /// When set, failures close the connection instead of reconnecting.
    pub fn set_ignore_retry_action(&self, ignore: bool) {
        self.ignore_retry.store(ignore, Ordering::Release);
    }

    pub fn ignore_retry_action(&self) -> bool {
        self.ignore_retry.load(Ordering::Acquire)
    }

    /// A cheap handle for controlling this client from inside listeners.
    ///
    /// The handle does not keep the client alive.
    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
            commands: self.commands.downgrade(),
            status: Arc::clone(&self.status),
        }
    }

    // ── Status ───────────────────────────────────────────────

    /// Last state published by the connection task.
    pub fn ready_state(&self) -> ReadyState {
        self.status.ready_state()
    }

    /// Stream of ready states, starting with the current one.
    pub fn state_changes(&self) -> WatchStream<ReadyState> {
        WatchStream::new(self.status.subscribe())
    }

    /// Id that will be sent as `Last-Event-ID` on the next attempt.
    pub fn last_event_id(&self) -> Option<String> {
        self.status.last_event_id()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("url", &self.url.as_str())
            .field("ready_state", &self.ready_state())
            .field("ignore_retry_action", &self.ignore_retry_action())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Weak control handle returned by [`EventSource::handle`].
#[derive(Debug, Clone)]
pub struct SourceHandle {
    commands: mpsc::WeakUnboundedSender<Command>,
    status: Arc<ConnectionStatus>,
}

impl SourceHandle {
    /// Same as [`EventSource::open`]. Returns `false` if the client is gone.
    pub fn open(&self) -> bool {
        self.command(Command::Open)
    }

    /// Same as [`EventSource::close`]. Returns `false` if the client is gone.
    pub fn close(&self) -> bool {
        self.command(Command::Close)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.status.ready_state()
    }

    fn command(&self, command: Command) -> bool {
        match self.commands.upgrade() {
            Some(commands) => {
                send(&commands, &self.status, command);
                true
            }
            None => false,
        }
    }
}

fn send(commands: &mpsc::UnboundedSender<Command>, status: &ConnectionStatus, command: Command) {
    status.note_command();
    if commands.send(command).is_err() {
        tracing::debug!(?command, "Connection task gone, command dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SerialQueue;
    use crate::event::{ErrorInfo, ErrorKind};
    use crate::transport::ManualTransport;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        source: EventSource,
        transport: ManualTransport,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(EventSourceConfig::default())
        }

        fn with_config(config: EventSourceConfig) -> Self {
            let transport = ManualTransport::new();
            let request = RequestTemplate::get("http://localhost/stream").unwrap();
            let source = EventSource::with_config(request, transport.clone(), &config).unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));

            for tag in ["readyState", "open", "error", "message", "ping"] {
                record(&source, &log, tag);
            }
            Self {
                source,
                transport,
                log,
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        /// Entries after `readyState:CONNECTING`, `readyState:OPEN`, `open`.
        fn after_open(&self) -> Vec<String> {
            self.log.lock().iter().skip(3).cloned().collect()
        }

        fn errors(&self) -> Arc<Mutex<Vec<ErrorInfo>>> {
            let errors = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&errors);
            self.source.on("error", move |e| {
                sink.lock().push(e.error.clone().unwrap());
            });
            errors
        }
    }

    fn record(source: &EventSource, log: &Arc<Mutex<Vec<String>>>, tag: &'static str) {
        let log = Arc::clone(log);
        source.on(tag, move |e| {
            let entry = match tag {
                "readyState" | "error" => format!("{tag}:{}", e.ready_state),
                "open" => tag.to_string(),
                _ => format!("{tag}:{}", e.data.as_deref().unwrap_or("")),
            };
            log.lock().push(entry);
        });
    }

    /// Let the connection task drain its queues.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_requires_runtime() {
        let request = RequestTemplate::get("http://localhost/stream").unwrap();
        let result = EventSource::new(request, ManualTransport::new());
        assert!(matches!(result, Err(EventSourceError::NoRuntime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_open_is_noop() {
        let h = Harness::new();
        h.source.close();
        settle().await;

        assert!(h.log().is_empty());
        assert_eq!(h.transport.attempt_count(), 0);
        assert_eq!(h.source.ready_state(), ReadyState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_order() {
        let h = Harness::new();
        h.source.open();
        settle().await;
        assert_eq!(h.log(), vec!["readyState:CONNECTING"]);

        h.transport.next_attempt(0).await.connect();
        settle().await;
        assert_eq!(
            h.log(),
            vec!["readyState:CONNECTING", "readyState:OPEN", "open"]
        );
        assert_eq!(h.source.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_by_event_name() {
        let h = Harness::new();
        record(&h.source, &h.log, "message2");
        h.source.open();

        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: hello\n\nevent: ping\ndata: a\ndata: b\n\n");
        attempt.send("event: other\ndata: z\n\nevent: message\ndata: m\n\n");
        settle().await;

        assert_eq!(
            h.after_open(),
            vec![
                "message:hello",
                "message2:hello",
                "ping:a\nb",
                "message:m",
                "message2:m"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_cannot_spoof_lifecycle_events() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("event: open\ndata: spoof\n\n");
        settle().await;

        assert_eq!(
            h.log(),
            vec![
                "readyState:CONNECTING",
                "readyState:OPEN",
                "open",
                "message:spoof"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_twice_emits_one_closed_event() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        settle().await;

        h.source.close();
        h.source.close();
        settle().await;

        let closed = h.log().iter().filter(|e| *e == "readyState:CLOSED").count();
        assert_eq!(closed, 1);
        assert!(attempt.is_cancelled());
        assert_eq!(h.source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_signals_are_ignored() {
        let h = Harness::new();
        h.source.open();
        h.source.open();
        let first = h.transport.next_attempt(0).await;
        let second = h.transport.next_attempt(1).await;
        assert!(first.is_cancelled());

        first.connect();
        first.send("data: stale\n\n");
        first.fail(EventSourceError::Connection("late".into()));
        settle().await;
        assert_eq!(h.log(), vec!["readyState:CONNECTING"]);

        second.connect();
        settle().await;
        h.source.close();
        settle().await;
        second.send("data: after close\n\n");
        settle().await;

        assert_eq!(
            h.log(),
            vec![
                "readyState:CONNECTING",
                "readyState:OPEN",
                "open",
                "readyState:CLOSED"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_honors_retry_and_last_event_id() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("id: 42\nretry: 5000\ndata: x\n\n");
        settle().await;
        assert_eq!(h.source.last_event_id().as_deref(), Some("42"));

        let failed_at = Instant::now();
        attempt.fail(EventSourceError::Connection("reset by peer".into()));
        let retry = h.transport.next_attempt(1).await;

        assert!(retry.started_at - failed_at >= Duration::from_millis(5000));
        assert_eq!(retry.last_event_id.as_deref(), Some("42"));
        assert_eq!(
            h.after_open(),
            vec!["message:x", "readyState:CONNECTING", "error:CONNECTING"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_block_does_not_advance_last_event_id() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("id: 1\ndata: a\n\nid: 5\ndata: never-delivered");
        settle().await;
        assert_eq!(h.source.last_event_id().as_deref(), Some("1"));

        attempt.fail(EventSourceError::Connection("reset by peer".into()));
        let retry = h.transport.next_attempt(1).await;
        assert_eq!(retry.last_event_id.as_deref(), Some("1"));
        assert_eq!(
            h.after_open(),
            vec!["message:a", "readyState:CONNECTING", "error:CONNECTING"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_character_id_is_not_resent() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("id: ok\ndata: a\n\nid: bad\x01id\ndata: b\n\n");
        settle().await;
        assert_eq!(h.source.last_event_id().as_deref(), Some("ok"));

        attempt.fail(EventSourceError::Connection("reset by peer".into()));
        let retry = h.transport.next_attempt(1).await;
        assert_eq!(retry.last_event_id.as_deref(), Some("ok"));
        assert_eq!(
            h.after_open(),
            vec!["message:a", "message:b", "readyState:CONNECTING", "error:CONNECTING"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_delay_and_floor() {
        let h = Harness::new();
        let errors = h.errors();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        settle().await;

        let ended_at = Instant::now();
        attempt.finish();
        let second = h.transport.next_attempt(1).await;
        let waited = second.started_at - ended_at;
        assert!(waited >= Duration::from_millis(3000));
        assert!(waited < Duration::from_millis(3100));
        assert_eq!(errors.lock()[0].kind, ErrorKind::StreamEnded);

        second.connect();
        second.send("retry: 0\n\n");
        settle().await;
        let failed_at = Instant::now();
        second.fail(EventSourceError::Connection("reset".into()));
        let third = h.transport.next_attempt(2).await;
        let waited = third.started_at - failed_at;
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_retry_action_closes_on_failure() {
        let h = Harness::new();
        let errors = h.errors();
        h.source.set_ignore_retry_action(true);
        assert!(h.source.ignore_retry_action());

        h.source.open();
        h.transport
            .next_attempt(0)
            .await
            .fail(EventSourceError::InvalidStatus(503));
        settle().await;

        assert_eq!(
            h.log(),
            vec!["readyState:CONNECTING", "readyState:CLOSED", "error:CLOSED"]
        );
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(errors.lock()[0].kind, ErrorKind::Protocol);
        assert_eq!(errors.lock()[0].status, Some(503));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.attempt_count(), 1);
        assert_eq!(h.source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_while_open_restarts() {
        let h = Harness::new();
        h.source.open();
        let first = h.transport.next_attempt(0).await;
        first.connect();
        settle().await;

        h.source.open();
        let second = h.transport.next_attempt(1).await;
        settle().await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(h.transport.attempt_count(), 2);
        assert_eq!(h.log().last().map(String::as_str), Some("readyState:CONNECTING"));
        assert_eq!(h.source.ready_state(), ReadyState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_after_close_resumes_from_last_id() {
        let h = Harness::new();
        h.source.open();
        let first = h.transport.next_attempt(0).await;
        first.connect();
        first.send("id: 7\ndata: a\n\n");
        settle().await;
        h.source.close();
        settle().await;

        h.source.open();
        let second = h.transport.next_attempt(1).await;
        assert_eq!(second.last_event_id.as_deref(), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_is_isolated() {
        let h = Harness::new();
        h.source.on("message", |_| panic!("listener bug"));
        record(&h.source, &h.log, "after");

        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: 1\n\ndata: 2\n\n");
        settle().await;

        assert_eq!(
            h.after_open(),
            vec!["message:1", "after:1", "message:2", "after:2"]
        );
        assert_eq!(h.source.ready_state(), ReadyState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_gives_up() {
        let h = Harness::with_config(EventSourceConfig {
            retry_ms: 200,
            max_retries: Some(1),
            ..EventSourceConfig::default()
        });
        h.source.open();

        h.transport
            .next_attempt(0)
            .await
            .fail(EventSourceError::Connection("refused".into()));
        h.transport
            .next_attempt(1)
            .await
            .fail(EventSourceError::Connection("refused".into()));
        settle().await;

        assert_eq!(
            h.log(),
            vec![
                "readyState:CONNECTING",
                "error:CONNECTING",
                "readyState:CLOSED",
                "error:CLOSED"
            ]
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_listener_sees_only_later_events() {
        let h = Harness::new();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: 1\n\n");
        settle().await;

        record(&h.source, &h.log, "late");
        attempt.send("data: 2\n\n");
        settle().await;

        let late: Vec<_> = h.log().into_iter().filter(|e| e.starts_with("late")).collect();
        assert_eq!(late, vec!["late:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_listener() {
        let h = Harness::new();
        let id = h.source.on("message", |_| panic!("removed listener called"));
        assert!(h.source.remove_listener(id));

        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: x\n\n");
        settle().await;
        assert_eq!(h.log().last().map(String::as_str), Some("message:x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_queue_context() {
        let h = Harness::new();
        let queue = SerialQueue::new("sse-listeners").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        h.source.add_listener(
            move |e: &Event| {
                let thread = std::thread::current().name().map(str::to_owned);
                let _ = tx.lock().send((e.data.clone(), thread));
            },
            "message",
            Some(Arc::new(queue)),
        );

        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: a\n\ndata: b\n\ndata: c\n\n");
        settle().await;

        let received: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        let data: Vec<_> = received.iter().map(|(d, _)| d.as_deref().unwrap()).collect();
        assert_eq!(data, vec!["a", "b", "c"]);
        assert!(received
            .iter()
            .all(|(_, thread)| thread.as_deref() == Some("sse-listeners")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_from_listener_stops_delivery() {
        let h = Harness::new();
        let handle = h.source.handle();
        h.source.on("message", move |e| {
            if e.data.as_deref() == Some("stop") {
                handle.close();
            }
        });

        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        attempt.send("data: a\n\ndata: stop\n\ndata: never\n\n");
        settle().await;

        assert_eq!(
            h.after_open(),
            vec!["message:a", "message:stop", "readyState:CLOSED"]
        );
        assert!(attempt.is_cancelled());
        assert_eq!(h.source.ready_state(), ReadyState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_stream() {
        let h = Harness::new();
        let mut changes = h.source.state_changes();
        assert_eq!(changes.next().await, Some(ReadyState::Connecting));

        h.source.open();
        h.transport.next_attempt(0).await.connect();
        settle().await;
        assert_eq!(changes.next().await, Some(ReadyState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_without_events() {
        let h = Harness::new();
        let handle = h.source.handle();
        h.source.open();
        let attempt = h.transport.next_attempt(0).await;
        attempt.connect();
        settle().await;
        let before = h.log();

        drop(h.source);
        settle().await;

        assert!(attempt.is_cancelled());
        assert_eq!(*h.log.lock(), before);
        assert!(!handle.close());
    }
}
