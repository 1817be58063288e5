//! In-memory transport driven by hand.
//!
//! Every `start` is recorded as an [`Attempt`]; the caller then plays the
//! server's part through the attempt's callbacks. Useful for exercising
//! reconnection and lifecycle behavior without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use url::Url;

use super::{RequestTemplate, SessionId, Transport, TransportCallbacks, TransportHandle};
use crate::error::EventSourceError;

/// One recorded connection attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub url: Url,
    pub last_event_id: Option<String>,
    pub started_at: Instant,
    callbacks: TransportCallbacks,
    cancelled: Arc<AtomicBool>,
}

impl Attempt {
    pub fn session(&self) -> SessionId {
        self.callbacks.session()
    }

    /// Whether the state machine cancelled this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn connect(&self) {
        self.callbacks.on_connected();
    }

    pub fn send(&self, chunk: impl Into<Bytes>) {
        self.callbacks.on_data(chunk.into());
    }

    /// End the stream cleanly.
    pub fn finish(&self) {
        self.callbacks.on_terminated(None);
    }

    pub fn fail(&self, error: EventSourceError) {
        self.callbacks.on_terminated(Some(error));
    }
}

/// Records attempts for a test to drive.
#[derive(Debug, Clone, Default)]
pub struct ManualTransport {
    attempts: Arc<Mutex<Vec<Attempt>>>,
    started: Arc<Notify>,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All attempts so far, oldest first.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Wait until attempt `index` (zero-based) has started.
    pub async fn next_attempt(&self, index: usize) -> Attempt {
        loop {
            let started = self.started.notified();
            tokio::pin!(started);
            started.as_mut().enable();

            if let Some(attempt) = self.attempts.lock().get(index) {
                return attempt.clone();
            }
            started.await;
        }
    }
}

impl Transport for ManualTransport {
    fn start(
        &self,
        request: &RequestTemplate,
        last_event_id: Option<&str>,
        callbacks: TransportCallbacks,
    ) -> TransportHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let attempt = Attempt {
            url: request.url().clone(),
            last_event_id: last_event_id.map(str::to_owned),
            started_at: Instant::now(),
            callbacks,
            cancelled: Arc::clone(&cancelled),
        };

        tracing::trace!(session = %attempt.session(), "Manual attempt started");
        self.attempts.lock().push(attempt);
        self.started.notify_waiters();

        TransportHandle::new(move || cancelled.store(true, Ordering::Release))
    }
}
