//! Delivery contexts for listener callbacks.
//!
//! A listener registered without a context runs inline on the connection's
//! task. A listener registered with an [`ExecutionContext`] has each
//! delivery handed to that context instead.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{EventSourceError, EventSourceResult};

/// A unit of work handed to a context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere listener callbacks can be run.
///
/// Implementations decide the threading: a context that runs jobs in
/// submission order keeps per-listener ordering intact.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Schedule `job` to run.
    fn execute(&self, job: Job);
}

/// A FIFO queue drained by one dedicated thread.
///
/// Jobs run one at a time in submission order. The thread exits once every
/// clone of the queue has been dropped and the backlog is drained.
#[derive(Clone)]
pub struct SerialQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Start a queue with a named worker thread.
    pub fn new(name: impl Into<Arc<str>>) -> EventSourceResult<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
            })
            .map_err(EventSourceError::WorkerSpawn)?;

        Ok(Self { name, tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExecutionContext for SerialQueue {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!(queue = %self.name, "Serial queue worker gone, dropping job");
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue").field("name", &self.name).finish()
    }
}
