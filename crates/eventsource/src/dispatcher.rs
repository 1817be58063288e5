//! Listener registry and fan-out delivery.
//!
//! Registrations are append-only from the point of view of a running
//! dispatch: every dispatch works on a snapshot of the listener list, so
//! adding or removing listeners from inside a callback is safe and only
//! affects later dispatches.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::event::{Event, EventName};

/// Listener callback.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a registration for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Registration {
    id: ListenerId,
    callback: Callback,
    context: Option<Arc<dyn ExecutionContext>>,
    /// Held while the callback runs inline. Re-entrant so a callback that
    /// dispatches on its own thread cannot deadlock.
    serial: ReentrantMutex<()>,
}

impl Registration {
    fn invoke(&self, event: &Event) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.callback)(event))) {
            tracing::error!(
                listener = %self.id,
                event = %event.name(),
                panic = panic_message(&*panic),
                "Listener panicked"
            );
        }
    }
}

/// Maps event names to ordered listener registrations.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EventName, Vec<Arc<Registration>>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `name`.
    ///
    /// With `context = None` the callback runs on the dispatching thread.
    pub fn register<F>(
        &self,
        name: impl Into<EventName>,
        context: Option<Arc<dyn ExecutionContext>>,
        callback: F,
    ) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = ListenerId(Uuid::new_v4());
        let registration = Arc::new(Registration {
            id,
            callback: Arc::new(callback),
            context,
            serial: ReentrantMutex::new(()),
        });

        tracing::debug!(listener = %id, event = %name, "Listener registered");
        self.listeners.write().entry(name).or_default().push(registration);
        id
    }

    /// Remove a registration. Returns `false` if it was not found.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for registrations in listeners.values_mut() {
            if let Some(pos) = registrations.iter().position(|r| r.id == id) {
                registrations.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of listeners registered for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }

    /// Deliver `event` to the listeners of its own name.
    pub fn dispatch(&self, event: &Event) -> usize {
        self.dispatch_as(event.name(), event)
    }

    /// Deliver `event` to the listeners registered under `name`, in
    /// registration order. Returns how many listeners were reached.
    pub fn dispatch_as(&self, name: &str, event: &Event) -> usize {
        let snapshot = match self.listeners.read().get(name) {
            Some(registrations) => registrations.clone(),
            None => return 0,
        };

        for registration in &snapshot {
            match &registration.context {
                None => {
                    let _serial = registration.serial.lock();
                    registration.invoke(event);
                }
                Some(context) => {
                    let registration = Arc::clone(registration);
                    let event = event.clone();
                    context.execute(Box::new(move || registration.invoke(&event)));
                }
            }
        }

        snapshot.len()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(name, regs)| (name.as_str(), regs.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("listeners", &counts)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
