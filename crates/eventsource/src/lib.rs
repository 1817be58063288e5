//! # eventsource
//!
//! Reconnecting Server-Sent Events client.
//!
//! An [`EventSource`] holds one logical connection to an SSE endpoint. It
//! parses the `text/event-stream` body incrementally, fans events out to
//! listeners by name, and reconnects after failures using the server's
//! `retry:` delay and `Last-Event-ID` resumption.
//!
//! ## Architecture
//!
//! 1. **Wire**: [`sse_wire::StreamParser`] turns body bytes into events
//! 2. **Connection**: an actor task owns the ready state, the live
//!    transport attempt and the retry timer
//! 3. **Dispatch**: [`EventDispatcher`] delivers to listeners, inline or
//!    through an [`ExecutionContext`]
//! 4. **Transport**: [`HttpTransport`] (reqwest), or any [`Transport`]
//!
//! Listeners are keyed by name: `"message"` for unnamed server events,
//! `"readyState"`, `"open"` and `"error"` for lifecycle events, and any other
//! name for server events sent with a matching `event:` field.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventsource::{EventSource, RequestTemplate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = RequestTemplate::get("https://stream.example.com/ticks")?;
//!     let source = EventSource::http(request)?;
//!
//!     source.on("message", |event| {
//!         println!("tick: {}", event.data.as_deref().unwrap_or(""));
//!     });
//!     source.on("error", |event| {
//!         eprintln!("stream error ({}): {:?}", event.ready_state, event.error);
//!     });
//!
//!     source.open();
//!     tokio::signal::ctrl_c().await?;
//!     source.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
mod machine;
pub mod source;
pub mod telemetry;
pub mod transport;

// Re-export primary types
pub use config::{EventSourceConfig, TelemetryConfig};
pub use context::{ExecutionContext, SerialQueue};
pub use dispatcher::{Callback, EventDispatcher, ListenerId};
pub use error::{EventSourceError, EventSourceResult};
pub use event::{names, ErrorInfo, ErrorKind, Event, EventName, ReadyState};
pub use source::{EventSource, SourceHandle};
pub use telemetry::init_tracing;
pub use transport::{
    HttpTransport, ManualTransport, RequestTemplate, SessionId, Transport, TransportCallbacks,
    TransportHandle,
};
