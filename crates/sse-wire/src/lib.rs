//! # sse-wire
//!
//! Incremental decoder for the Server-Sent Events wire format
//! (`text/event-stream`).
//!
//! The decoder knows nothing about HTTP or runtimes: it is fed raw body bytes
//! in arrival order, in chunks of any size, and hands back complete events.
//!
//! ## Wire format
//!
//! - `event:` lines name the event type
//! - `data:` lines carry the payload (several lines are joined with `\n`)
//! - `id:` lines set the last event id
//! - `retry:` lines set the reconnection delay in milliseconds
//! - lines starting with `:` are comments (keepalives)
//! - a blank line terminates the event
//!
//! ## Quick Start
//!
//! ```rust
//! use sse_wire::StreamParser;
//!
//! let mut parser = StreamParser::new();
//! assert_eq!(parser.feed(b"event: ping\nda").count(), 0);
//!
//! let events: Vec<_> = parser.feed(b"ta: hello\n\n").collect();
//! assert_eq!(events[0].event.as_deref(), Some("ping"));
//! assert_eq!(events[0].data.as_deref(), Some("hello"));
//! ```

pub mod error;
pub mod event;
pub mod parser;
pub mod stream;

// Re-export primary types
pub use error::EventStreamError;
pub use event::ParsedEvent;
pub use parser::{Events, StreamParser, DEFAULT_MAX_LINE_LEN};
pub use stream::EventStream;
