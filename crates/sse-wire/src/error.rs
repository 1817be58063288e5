//! Wire-level error types.

use thiserror::Error;

/// Errors yielded by [`EventStream`](crate::stream::EventStream).
///
/// Malformed lines are never errors: unknown fields, bad `retry:` values and
/// invalid UTF-8 are tolerated by the parser. The only failure is the
/// underlying byte stream itself.
#[derive(Debug, Error, PartialEq)]
pub enum EventStreamError<E> {
    /// The underlying byte stream failed.
    #[error("event stream read failed: {0}")]
    Transport(E),
}

impl<E> EventStreamError<E> {
    /// Unwrap the underlying transport error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Transport(e) => e,
        }
    }
}
