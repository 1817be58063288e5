//! [`Stream`] adaptor from body chunks to parsed events.

use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;

use crate::error::EventStreamError;
use crate::event::ParsedEvent;
use crate::parser::StreamParser;

// A stream of events decoded from a stream of byte chunks.
pin_project! {
    pub struct EventStream<S> {
        #[pin]
        inner: S,
        parser: StreamParser,
        finished: bool,
    }
}

impl<S> EventStream<S> {
    /// Wrap a byte stream, e.g. `reqwest::Response::bytes_stream()`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: StreamParser::new(),
            finished: false,
        }
    }

    /// The most recent event id seen on this stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.parser.last_event_id()
    }

    /// The most recent `retry:` value seen on this stream.
    pub fn retry(&self) -> Option<Duration> {
        self.parser.retry()
    }
}

impl<S, B, E> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    type Item = Result<ParsedEvent, EventStreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.parser.next_event() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.parser.push(chunk.as_ref()),
                Some(Err(e)) => return Poll::Ready(Some(Err(EventStreamError::Transport(e)))),
                None => {
                    // An unterminated trailing block is dropped.
                    *this.finished = true;
                }
            }
        }
    }
}
