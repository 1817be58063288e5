//! Incremental `text/event-stream` decoder.
//!
//! Bytes are appended to a pending buffer and split into lines on `\n`,
//! `\r\n` or a lone `\r`. A line is never interpreted before its terminator
//! has arrived, so the output does not depend on how the input was chunked.

use std::borrow::Cow;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

use crate::event::ParsedEvent;

const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// UTF-8 encoding of U+FEFF.
const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Default cap on a single line, terminator excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 1 << 20;

/// Streaming SSE parser.
///
/// One parser serves one connection: [`reset`](Self::reset) it before
/// feeding bytes from a new connection.
///
/// Lines longer than the line cap are dropped whole, so a server that never
/// sends a terminator cannot grow the buffer without bound.
#[derive(Debug)]
pub struct StreamParser {
    /// Bytes not yet split into complete lines.
    buffer: BytesMut,

    /// Whether the leading byte-order mark check has been done.
    bom_checked: bool,

    max_line_len: usize,

    /// Inside an over-long line; skip up to the next terminator.
    discarding: bool,

    // Accumulators for the block being built.
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,

    /// Id of the most recently completed block, kept across events.
    last_event_id: Option<String>,

    /// Most recent valid `retry:` value, kept across events.
    retry: Option<Duration>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            bom_checked: false,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            discarding: false,
            event: None,
            data: None,
            id: None,
            last_event_id: None,
            retry: None,
        }
    }
}

impl StreamParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the longest line accepted, terminator excluded.
    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }

    /// Append a chunk and return the events it completes.
    ///
    /// The returned iterator is lazy: lines are consumed only as it is
    /// advanced. Anything left when it is dropped stays buffered and comes
    /// out of the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Events<'_> {
        self.push(chunk);
        Events { parser: self }
    }

    /// Append a chunk without decoding anything yet.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode buffered lines until one completes an event.
    pub fn next_event(&mut self) -> Option<ParsedEvent> {
        while let Some(line) = self.next_line() {
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        None
    }

    /// The id of the most recently completed block on this connection.
    ///
    /// An `id:` line only counts once the blank line closing its block has
    /// arrived.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// The most recent valid `retry:` seen on this connection.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Number of bytes waiting for a line terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered input and accumulated state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.bom_checked = false;
        self.discarding = false;
        self.event = None;
        self.data = None;
        self.id = None;
        self.last_event_id = None;
        self.retry = None;
    }

    fn next_line(&mut self) -> Option<Bytes> {
        if !self.bom_checked {
            // A partial BOM needs more bytes before we can decide.
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return None;
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        loop {
            let Some((line_end, next_start)) = find_eol(&self.buffer) else {
                if self.buffer.len() > self.max_line_len {
                    tracing::debug!(
                        buffered = self.buffer.len(),
                        limit = self.max_line_len,
                        "Discarding over-long event stream line"
                    );
                    // A held CR may still pair with the next byte.
                    let held_cr = self.buffer.last() == Some(&CR);
                    self.buffer.clear();
                    if held_cr {
                        self.buffer.extend_from_slice(&[CR]);
                    }
                    self.discarding = true;
                }
                return None;
            };

            let line = self.buffer.split_to(line_end).freeze();
            self.buffer.advance(next_start - line_end);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line_len {
                tracing::debug!(
                    len = line.len(),
                    limit = self.max_line_len,
                    "Discarding over-long event stream line"
                );
                continue;
            }
            return Some(line);
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Option<ParsedEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        let (name, value) = match memchr::memchr(b':', line) {
            Some(0) => return None,
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &b""[..]),
        };

        match name {
            b"event" => {
                let value = decode(value);
                self.event = (!value.is_empty()).then_some(value);
            }
            b"data" => {
                let value = decode(value);
                match self.data.as_mut() {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(&value);
                    }
                    None => self.data = Some(value),
                }
            }
            b"id" => {
                if value.is_empty() || value.iter().any(|&b| is_control(b)) {
                    tracing::trace!("Ignoring empty or control-bearing event id");
                } else {
                    self.id = Some(decode(value));
                }
            }
            b"retry" => match parse_retry(value) {
                Some(retry) => self.retry = Some(retry),
                None => tracing::debug!(
                    value = %String::from_utf8_lossy(value),
                    "Ignoring malformed retry field"
                ),
            },
            _ => {}
        }

        None
    }

    /// Close the current block and commit its id. Blocks with neither
    /// `event:` nor `data:` produce nothing.
    fn dispatch(&mut self) -> Option<ParsedEvent> {
        let event = self.event.take();
        let data = self.data.take();
        let id = self.id.take();

        if let Some(id) = &id {
            self.last_event_id = Some(id.clone());
        }

        if event.is_none() && data.is_none() {
            return None;
        }

        Some(ParsedEvent { id, event, data })
    }
}

/// Lazy iterator over the events completed by a [`StreamParser::feed`] call.
#[derive(Debug)]
pub struct Events<'a> {
    parser: &'a mut StreamParser,
}

impl Iterator for Events<'_> {
    type Item = ParsedEvent;

    fn next(&mut self) -> Option<ParsedEvent> {
        self.parser.next_event()
    }
}

/// Find the next line terminator.
///
/// Returns `(line_end, next_line_start)`, or `None` when more bytes are
/// needed. A trailing `\r` is held back since it may be half of `\r\n`.
fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = memchr::memchr2(CR, LF, bytes)?;

    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }

    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}

/// ASCII control bytes other than tab. Such ids cannot be sent back in a
/// header.
fn is_control(b: u8) -> bool {
    (b < 0x20 && b != b'\t') || b == 0x7f
}

fn decode(bytes: &[u8]) -> String {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(s) => s.to_owned(),
        Cow::Owned(s) => {
            tracing::debug!(len = bytes.len(), "Replaced invalid UTF-8 in event stream");
            s
        }
    }
}

/// `retry:` must be ASCII digits only.
fn parse_retry(value: &[u8]) -> Option<Duration> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}
