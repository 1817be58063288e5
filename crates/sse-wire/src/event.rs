//! Decoded SSE message as it appears on the wire.

/// One event decoded from the stream.
///
/// Only the fields seen in the event's own block are set: `id` is not carried
/// over from earlier events (the parser keeps that separately as
/// [`last_event_id`](crate::StreamParser::last_event_id)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEvent {
    /// Value of the `id:` field, if this block carried one.
    pub id: Option<String>,

    /// Value of the `event:` field. `None` means the default `message` type.
    pub event: Option<String>,

    /// All `data:` lines of the block joined with `\n`.
    pub data: Option<String>,
}

impl ParsedEvent {
    /// The event type, falling back to `message` when no `event:` was sent.
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }
}

/// Event type assumed when a block carries no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";
