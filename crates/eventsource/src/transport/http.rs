//! HTTP transport backed by `reqwest`.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Client;

use super::{RequestTemplate, Transport, TransportCallbacks, TransportHandle};
use crate::error::{EventSourceError, EventSourceResult};

/// SSE media type.
pub const EVENT_STREAM_MEDIA_TYPE: &str = "text/event-stream";

/// Header carrying the last seen event id on reconnect.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Streams an HTTP response body into the state machine.
///
/// Each attempt runs on its own tokio task; cancelling aborts the task.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// HTTP client.
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    /// Use a custom HTTP client (proxies, TLS roots, ...).
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    /// Build a client with the given TCP connect timeout.
    pub fn with_connect_timeout(timeout: Duration) -> EventSourceResult<Self> {
        let http = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn start(
        &self,
        request: &RequestTemplate,
        last_event_id: Option<&str>,
        callbacks: TransportCallbacks,
    ) -> TransportHandle {
        let http = self.http.clone();
        let request = request.clone();
        let last_event_id = last_event_id.map(str::to_owned);

        let task = tokio::spawn(async move {
            let result = stream_body(&http, &request, last_event_id.as_deref(), &callbacks).await;
            callbacks.on_terminated(result.err());
        });

        TransportHandle::from_task(task.abort_handle())
    }
}

async fn stream_body(
    http: &Client,
    request: &RequestTemplate,
    last_event_id: Option<&str>,
    callbacks: &TransportCallbacks,
) -> EventSourceResult<()> {
    let mut http_request = http
        .request(request.http_method().clone(), request.url().clone())
        .headers(request.headers().clone())
        .header(ACCEPT, EVENT_STREAM_MEDIA_TYPE)
        .header(CACHE_CONTROL, "no-cache");

    if let Some(value) = last_event_id.and_then(last_event_id_value) {
        http_request = http_request.header(LAST_EVENT_ID_HEADER, value);
    }
    if let Some(body) = request.request_body() {
        http_request = http_request.body(body.clone());
    }

    tracing::debug!(
        url = %request.url(),
        session = %callbacks.session(),
        last_event_id,
        "Sending event stream request"
    );

    let response = match request.request_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, http_request.send())
            .await
            .map_err(|_| EventSourceError::Timeout(timeout))??,
        None => http_request.send().await?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(EventSourceError::InvalidStatus(status.as_u16()));
    }

    if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
        let content_type = content_type.to_str().unwrap_or_default();
        if !content_type.contains(EVENT_STREAM_MEDIA_TYPE) {
            return Err(EventSourceError::InvalidContentType(content_type.to_owned()));
        }
    }

    callbacks.on_connected();

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        callbacks.on_data(chunk?);
    }

    tracing::debug!(session = %callbacks.session(), "Event stream body ended");
    Ok(())
}

/// Header value for a resumption id. Ids that are not valid header values
/// are left off the request rather than failing it.
fn last_event_id_value(id: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(id) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(id, "Skipping Last-Event-ID that is not a valid header value");
            None
        }
    }
}
