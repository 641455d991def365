use crate::event::Properties;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// How a request should travel to the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Asynchronous HTTP request with full response visibility. Failed
    /// requests are classified and may enter the retry queue.
    #[default]
    Async,
    /// Fire-and-forget best-effort send with no response visibility. Used
    /// during unload, when there is no opportunity to retry.
    Beacon,
}

/// Callback invoked with the parsed JSON response of a request, or with the
/// `{"status": 0}` sentinel when the request failed.
pub type RequestCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// A request that failed with a non-200 status (0 = network error/timeout).
#[derive(Debug, Clone)]
pub struct FailedRequest {
    /// Destination of the failed request.
    pub url: String,
    /// HTTP status code, or 0 when no response was received.
    pub status: u16,
}

/// Hook invoked once per failed delivery attempt.
pub type OnRequestError = Arc<dyn Fn(&FailedRequest) + Send + Sync>;

/// Per-call options for [`capture`](crate::PostHog::capture).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureOptions {
    /// Override the configured transport for this event.
    pub transport: Option<Transport>,
    /// Endpoint path, defaults to `/e/`.
    pub endpoint: Option<String>,
    /// Explicit batch key; events sharing a key are coalesced into one
    /// request even when their options differ otherwise.
    pub batch_key: Option<String>,
    /// Delivery metrics attached to the batch, merged first-write-wins.
    pub metrics: Option<Properties>,
    /// Skip string property truncation (used for large payloads like session
    /// snapshots).
    pub no_truncate: bool,
    /// Bypass the batching queue and send immediately.
    pub send_instantly: bool,
    /// Explicit capture timestamp, defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Person properties to set, honored on `$identify` events.
    pub set: Option<Properties>,
    /// Person properties to set once, honored on `$identify` events.
    pub set_once: Option<Properties>,
}

impl CaptureOptions {
    /// Whether the call carried any per-call options at all. Calls without
    /// unique options are eligible for batching.
    pub(crate) fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Options that travel with a queued request through the batching layer to
/// the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Transport to use once the request leaves the queue.
    pub transport: Option<Transport>,
    /// Batch key; falls back to the destination URL in the batching queue.
    pub batch_key: Option<String>,
    /// Delivery metrics, merged across a batch first-write-wins.
    pub metrics: Option<Properties>,
}

impl From<&CaptureOptions> for RequestOptions {
    fn from(options: &CaptureOptions) -> Self {
        Self {
            transport: options.transport,
            batch_key: options.batch_key.clone(),
            metrics: options.metrics.clone(),
        }
    }
}

/// One pending network operation, owned exclusively by whichever queue
/// currently holds it.
///
/// `data` is a single event payload when enqueued and an array of payloads
/// once the batching queue has grouped it.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Destination URL (api host + endpoint path).
    pub url: String,
    /// Event payload(s).
    pub data: Value,
    /// Options merged across the batch.
    pub options: RequestOptions,
}
