use bytes::Bytes;
use http::Response;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_BATCH_KEY: &str = "events";
const DEFAULT_RETRY_AFTER_SECONDS: i64 = 60;

/// Response headers the server uses to ask for per-category throttling,
/// mapped to the batch-key category they apply to.
const SUPPORTED_RETRY_HEADERS: [(&str, &str); 2] = [
    (
        "X-PostHog-Retry-After-Recordings",
        crate::request_queue::SESSION_RECORDING_BATCH_KEY,
    ),
    ("X-PostHog-Retry-After-Events", DEFAULT_BATCH_KEY),
];

/// Tracks per-category backoff windows derived from server throttle signals.
///
/// Shared between the capture pipeline and both queues; every send path
/// checks it before going out on the wire. Expiry is lazy: entries are
/// compared against the current time on each read, there is no sweep.
#[derive(Debug, Default)]
pub(crate) struct RateLimiter {
    limits: Mutex<HashMap<&'static str, Instant>>,
}

impl RateLimiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether the category for `batch_key` (default `"events"`) is currently
    /// throttled. No side effects.
    pub(crate) fn is_rate_limited(&self, batch_key: Option<&str>) -> bool {
        let key = batch_key.unwrap_or(DEFAULT_BATCH_KEY);
        let limits = self.limits.lock().expect("rate limiter lock poisoned");
        match limits.get(key) {
            Some(unblock_at) => Instant::now() < *unblock_at,
            None => false,
        }
    }

    /// Record throttle windows from a 429 response.
    ///
    /// Each recognized header carries an integer number of seconds; values
    /// that fail to parse count as 60. Unrecognized headers are ignored.
    /// Responses with any other status are ignored entirely.
    pub(crate) fn on_429_response(&self, response: &Response<Bytes>) {
        if response.status().as_u16() != 429 {
            return;
        }

        let mut limits = self.limits.lock().expect("rate limiter lock poisoned");
        for (header, batch_key) in SUPPORTED_RETRY_HEADERS {
            let Some(value) = response.headers().get(header) else {
                continue;
            };
            let retry_after_seconds = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS);
            if retry_after_seconds > 0 {
                limits.insert(
                    batch_key,
                    Instant::now() + Duration::from_secs(retry_after_seconds as u64),
                );
            }
        }
    }
}
