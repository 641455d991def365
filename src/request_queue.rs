use crate::request::{QueuedRequest, RequestOptions, Transport};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::task::AbortHandle;

/// Batch key under which session-recording snapshots are coalesced.
pub const SESSION_RECORDING_BATCH_KEY: &str = "sessionRecording";

/// Serialized-size cap for a session-recording batch. A batch that would grow
/// past this is flushed as-is and the next snapshot starts a new one.
const RECORDING_MAX_BATCH_BYTES: usize = 943_718; // 0.9 MiB

/// Consecutive empty poll ticks after which the queue parks its timer.
const MAX_EMPTY_TICKS: u32 = 4;

/// Receives each formatted batch when the queue flushes.
pub(crate) type PollHandler = Arc<dyn Fn(QueuedRequest) + Send + Sync>;

#[derive(Default)]
struct RequestQueueState {
    queue: Vec<QueuedRequest>,
    empty_queue_count: u32,
    is_polling: bool,
    poller: Option<AbortHandle>,
}

/// Coalesces events raised in a short window into fewer network requests.
///
/// Entries accumulate between poll ticks and are grouped by batch key (the
/// destination URL when no explicit key is given). The poll timer parks
/// itself after sitting idle and restarts on the next enqueue.
pub(crate) struct RequestQueue {
    handler: PollHandler,
    poll_interval: Duration,
    state: Mutex<RequestQueueState>,
    weak_self: Weak<RequestQueue>,
}

impl RequestQueue {
    pub(crate) fn new(handler: PollHandler, poll_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            handler,
            poll_interval,
            state: Mutex::new(RequestQueueState::default()),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn enqueue(&self, url: String, data: Value, options: RequestOptions) {
        let mut state = self.state.lock().expect("request queue lock poisoned");
        state.queue.push(QueuedRequest { url, data, options });
        if !state.is_polling {
            if let Some(queue) = self.weak_self.upgrade() {
                state.is_polling = true;
                state.poller = Some(tokio::spawn(queue.poll()).abort_handle());
            }
        }
    }

    async fn poll(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let (batches, stop) = {
                let mut state = self.state.lock().expect("request queue lock poisoned");
                let batches = if state.queue.is_empty() {
                    state.empty_queue_count += 1;
                    None
                } else {
                    state.empty_queue_count = 0;
                    Some(format_queue(std::mem::take(&mut state.queue)))
                };
                let stop = state.empty_queue_count > MAX_EMPTY_TICKS;
                if stop {
                    state.is_polling = false;
                    state.empty_queue_count = 0;
                    state.poller = None;
                }
                (batches, stop)
            };

            if let Some(batches) = batches {
                let flushed_at = Utc::now();
                for mut batch in batches {
                    replace_timestamps_with_offsets(&mut batch.data, flushed_at);
                    (self.handler)(batch);
                }
            }
            if stop {
                break;
            }
        }
    }

    /// Flush whatever remains through the handler with the beacon transport,
    /// event-ingestion batches (`/e` path) first.
    pub(crate) fn unload(&self) {
        let batches = {
            let mut state = self.state.lock().expect("request queue lock poisoned");
            if let Some(poller) = state.poller.take() {
                poller.abort();
            }
            state.is_polling = false;
            format_queue(std::mem::take(&mut state.queue))
        };

        let (event_batches, other_batches): (Vec<_>, Vec<_>) = batches
            .into_iter()
            .partition(|batch| is_event_endpoint(&batch.url));
        for mut batch in event_batches.into_iter().chain(other_batches) {
            batch.options.transport = Some(Transport::Beacon);
            (self.handler)(batch);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.state.lock().unwrap().is_polling
    }
}

fn is_event_endpoint(url: &str) -> bool {
    url.parse::<http::Uri>()
        .map(|uri| uri.path().starts_with("/e"))
        .unwrap_or(false)
}

/// Group queued entries into batches keyed by `_batchKey` or URL.
///
/// Within a key, enqueue order is preserved. `_metrics` entries merge
/// first-write-wins. Session-recording batches are split at the byte cap.
fn format_queue(items: Vec<QueuedRequest>) -> Vec<QueuedRequest> {
    let mut batches: Vec<(String, usize, QueuedRequest)> = Vec::new();

    for item in items {
        let key = item
            .options
            .batch_key
            .clone()
            .unwrap_or_else(|| item.url.clone());
        let item_bytes = if key == SESSION_RECORDING_BATCH_KEY {
            serde_json::to_string(&item.data)
                .map(|s| s.len())
                .unwrap_or(0)
        } else {
            0
        };

        let target = batches.iter_mut().rev().find(|(batch_key, bytes, _)| {
            *batch_key == key
                && (key != SESSION_RECORDING_BATCH_KEY
                    || *bytes + item_bytes <= RECORDING_MAX_BATCH_BYTES)
        });
        match target {
            Some((_, bytes, batch)) => {
                merge_metrics(&mut batch.options, &item.options);
                *bytes += item_bytes;
                if let Some(payloads) = batch.data.as_array_mut() {
                    payloads.push(item.data);
                }
            }
            None => {
                let QueuedRequest { url, data, options } = item;
                batches.push((
                    key,
                    item_bytes,
                    QueuedRequest {
                        url,
                        data: Value::Array(vec![data]),
                        options,
                    },
                ));
            }
        }
    }

    batches.into_iter().map(|(_, _, batch)| batch).collect()
}

fn merge_metrics(batch_options: &mut RequestOptions, item_options: &RequestOptions) {
    let Some(item_metrics) = &item_options.metrics else {
        return;
    };
    let batch_metrics = batch_options.metrics.get_or_insert_with(Default::default);
    for (name, value) in item_metrics {
        batch_metrics
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
}

/// Rewrite each payload's absolute capture timestamp into a millisecond
/// `offset` relative to the flush, shrinking the payload and keeping raw
/// client clock skew off the wire.
fn replace_timestamps_with_offsets(data: &mut Value, flushed_at: DateTime<Utc>) {
    let Some(payloads) = data.as_array_mut() else {
        return;
    };
    for payload in payloads {
        let Some(object) = payload.as_object_mut() else {
            continue;
        };
        let timestamp = object
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
        if let Some(timestamp) = timestamp {
            let offset = (flushed_at - timestamp.with_timezone(&Utc))
                .num_milliseconds()
                .unsigned_abs();
            object.remove("timestamp");
            object.insert("offset".into(), offset.into());
        }
    }
}
