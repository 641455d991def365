use crate::{
    rate_limiter::RateLimiter,
    request::OnRequestError,
    transport::{self, HttpClient, PendingRequest},
};
use rand::Rng as _;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{task::AbortHandle, time::Instant};

const MAX_RETRIES: u32 = 10;
const THIRTY_MINUTES_MS: f64 = 30.0 * 60.0 * 1000.0;

/// Compute the delay before the next retry attempt.
///
/// Exponential envelope with jitter: the raw backoff doubles per retry from a
/// 3 s base and is capped at 30 minutes; the actual delay is drawn uniformly
/// from `capped ± (capped - raw/2) / 2`, rounded up. Jitter spreads retries
/// out so many clients recovering from the same outage do not stampede the
/// endpoint in lockstep.
pub(crate) fn pick_next_retry_delay(retries_performed_so_far: u32) -> Duration {
    let raw_backoff = 3000.0 * 2f64.powi(retries_performed_so_far as i32);
    let min_backoff = raw_backoff / 2.0;
    let capped_backoff = raw_backoff.min(THIRTY_MINUTES_MS);
    let jitter_fraction = rand::rng().random::<f64>() - 0.5;
    let jitter = jitter_fraction * (capped_backoff - min_backoff);
    Duration::from_millis((capped_backoff + jitter).ceil() as u64)
}

struct RetryQueueElement {
    retry_at: Instant,
    request: PendingRequest,
}

#[derive(Default)]
struct RetryQueueState {
    queue: Vec<RetryQueueElement>,
    poller: Option<AbortHandle>,
}

/// In-memory retry of failed deliveries with exponential backoff and jitter.
///
/// Requests enter through the transport's failure path with an incremented
/// attempt counter and leave on successful flush, on exceeding the retry
/// ceiling, or when dropped by an active rate limit. The poll loop is
/// permanent once started; it keeps ticking through idle periods, unlike the
/// batching queue which parks itself.
pub(crate) struct RetryQueue<C: HttpClient + 'static> {
    pub(crate) client: Arc<C>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) on_request_error: Option<OnRequestError>,
    pub(crate) request_timeout: Duration,
    poll_interval: Duration,
    state: Mutex<RetryQueueState>,
    are_we_online: AtomicBool,
    weak_self: Weak<RetryQueue<C>>,
}

impl<C: HttpClient + 'static> RetryQueue<C> {
    pub(crate) fn new(
        client: Arc<C>,
        rate_limiter: Arc<RateLimiter>,
        on_request_error: Option<OnRequestError>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client,
            rate_limiter,
            on_request_error,
            request_timeout,
            poll_interval,
            state: Mutex::new(RetryQueueState::default()),
            are_we_online: AtomicBool::new(true),
            weak_self: weak_self.clone(),
        })
    }

    /// Schedule a failed request for another attempt.
    ///
    /// Requests that already performed 10 attempts are silently dropped.
    pub(crate) fn enqueue(&self, request: PendingRequest) {
        if request.retries_performed_so_far >= MAX_RETRIES {
            return;
        }
        let delay = pick_next_retry_delay(request.retries_performed_so_far);
        tracing::warn!(
            url = %request.url,
            retries = request.retries_performed_so_far,
            delay_ms = delay.as_millis() as u64,
            "enqueued failed request for retry"
        );

        let mut state = self.state.lock().expect("retry queue lock poisoned");
        state.queue.push(RetryQueueElement {
            retry_at: Instant::now() + delay,
            request,
        });
        if state.poller.is_none() {
            if let Some(queue) = self.weak_self.upgrade() {
                state.poller = Some(tokio::spawn(queue.poll()).abort_handle());
            }
        }
    }

    /// Permanent poll loop: flush due entries whenever the network is
    /// believed up.
    async fn poll(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let has_work = {
                let state = self.state.lock().expect("retry queue lock poisoned");
                !state.queue.is_empty()
            };
            if self.are_we_online.load(Ordering::Relaxed) && has_work {
                self.flush().await;
            }
        }
    }

    /// Resubmit every entry whose retry time has passed.
    ///
    /// A due entry that is rate-limited right now is dropped from this flush,
    /// not re-queued; throttling is lossy by design of the protocol.
    pub(crate) async fn flush(&self) {
        let now = Instant::now();
        let due = {
            let mut state = self.state.lock().expect("retry queue lock poisoned");
            let mut due = Vec::new();
            state.queue.retain_mut(|element| {
                if element.retry_at < now {
                    due.push(element.request.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        let Some(queue) = self.weak_self.upgrade() else {
            return;
        };
        for request in due {
            if self
                .rate_limiter
                .is_rate_limited(request.batch_key.as_deref())
            {
                tracing::debug!(url = %request.url, "quota limited, dropping retried request");
                continue;
            }
            transport::send_request(Arc::clone(&queue), request).await;
        }
    }

    /// The network came back: flush immediately, outside the poll cadence.
    pub(crate) fn handle_online(&self) {
        self.are_we_online.store(true, Ordering::Relaxed);
        if let Some(queue) = self.weak_self.upgrade() {
            tokio::spawn(async move { queue.flush().await });
        }
    }

    pub(crate) fn handle_offline(&self) {
        self.are_we_online.store(false, Ordering::Relaxed);
    }

    /// Stop polling and fire every remaining request through the best-effort
    /// beacon transport. The queue is cleared unconditionally; once the host
    /// is gone there are no further retries.
    pub(crate) fn unload(&self) {
        let remaining = {
            let mut state = self.state.lock().expect("retry queue lock poisoned");
            if let Some(poller) = state.poller.take() {
                poller.abort();
            }
            std::mem::take(&mut state.queue)
        };

        for element in remaining {
            let request = element.request;
            if self
                .rate_limiter
                .is_rate_limited(request.batch_key.as_deref())
            {
                tracing::debug!(url = %request.url, "quota limited, dropping request on unload");
                continue;
            }
            transport::send_beacon(
                Arc::clone(&self.client),
                request.url,
                request.body,
                request.headers,
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_retry_counts(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .map(|element| element.request.retries_performed_so_far)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{pending_request, FakeClient};

    fn retry_queue<C: HttpClient + 'static>(client: Arc<C>) -> Arc<RetryQueue<C>> {
        RetryQueue::new(
            client,
            Arc::new(RateLimiter::new()),
            None,
            Duration::from_secs(3),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn backoff_stays_within_jitter_envelope() {
        for retries in 0..MAX_RETRIES {
            let raw = 3000.0 * 2f64.powi(retries as i32);
            let min_backoff = raw / 2.0;
            let capped = raw.min(THIRTY_MINUTES_MS);
            let lower = (capped + min_backoff) / 2.0;
            let upper = capped + (capped - min_backoff) / 2.0;
            for _ in 0..50 {
                let delay = pick_next_retry_delay(retries).as_millis() as f64;
                assert!(
                    delay >= lower && delay <= upper.ceil(),
                    "retry {retries}: delay {delay} outside [{lower}, {upper}]"
                );
            }
        }
    }

    #[test]
    fn backoff_midpoint_grows_until_capped() {
        let midpoint = |retries: u32| {
            let raw = 3000.0 * 2f64.powi(retries as i32);
            raw.min(THIRTY_MINUTES_MS)
        };
        for retries in 0..MAX_RETRIES - 1 {
            assert!(midpoint(retries + 1) >= midpoint(retries));
        }
        assert_eq!(THIRTY_MINUTES_MS, midpoint(MAX_RETRIES - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_at_retry_ceiling_are_dropped() {
        let queue = retry_queue(Arc::new(FakeClient::with_status(503)));

        let mut request = pending_request("https://host/e/");
        request.retries_performed_so_far = MAX_RETRIES;
        queue.enqueue(request);
        assert_eq!(0, queue.len());

        let mut request = pending_request("https://host/e/");
        request.retries_performed_so_far = MAX_RETRIES - 1;
        queue.enqueue(request);
        assert_eq!(1, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn due_entries_are_resent_by_the_poll_loop() {
        let client = FakeClient::with_status(200);
        let queue = retry_queue(Arc::new(client.clone()));

        queue.enqueue(pending_request("https://host/e/"));
        // First attempt is due after at most 3.75s; two poll ticks cover it.
        tokio::time::sleep(Duration::from_millis(6100)).await;

        assert_eq!(1, client.request_count());
        assert_eq!(0, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_due_entries_are_dropped_not_requeued() {
        let client = FakeClient::with_status(200);
        let queue = retry_queue(Arc::new(client.clone()));
        let limited = http::Response::builder()
            .status(429)
            .header("X-PostHog-Retry-After-Events", "3600")
            .body(bytes::Bytes::new())
            .unwrap();
        queue.rate_limiter.on_429_response(&limited);

        queue.enqueue(pending_request("https://host/e/"));
        tokio::time::sleep(Duration::from_millis(6100)).await;

        assert_eq!(0, client.request_count());
        assert_eq!(0, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_pauses_flushing_and_online_flushes_immediately() {
        let client = FakeClient::with_status(200);
        let queue = retry_queue(Arc::new(client.clone()));

        queue.handle_offline();
        queue.enqueue(pending_request("https://host/e/"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(0, client.request_count());
        assert_eq!(1, queue.len());

        queue.handle_online();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, client.request_count());
        assert_eq!(0, queue.len());
    }

    #[tokio::test(start_paused = true)]
    async fn unload_beacons_remaining_requests_and_clears() {
        let client = FakeClient::with_status(200);
        let queue = retry_queue(Arc::new(client.clone()));

        queue.enqueue(pending_request("https://host/e/"));
        queue.enqueue(pending_request("https://host/s/"));
        queue.unload();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(2, client.request_count());
        assert_eq!(0, queue.len());

        // The poller is gone; nothing further is sent.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(2, client.request_count());
    }
}
