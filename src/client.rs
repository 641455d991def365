use crate::{
    config::Config,
    encoding::{add_params_to_url, compress_data, decide_compression, Compression, PostData},
    event::{Event, Properties},
    rate_limiter::RateLimiter,
    request::{CaptureOptions, QueuedRequest, RequestCallback, RequestOptions, Transport},
    request_queue::{PollHandler, RequestQueue},
    retry_queue::RetryQueue,
    session::SessionManager,
    transport::{self, HttpClient, PendingRequest},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

/// Observer invoked with the event name after every accepted capture.
pub type CaptureHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Substrings identifying web crawlers and test runners whose traffic is
/// never captured.
const BLOCKED_USER_AGENTS: [&str; 26] = [
    "ahrefsbot",
    "baiduspider",
    "bingbot",
    "bingpreview",
    "bot.htm",
    "bot.php",
    "crawler",
    "deepcrawl",
    "facebookexternalhit",
    "gptbot",
    "petalbot",
    "pinterest",
    "prerender",
    "screaming frog",
    "semrushbot",
    "sitebulb",
    "slurp",
    "turnitin",
    "twitterbot",
    "vercelbot",
    "yandexbot",
    "headlesschrome",
    "cypress",
    "googlebot",
    "googleweblight",
    "mediapartners-google",
];

pub(crate) fn is_blocked_user_agent(user_agent: &str) -> bool {
    let user_agent = user_agent.to_lowercase();
    BLOCKED_USER_AGENTS
        .iter()
        .any(|blocked| user_agent.contains(blocked))
}

/// The parts of a decide response this pipeline consumes. Feature-flag
/// payloads are handled by the flags collaborator, not here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecideResponse {
    /// Compression schemes the server accepts, in no particular order.
    #[serde(default, rename = "supportedCompression")]
    pub supported_compression: Vec<Compression>,
}

/// A capture client: the single entry point turning named events into
/// enriched, queued-or-sent payloads.
///
/// Cheap to share; all methods take `&self` and delivery is fire-and-forget.
/// Construct inside a tokio runtime, the queues spawn their poll timers onto
/// it.
pub struct PostHog<C: HttpClient + 'static> {
    config: Config,
    client: Arc<C>,
    rate_limiter: Arc<RateLimiter>,
    retry_queue: Arc<RetryQueue<C>>,
    request_queue: Arc<RequestQueue>,
    session_manager: SessionManager,
    persistent_properties: Mutex<Properties>,
    session_properties: Mutex<Properties>,
    supported_compression: Mutex<Vec<Compression>>,
    capture_hooks: Mutex<Vec<CaptureHook>>,
    opted_out: AtomicBool,
    loaded: AtomicBool,
}

impl<C: HttpClient + 'static> std::fmt::Debug for PostHog<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostHog")
            .field("config", &self.config)
            .field("session_manager", &self.session_manager)
            .finish()
    }
}

impl<C: HttpClient + 'static> PostHog<C> {
    /// Create a client from a configuration and an HTTP client
    /// implementation.
    pub fn new(config: Config, client: C) -> Arc<Self> {
        let client = Arc::new(client);
        let rate_limiter = Arc::new(RateLimiter::new());
        let retry_queue = RetryQueue::new(
            Arc::clone(&client),
            Arc::clone(&rate_limiter),
            config.on_request_error.clone(),
            config.poll_interval,
            config.request_timeout,
        );

        Arc::new_cyclic(|instance: &Weak<Self>| {
            let weak = instance.clone();
            let handler: PollHandler = Arc::new(move |batch: QueuedRequest| {
                if let Some(instance) = weak.upgrade() {
                    instance.handle_queued_request(batch);
                }
            });
            let request_queue = RequestQueue::new(handler, config.poll_interval);
            let session_manager = SessionManager::new(config.session_idle_timeout_seconds);
            Self {
                config,
                client,
                rate_limiter,
                retry_queue,
                request_queue,
                session_manager,
                persistent_properties: Mutex::new(Properties::new()),
                session_properties: Mutex::new(Properties::new()),
                supported_compression: Mutex::new(Vec::new()),
                capture_hooks: Mutex::new(Vec::new()),
                opted_out: AtomicBool::new(false),
                loaded: AtomicBool::new(true),
            }
        })
    }

    /// Capture a named event.
    ///
    /// Returns the constructed event immediately; delivery happens in the
    /// background and its outcome is never surfaced here. Returns `None`
    /// without side effects when the instance was unloaded, the visitor
    /// opted out, the configured user agent is a blocked crawler, or the
    /// event name is empty.
    pub fn capture(
        &self,
        event_name: &str,
        properties: Properties,
        options: CaptureOptions,
    ) -> Option<Event> {
        if !self.loaded.load(Ordering::SeqCst) || self.opted_out.load(Ordering::SeqCst) {
            return None;
        }
        if event_name.is_empty() {
            tracing::error!("no event name provided to capture");
            return None;
        }
        if let Some(user_agent) = &self.config.user_agent {
            if is_blocked_user_agent(user_agent) {
                return None;
            }
        }

        let mut event = Event::new(
            event_name.into(),
            self.calculate_event_properties(properties),
            options.timestamp.unwrap_or_else(Utc::now),
        );
        if event_name == "$identify" {
            event.set = options.set.clone();
            event.set_once = options.set_once.clone();
        }
        if !options.no_truncate {
            event.truncate_strings(self.config.properties_string_max_length);
        }

        let url = format!(
            "{}{}",
            self.config.api_host,
            options.endpoint.as_deref().unwrap_or("/e/")
        );
        let batched = self.config.request_batching
            && (options.is_default() || options.batch_key.is_some())
            && !options.send_instantly;
        if batched {
            match serde_json::to_value(&event) {
                Ok(payload) => {
                    self.request_queue
                        .enqueue(url, payload, RequestOptions::from(&options));
                }
                Err(err) => {
                    tracing::error!(error = %crate::Error::EncodeRequest(err), "dropping event");
                }
            }
        } else {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    self.compress_and_send(url, json, RequestOptions::from(&options), None);
                }
                Err(err) => {
                    tracing::error!(error = %crate::Error::EncodeRequest(err), "dropping event");
                }
            }
        }

        self.invoke_capture_hooks(event_name);
        Some(event)
    }

    /// Enrich per-event properties, merged in increasing priority: library
    /// info, persisted superproperties, session-scoped properties, then the
    /// per-event set. Session/window identifiers are attached to the
    /// per-event set first so they survive every merge.
    fn calculate_event_properties(&self, event_properties: Properties) -> Properties {
        let mut event_properties = event_properties;
        event_properties.insert("token".into(), self.config.token.clone().into());
        let (session_id, window_id) = self
            .session_manager
            .check_and_get_session_and_window_id(false);
        event_properties.insert("$session_id".into(), session_id.into());
        event_properties.insert("$window_id".into(), window_id.into());

        let mut properties = info_properties();
        let persistent = self
            .persistent_properties
            .lock()
            .expect("properties lock poisoned");
        properties.extend(persistent.iter().map(|(k, v)| (k.clone(), v.clone())));
        drop(persistent);
        let session = self
            .session_properties
            .lock()
            .expect("properties lock poisoned");
        properties.extend(session.iter().map(|(k, v)| (k.clone(), v.clone())));
        drop(session);
        properties.extend(event_properties);
        properties
    }

    /// Direct bypass of batching for subsystems needing immediate delivery,
    /// such as flag evaluation. Respects the rate limiter.
    pub fn send_request(
        &self,
        url: &str,
        data: Value,
        options: RequestOptions,
        callback: Option<RequestCallback>,
    ) {
        match serde_json::to_string(&data) {
            Ok(json) => self.compress_and_send(url.into(), json, options, callback),
            Err(err) => {
                tracing::error!(error = %crate::Error::EncodeRequest(err), "dropping request");
            }
        }
    }

    /// Batches leave the request queue through here.
    fn handle_queued_request(&self, batch: QueuedRequest) {
        match serde_json::to_string(&batch.data) {
            Ok(json) => self.compress_and_send(batch.url, json, batch.options, None),
            Err(err) => {
                tracing::error!(error = %crate::Error::EncodeRequest(err), "dropping batch");
            }
        }
    }

    fn compress_and_send(
        &self,
        url: String,
        json: String,
        options: RequestOptions,
        callback: Option<RequestCallback>,
    ) {
        let supported = self
            .supported_compression
            .lock()
            .expect("compression lock poisoned")
            .clone();
        let compression = decide_compression(&supported, self.config.disable_compression);
        match compress_data(compression, json) {
            Ok(body) => self.dispatch_request(url, body, options, callback),
            Err(err) => {
                tracing::error!(error = %err, "failed to prepare capture request");
            }
        }
    }

    fn dispatch_request(
        &self,
        url: String,
        body: PostData,
        options: RequestOptions,
        callback: Option<RequestCallback>,
    ) {
        if self.rate_limiter.is_rate_limited(options.batch_key.as_deref()) {
            tracing::debug!(url = %url, "quota limited, dropping request");
            return;
        }

        let url = add_params_to_url(&url, &body.url_query_args(), self.config.ip);
        match options.transport.unwrap_or(self.config.api_transport) {
            Transport::Beacon => transport::send_beacon(
                Arc::clone(&self.client),
                url,
                body,
                self.config.request_headers.clone(),
            ),
            Transport::Async => {
                let request = PendingRequest {
                    url,
                    method: self.config.api_method.clone(),
                    body,
                    headers: self.config.request_headers.clone(),
                    batch_key: options.batch_key,
                    callback,
                    retries_performed_so_far: 0,
                };
                tokio::spawn(transport::send_request(
                    Arc::clone(&self.retry_queue),
                    request,
                ));
            }
        }
    }

    /// Register superproperties merged into every captured event.
    pub fn register(&self, properties: Properties) {
        self.persistent_properties
            .lock()
            .expect("properties lock poisoned")
            .extend(properties);
    }

    /// Register superproperties only for keys that have no value yet.
    pub fn register_once(&self, properties: Properties) {
        let mut persistent = self
            .persistent_properties
            .lock()
            .expect("properties lock poisoned");
        for (name, value) in properties {
            persistent.entry(name).or_insert(value);
        }
    }

    /// Register properties scoped to the current session.
    pub fn register_for_session(&self, properties: Properties) {
        self.session_properties
            .lock()
            .expect("properties lock poisoned")
            .extend(properties);
    }

    /// Remove a persisted superproperty.
    pub fn unregister(&self, property_name: &str) {
        self.persistent_properties
            .lock()
            .expect("properties lock poisoned")
            .remove(property_name);
    }

    /// Register an observer invoked with the event name on every accepted
    /// capture, after the send decision. Observers never block delivery.
    pub fn on_capture(&self, hook: CaptureHook) {
        self.capture_hooks
            .lock()
            .expect("capture hooks lock poisoned")
            .push(hook);
    }

    fn invoke_capture_hooks(&self, event_name: &str) {
        // Clone so a hook that captures again cannot deadlock on the list.
        let hooks = self
            .capture_hooks
            .lock()
            .expect("capture hooks lock poisoned")
            .clone();
        for hook in hooks {
            hook(event_name);
        }
    }

    /// Feed the decide collaborator's response into compression negotiation.
    pub fn on_decide_response(&self, response: &DecideResponse) {
        *self
            .supported_compression
            .lock()
            .expect("compression lock poisoned") = response.supported_compression.clone();
    }

    /// Stop capturing for this visitor. Opt-out persistence is the caller's
    /// concern.
    pub fn opt_out_capturing(&self) {
        self.opted_out.store(true, Ordering::SeqCst);
    }

    /// Resume capturing for this visitor.
    pub fn opt_in_capturing(&self) {
        self.opted_out.store(false, Ordering::SeqCst);
    }

    /// Whether the visitor is currently opted out.
    pub fn has_opted_out_capturing(&self) -> bool {
        self.opted_out.load(Ordering::SeqCst)
    }

    /// The network connection came back; retries flush immediately.
    pub fn handle_online(&self) {
        self.retry_queue.handle_online();
    }

    /// The network connection went away; retries pause until it returns.
    pub fn handle_offline(&self) {
        self.retry_queue.handle_offline();
    }

    /// The host is being torn down: flush both queues best-effort through the
    /// beacon transport, event-ingestion batches first. The instance rejects
    /// further captures afterwards; there is nothing left to deliver them.
    pub fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
        self.request_queue.unload();
        self.retry_queue.unload();
    }

    /// Session and window identifier management.
    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }
}

fn info_properties() -> Properties {
    let mut properties = Properties::new();
    properties.insert("$lib".into(), env!("CARGO_PKG_NAME").into());
    properties.insert("$lib_version".into(), env!("CARGO_PKG_VERSION").into());
    properties.insert("$os".into(), std::env::consts::OS.into());
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::FakeClient;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn properties(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    fn client_with(config: Config) -> (Arc<PostHog<FakeClient>>, FakeClient) {
        let fake = FakeClient::with_status(200);
        let instance = PostHog::new(config, fake.clone());
        (instance, fake)
    }

    #[tokio::test(start_paused = true)]
    async fn capture_rejects_bad_input_without_side_effects() {
        let (instance, fake) = client_with(Config::new("token"));

        assert!(instance.capture("", Properties::new(), Default::default()).is_none());

        instance.opt_out_capturing();
        assert!(instance
            .capture("$pageview", Properties::new(), Default::default())
            .is_none());
        instance.opt_in_capturing();

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(0, fake.request_count());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_user_agents_are_not_captured() {
        let config = Config::new("token")
            .with_user_agent("Mozilla/5.0 (compatible; Googlebot/2.1)")
            .with_request_batching(false);
        let (instance, fake) = client_with(config);

        assert!(instance
            .capture("$pageview", Properties::new(), Default::default())
            .is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(0, fake.request_count());
    }

    #[tokio::test(start_paused = true)]
    async fn event_properties_win_over_registered_defaults() {
        let (instance, _fake) = client_with(Config::new("token"));
        instance.register(properties(json!({ "plan": "free", "$os": "registered" })));
        instance.register_for_session(properties(json!({ "plan": "session", "flow": "a" })));

        let event = instance
            .capture(
                "$pageview",
                properties(json!({ "plan": "explicit" })),
                Default::default(),
            )
            .unwrap();

        assert_eq!("explicit", event.properties["plan"]);
        assert_eq!("a", event.properties["flow"]);
        assert_eq!("registered", event.properties["$os"]);
        assert_eq!("token", event.properties["token"]);
        assert_eq!(env!("CARGO_PKG_NAME"), event.properties["$lib"]);
        assert!(event.properties["$session_id"].is_string());
        assert!(event.properties["$window_id"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn register_once_does_not_overwrite() {
        let (instance, _fake) = client_with(Config::new("token"));
        instance.register(properties(json!({ "initial_referrer": "direct" })));
        instance.register_once(properties(json!({ "initial_referrer": "ad", "utm": "x" })));

        let event = instance
            .capture("$pageview", Properties::new(), Default::default())
            .unwrap();
        assert_eq!("direct", event.properties["initial_referrer"]);
        assert_eq!("x", event.properties["utm"]);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_carries_person_properties() {
        let (instance, _fake) = client_with(Config::new("token"));
        let event = instance
            .capture(
                "$identify",
                Properties::new(),
                CaptureOptions {
                    set: Some(properties(json!({ "email": "user@example.com" }))),
                    set_once: Some(properties(json!({ "first_seen": "today" }))),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!("user@example.com", event.set.unwrap()["email"]);
        assert_eq!("today", event.set_once.unwrap()["first_seen"]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_strings_are_truncated_unless_opted_out() {
        let config = Config::new("token").with_properties_string_max_length(8);
        let (instance, _fake) = client_with(config);

        let event = instance
            .capture(
                "$pageview",
                properties(json!({ "$current_url": "https://example.com/a/very/long/path" })),
                Default::default(),
            )
            .unwrap();
        assert_eq!("https://", event.properties["$current_url"]);

        let event = instance
            .capture(
                "$snapshot",
                properties(json!({ "$snapshot_data": "https://example.com/a/very/long/path" })),
                CaptureOptions {
                    no_truncate: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            "https://example.com/a/very/long/path",
            event.properties["$snapshot_data"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn default_options_batch_and_send_instantly_bypasses() {
        let (instance, fake) = client_with(Config::new("token"));

        instance.capture("$pageview", Properties::new(), Default::default());
        assert!(instance.request_queue.is_polling());
        assert_eq!(0, fake.request_count());

        instance.capture(
            "$pageleave",
            Properties::new(),
            CaptureOptions {
                send_instantly: true,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, fake.request_count());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(2, fake.request_count());
    }

    #[tokio::test(start_paused = true)]
    async fn unique_options_without_batch_key_send_immediately() {
        let (instance, fake) = client_with(Config::new("token"));

        instance.capture(
            "$pageview",
            Properties::new(),
            CaptureOptions {
                endpoint: Some("/engage/".into()),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, fake.request_count());
        assert!(fake.request_urls()[0].starts_with("https://app.posthog.com/engage/"));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_hooks_observe_both_paths() {
        let (instance, _fake) = client_with(Config::new("token"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        instance.on_capture(Arc::new(move |event_name| {
            sink.lock().unwrap().push(event_name.to_string());
        }));

        instance.capture("batched", Properties::new(), Default::default());
        instance.capture(
            "instant",
            Properties::new(),
            CaptureOptions {
                send_instantly: true,
                ..Default::default()
            },
        );

        assert_eq!(vec!["batched", "instant"], *seen.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn send_request_respects_rate_limiter() {
        let (instance, fake) = client_with(Config::new("token"));
        let limited = http::Response::builder()
            .status(429)
            .header("X-PostHog-Retry-After-Events", "60")
            .body(bytes::Bytes::new())
            .unwrap();
        instance.rate_limiter.on_429_response(&limited);

        instance.send_request(
            "https://app.posthog.com/e/",
            json!({ "event": "x" }),
            RequestOptions::default(),
            None,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(0, fake.request_count());
    }

    #[tokio::test(start_paused = true)]
    async fn negotiated_compression_is_applied() {
        let config = Config::new("token").with_request_batching(false);
        let (instance, fake) = client_with(config);
        instance.on_decide_response(&DecideResponse {
            supported_compression: vec![Compression::GzipJs, Compression::Base64],
        });

        instance.capture("$pageview", Properties::new(), Default::default());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let urls = fake.request_urls();
        assert!(urls[0].contains("compression=gzip-js"));
    }

    #[tokio::test(start_paused = true)]
    async fn unload_rejects_further_captures() {
        let (instance, fake) = client_with(Config::new("token"));
        instance.capture("$pageview", Properties::new(), Default::default());
        instance.unload();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, fake.request_count());

        assert!(instance
            .capture("$pageview", Properties::new(), Default::default())
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_count_is_not_affected_by_rejections() {
        let (instance, _fake) = client_with(Config::new("token"));
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        instance.on_capture(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        instance.capture("", Properties::new(), Default::default());
        instance.capture("ok", Properties::new(), Default::default());
        assert_eq!(1, count.load(Ordering::SeqCst));
    }
}
