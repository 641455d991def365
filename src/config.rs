use crate::request::{OnRequestError, Transport};
use http::HeaderMap;
use std::time::Duration;

pub(crate) const DEFAULT_API_HOST: &str = "https://app.posthog.com";

/// Client configuration. Start from [`Config::new`] and chain `with_*`
/// setters for anything beyond the defaults.
#[derive(Clone)]
pub struct Config {
    pub(crate) token: String,
    pub(crate) api_host: String,
    pub(crate) api_method: http::Method,
    pub(crate) api_transport: Transport,
    pub(crate) request_batching: bool,
    pub(crate) properties_string_max_length: usize,
    pub(crate) request_headers: HeaderMap,
    pub(crate) on_request_error: Option<OnRequestError>,
    pub(crate) ip: bool,
    pub(crate) disable_compression: bool,
    pub(crate) user_agent: Option<String>,
    pub(crate) session_idle_timeout_seconds: u64,
    pub(crate) poll_interval: Duration,
    pub(crate) request_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token", &self.token)
            .field("api_host", &self.api_host)
            .field("api_method", &self.api_method)
            .field("api_transport", &self.api_transport)
            .field("request_batching", &self.request_batching)
            .field("properties_string_max_length", &self.properties_string_max_length)
            .field("ip", &self.ip)
            .field("disable_compression", &self.disable_compression)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Config {
    /// Create a configuration for the given project API token with the
    /// defaults used by the hosted ingestion service.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_host: DEFAULT_API_HOST.into(),
            api_method: http::Method::POST,
            api_transport: Transport::Async,
            request_batching: true,
            properties_string_max_length: 65535,
            request_headers: HeaderMap::new(),
            on_request_error: None,
            ip: true,
            disable_compression: false,
            user_agent: None,
            session_idle_timeout_seconds: 30 * 60,
            poll_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Point the client at a self-hosted ingestion endpoint. Trailing slashes
    /// are trimmed so endpoint paths can be appended verbatim.
    pub fn with_api_host(mut self, api_host: impl AsRef<str>) -> Self {
        self.api_host = api_host.as_ref().trim_end_matches('/').into();
        self
    }

    /// HTTP method for ingestion requests. The hosted service expects POST.
    pub fn with_api_method(mut self, api_method: http::Method) -> Self {
        self.api_method = api_method;
        self
    }

    /// Default transport for ingestion requests; per-call options can still
    /// override it.
    pub fn with_api_transport(mut self, api_transport: Transport) -> Self {
        self.api_transport = api_transport;
        self
    }

    /// Disable the batching queue; every capture is sent immediately.
    pub fn with_request_batching(mut self, request_batching: bool) -> Self {
        self.request_batching = request_batching;
        self
    }

    /// Maximum length of string property values before truncation.
    pub fn with_properties_string_max_length(mut self, max_length: usize) -> Self {
        self.properties_string_max_length = max_length;
        self
    }

    /// Extra headers set on every outbound request.
    pub fn with_request_headers(mut self, request_headers: HeaderMap) -> Self {
        self.request_headers = request_headers;
        self
    }

    /// Hook invoked once per failed delivery attempt.
    pub fn with_on_request_error(mut self, on_request_error: OnRequestError) -> Self {
        self.on_request_error = Some(on_request_error);
        self
    }

    /// Whether to ask the server to record the client IP (`ip=1` query
    /// parameter).
    pub fn with_ip(mut self, ip: bool) -> Self {
        self.ip = ip;
        self
    }

    /// Never compress request payloads, regardless of what the server
    /// supports.
    pub fn with_disable_compression(mut self, disable_compression: bool) -> Self {
        self.disable_compression = disable_compression;
        self
    }

    /// User agent of the embedding application, checked against the
    /// crawler/bot blocklist before capturing.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Session idle timeout in seconds, clamped to 60..1800.
    pub fn with_session_idle_timeout_seconds(mut self, seconds: u64) -> Self {
        self.session_idle_timeout_seconds = seconds;
        self
    }

    /// Poll interval of the batching and retry queues.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Per-request timeout of the asynchronous transport.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}
