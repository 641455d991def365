//! An event capture, batching and delivery client for [PostHog]-compatible
//! ingestion endpoints.
//!
//! [PostHog]: https://posthog.com
//!
//! **Disclaimer**: This is not an official PostHog product.
//!
//! # Usage
//!
//! Configure a client and capture events:
//!
//! ```no_run
//! # #[cfg(feature = "reqwest-client")]
//! # fn run() {
//! use posthog_capture::{CaptureOptions, Config, PostHog, Properties};
//!
//! let client = PostHog::new(
//!     Config::new("phc_your_project_token"),
//!     reqwest::Client::new(),
//! );
//! client.capture("$pageview", Properties::new(), CaptureOptions::default());
//! # }
//! ```
//!
//! `capture` returns the constructed event synchronously; delivery happens in
//! the background and is fire-and-forget from the caller's perspective. The
//! client must be created inside a tokio runtime, which runs the queue
//! timers.
//!
//! # Delivery pipeline
//!
//! A captured event is enriched with session identifiers, registered
//! superproperties and library info, then either coalesced in the batching
//! queue or sent immediately:
//!
//! | Stage         | Behavior                                                       |
//! | ------------- | -------------------------------------------------------------- |
//! | Batching      | Events are grouped per batch key over a 3 s poll window; the   |
//! |               | timer parks itself after ~15 s without traffic.                |
//! | Encoding      | Payloads are form-encoded, optionally gzip or base64           |
//! |               | compressed depending on what the server negotiated.            |
//! | Transport     | Single-attempt async POST with a 10 s timeout, or a detached   |
//! |               | fire-and-forget send during teardown.                          |
//! | Retry         | Transient failures back off exponentially with jitter (3 s     |
//! |               | base, 30 min ceiling, 10 attempts), paused while offline.      |
//! | Rate limiting | 429 responses throttle their batch-key category; throttled     |
//! |               | requests are dropped, not queued.                              |
//!
//! On `unload()` both queues flush synchronously through the best-effort
//! transport, event-ingestion batches before everything else.
//!
//! # HTTP clients
//!
//! The crate is generic over an [`HttpClient`]. Enable the `reqwest-client`
//! feature for an implementation based on `reqwest::Client`, or implement
//! the trait for your client of choice.
#![doc(html_root_url = "https://docs.rs/posthog-capture/0.4.0")]
#![deny(missing_docs, unreachable_pub, missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

mod client;
mod config;
mod encoding;
mod error;
mod event;
mod rate_limiter;
mod registry;
mod request;
mod request_queue;
mod retry_queue;
mod session;
mod transport;

pub use client::{CaptureHook, DecideResponse, PostHog};
pub use config::Config;
pub use encoding::Compression;
pub use error::Error;
pub use event::{Event, Properties};
pub use registry::Registry;
pub use request::{
    CaptureOptions, FailedRequest, OnRequestError, QueuedRequest, RequestCallback, RequestOptions,
    Transport,
};
pub use request_queue::SESSION_RECORDING_BATCH_KEY;
pub use session::{SessionIdChangedCallback, SessionManager};
pub use transport::{HttpClient, HttpError};
