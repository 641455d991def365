use crate::{
    encoding::{encode_post_data, PostData},
    request::{FailedRequest, RequestCallback},
    retry_queue::RetryQueue,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderMap, Request, Response};
use serde_json::{json, Value};
use std::{fmt::Debug, sync::Arc};

/// Error returned by an [`HttpClient`] send.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Statuses that are never retried: the request is malformed or rejected for
/// good, so replaying it cannot help.
const NON_RETRYABLE_STATUSES: [u16; 4] = [401, 403, 404, 500];

/// Abstraction over the HTTP client used to reach the ingestion endpoint.
///
/// Implemented for `reqwest::Client` behind the `reqwest-client` feature;
/// bring your own implementation otherwise.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send a single request and return the complete response.
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError>;
}

/// A fully encoded request owned by the transport/retry layer.
#[derive(Clone)]
pub(crate) struct PendingRequest {
    pub(crate) url: String,
    pub(crate) method: http::Method,
    pub(crate) body: PostData,
    pub(crate) headers: HeaderMap,
    pub(crate) batch_key: Option<String>,
    pub(crate) callback: Option<RequestCallback>,
    pub(crate) retries_performed_so_far: u32,
}

impl Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("url", &self.url)
            .field("batch_key", &self.batch_key)
            .field("retries_performed_so_far", &self.retries_performed_so_far)
            .finish()
    }
}

/// Perform one delivery attempt over the asynchronous transport.
///
/// Exactly one outcome is recorded per attempt: success (callback with the
/// parsed body), retryable failure (re-enqueued with an incremented counter),
/// or non-retryable failure (dropped). Failed attempts always fire the
/// original callback with the `{"status": 0}` sentinel so callers are not
/// left hanging.
pub(crate) async fn send_request<C: HttpClient + 'static>(
    retry_queue: Arc<RetryQueue<C>>,
    request: PendingRequest,
) {
    let (body, content_type) = encode_post_data(&request.body);
    let http_request = match Request::builder()
        .method(request.method.clone())
        .uri(request.url.as_str())
        .header(CONTENT_TYPE, content_type)
        .body(body)
    {
        Ok(mut http_request) => {
            http_request.headers_mut().extend(request.headers.clone());
            http_request
        }
        Err(err) => {
            tracing::error!(url = %request.url, error = %err, "failed to build capture request");
            invoke_failure_callback(&request);
            return;
        }
    };

    let send = retry_queue.client.send(http_request);
    match tokio::time::timeout(retry_queue.request_timeout, send).await {
        Ok(Ok(response)) if response.status().as_u16() == 200 => {
            if let Some(callback) = &request.callback {
                match serde_json::from_slice::<Value>(response.body()) {
                    Ok(parsed) => callback(parsed),
                    Err(err) => {
                        tracing::error!(
                            url = %request.url,
                            error = %crate::Error::DeserializeResponse(err),
                            "malformed success response"
                        );
                    }
                }
            }
        }
        Ok(Ok(response)) => {
            handle_failed_attempt(
                &retry_queue,
                request,
                response.status().as_u16(),
                Some(&response),
            );
        }
        Ok(Err(err)) => {
            tracing::debug!(
                url = %request.url,
                error = %crate::Error::Connection(err),
                "capture request failed to send"
            );
            handle_failed_attempt(&retry_queue, request, 0, None);
        }
        Err(_elapsed) => {
            tracing::debug!(url = %request.url, "capture request timed out");
            handle_failed_attempt(&retry_queue, request, 0, None);
        }
    }
}

fn handle_failed_attempt<C: HttpClient + 'static>(
    retry_queue: &Arc<RetryQueue<C>>,
    request: PendingRequest,
    status: u16,
    response: Option<&Response<Bytes>>,
) {
    if let Some(on_request_error) = &retry_queue.on_request_error {
        on_request_error(&FailedRequest {
            url: request.url.clone(),
            status,
        });
    }

    if status == 429 {
        if let Some(response) = response {
            retry_queue.rate_limiter.on_429_response(response);
        }
    }

    if !NON_RETRYABLE_STATUSES.contains(&status) {
        let mut retried = request.clone();
        retried.retries_performed_so_far += 1;
        retry_queue.enqueue(retried);
    }

    invoke_failure_callback(&request);
}

fn invoke_failure_callback(request: &PendingRequest) {
    if let Some(callback) = &request.callback {
        callback(json!({ "status": 0 }));
    }
}

/// Fire-and-forget best-effort send, used when the host is being torn down.
///
/// The request is dispatched on a detached task; there is no response
/// visibility and errors are swallowed, since there is no opportunity to
/// retry once the caller is gone.
pub(crate) fn send_beacon<C: HttpClient + 'static>(
    client: Arc<C>,
    url: String,
    body: PostData,
    headers: HeaderMap,
) {
    let (encoded, content_type) = encode_post_data(&body);
    let http_request = match Request::post(url.as_str())
        .header(CONTENT_TYPE, content_type)
        .body(encoded)
    {
        Ok(mut http_request) => {
            http_request.headers_mut().extend(headers);
            http_request
        }
        Err(err) => {
            tracing::debug!(url = %url, error = %err, "failed to build beacon request");
            return;
        }
    };

    tokio::spawn(async move {
        if let Err(err) = client.send(http_request).await {
            tracing::debug!(url = %url, error = %err, "beacon send failed");
        }
    });
}

#[cfg(feature = "reqwest-client")]
mod reqwest {
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
            let request = request.try_into()?;
            let response = self.execute(request).await?;
            let mut builder = Response::builder().status(response.status());
            for (name, value) in response.headers() {
                builder = builder.header(name, value);
            }
            Ok(builder.body(response.bytes().await?)?)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Client stub that records every request and answers with a canned
    /// response. Clones share the request log.
    #[derive(Debug, Clone)]
    pub(crate) struct FakeClient {
        pub(crate) requests: Arc<Mutex<Vec<Request<Vec<u8>>>>>,
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    }

    impl FakeClient {
        pub(crate) fn with_status(status: u16) -> Self {
            Self::with_response(status, &[], "{}")
        }

        pub(crate) fn with_response(
            status: u16,
            headers: &[(&'static str, &'static str)],
            body: &'static str,
        ) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                status,
                headers: headers.to_vec(),
                body,
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn request_urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.uri().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
            self.requests.lock().unwrap().push(request);
            let mut builder = Response::builder().status(self.status);
            for (name, value) in &self.headers {
                builder = builder.header(*name, *value);
            }
            Ok(builder.body(Bytes::from_static(self.body.as_bytes()))?)
        }
    }

    pub(crate) fn pending_request(url: &str) -> PendingRequest {
        PendingRequest {
            url: url.into(),
            method: http::Method::POST,
            body: PostData::Form {
                data: "{}".into(),
                compression: None,
            },
            headers: HeaderMap::new(),
            batch_key: None,
            callback: None,
            retries_performed_so_far: 0,
        }
    }
}
