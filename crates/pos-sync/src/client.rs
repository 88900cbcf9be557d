use std::{sync::Arc, time::Duration};

use pos_core::{
    Attempted, AuthState, RequestError, RequestErrorCategory, RequestOutcome, RetryPolicy,
    ValidationDetails, classify_http_status,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

use crate::transport::{HttpRequest, HttpResponse, Method, Transport, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// API call intent, resolved against the client's base URL at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    /// Path segments below the base URL; each one is percent-encoded.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: Method, segments: &[&str]) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| (*s).to_owned()).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(segments: &[&str]) -> Self {
        Self::new(Method::Get, segments)
    }

    pub fn post(segments: &[&str], body: serde_json::Value) -> Self {
        Self::new(Method::Post, segments).with_body(body)
    }

    pub fn put(segments: &[&str], body: serde_json::Value) -> Self {
        Self::new(Method::Put, segments).with_body(body)
    }

    pub fn delete(segments: &[&str]) -> Self {
        Self::new(Method::Delete, segments)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Resolve against `base`, keeping any path prefix the base carries.
    pub fn resolve(&self, base: &Url) -> Result<Url, RequestError> {
        let mut url = base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                RequestError::new(
                    RequestErrorCategory::Server,
                    "invalid_base_url",
                    format!("base url cannot carry a path: {base}"),
                )
            })?;
            path.pop_if_empty();
            path.extend(self.segments.iter());
        }
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct RequestClientConfig {
    pub base_url: Url,
    /// Per-attempt bound; an unanswered attempt counts as a network error.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl RequestClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Issues API calls and classifies every result into a [`RequestOutcome`].
///
/// Only network-class failures are retried. The bearer token is read from the
/// session observer right before each attempt, so a refresh that lands during
/// backoff is picked up by the next attempt.
#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    config: RequestClientConfig,
    auth: watch::Receiver<AuthState>,
}

impl RequestClient {
    pub fn new(
        config: RequestClientConfig,
        transport: Arc<dyn Transport>,
        auth: watch::Receiver<AuthState>,
    ) -> Self {
        Self {
            transport,
            config,
            auth,
        }
    }

    pub async fn execute<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Attempted<T> {
        self.execute_with_token(spec).await.0
    }

    /// Like [`RequestClient::execute`], also returning the bearer token the
    /// final attempt carried.
    pub(crate) async fn execute_with_token<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
    ) -> (Attempted<T>, Option<String>) {
        let url = match spec.resolve(&self.config.base_url) {
            Ok(url) => url,
            Err(err) => return (Attempted::new(Err(err), 0), None),
        };

        let policy = self.config.retry;
        let mut attempts_used = 0;
        loop {
            attempts_used += 1;
            let token = self.current_token();
            let request = HttpRequest {
                method: spec.method,
                url: url.clone(),
                bearer_token: token.clone(),
                body: spec.body.clone(),
            };

            let outcome = send_once(self.transport.as_ref(), request, self.config.timeout).await;
            match outcome {
                Err(err) if err.is_retryable() && policy.allows_another(attempts_used) => {
                    let delay = policy.delay_for_attempt(attempts_used - 1, err.retry_after_ms);
                    debug!(
                        %url,
                        attempt = attempts_used,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return (Attempted::new(outcome, attempts_used), token),
            }
        }
    }

    fn current_token(&self) -> Option<String> {
        self.auth.borrow().access_token().map(str::to_owned)
    }
}

/// Send a single attempt with a timeout and classify the result.
pub(crate) async fn send_once<T: DeserializeOwned>(
    transport: &dyn Transport,
    request: HttpRequest,
    timeout: Duration,
) -> RequestOutcome<T> {
    trace!(method = ?request.method, url = %request.url, "sending request");
    match tokio::time::timeout(timeout, transport.send(request)).await {
        Err(_) => Err(RequestError::timeout(timeout)),
        Ok(Err(err)) => Err(map_transport_error(err, timeout)),
        Ok(Ok(response)) => classify_response(response),
    }
}

fn map_transport_error(err: TransportError, timeout: Duration) -> RequestError {
    match err {
        TransportError::Timeout => RequestError::timeout(timeout),
        TransportError::Connect(message) | TransportError::Other(message) => {
            RequestError::network(message)
        }
    }
}

/// Map a raw HTTP response to a success payload or a classified failure.
pub fn classify_response<T: DeserializeOwned>(response: HttpResponse) -> RequestOutcome<T> {
    let HttpResponse {
        status,
        body,
        retry_after,
    } = response;

    let Some(category) = classify_http_status(status) else {
        let bytes: &[u8] = if body.is_empty() { b"null" } else { &body };
        return serde_json::from_slice(bytes)
            .map_err(|err| RequestError::decode(status, format!("invalid response body: {err}")));
    };

    let json = serde_json::from_slice::<serde_json::Value>(&body).ok();
    let message = json
        .as_ref()
        .and_then(|value| ValidationDetails::from_body(value.clone()))
        .and_then(|details| details.message)
        .unwrap_or_else(|| format!("request failed with status {status}"));

    let err = match category {
        RequestErrorCategory::Network => {
            let err = RequestError::network(message).with_status(status);
            match retry_after {
                Some(delay) => err.with_retry_after(delay),
                None => err,
            }
        }
        RequestErrorCategory::Auth => RequestError::auth(status, message),
        RequestErrorCategory::NotFound => RequestError::not_found(message),
        RequestErrorCategory::Validation => match json.and_then(ValidationDetails::from_body) {
            Some(details) => RequestError::validation(status, details),
            None => RequestError::server(status, message),
        },
        RequestErrorCategory::Inactive | RequestErrorCategory::Server => {
            RequestError::server(status, message)
        }
    };
    Err(err)
}
