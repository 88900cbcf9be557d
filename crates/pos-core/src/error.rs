use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad outcome category used for UI handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestErrorCategory {
    /// Connection failure, timeout or 5xx. Retryable.
    Network,
    /// Session invalid or expired (401/403).
    Auth,
    /// The requested resource does not exist (404).
    NotFound,
    /// The resource exists but is deactivated by business state.
    Inactive,
    /// Caller input rejected with a structured body (400/422).
    Validation,
    /// Any other remote failure.
    Server,
}

impl RequestErrorCategory {
    /// Whether the request client may retry this category on its own.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network)
    }
}

/// Structured error body returned by mutation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationDetails {
    /// Top-level `error`/`message` string when the body carries one.
    pub message: Option<String>,
    /// Full decoded body, surfaced verbatim to the caller.
    pub body: serde_json::Value,
}

impl ValidationDetails {
    /// Build details from a decoded JSON body.
    ///
    /// Returns `None` unless the body is a JSON object.
    pub fn from_body(body: serde_json::Value) -> Option<Self> {
        if !body.is_object() {
            return None;
        }
        let message = ["error", "message"]
            .iter()
            .find_map(|field| body.get(*field).and_then(|v| v.as_str()))
            .map(str::to_owned);
        Some(Self { message, body })
    }
}

/// Stable classified failure produced by the request layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct RequestError {
    /// High-level failure category.
    pub category: RequestErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
    /// Structured validation body for `Validation` failures.
    pub details: Option<ValidationDetails>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl RequestError {
    /// Construct a new request error.
    pub fn new(
        category: RequestErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
            details: None,
            retry_after_ms: None,
        }
    }

    /// Attach the HTTP status that produced the error.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::Network, "network_error", message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            RequestErrorCategory::Network,
            "timeout",
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::Auth, "auth_error", message).with_status(status)
    }

    /// Failure raised locally when a call needs a session and none exists.
    pub fn not_authenticated() -> Self {
        Self::new(
            RequestErrorCategory::Auth,
            "not_authenticated",
            "no active session",
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::NotFound, "not_found", message).with_status(404)
    }

    pub fn inactive(message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::Inactive, "inactive", message)
    }

    pub fn validation(status: u16, details: ValidationDetails) -> Self {
        let message = details
            .message
            .clone()
            .unwrap_or_else(|| "request rejected".to_owned());
        let mut err =
            Self::new(RequestErrorCategory::Validation, "validation_error", message).with_status(status);
        err.details = Some(details);
        err
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::Server, "server_error", message).with_status(status)
    }

    /// A 2xx body that could not be decoded into the expected payload.
    pub fn decode(status: u16, message: impl Into<String>) -> Self {
        Self::new(RequestErrorCategory::Server, "decode_error", message).with_status(status)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Coarse grouping used by views that only distinguish connectivity issues.
    pub fn is_network_issue(&self) -> bool {
        self.category == RequestErrorCategory::Network
    }
}

/// Map HTTP status codes to request failure categories.
///
/// Returns `None` for success statuses. `Validation` is only final when the
/// response also carries a structured body; see [`ValidationDetails::from_body`].
pub fn classify_http_status(status: u16) -> Option<RequestErrorCategory> {
    match status {
        200..=299 => None,
        401 | 403 => Some(RequestErrorCategory::Auth),
        404 => Some(RequestErrorCategory::NotFound),
        400 | 422 => Some(RequestErrorCategory::Validation),
        408 | 500..=599 => Some(RequestErrorCategory::Network),
        _ => Some(RequestErrorCategory::Server),
    }
}
