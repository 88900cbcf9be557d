//! Runtime layer of the point-of-sale sync client.
//!
//! Binds the `pos-core` contract to real I/O: an HTTP transport, the
//! classified request client, the session store with its account service,
//! typed endpoints, per-key resource synchronization and the realtime
//! coordinator that decides when resources refetch.

/// Account service seam and its HTTP implementation.
pub mod account;
/// Typed POS endpoints with the auth refresh-and-retry-once policy.
pub mod api;
/// Request execution, classification and retry.
pub mod client;
/// Signal merging and refetch scheduling per resource key.
pub mod realtime;
/// Per-key fetch/retry synchronization.
pub mod resource;
/// Authoritative authentication state.
pub mod session;
/// HTTP transport seam and the `reqwest` implementation.
pub mod transport;

#[cfg(test)]
mod testing;

pub use account::{AccountService, HttpAccountService, SESSION_STORAGE_KEY};
pub use api::PosApi;
pub use client::{RequestClient, RequestClientConfig, RequestSpec, classify_response};
pub use realtime::RealtimeCoordinator;
pub use resource::{DEFAULT_MAX_RETRIES, Fetcher, Refetch, ResourceSync, TerminalCatalogFetcher};
pub use session::{DEFAULT_REFRESH_MARGIN, SessionStore};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
