use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{RequestError, RequestErrorCategory};

/// Storage key and same-tab event name announcing terminal mutations.
pub const TERMINALS_UPDATED_KEY: &str = "pos-terminals-updated";

/// Role attached to an authenticated account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Super-role: satisfies every capability check.
    Admin,
    Manager,
    Cashier,
    /// Role string not recognized by this client.
    #[serde(other)]
    Unknown,
}

/// Public identity of the signed-in account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub role: Role,
}

/// Authenticated identity and token state for the current client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    /// Bearer token injected into API requests.
    pub access_token: String,
    /// Token exchanged for a new session on refresh.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token expiry in milliseconds since Unix epoch.
    pub expires_at_ms: u64,
}

impl Session {
    pub fn user(&self) -> AuthUser {
        AuthUser {
            id: self.user_id.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Time left until expiry, zero when already expired.
    pub fn expires_in(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }
}

/// Result of a successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignIn {
    pub user: AuthUser,
    pub session: Session,
}

/// Coarse authentication status derived from [`AuthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// The first session lookup has not resolved yet.
    Unknown,
    Anonymous,
    Authenticated,
}

/// Snapshot published by the session store to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub session: Option<Session>,
    /// True from startup until the first session lookup resolves.
    pub loading: bool,
    /// True while a token refresh is running.
    pub refreshing: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            session: None,
            loading: true,
            refreshing: false,
        }
    }
}

impl AuthState {
    pub fn status(&self) -> AuthStatus {
        match (&self.session, self.loading) {
            (Some(_), _) => AuthStatus::Authenticated,
            (None, true) => AuthStatus::Unknown,
            (None, false) => AuthStatus::Anonymous,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.access_token.as_str())
    }
}

/// Unsolicited session change pushed by the account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChange {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthChange {
    /// The session to install, or `None` when the change clears it.
    pub fn into_session(self) -> Option<Session> {
        match self {
            Self::SignedIn(session) | Self::TokenRefreshed(session) => Some(session),
            Self::SignedOut => None,
        }
    }
}

/// Point-of-sale terminal record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Terminal {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Deactivated terminals must not take orders.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Body for terminal create/update calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalDraft {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub pos_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub pos_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
}

/// A terminal together with the products it sells.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalCatalog {
    pub terminal: Terminal,
    pub products: Vec<Product>,
}

fn default_true() -> bool {
    true
}

/// Identifier scoping one synchronized resource (for example a terminal id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Classified result of one request.
pub type RequestOutcome<T> = Result<T, RequestError>;

/// Request outcome together with the number of attempts the client spent.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub outcome: RequestOutcome<T>,
    pub attempts_used: u32,
}

impl<T> Attempted<T> {
    pub fn new(outcome: RequestOutcome<T>, attempts_used: u32) -> Self {
        Self {
            outcome,
            attempts_used,
        }
    }

    pub fn success(value: T) -> Self {
        Self::new(Ok(value), 1)
    }

    pub fn failure(error: RequestError) -> Self {
        Self::new(Err(error), 1)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempted<U> {
        Attempted {
            outcome: self.outcome.map(f),
            attempts_used: self.attempts_used,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Discrete state of a resource fetch lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourcePhase {
    Idle,
    Loading,
    Retrying,
    Ready,
    NotFound,
    Inactive,
    Failed,
}

impl ResourcePhase {
    /// Loading and retrying both mean a fetch is outstanding.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Loading | Self::Retrying)
    }
}

/// Observable state of one synchronized resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub data: Option<T>,
    pub phase: ResourcePhase,
    /// Automatic retries spent since the last success, `0..=max_retries`.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Attempts the request client used for the latest settled fetch.
    pub attempts_used: u32,
    pub last_error: Option<RequestError>,
}

impl<T> ResourceState<T> {
    pub fn idle(max_retries: u32) -> Self {
        Self {
            data: None,
            phase: ResourcePhase::Idle,
            retry_count: 0,
            max_retries,
            attempts_used: 0,
            last_error: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase.is_in_flight()
    }

    /// Whether the latest failure looks like a connectivity problem.
    pub fn is_network_issue(&self) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(RequestError::is_network_issue)
    }

    /// Short human-readable status for a status bar.
    pub fn status_line(&self) -> String {
        match self.phase {
            ResourcePhase::Idle => "idle".to_owned(),
            ResourcePhase::Loading => "loading".to_owned(),
            ResourcePhase::Retrying => {
                format!("retrying ({}/{})", self.retry_count, self.max_retries)
            }
            ResourcePhase::Ready => "ready".to_owned(),
            ResourcePhase::NotFound => "not found".to_owned(),
            ResourcePhase::Inactive => "inactive".to_owned(),
            ResourcePhase::Failed => match &self.last_error {
                Some(err) if err.category == RequestErrorCategory::Network => {
                    format!("network error: {}", err.message)
                }
                Some(err) => format!("error: {}", err.message),
                None => "error".to_owned(),
            },
        }
    }
}

/// Source that produced an invalidation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Timer,
    Focus,
    CrossTabStorage,
    SameTabCustomEvent,
}

/// Instantaneous hint that the data behind `key` may be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSignal {
    pub kind: SignalKind,
    pub key: ResourceKey,
}

/// Toggles and timings for refresh triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub enable_polling: bool,
    pub polling_interval: Duration,
    pub enable_focus_refresh: bool,
    /// Cross-tab storage and same-tab mutation events.
    pub enable_mutation_events: bool,
    /// Storage key whose cross-tab changes invalidate resources.
    pub storage_key: String,
    /// Same-tab custom event name fired after local mutations.
    pub mutation_event: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enable_polling: true,
            polling_interval: Duration::from_secs(30),
            enable_focus_refresh: true,
            enable_mutation_events: true,
            storage_key: TERMINALS_UPDATED_KEY.to_owned(),
            mutation_event: TERMINALS_UPDATED_KEY.to_owned(),
        }
    }
}
