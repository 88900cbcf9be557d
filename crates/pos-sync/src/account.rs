//! Remote account surface: sign-in, token refresh and sign-out, plus the
//! persisted session every tab of the origin shares.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pos_core::{AuthChange, AuthUser, RequestError, RequestErrorCategory, Session};
use pos_platform::{StorageChange, StorageError, TabStorage};
use serde::Deserialize;
use serde_json::json;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    client::{RequestSpec, send_once},
    session::now_ms,
    transport::{HttpRequest, Transport},
};

/// Storage key holding the persisted session JSON.
pub const SESSION_STORAGE_KEY: &str = "pos.auth.session";

const CHANGE_BUFFER: usize = 16;

/// Account operations the session store delegates to.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Persisted session left by an earlier run or another tab.
    async fn current_session(&self) -> Result<Option<Session>, RequestError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RequestError>;

    async fn refresh(&self, session: &Session) -> Result<Session, RequestError>;

    async fn sign_out(&self, session: &Session) -> Result<(), RequestError>;

    /// Unsolicited session changes, such as another tab signing out.
    fn auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}

/// Session as returned by the auth endpoints.
#[derive(Debug, Deserialize)]
struct SessionPayload {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    expires_in: u64,
    user: AuthUser,
}

impl SessionPayload {
    fn into_session(self, now_ms: u64) -> Session {
        Session {
            user_id: self.user.id,
            email: self.user.email,
            role: self.user.role,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at_ms: now_ms.saturating_add(self.expires_in.saturating_mul(1_000)),
        }
    }
}

/// [`AccountService`] talking to the remote auth endpoints and persisting the
/// session in origin-wide tab storage.
pub struct HttpAccountService {
    transport: Arc<dyn Transport>,
    base_url: Url,
    timeout: Duration,
    storage: TabStorage,
    changes: broadcast::Sender<AuthChange>,
}

impl HttpAccountService {
    pub fn new(
        base_url: Url,
        timeout: Duration,
        transport: Arc<dyn Transport>,
        storage: TabStorage,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            transport,
            base_url,
            timeout,
            storage,
            changes,
        }
    }

    /// Turn session writes made by other tabs into [`AuthChange`] notifications.
    pub fn spawn_storage_watch(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut storage_changes = self.storage.changes();
        let tx = self.changes.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = storage_changes.recv() => change,
                };
                let Some(change) = change else {
                    break;
                };
                if change.key != SESSION_STORAGE_KEY {
                    continue;
                }
                if let Some(auth_change) = auth_change_from_storage(&change) {
                    debug!(origin = %change.origin, "session changed in another tab");
                    let _ = tx.send(auth_change);
                }
            }
        })
    }

    async fn request_session(
        &self,
        spec: RequestSpec,
        bearer_token: Option<String>,
    ) -> Result<Session, RequestError> {
        let request = HttpRequest {
            method: spec.method,
            url: spec.resolve(&self.base_url)?,
            bearer_token,
            body: spec.body,
        };
        let payload: SessionPayload = send_once(self.transport.as_ref(), request, self.timeout).await?;
        let session = payload.into_session(now_ms());
        self.persist(&session)?;
        Ok(session)
    }

    fn persist(&self, session: &Session) -> Result<(), RequestError> {
        let encoded = serde_json::to_string(session).map_err(|err| {
            RequestError::new(
                RequestErrorCategory::Server,
                "session_serialize_error",
                err.to_string(),
            )
        })?;
        self.storage
            .set_item(SESSION_STORAGE_KEY, &encoded)
            .map_err(|err| map_storage_error("set_session", err))
    }

    fn forget(&self) {
        if let Err(err) = self.storage.remove_item(SESSION_STORAGE_KEY) {
            warn!(error = %err, "failed to remove persisted session");
        }
    }
}

#[async_trait]
impl AccountService for HttpAccountService {
    async fn current_session(&self) -> Result<Option<Session>, RequestError> {
        let raw = self
            .storage
            .get_item(SESSION_STORAGE_KEY)
            .map_err(|err| map_storage_error("get_session", err))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let session = serde_json::from_str::<Session>(&raw).map_err(|err| {
            RequestError::new(
                RequestErrorCategory::Server,
                "session_deserialize_error",
                err.to_string(),
            )
        })?;

        if session.is_expired_at(now_ms()) && session.refresh_token.is_none() {
            debug!("persisted session expired and cannot be refreshed");
            self.forget();
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RequestError> {
        let spec = RequestSpec::post(
            &["auth", "sign-in"],
            json!({ "email": email, "password": password }),
        );
        self.request_session(spec, None).await
    }

    async fn refresh(&self, session: &Session) -> Result<Session, RequestError> {
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Err(RequestError::new(
                RequestErrorCategory::Auth,
                "refresh_unavailable",
                "session carries no refresh token",
            ));
        };
        let spec = RequestSpec::post(
            &["auth", "refresh"],
            json!({ "refresh_token": refresh_token }),
        );
        self.request_session(spec, None).await
    }

    async fn sign_out(&self, session: &Session) -> Result<(), RequestError> {
        let spec = RequestSpec::post(&["auth", "sign-out"], json!({}));
        let request = HttpRequest {
            method: spec.method,
            url: spec.resolve(&self.base_url)?,
            bearer_token: Some(session.access_token.clone()),
            body: spec.body,
        };
        let remote = send_once::<serde::de::IgnoredAny>(self.transport.as_ref(), request, self.timeout)
            .await
            .map(|_| ());
        self.forget();
        remote
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

fn auth_change_from_storage(change: &StorageChange) -> Option<AuthChange> {
    let Some(raw) = change.new_value.as_deref() else {
        return Some(AuthChange::SignedOut);
    };
    let session = match serde_json::from_str::<Session>(raw) {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable session written by another tab");
            return None;
        }
    };

    let previous_user = change
        .old_value
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Session>(raw).ok())
        .map(|previous| previous.user_id);
    if previous_user.as_deref() == Some(session.user_id.as_str()) {
        Some(AuthChange::TokenRefreshed(session))
    } else {
        Some(AuthChange::SignedIn(session))
    }
}

fn map_storage_error(operation: &str, err: StorageError) -> RequestError {
    RequestError::new(
        RequestErrorCategory::Server,
        "session_storage_error",
        format!("{operation} failed: {err}"),
    )
}
