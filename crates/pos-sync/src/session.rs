use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use pos_core::{
    AuthChange, AuthState, AuthStatus, RequestError, Role, Session, SignIn, StateChannel,
    has_any_role, has_role,
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::AccountService;

/// How long before expiry the background watcher refreshes the token.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Single authoritative source of authentication state.
///
/// Every mutation (sign-in, refresh, sign-out and pushed auth changes) goes
/// through one install path and is published to observers registered with
/// [`SessionStore::subscribe`]. Clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    account: Arc<dyn AccountService>,
    state: StateChannel<AuthState>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_margin: Duration,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(account: Arc<dyn AccountService>) -> Self {
        Self::with_refresh_margin(account, DEFAULT_REFRESH_MARGIN)
    }

    pub fn with_refresh_margin(account: Arc<dyn AccountService>, refresh_margin: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                account,
                state: StateChannel::new(AuthState::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_margin,
                cancel: CancellationToken::new(),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Restore any persisted session. A lookup failure leaves the store
    /// signed out; it is logged and not retried.
    pub async fn initialize(&self) {
        match self.inner.account.current_session().await {
            Ok(Some(session)) => {
                info!(user_id = %session.user_id, role = ?session.role, "restored session");
                self.install(Some(session));
            }
            Ok(None) => {
                debug!("no persisted session");
                self.install(None);
            }
            Err(err) => {
                warn!(error = %err, "could not restore persisted session");
                self.install(None);
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignIn, RequestError> {
        let session = self.inner.account.sign_in(email, password).await.map_err(|err| {
            warn!(error = %err, "sign in rejected");
            err
        })?;
        info!(user_id = %session.user_id, role = ?session.role, "signed in");
        self.install(Some(session.clone()));
        Ok(SignIn {
            user: session.user(),
            session,
        })
    }

    /// Clear the local session, then invalidate it remotely.
    ///
    /// The local session is gone even when the remote call fails.
    pub async fn sign_out(&self) {
        let previous = self.session();
        self.install(None);

        let Some(previous) = previous else {
            return;
        };
        info!(user_id = %previous.user_id, "signed out");
        if let Err(err) = self.inner.account.sign_out(&previous).await {
            warn!(error = %err, "remote sign out failed; local session already cleared");
        }
    }

    /// Exchange the current session for a fresh one.
    ///
    /// Concurrent callers share one refresh. A failed refresh signs out
    /// before the error is returned.
    pub async fn refresh_session(&self) -> Result<Session, RequestError> {
        let seen_token = self.access_token();
        self.refresh_replacing(seen_token.as_deref()).await
    }

    /// Refresh because a request carrying `rejected_token` was refused.
    ///
    /// Does nothing remotely when the session has already moved past that
    /// token, so callers rejected with the same token share one refresh.
    pub(crate) async fn refresh_rejected(
        &self,
        rejected_token: Option<&str>,
    ) -> Result<Session, RequestError> {
        self.refresh_replacing(rejected_token).await
    }

    async fn refresh_replacing(&self, stale_token: Option<&str>) -> Result<Session, RequestError> {
        let _guard = self.inner.refresh_lock.lock().await;

        let Some(current) = self.session() else {
            return Err(RequestError::not_authenticated());
        };
        if stale_token != Some(current.access_token.as_str()) {
            debug!("session already refreshed by a concurrent caller");
            return Ok(current);
        }

        self.inner.state.update(|state| state.refreshing = true);
        let _refreshing = RefreshingFlag {
            state: &self.inner.state,
        };
        match self.inner.account.refresh(&current).await {
            Ok(session) => {
                debug!(user_id = %session.user_id, expires_at_ms = session.expires_at_ms, "session refreshed");
                self.install(Some(session.clone()));
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "session refresh failed; signing out");
                self.sign_out().await;
                Err(err)
            }
        }
    }

    /// Apply an unsolicited change pushed by the account service.
    pub fn apply_auth_change(&self, change: AuthChange) {
        debug!(?change, "applying pushed auth change");
        self.install(change.into_session());
    }

    pub fn has_role(&self, role: Role) -> bool {
        has_role(self.session().as_ref(), role)
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        has_any_role(self.session().as_ref(), roles)
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn auth_state(&self) -> AuthState {
        self.inner.state.current()
    }

    pub fn status(&self) -> AuthStatus {
        self.auth_state().status()
    }

    pub fn session(&self) -> Option<Session> {
        self.auth_state().session
    }

    /// Observer of every auth state change. Drop the receiver to deregister.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Start the background watcher that applies pushed auth changes and
    /// refreshes the token shortly before it expires. Idempotent.
    ///
    /// Changes pushed after `start` returns are never missed.
    pub fn start(&self) {
        let mut watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let changes = self.inner.account.auth_changes();
        let store = self.clone();
        *watcher = Some(tokio::spawn(async move { store.watch(changes).await }));
    }

    /// Stop the background watcher and wait for it to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
    }

    async fn watch(self, mut changes: broadcast::Receiver<AuthChange>) {
        let cancel = self.inner.cancel.clone();
        let mut changes_open = true;
        let mut state_rx = self.subscribe();

        loop {
            let refresh_in = self.refresh_delay(&state_rx.borrow_and_update());
            let refresh_due = async {
                match refresh_in {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv(), if changes_open => match change {
                    Ok(change) => self.apply_auth_change(change),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth change subscriber lagged");
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = refresh_due => {
                    if let Err(err) = self.refresh_session().await {
                        warn!(error = %err, "scheduled token refresh failed");
                    }
                }
            }
        }
        debug!("session watcher stopped");
    }

    fn refresh_delay(&self, state: &AuthState) -> Option<Duration> {
        if state.refreshing {
            return None;
        }
        let session = state.session.as_ref()?;
        let delay = session
            .expires_in(now_ms())
            .saturating_sub(self.inner.refresh_margin);
        Some(delay.max(MIN_REFRESH_DELAY))
    }

    fn access_token(&self) -> Option<String> {
        self.auth_state().access_token().map(str::to_owned)
    }

    fn install(&self, session: Option<Session>) {
        self.inner.state.update(|state| {
            state.session = session;
            state.loading = false;
            state.refreshing = false;
        });
    }
}

/// Clears `refreshing` when a refresh is abandoned before it settles.
struct RefreshingFlag<'a> {
    state: &'a StateChannel<AuthState>,
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.state
            .update_if(|state| std::mem::take(&mut state.refreshing));
    }
}
