//! Scripted fakes shared by the runtime tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use pos_core::{Attempted, AuthChange, AuthState, RequestError, ResourceKey, Role, Session};
use tokio::sync::{broadcast, oneshot};

use crate::{
    account::AccountService,
    resource::Fetcher,
    transport::{HttpRequest, HttpResponse, Transport, TransportError},
};

pub fn session(token: &str) -> Session {
    session_with_role(token, Role::Cashier)
}

pub fn session_with_role(token: &str, role: Role) -> Session {
    Session {
        user_id: "u-1".to_owned(),
        email: "ana@example.com".to_owned(),
        role,
        access_token: token.to_owned(),
        refresh_token: Some(format!("refresh-{token}")),
        expires_at_ms: u64::MAX,
    }
}

pub fn session_state(token: &str) -> AuthState {
    AuthState {
        session: Some(session(token)),
        loading: false,
        refreshing: false,
    }
}

pub enum Scripted {
    Respond(HttpResponse),
    Fail(TransportError),
    /// Never answer; exercises the per-attempt timeout.
    Hang,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::default(),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().expect("requests lock").push(request);
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Err(TransportError::Other("script exhausted".to_owned())),
        }
    }
}

/// In-memory account service with scripted refresh/sign-out results.
pub struct FakeAccountService {
    pub persisted: Mutex<Result<Option<Session>, RequestError>>,
    pub sign_in_result: Mutex<Result<Session, RequestError>>,
    pub refresh_results: Mutex<VecDeque<Result<Session, RequestError>>>,
    pub sign_out_result: Mutex<Result<(), RequestError>>,
    pub refresh_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    changes: broadcast::Sender<AuthChange>,
}

impl Default for FakeAccountService {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            persisted: Mutex::new(Ok(None)),
            sign_in_result: Mutex::new(Ok(session("token-1"))),
            refresh_results: Mutex::default(),
            sign_out_result: Mutex::new(Ok(())),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            changes,
        }
    }
}

impl FakeAccountService {
    pub fn push(&self, change: AuthChange) {
        let _ = self.changes.send(change);
    }

    pub fn queue_refresh(&self, result: Result<Session, RequestError>) {
        self.refresh_results
            .lock()
            .expect("refresh lock")
            .push_back(result);
    }
}

#[async_trait]
impl AccountService for FakeAccountService {
    async fn current_session(&self) -> Result<Option<Session>, RequestError> {
        self.persisted.lock().expect("persisted lock").clone()
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> Result<Session, RequestError> {
        self.sign_in_result.lock().expect("sign in lock").clone()
    }

    async fn refresh(&self, _session: &Session) -> Result<Session, RequestError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        // Suspend like a real network call so concurrent callers interleave.
        tokio::task::yield_now().await;
        self.refresh_results
            .lock()
            .expect("refresh lock")
            .pop_front()
            .unwrap_or_else(|| Err(RequestError::auth(401, "refresh token revoked")))
    }

    async fn sign_out(&self, _session: &Session) -> Result<(), RequestError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_out_result.lock().expect("sign out lock").clone()
    }

    fn auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

/// Fetcher returning scripted outcomes in call order.
pub struct ScriptedFetcher<T> {
    script: Mutex<VecDeque<Attempted<T>>>,
    calls: AtomicUsize,
}

impl<T> ScriptedFetcher<T> {
    pub fn new(script: Vec<Attempted<T>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Fetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self, _key: &ResourceKey) -> Attempted<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Attempted::failure(RequestError::network("script exhausted")))
    }
}

/// Fetcher whose calls stay pending until the test resolves them by index.
pub struct ManualFetcher<T> {
    pending: Mutex<Vec<Option<oneshot::Sender<Attempted<T>>>>>,
}

impl<T> ManualFetcher<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Calls whose future is still alive and waiting to be resolved.
    pub fn outstanding(&self) -> usize {
        self.pending
            .lock()
            .expect("pending lock")
            .iter()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Settle call number `index` (zero-based). Returns `false` if it is gone.
    pub fn resolve(&self, index: usize, outcome: Attempted<T>) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending lock")
            .get_mut(index)
            .and_then(Option::take);
        sender.is_some_and(|tx| tx.send(outcome).is_ok())
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Fetcher<T> for ManualFetcher<T> {
    async fn fetch(&self, _key: &ResourceKey) -> Attempted<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").push(Some(tx));
        rx.await
            .unwrap_or_else(|_| Attempted::failure(RequestError::network("fetch abandoned")))
    }
}
