//! Per-key resource synchronization on top of the fetch state machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pos_core::{
    Attempted, RequestError, ResourceKey, ResourcePhase, ResourceState, ResourceStateMachine,
    RetryPolicy, StateChannel, TerminalCatalog,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::PosApi;

/// Automatic retries after the first failed fetch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Loads the value behind one resource key.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Attempted<T>;
}

/// Type-erased refetch handle driven by the realtime coordinator.
pub trait Refetch: Send + Sync {
    fn key(&self) -> &ResourceKey;

    /// Start a fetch. Returns `false` when the trigger was dropped.
    fn refetch(&self) -> bool;
}

/// Keeps a [`ResourceState`] for one key current.
///
/// At most one fetch runs at a time; triggers that arrive while one is
/// outstanding are dropped. Network and server failures are retried with
/// backoff up to `max_retries` times before the state settles as `Failed`.
pub struct ResourceSync<T> {
    inner: Arc<SyncInner<T>>,
}

impl<T> Clone for ResourceSync<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SyncInner<T> {
    key: ResourceKey,
    fetcher: Arc<dyn Fetcher<T>>,
    machine: Mutex<ResourceStateMachine<T>>,
    state: StateChannel<ResourceState<T>>,
    backoff: RetryPolicy,
    cancel: CancellationToken,
    /// Cancels the fetch task for the latest issued sequence number.
    current: Mutex<Option<CancellationToken>>,
}

impl<T> SyncInner<T> {
    fn machine(&self) -> MutexGuard<'_, ResourceStateMachine<T>> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out the token for a newly issued fetch and cancel its predecessor.
    /// Called with the machine lock held so issue order and token order agree.
    fn replace_current(&self) -> CancellationToken {
        let token = self.cancel.child_token();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }
}

impl<T: Clone + Send + Sync + 'static> ResourceSync<T> {
    pub fn new(key: impl Into<ResourceKey>, fetcher: Arc<dyn Fetcher<T>>) -> Self {
        Self::with_policy(key, fetcher, DEFAULT_MAX_RETRIES, RetryPolicy::default())
    }

    /// `backoff` spaces automatic retries; only its delays are used.
    pub fn with_policy(
        key: impl Into<ResourceKey>,
        fetcher: Arc<dyn Fetcher<T>>,
        max_retries: u32,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                key: key.into(),
                fetcher,
                machine: Mutex::new(ResourceStateMachine::new(max_retries)),
                state: StateChannel::new(ResourceState::idle(max_retries)),
                backoff,
                cancel: CancellationToken::new(),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    /// Fetch unless a fetch is already outstanding.
    pub fn refetch(&self) -> bool {
        let issued = {
            let mut machine = self.inner.machine();
            machine.begin().map(|seq| {
                self.inner.state.publish(machine.state().clone());
                (seq, self.inner.replace_current())
            })
        };
        match issued {
            Some((seq, cancel)) => {
                tokio::spawn(run_fetch(self.inner.clone(), seq, cancel));
                true
            }
            None => {
                trace!(key = %self.inner.key, "fetch outstanding; trigger dropped");
                false
            }
        }
    }

    /// Manual retry with a fresh retry budget, allowed from any phase.
    /// An outstanding fetch is cancelled before the new one starts.
    pub fn retry(&self) -> bool {
        let issued = {
            let mut machine = self.inner.machine();
            machine.begin_manual_retry().map(|seq| {
                self.inner.state.publish(machine.state().clone());
                (seq, self.inner.replace_current())
            })
        };
        let Some((seq, cancel)) = issued else {
            return false;
        };
        debug!(key = %self.inner.key, seq, "manual retry");
        tokio::spawn(run_fetch(self.inner.clone(), seq, cancel));
        true
    }

    pub fn state(&self) -> ResourceState<T> {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.inner.state.subscribe()
    }

    /// Cancel outstanding work and drop the state. Later results are discarded
    /// and later triggers ignored.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut machine = self.inner.machine();
        machine.tear_down();
        self.inner.state.publish(machine.state().clone());
    }
}

async fn run_fetch<T: Clone + Send + Sync + 'static>(
    inner: Arc<SyncInner<T>>,
    mut seq: u64,
    cancel: CancellationToken,
) {
    loop {
        let attempted = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(key = %inner.key, seq, "fetch cancelled");
                return;
            }
            attempted = inner.fetcher.fetch(&inner.key) => attempted,
        };

        let (retry_count, retry_hint) = {
            let mut machine = inner.machine();
            let state = match machine.apply(seq, attempted) {
                Ok(state) => state.clone(),
                Err(rejected) => {
                    debug!(key = %inner.key, seq, %rejected, "discarding fetch result");
                    return;
                }
            };
            inner.state.publish(state.clone());
            if state.phase != ResourcePhase::Retrying {
                trace!(key = %inner.key, seq, phase = ?state.phase, "fetch settled");
                return;
            }
            (
                state.retry_count,
                state.last_error.and_then(|err| err.retry_after_ms),
            )
        };

        let delay = inner
            .backoff
            .delay_for_attempt(retry_count.saturating_sub(1), retry_hint);
        debug!(
            key = %inner.key,
            retry = retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling resource retry"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let next = inner.machine().continue_retry(seq);
        seq = match next {
            Ok(next) => next,
            Err(rejected) => {
                debug!(key = %inner.key, seq, %rejected, "retry superseded");
                return;
            }
        };
    }
}

impl<T: Clone + Send + Sync + 'static> Refetch for ResourceSync<T> {
    fn key(&self) -> &ResourceKey {
        &self.inner.key
    }

    fn refetch(&self) -> bool {
        ResourceSync::refetch(self)
    }
}

/// Loads a terminal and, when it is active, the products it sells.
pub struct TerminalCatalogFetcher {
    api: PosApi,
}

impl TerminalCatalogFetcher {
    pub fn new(api: PosApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Fetcher<TerminalCatalog> for TerminalCatalogFetcher {
    async fn fetch(&self, key: &ResourceKey) -> Attempted<TerminalCatalog> {
        let terminal = self.api.get_terminal(key.as_str()).await;
        let attempts_used = terminal.attempts_used;
        let terminal = match terminal.outcome {
            Ok(terminal) => terminal,
            Err(err) => return Attempted::new(Err(err), attempts_used),
        };
        if !terminal.is_active {
            let err = RequestError::inactive(format!("terminal {} is deactivated", terminal.id));
            return Attempted::new(Err(err), attempts_used);
        }

        let products = self.api.list_products(Some(&terminal.id)).await;
        let attempts_used = attempts_used.max(products.attempts_used);
        Attempted::new(
            products
                .outcome
                .map(|products| TerminalCatalog { terminal, products }),
            attempts_used,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::RequestClientConfig,
        session::SessionStore,
        testing::{FakeAccountService, ManualFetcher, Scripted, ScriptedFetcher, ScriptedTransport},
        transport::HttpResponse,
    };
    use pos_core::RequestErrorCategory;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    fn network() -> Attempted<&'static str> {
        Attempted::new(Err(RequestError::network("connection refused")), 3)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn wait_for_phase<T>(sync: &ResourceSync<T>, phase: ResourcePhase) -> ResourceState<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut rx = sync.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("phase should be reached")
            .expect("sync alive")
            .clone();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_three_network_errors() {
        let fetcher = ScriptedFetcher::new(vec![
            network(),
            network(),
            network(),
            Attempted::success("catalog"),
        ]);
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        assert!(sync.refetch());
        let state = wait_for_phase(&sync, ResourcePhase::Ready).await;

        assert_eq!(state.data, Some("catalog"));
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_exactly_three_retries() {
        let fetcher = ScriptedFetcher::new(vec![
            network(),
            network(),
            network(),
            network(),
            Attempted::success("never"),
        ]);
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        sync.refetch();
        let state = wait_for_phase(&sync, ResourcePhase::Failed).await;

        assert_eq!(state.retry_count, 3);
        assert_eq!(state.attempts_used, 3);
        assert_eq!(
            state.last_error.map(|err| err.category),
            Some(RequestErrorCategory::Network)
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_retry_progress_while_backing_off() {
        let fetcher = ScriptedFetcher::new(vec![network(), Attempted::success("ok")]);
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher);

        sync.refetch();
        let state = wait_for_phase(&sync, ResourcePhase::Retrying).await;
        assert_eq!(state.status_line(), "retrying (1/3)");
        assert!(state.is_network_issue());
        assert!(!sync.refetch(), "backoff counts as in flight");

        wait_for_phase(&sync, ResourcePhase::Ready).await;
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_never_retried() {
        let fetcher = ScriptedFetcher::new(vec![
            network(),
            Attempted::failure(RequestError::not_found("no such terminal")),
            Attempted::success("unreachable"),
        ]);
        let sync = ResourceSync::<&'static str>::new("t-404", fetcher.clone());

        sync.refetch();
        let state = wait_for_phase(&sync, ResourcePhase::NotFound).await;
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.data, None);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_during_a_fetch_are_dropped() {
        let fetcher = ManualFetcher::new();
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        assert!(sync.refetch());
        for _ in 0..5 {
            assert!(!sync.refetch());
        }
        settle().await;
        assert_eq!(fetcher.calls(), 1);

        assert!(fetcher.resolve(0, Attempted::success("first")));
        wait_for_phase(&sync, ResourcePhase::Ready).await;
        assert!(sync.refetch());
        settle().await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cancels_the_superseded_fetch() {
        let fetcher = ManualFetcher::new();
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        sync.refetch();
        settle().await;
        assert_eq!(fetcher.outstanding(), 1);

        assert!(sync.retry());
        settle().await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(fetcher.outstanding(), 1, "only the latest fetch may be pending");
        assert!(!fetcher.resolve(0, Attempted::success("A")));

        assert!(fetcher.resolve(1, Attempted::success("B")));
        let state = wait_for_phase(&sync, ResourcePhase::Ready).await;
        assert_eq!(state.data, Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_during_backoff_stops_the_older_retry_loop() {
        let fetcher = ScriptedFetcher::new(vec![
            network(),
            Attempted::success("from retry"),
            Attempted::success("stale loop"),
        ]);
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        sync.refetch();
        wait_for_phase(&sync, ResourcePhase::Retrying).await;
        assert!(sync.retry());
        let state = wait_for_phase(&sync, ResourcePhase::Ready).await;
        assert_eq!(state.data, Some("from retry"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(sync.state().data, Some("from retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_restarts_after_failure() {
        let fetcher = ScriptedFetcher::new(vec![
            network(),
            network(),
            network(),
            network(),
            Attempted::success("back"),
        ]);
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        sync.refetch();
        wait_for_phase(&sync, ResourcePhase::Failed).await;
        assert!(!sync.state().is_in_flight());

        assert!(sync.retry());
        let state = wait_for_phase(&sync, ResourcePhase::Ready).await;
        assert_eq!(state.data, Some("back"));
        assert_eq!(state.retry_count, 0);
        assert_eq!(fetcher.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_in_flight_result() {
        let fetcher = ManualFetcher::new();
        let sync = ResourceSync::<&'static str>::new("t-1", fetcher.clone());

        sync.refetch();
        settle().await;
        sync.shutdown();
        settle().await;
        assert_eq!(fetcher.outstanding(), 0);
        assert!(!fetcher.resolve(0, Attempted::success("late")));

        let state = sync.state();
        assert_eq!(state.phase, ResourcePhase::Idle);
        assert_eq!(state.data, None);
        assert!(!sync.refetch());
        assert!(!sync.retry());
    }

    async fn catalog_sync(script: Vec<Scripted>) -> (ResourceSync<TerminalCatalog>, Arc<ScriptedTransport>) {
        let account = Arc::new(FakeAccountService::default());
        let store = SessionStore::new(account);
        store.sign_in("ana@example.com", "pw").await.expect("sign in");
        let transport = ScriptedTransport::new(script);
        let base = Url::parse("https://pos.example.com/api").expect("base url");
        let api = PosApi::new(RequestClientConfig::new(base), transport.clone(), store);
        let sync = ResourceSync::<TerminalCatalog>::new("t-1", Arc::new(TerminalCatalogFetcher::new(api)));
        (sync, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_terminal_is_inactive_without_loading_products() {
        let (sync, transport) = catalog_sync(vec![Scripted::Respond(HttpResponse::json(
            200,
            &json!({ "id": "t-1", "name": "Front", "is_active": false }),
        ))])
        .await;

        sync.refetch();
        let state = wait_for_phase(&sync, ResourcePhase::Inactive).await;

        assert_eq!(state.data, None);
        assert_eq!(state.status_line(), "inactive");
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn active_terminal_loads_its_products() {
        let (sync, transport) = catalog_sync(vec![
            Scripted::Respond(HttpResponse::json(
                200,
                &json!({ "id": "t-1", "name": "Front", "is_active": true }),
            )),
            Scripted::Respond(HttpResponse::json(
                200,
                &json!([{ "id": "p-1", "name": "Latte", "price": 4.5, "pos_id": "t-1" }]),
            )),
        ])
        .await;

        sync.refetch();
        let state = wait_for_phase(&sync, ResourcePhase::Ready).await;

        let catalog = state.data.expect("catalog loaded");
        assert_eq!(catalog.terminal.name, "Front");
        assert_eq!(catalog.products.len(), 1);
        assert_eq!(
            transport.requests()[1].url.as_str(),
            "https://pos.example.com/api/products?posId=t-1"
        );
    }
}
