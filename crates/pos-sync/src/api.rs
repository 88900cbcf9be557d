use std::sync::Arc;

use pos_core::{
    Attempted, HealthStatus, Order, Product, RealtimeConfig, RequestError, RequestErrorCategory,
    Terminal, TerminalDraft,
};
use pos_platform::BrowserWindow;
use serde::{
    Serialize,
    de::{DeserializeOwned, IgnoredAny},
};
use tracing::{debug, warn};

use crate::{
    client::{RequestClient, RequestClientConfig, RequestSpec},
    session::{SessionStore, now_ms},
    transport::Transport,
};

const TERMINALS: &str = "pos-terminals";

/// Announces terminal mutations to this tab and to every other tab.
#[derive(Clone)]
struct MutationNotifier {
    window: BrowserWindow,
    storage_key: String,
    event: String,
}

impl MutationNotifier {
    fn notify(&self) {
        let stamp = now_ms().to_string();
        if let Err(err) = self.window.storage().set_item(&self.storage_key, &stamp) {
            warn!(error = %err, key = %self.storage_key, "failed to announce mutation to other tabs");
        }
        self.window.dispatch_custom_event(&self.event);
    }
}

/// Typed POS endpoints over a [`RequestClient`].
///
/// An `Auth` failure triggers one session refresh and one re-issue of the
/// call. If the re-issued call is rejected again the session is signed out.
#[derive(Clone)]
pub struct PosApi {
    client: RequestClient,
    session: SessionStore,
    notifier: Option<MutationNotifier>,
}

impl PosApi {
    pub fn new(config: RequestClientConfig, transport: Arc<dyn Transport>, session: SessionStore) -> Self {
        let client = RequestClient::new(config, transport, session.subscribe());
        Self {
            client,
            session,
            notifier: None,
        }
    }

    /// Announce successful terminal mutations on `window`'s storage key and
    /// custom event.
    pub fn with_mutation_notifications(mut self, window: BrowserWindow, config: &RealtimeConfig) -> Self {
        self.notifier = Some(MutationNotifier {
            window,
            storage_key: config.storage_key.clone(),
            event: config.mutation_event.clone(),
        });
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub async fn execute<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Attempted<T> {
        let (first, sent_token) = self.client.execute_with_token(spec).await;
        let rejected = matches!(&first.outcome, Err(err) if err.category == RequestErrorCategory::Auth);
        if !rejected || !self.session.is_authenticated() {
            return first;
        }

        debug!(segments = ?spec.segments, "request rejected; refreshing session once");
        if self
            .session
            .refresh_rejected(sent_token.as_deref())
            .await
            .is_err()
        {
            return first;
        }

        let second = self.client.execute(spec).await;
        if matches!(&second.outcome, Err(err) if err.category == RequestErrorCategory::Auth) {
            warn!(segments = ?spec.segments, "request still rejected after refresh; signing out");
            self.session.sign_out().await;
        }
        Attempted::new(second.outcome, first.attempts_used + second.attempts_used)
    }

    pub async fn health(&self) -> Attempted<HealthStatus> {
        self.execute(&RequestSpec::get(&["health"])).await
    }

    pub async fn list_terminals(&self, active_only: bool) -> Attempted<Vec<Terminal>> {
        let mut spec = RequestSpec::get(&[TERMINALS]);
        if active_only {
            spec = spec.with_query("active", "true");
        }
        self.execute(&spec).await
    }

    pub async fn get_terminal(&self, id: &str) -> Attempted<Terminal> {
        self.execute(&RequestSpec::get(&[TERMINALS, id])).await
    }

    pub async fn create_terminal(&self, draft: &TerminalDraft) -> Attempted<Terminal> {
        let body = match encode_body(draft) {
            Ok(body) => body,
            Err(err) => return Attempted::new(Err(err), 0),
        };
        let created = self.execute(&RequestSpec::post(&[TERMINALS], body)).await;
        self.announce_if_success(created)
    }

    pub async fn update_terminal(&self, id: &str, draft: &TerminalDraft) -> Attempted<Terminal> {
        let body = match encode_body(draft) {
            Ok(body) => body,
            Err(err) => return Attempted::new(Err(err), 0),
        };
        let updated = self.execute(&RequestSpec::put(&[TERMINALS, id], body)).await;
        self.announce_if_success(updated)
    }

    pub async fn delete_terminal(&self, id: &str) -> Attempted<()> {
        let deleted = self
            .execute::<IgnoredAny>(&RequestSpec::delete(&[TERMINALS, id]))
            .await
            .map(|_| ());
        self.announce_if_success(deleted)
    }

    pub async fn list_products(&self, pos_id: Option<&str>) -> Attempted<Vec<Product>> {
        let mut spec = RequestSpec::get(&["products"]);
        if let Some(pos_id) = pos_id {
            spec = spec.with_query("posId", pos_id);
        }
        self.execute(&spec).await
    }

    pub async fn get_order(&self, id: &str) -> Attempted<Order> {
        self.execute(&RequestSpec::get(&["orders", id])).await
    }

    fn announce_if_success<T>(&self, attempted: Attempted<T>) -> Attempted<T> {
        if attempted.is_success()
            && let Some(notifier) = &self.notifier
        {
            notifier.notify();
        }
        attempted
    }
}

fn encode_body<B: Serialize>(body: &B) -> Result<serde_json::Value, RequestError> {
    serde_json::to_value(body).map_err(|err| {
        RequestError::new(
            RequestErrorCategory::Server,
            "encode_error",
            format!("request body could not be encoded: {err}"),
        )
    })
}
