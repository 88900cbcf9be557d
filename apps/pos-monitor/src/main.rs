mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use pos_core::{ResourceState, TerminalCatalog};
use pos_platform::{BrowserWindow, SharedStorage};
use pos_sync::{
    HttpAccountService, PosApi, RealtimeCoordinator, ReqwestTransport, ResourceSync, SessionStore,
    TerminalCatalogFetcher, Transport,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PosConfig;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match PosConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    run(config).await;
    ExitCode::SUCCESS
}

async fn run(config: PosConfig) {
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::default());
    let storage = SharedStorage::default();
    let window = BrowserWindow::open(&storage);
    let stop = CancellationToken::new();

    let account = Arc::new(HttpAccountService::new(
        config.auth_base_url.clone(),
        config.request_timeout,
        transport.clone(),
        window.storage().clone(),
    ));
    let storage_watch = account.spawn_storage_watch(stop.child_token());

    let session = SessionStore::new(account);
    session.initialize().await;
    if !session.is_authenticated()
        && let Some((email, password)) = config.credentials()
    {
        match session.sign_in(email, password).await {
            Ok(signed_in) => info!(
                user_id = %signed_in.user.id,
                role = ?signed_in.user.role,
                "signed in with configured credentials"
            ),
            Err(err) => warn!(error = %err, "sign in with configured credentials failed"),
        }
    }
    session.start();
    info!(status = ?session.status(), "session ready");

    let realtime_config = config.realtime_config();
    let api = PosApi::new(config.request_client_config(), transport, session.clone())
        .with_mutation_notifications(window.clone(), &realtime_config);

    let health = api.health().await;
    match health.outcome {
        Ok(status) => info!(
            status = %status.status,
            attempts = health.attempts_used,
            base_url = %config.api_base_url,
            "api reachable"
        ),
        Err(err) => warn!(
            error = %err,
            attempts = health.attempts_used,
            base_url = %config.api_base_url,
            "health check failed"
        ),
    }

    let coordinator = RealtimeCoordinator::new(window.clone(), realtime_config);
    let mut catalog = None;
    let mut transitions = None;
    match config.terminal_id.clone() {
        Some(terminal_id) => {
            let sync = ResourceSync::<TerminalCatalog>::new(
                terminal_id,
                Arc::new(TerminalCatalogFetcher::new(api.clone())),
            );
            transitions = Some(tokio::spawn(log_transitions(
                sync.subscribe(),
                stop.child_token(),
            )));
            coordinator.subscribe(Arc::new(sync.clone()));
            sync.refetch();
            catalog = Some(sync);
        }
        None => info!("POS_TERMINAL_ID not set; monitoring the session only"),
    }
    window.set_focused(true);

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutting down");

    coordinator.shutdown().await;
    if let Some(sync) = &catalog {
        sync.shutdown();
    }
    session.shutdown().await;
    stop.cancel();
    let _ = storage_watch.await;
    if let Some(transitions) = transitions {
        let _ = transitions.await;
    }
}

async fn log_transitions(
    mut states: watch::Receiver<ResourceState<TerminalCatalog>>,
    stop: CancellationToken,
) {
    loop {
        let state = states.borrow_and_update().clone();
        let products = state.data.as_ref().map(|catalog| catalog.products.len());
        if state.is_network_issue() {
            warn!(status = %state.status_line(), attempts = state.attempts_used, "terminal catalog");
        } else {
            info!(status = %state.status_line(), ?products, "terminal catalog");
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
