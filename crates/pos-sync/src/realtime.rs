//! Merges timer, focus, cross-tab storage and same-tab mutation signals into
//! refetch triggers, one registration per resource key.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use pos_core::{InvalidationSignal, RealtimeConfig, ResourceKey, signal_channel};
use pos_platform::{
    BrowserWindow, CustomEventSource, FocusSource, IntervalSource, SignalSource, StorageKeySource,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::resource::Refetch;

const SIGNAL_BUFFER: usize = 16;

struct Registration {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Decides when registered resources refetch. It never fetches by itself.
///
/// Each key holds at most one registration, so repeated subscribe and
/// unsubscribe cycles never stack listeners or timers. Signals that pile up
/// before the dispatcher runs are coalesced into a single refetch.
pub struct RealtimeCoordinator {
    window: BrowserWindow,
    config: RealtimeConfig,
    registrations: Mutex<HashMap<ResourceKey, Registration>>,
}

impl RealtimeCoordinator {
    pub fn new(window: BrowserWindow, config: RealtimeConfig) -> Self {
        Self {
            window,
            config,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Start driving `target`. Returns `false` if its key is already registered.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe(&self, target: Arc<dyn Refetch>) -> bool {
        let key = target.key().clone();
        let mut registrations = self.registrations();
        if registrations.contains_key(&key) {
            debug!(%key, "already subscribed");
            return false;
        }

        let cancel = CancellationToken::new();
        let (tx, mut rx) = signal_channel(SIGNAL_BUFFER);
        let mut tasks = Vec::new();

        for source in self.sources() {
            let kind = source.kind();
            // Opened here so the listener exists before `subscribe` returns.
            let mut stream = source.open();
            let tx = tx.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let fired = tokio::select! {
                        _ = cancel.cancelled() => break,
                        fired = stream.next() => fired,
                    };
                    if fired.is_none() {
                        break;
                    }
                    let signal = InvalidationSignal {
                        kind,
                        key: key.clone(),
                    };
                    if !tx.forward(signal) {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let dispatch_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    next = rx.recv_coalesced() => next,
                };
                let Some((signal, absorbed)) = next else {
                    break;
                };
                let started = target.refetch();
                trace!(
                    key = %signal.key,
                    kind = ?signal.kind,
                    absorbed,
                    started,
                    "invalidation signal"
                );
            }
        }));

        debug!(%key, sources = tasks.len() - 1, "subscribed");
        registrations.insert(key, Registration { cancel, tasks });
        true
    }

    /// Stop driving `key` and wait until its listeners are gone.
    pub async fn unsubscribe(&self, key: &ResourceKey) -> bool {
        let removed = self.registrations().remove(key);
        let Some(registration) = removed else {
            return false;
        };
        stop(registration).await;
        debug!(%key, "unsubscribed");
        true
    }

    pub fn is_subscribed(&self, key: &ResourceKey) -> bool {
        self.registrations().contains_key(key)
    }

    pub fn subscription_count(&self) -> usize {
        self.registrations().len()
    }

    /// Tear down every registration.
    pub async fn shutdown(&self) {
        let drained = self
            .registrations()
            .drain()
            .map(|(_, registration)| registration)
            .collect::<Vec<_>>();
        for registration in drained {
            stop(registration).await;
        }
    }

    fn sources(&self) -> Vec<Box<dyn SignalSource>> {
        let mut sources: Vec<Box<dyn SignalSource>> = Vec::new();
        if self.config.enable_polling {
            sources.push(Box::new(IntervalSource::new(self.config.polling_interval)));
        }
        if self.config.enable_focus_refresh {
            sources.push(Box::new(FocusSource::new(self.window.clone())));
        }
        if self.config.enable_mutation_events {
            sources.push(Box::new(StorageKeySource::new(
                self.window.storage().clone(),
                self.config.storage_key.clone(),
            )));
            sources.push(Box::new(CustomEventSource::new(
                self.window.clone(),
                self.config.mutation_event.clone(),
            )));
        }
        sources
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<ResourceKey, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RealtimeCoordinator {
    fn drop(&mut self) {
        for registration in self.registrations().values() {
            registration.cancel.cancel();
        }
    }
}

async fn stop(registration: Registration) {
    registration.cancel.cancel();
    for task in registration.tasks {
        let _ = task.await;
    }
}
