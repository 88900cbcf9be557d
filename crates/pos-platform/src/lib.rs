//! Host-side signal plumbing: origin-wide storage shared between tabs, per-tab
//! window events, and the uniform [`SignalSource`] interface the realtime
//! coordinator composes.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use pos_core::SignalKind;
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::trace;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// One write observed on the shared storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Tab that performed the write.
    pub origin: Uuid,
}

/// Key/value storage shared by every tab of one origin.
#[derive(Clone)]
pub struct SharedStorage {
    data: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            data: Arc::default(),
            changes,
        }
    }
}

impl SharedStorage {
    /// Handle scoped to one tab.
    pub fn tab(&self, tab_id: Uuid) -> TabStorage {
        TabStorage {
            shared: self.clone(),
            tab_id,
        }
    }

    fn write(&self, tab_id: Uuid, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        let old_value = {
            let mut data = self
                .data
                .write()
                .map_err(|_| StorageError::Unavailable("poisoned lock".to_owned()))?;
            match value {
                Some(value) => data.insert(key.to_owned(), value.to_owned()),
                None => data.remove(key),
            }
        };

        if old_value.is_none() && value.is_none() {
            return Ok(());
        }

        let _ = self.changes.send(StorageChange {
            key: key.to_owned(),
            old_value,
            new_value: value.map(str::to_owned),
            origin: tab_id,
        });
        Ok(())
    }
}

/// A tab's view of [`SharedStorage`].
///
/// Change notifications are only delivered for writes made by other tabs.
#[derive(Clone)]
pub struct TabStorage {
    shared: SharedStorage,
    tab_id: Uuid,
}

impl TabStorage {
    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self
            .shared
            .data
            .read()
            .map_err(|_| StorageError::Unavailable("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.shared.write(self.tab_id, key, Some(value))
    }

    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.shared.write(self.tab_id, key, None)
    }

    /// Stream of writes made by other tabs.
    pub fn changes(&self) -> StorageChanges {
        StorageChanges {
            rx: self.shared.changes.subscribe(),
            own_tab: self.tab_id,
        }
    }
}

pub struct StorageChanges {
    rx: broadcast::Receiver<StorageChange>,
    own_tab: Uuid,
}

impl StorageChanges {
    /// Next foreign write, or `None` once storage is gone.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.origin != self.own_tab => return Some(change),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    trace!(skipped, "storage change subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Event raised on a single tab's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    /// Focus transition; `true` when the window gained focus.
    Focus(bool),
    /// Same-tab custom event fired by application code.
    Custom { name: String },
}

/// One tab: window events plus its storage handle.
#[derive(Clone)]
pub struct BrowserWindow {
    tab_id: Uuid,
    events: broadcast::Sender<WindowEvent>,
    storage: TabStorage,
}

impl BrowserWindow {
    /// Open a new tab on the given origin storage.
    pub fn open(storage: &SharedStorage) -> Self {
        let tab_id = Uuid::new_v4();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tab_id,
            events,
            storage: storage.tab(tab_id),
        }
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    pub fn storage(&self) -> &TabStorage {
        &self.storage
    }

    pub fn set_focused(&self, focused: bool) {
        let _ = self.events.send(WindowEvent::Focus(focused));
    }

    pub fn dispatch_custom_event(&self, name: &str) {
        let _ = self.events.send(WindowEvent::Custom {
            name: name.to_owned(),
        });
    }

    pub fn events(&self) -> broadcast::Receiver<WindowEvent> {
        self.events.subscribe()
    }
}

/// Uniform interface over everything that can invalidate a resource.
pub trait SignalSource: Send + Sync {
    fn kind(&self) -> SignalKind;

    /// Start listening. Dropping the stream unregisters the listener.
    fn open(&self) -> SignalStream;
}

/// Fixed-period timer; the first tick fires one period after opening.
pub struct IntervalSource {
    period: Duration,
}

impl IntervalSource {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }
}

impl SignalSource for IntervalSource {
    fn kind(&self) -> SignalKind {
        SignalKind::Timer
    }

    fn open(&self) -> SignalStream {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        SignalStream {
            inner: StreamInner::Interval(interval),
        }
    }
}

/// Fires when the window gains focus.
pub struct FocusSource {
    window: BrowserWindow,
}

impl FocusSource {
    pub fn new(window: BrowserWindow) -> Self {
        Self { window }
    }
}

impl SignalSource for FocusSource {
    fn kind(&self) -> SignalKind {
        SignalKind::Focus
    }

    fn open(&self) -> SignalStream {
        SignalStream {
            inner: StreamInner::Window {
                rx: self.window.events(),
                filter: WindowFilter::FocusGained,
            },
        }
    }
}

/// Fires on a named same-tab custom event.
pub struct CustomEventSource {
    window: BrowserWindow,
    name: String,
}

impl CustomEventSource {
    pub fn new(window: BrowserWindow, name: impl Into<String>) -> Self {
        Self {
            window,
            name: name.into(),
        }
    }
}

impl SignalSource for CustomEventSource {
    fn kind(&self) -> SignalKind {
        SignalKind::SameTabCustomEvent
    }

    fn open(&self) -> SignalStream {
        SignalStream {
            inner: StreamInner::Window {
                rx: self.window.events(),
                filter: WindowFilter::Custom(self.name.clone()),
            },
        }
    }
}

/// Fires when another tab writes a specific storage key.
pub struct StorageKeySource {
    storage: TabStorage,
    key: String,
}

impl StorageKeySource {
    pub fn new(storage: TabStorage, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }
}

impl SignalSource for StorageKeySource {
    fn kind(&self) -> SignalKind {
        SignalKind::CrossTabStorage
    }

    fn open(&self) -> SignalStream {
        SignalStream {
            inner: StreamInner::Storage {
                changes: self.storage.changes(),
                key: self.key.clone(),
            },
        }
    }
}

enum WindowFilter {
    FocusGained,
    Custom(String),
}

impl WindowFilter {
    fn matches(&self, event: &WindowEvent) -> bool {
        match (self, event) {
            (Self::FocusGained, WindowEvent::Focus(focused)) => *focused,
            (Self::Custom(wanted), WindowEvent::Custom { name }) => wanted == name,
            _ => false,
        }
    }
}

enum StreamInner {
    Interval(Interval),
    Window {
        rx: broadcast::Receiver<WindowEvent>,
        filter: WindowFilter,
    },
    Storage {
        changes: StorageChanges,
        key: String,
    },
}

/// Open listener produced by a [`SignalSource`].
pub struct SignalStream {
    inner: StreamInner,
}

impl SignalStream {
    /// Wait for the next firing. `None` means the source is gone for good.
    pub async fn next(&mut self) -> Option<()> {
        match &mut self.inner {
            StreamInner::Interval(interval) => {
                interval.tick().await;
                Some(())
            }
            StreamInner::Window { rx, filter } => loop {
                match rx.recv().await {
                    Ok(event) if filter.matches(&event) => return Some(()),
                    Ok(_) => continue,
                    // Missed events may have included a match.
                    Err(RecvError::Lagged(_)) => return Some(()),
                    Err(RecvError::Closed) => return None,
                }
            },
            StreamInner::Storage { changes, key } => loop {
                let change = changes.recv().await?;
                if change.key == *key {
                    return Some(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn storage_is_shared_between_tabs() {
        let origin = SharedStorage::default();
        let a = BrowserWindow::open(&origin);
        let b = BrowserWindow::open(&origin);

        a.storage().set_item("k", "v1").expect("set should work");
        assert_eq!(
            b.storage().get_item("k").expect("get should work"),
            Some("v1".to_owned())
        );

        b.storage().remove_item("k").expect("remove should work");
        assert_eq!(a.storage().get_item("k").expect("get should work"), None);
    }

    #[tokio::test]
    async fn storage_changes_skip_own_tab_writes() {
        let origin = SharedStorage::default();
        let a = BrowserWindow::open(&origin);
        let b = BrowserWindow::open(&origin);
        let mut a_changes = a.storage().changes();

        a.storage().set_item("own", "1").expect("set");
        b.storage().set_item("foreign", "2").expect("set");

        let change = timeout(SHORT, a_changes.recv())
            .await
            .expect("change should arrive")
            .expect("storage should be open");
        assert_eq!(change.key, "foreign");
        assert_eq!(change.new_value.as_deref(), Some("2"));
        assert_eq!(change.origin, b.tab_id());
    }

    #[tokio::test]
    async fn focus_source_fires_only_on_focus_gained() {
        let origin = SharedStorage::default();
        let window = BrowserWindow::open(&origin);
        let source = FocusSource::new(window.clone());
        assert_eq!(source.kind(), SignalKind::Focus);
        let mut stream = source.open();

        window.set_focused(false);
        assert!(timeout(SHORT, stream.next()).await.is_err());

        window.set_focused(true);
        assert_eq!(timeout(SHORT, stream.next()).await, Ok(Some(())));
    }

    #[tokio::test]
    async fn custom_event_source_filters_by_name() {
        let origin = SharedStorage::default();
        let window = BrowserWindow::open(&origin);
        let mut stream = CustomEventSource::new(window.clone(), "pos-terminals-updated").open();

        window.dispatch_custom_event("cart-updated");
        assert!(timeout(SHORT, stream.next()).await.is_err());

        window.dispatch_custom_event("pos-terminals-updated");
        assert_eq!(timeout(SHORT, stream.next()).await, Ok(Some(())));
    }

    #[tokio::test]
    async fn storage_key_source_ignores_other_keys_and_own_tab() {
        let origin = SharedStorage::default();
        let here = BrowserWindow::open(&origin);
        let there = BrowserWindow::open(&origin);
        let mut stream =
            StorageKeySource::new(here.storage().clone(), "pos-terminals-updated").open();

        here.storage()
            .set_item("pos-terminals-updated", "1")
            .expect("set");
        there.storage().set_item("unrelated", "1").expect("set");
        assert!(timeout(SHORT, stream.next()).await.is_err());

        there
            .storage()
            .set_item("pos-terminals-updated", "2")
            .expect("set");
        assert_eq!(timeout(SHORT, stream.next()).await, Ok(Some(())));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_source_waits_one_period_before_first_tick() {
        let mut stream = IntervalSource::new(Duration::from_secs(30)).open();

        assert!(
            timeout(Duration::from_secs(29), stream.next())
                .await
                .is_err()
        );
        assert_eq!(
            timeout(Duration::from_secs(2), stream.next()).await,
            Ok(Some(()))
        );
    }
}
