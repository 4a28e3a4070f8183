//! Keyed reactive store with synchronous subscriber fan-out.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// State held for a single store key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataState {
    /// Last written value, kept even when an error is recorded.
    pub value: Option<Value>,
    /// Whether a producer reported work in progress.
    pub loading: bool,
    /// Last reported error.
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch of the last mutation.
    pub updated_at: u64,
    /// Who wrote the current value.
    pub source: Option<String>,
    /// Mutation counter, 0 for keys that hold no state. Keeps counting
    /// across clears, so a version is never handed out twice for one key.
    #[serde(default)]
    pub version: u64,
}

impl DataState {
    /// The sentinel returned for keys that were never written.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the never-written sentinel.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.version == 0
    }
}

/// Store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
}

/// Subscriber callback. Receives the full state after each mutation.
pub type Callback = Arc<dyn Fn(&DataState) + Send + Sync>;

struct Listener {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, DataState>,
    /// Last version of each cleared key; a re-created entry continues from it.
    floors: HashMap<String, u64>,
    listeners: HashMap<String, Vec<Listener>>,
}

struct Shared {
    inner: RwLock<Inner>,
    next_listener: AtomicU64,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_listener(&self, key: &str, id: u64) {
        let mut inner = self.write();
        if let Some(listeners) = inner.listeners.get_mut(key) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                inner.listeners.remove(key);
            }
        }
    }
}

/// In-memory keyed store shared by everything running against one workspace.
///
/// Cloning is cheap and yields a handle to the same data. Writers are
/// last-write-wins unless they go through [`Store::set_data_if_version`].
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner::default()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Overwrite the value for `key`, clearing any error and the loading flag.
    pub fn set_data(&self, key: &str, value: Value, source: Option<&str>) -> DataState {
        let source = source.map(str::to_owned);
        self.write_entry(key, None, |state| {
            state.value = Some(value);
            state.source = source;
            state.error = None;
            state.loading = false;
        })
        .unwrap_or_else(|_| self.get_data(key))
    }

    /// Overwrite the value only if the key is still at `expected` version.
    ///
    /// Use `expected = 0` to require that the key does not exist yet.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] and leaves the entry untouched when
    /// another writer got there first.
    pub fn set_data_if_version(
        &self,
        key: &str,
        value: Value,
        source: Option<&str>,
        expected: u64,
    ) -> Result<DataState, StoreError> {
        let source = source.map(str::to_owned);
        self.write_entry(key, Some(expected), |state| {
            state.value = Some(value);
            state.source = source;
            state.error = None;
            state.loading = false;
        })
    }

    /// Current state of `key`, or the empty sentinel.
    #[must_use]
    pub fn get_data(&self, key: &str) -> DataState {
        self.shared
            .read()
            .entries
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `key` has ever been written (and not cleared since).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.shared.read().entries.contains_key(key)
    }

    /// Set the loading flag, leaving value and error alone.
    pub fn set_loading(&self, key: &str, loading: bool) -> DataState {
        self.write_entry(key, None, |state| state.loading = loading)
            .unwrap_or_else(|_| self.get_data(key))
    }

    /// Record or clear an error. The stored value stays visible.
    pub fn set_error(&self, key: &str, error: Option<&str>) -> DataState {
        let error = error.map(str::to_owned);
        self.write_entry(key, None, |state| state.error = error)
            .unwrap_or_else(|_| self.get_data(key))
    }

    /// Remove a single entry. Subscribers are not notified.
    pub fn clear_data(&self, key: &str) {
        let mut inner = self.shared.write();
        if let Some(state) = inner.entries.remove(key) {
            inner.floors.insert(key.to_owned(), state.version);
        }
    }

    /// Remove every entry. Subscribers stay registered and are not notified.
    pub fn clear_all(&self) {
        let mut guard = self.shared.write();
        let inner = &mut *guard;
        for (key, state) in inner.entries.drain() {
            inner.floors.insert(key, state.version);
        }
    }

    /// Keys currently holding state, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of keys holding state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.read().entries.len()
    }

    /// True when no key holds state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.read().entries.is_empty()
    }

    /// Number of callbacks registered for `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.shared
            .read()
            .listeners
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Register `callback` for every future mutation of `key`.
    ///
    /// Callbacks run synchronously inside the writing call, in registration
    /// order, after the store lock has been released. Callbacks of
    /// concurrent writers may interleave; order by [`DataState::version`].
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&DataState) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .write()
            .listeners
            .entry(key.to_owned())
            .or_default()
            .push(Listener {
                id,
                callback: Arc::new(callback),
            });

        Subscription {
            key: key.to_owned(),
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn write_entry<F>(
        &self,
        key: &str,
        expected: Option<u64>,
        update: F,
    ) -> Result<DataState, StoreError>
    where
        F: FnOnce(&mut DataState),
    {
        let (state, callbacks) = {
            let mut guard = self.shared.write();
            let inner = &mut *guard;

            if let Some(expected) = expected {
                let actual = inner.entries.get(key).map_or(0, |s| s.version);
                if actual != expected {
                    tracing::debug!(key, expected, actual, "Rejected stale write");
                    return Err(StoreError::Conflict {
                        key: key.to_owned(),
                        expected,
                        actual,
                    });
                }
            }

            let floors = &mut inner.floors;
            let entry = inner
                .entries
                .entry(key.to_owned())
                .or_insert_with(|| DataState {
                    version: floors.remove(key).unwrap_or(0),
                    ..DataState::default()
                });
            update(entry);
            entry.updated_at = entry.updated_at.max(now_ms());
            entry.version += 1;
            let state = entry.clone();

            // Snapshot so callbacks may unsubscribe (or subscribe) while we iterate.
            let callbacks: Vec<Callback> = inner
                .listeners
                .get(key)
                .map(|ls| ls.iter().map(|l| Arc::clone(&l.callback)).collect())
                .unwrap_or_default();

            (state, callbacks)
        };

        for callback in callbacks {
            callback(&state);
        }

        Ok(state)
    }
}

/// Handle returned by [`Store::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    key: String,
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Key this subscription watches.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop receiving notifications. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
