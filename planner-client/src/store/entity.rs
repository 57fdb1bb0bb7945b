//! Per-kind cache of ordered collections keyed by parent id.
//!
//! Fetches are single-flight per key: the first caller spawns the remote
//! fetch and every concurrent caller awaits the same shared result. The
//! fetch and its commit run on their own task, so dropping an awaiting
//! caller never leaves a key marked as loading. A fetch may publish partial
//! results through a `Publisher` while it runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use client_core::error::RpcError;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::models::{AgendaItem, Event, Expense, Guest, Task};

/// A cached value with a stable identifier.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

impl Entity for Event {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Guest {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Task {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for AgendaItem {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Expense {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Event,
    Guest,
    Task,
    Agenda,
    Expense,
}

impl EntityKind {
    /// Kinds stored as children of an event.
    pub const CHILDREN: [EntityKind; 4] = [
        EntityKind::Guest,
        EntityKind::Task,
        EntityKind::Agenda,
        EntityKind::Expense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Event => "event",
            EntityKind::Guest => "guest",
            EntityKind::Task => "task",
            EntityKind::Agenda => "agenda",
            EntityKind::Expense => "expense",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a load or refresh, shared by every caller that joined it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Collection replaced; carries the new length.
    Loaded(usize),
    /// Fetch failed; the previous collection is kept.
    Failed(RpcError),
    /// The parent is gone or no longer accessible; the collection was dropped.
    AccessLost(RpcError),
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }

    pub fn is_access_lost(&self) -> bool {
        matches!(self, LoadOutcome::AccessLost(_))
    }
}

/// Fetches the full collection for one parent id.
pub type Fetcher<E> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<E>, RpcError>> + Send + Sync>;

/// A load in progress. Cloning it joins the same fetch.
pub type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct InFlight {
    fetch_id: u64,
    load: SharedLoad,
}

struct State<E> {
    collections: HashMap<String, Vec<E>>,
    in_flight: HashMap<String, InFlight>,
}

struct Inner<E> {
    kind: EntityKind,
    fetcher: Fetcher<E>,
    state: Mutex<State<E>>,
    next_fetch_id: AtomicU64,
}

impl<E: Entity> Inner<E> {
    fn lock(&self) -> MutexGuard<'_, State<E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(state: &State<E>, parent_id: &str, fetch_id: u64) -> bool {
        state
            .in_flight
            .get(parent_id)
            .is_some_and(|f| f.fetch_id == fetch_id)
    }

    /// Apply a finished fetch. Results of a fetch that was superseded by
    /// `clear` are discarded.
    fn commit(&self, parent_id: &str, fetch_id: u64, result: Result<Vec<E>, RpcError>) -> LoadOutcome {
        let mut state = self.lock();
        if !Self::is_current(&state, parent_id, fetch_id) {
            tracing::debug!(kind = %self.kind, parent_id, "Discarding result of cleared fetch");
            return LoadOutcome::Failed(RpcError::Cancelled);
        }
        state.in_flight.remove(parent_id);

        match result {
            Ok(items) => {
                let items = dedup_by_id(items);
                let len = items.len();
                state.collections.insert(parent_id.to_string(), items);
                tracing::debug!(kind = %self.kind, parent_id, len, "Collection loaded");
                LoadOutcome::Loaded(len)
            }
            Err(err) if err.is_access_lost() => {
                state.collections.remove(parent_id);
                tracing::info!(kind = %self.kind, parent_id, error = %err, "Access lost, collection dropped");
                LoadOutcome::AccessLost(err)
            }
            Err(err) => {
                tracing::warn!(kind = %self.kind, parent_id, error = %err, "Load failed, keeping cached collection");
                LoadOutcome::Failed(err)
            }
        }
    }
}

/// Write access for a running fetch to its own key.
pub struct Publisher<E> {
    inner: Arc<Inner<E>>,
    parent_id: String,
    fetch_id: u64,
}

impl<E: Entity> Publisher<E> {
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Replace the collection with a partial result. Returns `false`, and
    /// writes nothing, once the fetch was superseded by `clear`.
    pub fn publish(&self, items: Vec<E>) -> bool {
        let mut state = self.inner.lock();
        if !Inner::is_current(&state, &self.parent_id, self.fetch_id) {
            return false;
        }
        state
            .collections
            .insert(self.parent_id.clone(), dedup_by_id(items));
        true
    }
}

/// Cache for one entity kind.
pub struct EntityStore<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Entity> EntityStore<E> {
    pub fn new<F, Fut>(kind: EntityKind, fetch: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<E>, RpcError>> + Send + 'static,
    {
        let fetcher: Fetcher<E> = Arc::new(move |parent_id| fetch(parent_id).boxed());
        Self {
            inner: Arc::new(Inner {
                kind,
                fetcher,
                state: Mutex::new(State {
                    collections: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                next_fetch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    /// Cached collection, empty if never loaded.
    pub fn get(&self, parent_id: &str) -> Vec<E> {
        self.inner
            .lock()
            .collections
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find(&self, parent_id: &str, id: &str) -> Option<E> {
        self.inner
            .lock()
            .collections
            .get(parent_id)
            .and_then(|items| items.iter().find(|e| e.id() == id).cloned())
    }

    pub fn is_loading(&self, parent_id: &str) -> bool {
        self.inner.lock().in_flight.contains_key(parent_id)
    }

    /// Parent ids currently holding a collection.
    pub fn parent_ids(&self) -> Vec<String> {
        self.inner.lock().collections.keys().cloned().collect()
    }

    /// Cached collection, revalidated in the background unless a fetch is
    /// already running. Must be called from within a tokio runtime.
    pub fn read(&self, parent_id: &str) -> Vec<E> {
        let items = self.get(parent_id);
        drop(self.start(parent_id));
        items
    }

    /// Fetch and replace the collection, or join the fetch already in flight.
    pub async fn load(&self, parent_id: &str) -> LoadOutcome {
        self.start(parent_id).await
    }

    /// Same as `load`; never skipped because the cache already has data.
    pub async fn refresh(&self, parent_id: &str) -> LoadOutcome {
        tracing::debug!(kind = %self.inner.kind, parent_id, "Refresh requested");
        self.start(parent_id).await
    }

    /// Start a load whose fetch is built by `fetch`, which gets a `Publisher`
    /// for partial results. The final result is committed like any other
    /// load. If a load for the key is already running it is joined instead,
    /// and `fetch` is never called.
    pub fn load_with<F>(&self, parent_id: &str, fetch: F) -> SharedLoad
    where
        F: FnOnce(Publisher<E>) -> BoxFuture<'static, Result<Vec<E>, RpcError>>,
    {
        let mut state = self.inner.lock();
        if let Some(existing) = state.in_flight.get(parent_id) {
            return existing.load.clone();
        }

        let fetch_id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let fetch = fetch(Publisher {
            inner: self.inner.clone(),
            parent_id: parent_id.to_string(),
            fetch_id,
        });
        let inner = self.inner.clone();
        let key = parent_id.to_string();

        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Transport("fetch task panicked".to_string())),
            };
            inner.commit(&key, fetch_id, result)
        });

        let load = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => LoadOutcome::Failed(RpcError::Transport(format!("fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            parent_id.to_string(),
            InFlight {
                fetch_id,
                load: load.clone(),
            },
        );
        load
    }

    fn start(&self, parent_id: &str) -> SharedLoad {
        let fetcher = self.inner.fetcher.clone();
        self.load_with(parent_id, move |publisher| fetcher(publisher.parent_id.clone()))
    }

    /// Insert at the front, or replace in place if the id is already cached.
    pub fn upsert_local(&self, entity: E, parent_id: &str) {
        let mut state = self.inner.lock();
        let items = state.collections.entry(parent_id.to_string()).or_default();
        match items.iter().position(|e| e.id() == entity.id()) {
            Some(pos) => items[pos] = entity,
            None => items.insert(0, entity),
        }
    }

    pub fn remove_local(&self, id: &str, parent_id: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(items) = state.collections.get_mut(parent_id) else {
            return false;
        };
        let before = items.len();
        items.retain(|e| e.id() != id);
        items.len() != before
    }

    pub fn remove_many_local(&self, ids: &[String], parent_id: &str) -> usize {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut state = self.inner.lock();
        let Some(items) = state.collections.get_mut(parent_id) else {
            return 0;
        };
        let before = items.len();
        items.retain(|e| !ids.contains(e.id()));
        before - items.len()
    }

    /// Swap `old_id` for `entity` at the same position, e.g. a local
    /// placeholder for the server-assigned record. Falls back to an upsert
    /// when `old_id` is not cached.
    pub fn replace_local(&self, old_id: &str, entity: E, parent_id: &str) {
        let mut state = self.inner.lock();
        let items = state.collections.entry(parent_id.to_string()).or_default();
        match items.iter().position(|e| e.id() == old_id) {
            Some(pos) => {
                let new_id = entity.id().to_string();
                items[pos] = entity;
                let mut index = 0;
                items.retain(|e| {
                    let keep = index == pos || e.id() != new_id;
                    index += 1;
                    keep
                });
            }
            None => {
                drop(state);
                self.upsert_local(entity, parent_id);
            }
        }
    }

    /// Replace the whole collection without a fetch.
    pub fn replace_all(&self, parent_id: &str, items: Vec<E>) {
        self.inner
            .lock()
            .collections
            .insert(parent_id.to_string(), dedup_by_id(items));
    }

    /// Drop the collection and loading flag for one key. A fetch still in
    /// flight for the key will not write back.
    pub fn clear(&self, parent_id: &str) {
        let mut state = self.inner.lock();
        state.collections.remove(parent_id);
        state.in_flight.remove(parent_id);
    }

    pub fn clear_all(&self) {
        let mut state = self.inner.lock();
        state.collections.clear();
        state.in_flight.clear();
    }

    /// Replace the entity with the same id under every parent. Returns
    /// whether any copy was found.
    pub fn update_everywhere(&self, entity: &E) -> bool {
        let mut state = self.inner.lock();
        let mut found = false;
        for items in state.collections.values_mut() {
            for item in items.iter_mut().filter(|e| e.id() == entity.id()) {
                *item = entity.clone();
                found = true;
            }
        }
        found
    }

    pub fn remove_everywhere(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        let mut found = false;
        for items in state.collections.values_mut() {
            let before = items.len();
            items.retain(|e| e.id() != id);
            found |= items.len() != before;
        }
        found
    }
}

/// Keep the first occurrence of each id, preserving server order.
fn dedup_by_id<E: Entity>(items: Vec<E>) -> Vec<E> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|e| seen.insert(e.id().to_string()))
        .collect()
}
