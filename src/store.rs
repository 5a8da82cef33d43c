//! The shared synchronization store.
//!
//! One `SyncStore` exists per browsing session. It owns the page cache, the
//! local overlay and the connection state, and is the single writer for all
//! of them: views, the realtime bridge and bulk operations only ever go
//! through its methods. Locks are never held across an `.await`, so every
//! cache/overlay transition is atomic with respect to async completions.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{CollectionSource, MutationSink};
use crate::cache::{LocalOverlay, Mutation, MutationId, MutationKind, PageCache, PendingMutation};
use crate::error::{FetchError, MutationError};
use crate::event::{Notifier, StoreEvent};
use crate::fetch::{FetchCoordinator, RetryPolicy};
use crate::model::{CollectionId, ItemRecord};
use crate::query::{QueryKey, QueryState, DEFAULT_PAGE_SIZE};
use crate::realtime::{ChangeEvent, ChangeKind, ConnectionState, ConnectionStatus, ReconnectPolicy};

/// Cache and overlay, always mutated together under one lock.
#[derive(Debug)]
pub(crate) struct SyncState {
  pub(crate) cache: PageCache,
  pub(crate) overlay: LocalOverlay,
}

impl SyncState {
  pub(crate) fn new(notifier: Notifier) -> Self {
    Self {
      cache: PageCache::new(notifier),
      overlay: LocalOverlay::new(),
    }
  }
}

pub(crate) type SharedState = Arc<Mutex<SyncState>>;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
/// Every critical section leaves the state consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables of the synchronization layer.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  pub page_size: u32,
  pub search_debounce: Duration,
  pub fetch_timeout: Duration,
  pub retry: RetryPolicy,
  pub reconnect: ReconnectPolicy,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      search_debounce: Duration::from_millis(300),
      fetch_timeout: Duration::from_secs(10),
      retry: RetryPolicy::default(),
      reconnect: ReconnectPolicy::default(),
    }
  }
}

struct StoreInner {
  state: SharedState,
  coordinator: FetchCoordinator,
  sink: Arc<dyn MutationSink>,
  notifier: Notifier,
  connection: watch::Sender<ConnectionState>,
  /// Keys with at least one attached view, with their view count
  bound: Mutex<HashMap<QueryKey, usize>>,
  options: SyncOptions,
}

/// Handle to the session-wide store. Cheap to clone.
#[derive(Clone)]
pub struct SyncStore {
  inner: Arc<StoreInner>,
}

impl SyncStore {
  pub fn new(
    source: Arc<dyn CollectionSource>,
    sink: Arc<dyn MutationSink>,
    options: SyncOptions,
  ) -> Self {
    let notifier = Notifier::new();
    let state = Arc::new(Mutex::new(SyncState::new(notifier.clone())));
    let coordinator = FetchCoordinator::new(
      source,
      Arc::clone(&state),
      notifier.clone(),
      options.retry.clone(),
      options.fetch_timeout,
    );
    let (connection, _) = watch::channel(ConnectionState::default());

    Self {
      inner: Arc::new(StoreInner {
        state,
        coordinator,
        sink,
        notifier,
        connection,
        bound: Mutex::new(HashMap::new()),
        options,
      }),
    }
  }

  pub fn options(&self) -> &SyncOptions {
    &self.inner.options
  }

  /// Default query of a collection at the configured page size.
  pub fn query(&self, collection: CollectionId) -> QueryKey {
    QueryKey::new(collection).with_page_size(self.inner.options.page_size)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.inner.notifier.subscribe()
  }

  // -- reads ------------------------------------------------------------------

  /// Visible items of a key: page order, de-duplicated, overlay applied.
  pub fn items(&self, key: &QueryKey) -> Vec<ItemRecord> {
    lock(&self.inner.state).cache.items(key)
  }

  pub fn has_more(&self, key: &QueryKey) -> bool {
    lock(&self.inner.state).cache.has_more(key)
  }

  pub fn loaded_pages(&self, key: &QueryKey) -> usize {
    lock(&self.inner.state).cache.loaded_pages(key)
  }

  pub fn is_stale(&self, key: &QueryKey) -> bool {
    lock(&self.inner.state).cache.is_stale(key)
  }

  pub fn status(&self, key: &QueryKey) -> QueryState {
    self.inner.coordinator.status(key)
  }

  /// Number of optimistic mutations still awaiting the server.
  pub fn pending_mutations(&self) -> usize {
    lock(&self.inner.state).overlay.len()
  }

  // -- view binding -----------------------------------------------------------

  pub fn bind(&self, key: &QueryKey) {
    *lock(&self.inner.bound).entry(key.clone()).or_insert(0) += 1;
  }

  /// Detach one view from a key. Cached pages stay for other views.
  pub fn unbind(&self, key: &QueryKey) {
    let mut bound = lock(&self.inner.bound);
    if let Some(count) = bound.get_mut(key) {
      *count -= 1;
      if *count == 0 {
        bound.remove(key);
      }
    }
  }

  pub fn bound_keys(&self) -> Vec<QueryKey> {
    lock(&self.inner.bound).keys().cloned().collect()
  }

  // -- fetching ---------------------------------------------------------------

  /// Make sure page 0 of `key` is cached. A cached key causes no request and
  /// no loading state.
  pub async fn ensure_loaded(&self, key: &QueryKey) -> Result<(), FetchError> {
    if self.is_stale(key) {
      return self.refresh(key).await;
    }
    self.inner.coordinator.fetch_page(key, 0).await.map(|_| ())
  }

  /// Fetch the next page of `key`.
  ///
  /// A no-op once the last page reported no more. Concurrent calls target
  /// the same next page and share its request, so pages are appended in
  /// index order. A key flagged stale is refreshed from page 0 instead.
  pub async fn load_more(&self, key: &QueryKey) -> Result<(), FetchError> {
    let (stale, has_more, next) = {
      let state = lock(&self.inner.state);
      (
        state.cache.is_stale(key),
        state.cache.has_more(key),
        state.cache.loaded_pages(key),
      )
    };
    if stale {
      return self.refresh(key).await;
    }
    if !has_more {
      return Ok(());
    }
    self.inner.coordinator.fetch_page(key, next).await.map(|_| ())
  }

  /// Invalidate `key` and fetch page 0 again.
  pub async fn refresh(&self, key: &QueryKey) -> Result<(), FetchError> {
    self.inner.coordinator.refresh(key).await.map(|_| ())
  }

  /// Bring the cache back in line after the push channel connects.
  ///
  /// Changes made while no channel was open are never replayed, so every
  /// cached key is flagged stale; an unbound one refreshes when a view binds
  /// it again. Bound keys that are cached or still loading are refreshed now.
  /// Failures stay on the key's status; they are not propagated.
  pub async fn catch_up(&self) {
    let cached = lock(&self.inner.state).cache.mark_all_stale();
    let keys: Vec<QueryKey> = self
      .bound_keys()
      .into_iter()
      .filter(|key| cached.contains(key) || self.status(key).is_loading())
      .collect();
    info!(
      cached = cached.len(),
      refreshing = keys.len(),
      "catching up after connect"
    );
    let results = join_all(keys.iter().map(|key| self.refresh(key))).await;
    for (key, result) in keys.iter().zip(results) {
      if let Err(err) = result {
        warn!(key = %key.fingerprint(), error = %err, "catch-up refresh failed");
      }
    }
  }

  // -- mutations --------------------------------------------------------------

  /// Apply a mutation optimistically, submit it, then commit or revert.
  ///
  /// Returns the server's authoritative record, or the rejection reason after
  /// the item has been reverted to its last authoritative state. Dropping
  /// the returned future does not abandon the mutation.
  pub async fn mutate(
    &self,
    collection: &CollectionId,
    item_id: &str,
    mutation: &Mutation,
  ) -> Result<ItemRecord, MutationError> {
    let id = self.begin_mutation(collection, item_id, mutation);
    self.spawn_submission(id, collection, item_id, mutation).await
  }

  pub(crate) fn begin_mutation(
    &self,
    collection: &CollectionId,
    item_id: &str,
    mutation: &Mutation,
  ) -> MutationId {
    let mut state = lock(&self.inner.state);
    let SyncState { cache, overlay } = &mut *state;
    let known = cache.authoritative_version(collection, item_id);
    overlay.apply(
      cache,
      PendingMutation::new(collection.clone(), item_id, mutation, known),
    )
  }

  /// Submit a begun mutation and settle it in its own task. The request is
  /// sent and the overlay entry resolved whether or not anyone awaits the
  /// returned future.
  pub(crate) fn spawn_submission(
    &self,
    id: MutationId,
    collection: &CollectionId,
    item_id: &str,
    mutation: &Mutation,
  ) -> BoxFuture<'static, Result<ItemRecord, MutationError>> {
    let store = self.clone();
    let collection = collection.clone();
    let item_id = item_id.to_string();
    let kind = mutation.kind();
    let mutation = mutation.clone();

    let task = tokio::spawn({
      let store = store.clone();
      let collection = collection.clone();
      async move {
        let result = store
          .inner
          .sink
          .submit(&collection, &item_id, &mutation)
          .await;
        store.finish_mutation(id, &collection, kind, result)
      }
    });

    async move {
      match task.await {
        Ok(result) => result,
        // the task died before settling; revert so the item is not stuck
        Err(err) => store.finish_mutation(
          id,
          &collection,
          kind,
          Err(MutationError::Network(format!("mutation task failed: {}", err))),
        ),
      }
    }
    .boxed()
  }

  pub(crate) fn finish_mutation(
    &self,
    id: MutationId,
    collection: &CollectionId,
    kind: MutationKind,
    result: Result<ItemRecord, MutationError>,
  ) -> Result<ItemRecord, MutationError> {
    let mut state = lock(&self.inner.state);
    let SyncState { cache, overlay } = &mut *state;
    match result {
      Ok(record) => {
        overlay.confirm(cache, id, collection, kind, &record);
        Ok(record)
      }
      Err(err) => {
        overlay.fail(cache, id, &err.reason());
        Err(err)
      }
    }
  }

  // -- realtime ---------------------------------------------------------------

  /// Translate a pushed change into cache operations.
  pub fn apply_change(&self, event: &ChangeEvent) {
    let mut state = lock(&self.inner.state);
    let SyncState { cache, overlay } = &mut *state;
    let collection = &event.collection;
    let item_id = event.item_id.as_str();

    match event.kind {
      ChangeKind::Removed => {
        cache.record_removal(collection, item_id, event.version);
        for key in cache.keys_holding(collection, item_id) {
          cache.remove_authoritative(&key, item_id, event.version);
        }
        overlay.resolve_removed(collection, item_id);
      }
      ChangeKind::Updated => {
        let keys = cache.keys_holding(collection, item_id);
        if keys.is_empty() {
          debug!(item = item_id, "update for an item no page holds, ignored");
          return;
        }
        match &event.payload {
          Some(patch) => {
            for key in &keys {
              cache.patch_authoritative(key, item_id, event.version, patch);
            }
            overlay.reconcile_item(cache, collection, item_id, event.version);
          }
          None => {
            for key in &keys {
              cache.mark_stale(key);
            }
          }
        }
      }
      ChangeKind::Created => {
        // position under the key's sort/filter is unknown
        for key in cache.keys_for(collection) {
          cache.mark_stale(&key);
        }
      }
    }
  }

  pub fn connection(&self) -> ConnectionState {
    self.inner.connection.borrow().clone()
  }

  pub(crate) fn set_connection_status(&self, status: ConnectionStatus) {
    let changed = self.inner.connection.send_if_modified(|state| {
      if state.status == status {
        return false;
      }
      state.status = status;
      true
    });
    if changed {
      info!(%status, "connection status changed");
      self.inner.notifier.connection_changed(&self.connection());
    }
  }

  pub(crate) fn record_event_received(&self) {
    self.inner.connection.send_modify(|state| {
      state.last_event_at = Some(chrono::Utc::now());
    });
  }

  pub(crate) fn reset_connection(&self) {
    self.inner.connection.send_replace(ConnectionState::default());
    self.inner.notifier.connection_changed(&ConnectionState::default());
  }

  /// Drop all cached pages, tombstones and pending mutations (logout).
  pub fn clear(&self) {
    let mut state = lock(&self.inner.state);
    state.overlay.clear();
    state.cache.clear();
    debug!("store cleared");
  }
}
