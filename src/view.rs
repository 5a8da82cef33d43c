//! The surface a presentation layer consumes.
//!
//! A [`CollectionView`] is bound to one [`QueryKey`] at a time and reads
//! everything through the shared [`SyncStore`]. Changing search, filters or
//! sort re-keys the view; the previous key's pages stay cached for other
//! views (and for switching back without a loading flash).

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::bulk::{BulkExecutor, BulkOutcome};
use crate::cache::Mutation;
use crate::error::{FetchError, MutationError};
use crate::event::StoreEvent;
use crate::fetch::Debouncer;
use crate::model::ItemRecord;
use crate::query::{FilterValue, QueryKey, SortSpec};
use crate::realtime::ConnectionStatus;
use crate::store::{lock, SyncStore};

struct ViewInner {
  store: SyncStore,
  key: Mutex<QueryKey>,
  /// Search term typed but not yet past the debounce window
  pending_search: Mutex<Option<String>>,
  debouncer: Debouncer,
}

impl Drop for ViewInner {
  fn drop(&mut self) {
    let key = lock(&self.key).clone();
    self.store.unbind(&key);
    debug!(key = %key.fingerprint(), "view detached");
  }
}

/// A live, paginated window onto one collection query. Cheap to clone; the
/// key is unbound when the last clone is dropped.
#[derive(Clone)]
pub struct CollectionView {
  inner: Arc<ViewInner>,
}

impl CollectionView {
  pub fn new(store: SyncStore, key: QueryKey) -> Self {
    store.bind(&key);
    let debouncer = Debouncer::new(store.options().search_debounce);
    Self {
      inner: Arc::new(ViewInner {
        store,
        key: Mutex::new(key),
        pending_search: Mutex::new(None),
        debouncer,
      }),
    }
  }

  pub fn key(&self) -> QueryKey {
    lock(&self.inner.key).clone()
  }

  // -- state ------------------------------------------------------------------

  /// Loaded items in page order. Never contains an id twice.
  pub fn items(&self) -> Vec<ItemRecord> {
    let mut seen = HashSet::new();
    self
      .inner
      .store
      .items(&self.key())
      .into_iter()
      .filter(|record| seen.insert(record.id.clone()))
      .collect()
  }

  pub fn loading(&self) -> bool {
    self.inner.store.status(&self.key()).is_loading()
  }

  /// Fetch failure of the current key, if its last request failed.
  pub fn error(&self) -> Option<FetchError> {
    self.inner.store.status(&self.key()).error().cloned()
  }

  pub fn has_more(&self) -> bool {
    self.inner.store.has_more(&self.key())
  }

  /// The term as typed, including one still inside the debounce window.
  pub fn search_term(&self) -> String {
    lock(&self.inner.pending_search)
      .clone()
      .unwrap_or_else(|| self.key().search().to_string())
  }

  pub fn filters(&self) -> BTreeMap<String, FilterValue> {
    self.key().filters().clone()
  }

  pub fn connection_status(&self) -> ConnectionStatus {
    self.inner.store.connection().status
  }

  // -- actions ----------------------------------------------------------------

  /// Fetch page 0 of the current key unless it is already cached.
  pub async fn load(&self) -> Result<(), FetchError> {
    self.inner.store.ensure_loaded(&self.key()).await
  }

  /// Fetch the next page. A no-op once `has_more` is false.
  pub async fn load_more(&self) -> Result<(), FetchError> {
    self.inner.store.load_more(&self.key()).await
  }

  pub async fn refresh(&self) -> Result<(), FetchError> {
    self.inner.store.refresh(&self.key()).await
  }

  /// Debounced search. Returns `Ok(false)` if a later keystroke superseded
  /// this one, in which case nothing was fetched.
  pub async fn set_search(&self, term: impl Into<String>) -> Result<bool, FetchError> {
    *lock(&self.inner.pending_search) = Some(term.into());
    if !self.inner.debouncer.settle().await {
      return Ok(false);
    }
    let Some(term) = lock(&self.inner.pending_search).take() else {
      return Ok(false);
    };
    let key = self.key().with_search(term);
    self.rekey(key).await?;
    Ok(true)
  }

  /// Replace all filters. Applied immediately, together with a search term
  /// still inside the debounce window.
  pub async fn set_filters(
    &self,
    filters: BTreeMap<String, FilterValue>,
  ) -> Result<(), FetchError> {
    let key = self.key_with_pending_search().with_filters(filters);
    self.rekey(key).await
  }

  /// Change the sort order. Applied immediately, like [`Self::set_filters`].
  pub async fn set_sort(&self, sort: SortSpec) -> Result<(), FetchError> {
    let key = self.key_with_pending_search().with_sort(sort);
    self.rekey(key).await
  }

  /// Current key with any debounced term folded in. The waiting
  /// `set_search` call is superseded.
  fn key_with_pending_search(&self) -> QueryKey {
    self.inner.debouncer.cancel();
    match lock(&self.inner.pending_search).take() {
      Some(term) => self.key().with_search(term),
      None => self.key(),
    }
  }

  async fn rekey(&self, key: QueryKey) -> Result<(), FetchError> {
    let previous = {
      let mut current = lock(&self.inner.key);
      if *current == key {
        None
      } else {
        Some(std::mem::replace(&mut *current, key.clone()))
      }
    };
    if let Some(previous) = previous {
      self.inner.store.bind(&key);
      self.inner.store.unbind(&previous);
      debug!(from = %previous.fingerprint(), to = %key.fingerprint(), "view re-keyed");
    }
    self.inner.store.ensure_loaded(&key).await
  }

  pub async fn mutate(
    &self,
    item_id: &str,
    mutation: Mutation,
  ) -> Result<ItemRecord, MutationError> {
    let key = self.key();
    self
      .inner
      .store
      .mutate(key.collection(), item_id, &mutation)
      .await
  }

  pub async fn bulk_apply<I, S>(&self, ids: I, mutation: Mutation) -> BulkOutcome
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let key = self.key();
    BulkExecutor::new(self.inner.store.clone())
      .bulk_apply(key.collection(), ids, &mutation)
      .await
  }

  /// Change notifications relevant to this view.
  pub fn subscribe(&self) -> ViewSubscription {
    ViewSubscription {
      view: self.clone(),
      events: self.inner.store.subscribe(),
    }
  }
}

/// Resolves whenever the view's visible state may have changed. Keeps the
/// view (and its key binding) alive.
pub struct ViewSubscription {
  view: CollectionView,
  events: broadcast::Receiver<StoreEvent>,
}

impl ViewSubscription {
  /// Wait for the next change to the view's current key or to the connection
  /// state. Returns `false` once the store is gone.
  pub async fn changed(&mut self) -> bool {
    loop {
      match self.events.recv().await {
        Ok(StoreEvent::KeyChanged(key)) => {
          if key == self.view.key() {
            return true;
          }
        }
        Ok(StoreEvent::ConnectionChanged(_)) => return true,
        // missed events; re-read everything
        Err(RecvError::Lagged(_)) => return true,
        Err(RecvError::Closed) => return false,
      }
    }
  }
}
