use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::api::{CollectionSource, PageResponse};
use crate::cache::Page;
use crate::error::FetchError;
use crate::event::Notifier;
use crate::query::{QueryKey, QueryState};
use crate::store::{lock, SharedState, SyncState};

type SharedFetch = Shared<BoxFuture<'static, Result<Page, FetchError>>>;

/// Identity of one underlying network request.
///
/// The generation is part of the identity: a request started before an
/// invalidation is never joined by a request started after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageRequest {
  key: QueryKey,
  page_index: usize,
  generation: u64,
}

#[derive(Debug, Default)]
struct KeyStatus {
  in_flight: usize,
  settled: QueryState,
}

struct Inner {
  source: Arc<dyn CollectionSource>,
  state: SharedState,
  notifier: Notifier,
  policy: RetryPolicy,
  timeout: Duration,
  in_flight: Mutex<HashMap<PageRequest, SharedFetch>>,
  status: Mutex<HashMap<QueryKey, KeyStatus>>,
}

/// Cache-first page loader with request de-duplication and retries.
#[derive(Clone)]
pub struct FetchCoordinator {
  inner: Arc<Inner>,
}

impl FetchCoordinator {
  pub(crate) fn new(
    source: Arc<dyn CollectionSource>,
    state: SharedState,
    notifier: Notifier,
    policy: RetryPolicy,
    timeout: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        source,
        state,
        notifier,
        policy,
        timeout,
        in_flight: Mutex::new(HashMap::new()),
        status: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Return a cached page, or fetch it.
  ///
  /// Concurrent calls for the same page attach to one in-flight request.
  pub async fn fetch_page(&self, key: &QueryKey, page_index: usize) -> Result<Page, FetchError> {
    let generation = {
      let state = lock(&self.inner.state);
      if let Some(page) = state.cache.get(key, page_index) {
        return Ok(page.clone());
      }
      state.cache.generation(key)
    };
    self.request(key, page_index, generation).await
  }

  /// Drop every page of `key` and fetch page 0 again.
  pub async fn refresh(&self, key: &QueryKey) -> Result<Page, FetchError> {
    let generation = {
      let mut state = lock(&self.inner.state);
      state.cache.invalidate(key);
      state.cache.generation(key)
    };
    debug!(key = %key.fingerprint(), "refreshing");
    self.request(key, 0, generation).await
  }

  /// Fetch state of a key. Results of requests for other keys never show up
  /// here.
  pub fn status(&self, key: &QueryKey) -> QueryState {
    match lock(&self.inner.status).get(key) {
      Some(status) if status.in_flight > 0 => QueryState::Loading,
      Some(status) => status.settled.clone(),
      None => QueryState::Idle,
    }
  }

  /// Number of distinct page requests currently on the network.
  pub fn in_flight(&self) -> usize {
    lock(&self.inner.in_flight).len()
  }

  async fn request(
    &self,
    key: &QueryKey,
    page_index: usize,
    generation: u64,
  ) -> Result<Page, FetchError> {
    let request = PageRequest {
      key: key.clone(),
      page_index,
      generation,
    };

    let shared = {
      let mut in_flight = lock(&self.inner.in_flight);
      match in_flight.get(&request) {
        Some(existing) => {
          debug!(key = %key.fingerprint(), page = page_index, "joining in-flight request");
          existing.clone()
        }
        None => {
          // spawned so the page still lands in the cache if every caller
          // loses interest
          let task = tokio::spawn(Inner::run(Arc::clone(&self.inner), request.clone()));
          let fetch = async move {
            task
              .await
              .unwrap_or_else(|err| Err(FetchError::Network(format!("fetch task failed: {}", err))))
          }
          .boxed()
          .shared();
          in_flight.insert(request, fetch.clone());
          fetch
        }
      }
    };

    shared.await
  }
}

impl Inner {
  async fn run(self: Arc<Self>, request: PageRequest) -> Result<Page, FetchError> {
    self.begin(&request.key);
    let result = self.fetch_with_retry(&request).await;
    lock(&self.in_flight).remove(&request);

    let outcome = result.map(|response| self.store(&request, response));
    self.finish(&request.key, outcome.as_ref().err());
    outcome
  }

  async fn fetch_with_retry(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      let result = match tokio::time::timeout(
        self.timeout,
        self.source.fetch_page(&request.key, request.page_index),
      )
      .await
      {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
      };

      match result {
        Ok(response) => return Ok(response),
        Err(err) if err.transience().is_retryable() && attempt < self.policy.max_attempts => {
          let delay = self.policy.delay_for(attempt);
          warn!(
            key = %request.key.fingerprint(),
            page = request.page_index,
            attempt,
            ?delay,
            error = %err,
            "transient fetch failure, retrying"
          );
          tokio::time::sleep(delay).await;
        }
        Err(err) => {
          warn!(
            key = %request.key.fingerprint(),
            page = request.page_index,
            attempt,
            error = %err,
            "fetch failed"
          );
          return Err(err);
        }
      }
    }
  }

  /// Write a fetched page into the cache and reconcile pending mutations.
  /// Pages from an outdated generation are handed back but not stored.
  fn store(&self, request: &PageRequest, response: PageResponse) -> Page {
    let mut state = lock(&self.state);
    let SyncState { cache, overlay } = &mut *state;

    if cache.generation(&request.key) != request.generation {
      debug!(
        key = %request.key.fingerprint(),
        page = request.page_index,
        "discarding page fetched before invalidation"
      );
      return Page::detached(
        request.key.clone(),
        request.page_index,
        response.items,
        response.has_more,
      );
    }

    let fresh = cache
      .put(
        &request.key,
        request.page_index,
        response.items,
        response.has_more,
      )
      .clone();
    overlay.reconcile(cache, &request.key, fresh.authoritative());
    cache
      .get(&request.key, request.page_index)
      .cloned()
      .unwrap_or(fresh)
  }

  fn begin(&self, key: &QueryKey) {
    lock(&self.status).entry(key.clone()).or_default().in_flight += 1;
    self.notifier.key_changed(key);
  }

  fn finish(&self, key: &QueryKey, error: Option<&FetchError>) {
    {
      let mut status = lock(&self.status);
      let entry = status.entry(key.clone()).or_default();
      entry.in_flight = entry.in_flight.saturating_sub(1);
      entry.settled = match error {
        Some(err) => QueryState::Error(err.clone()),
        None => QueryState::Ready,
      };
    }
    self.notifier.key_changed(key);
  }
}
