//! In-memory stand-ins for the REST API and the push channel.

#![allow(dead_code)]

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rentsync::api::{CollectionSource, MutationSink, PageResponse};
use rentsync::realtime::{EventStream, PushChannel};
use rentsync::{
  ChangeEvent, ChannelError, CollectionId, FetchError, ItemRecord, Mutation, MutationError,
  Payload, QueryKey,
};

pub fn payload(value: Value) -> Payload {
  match value {
    Value::Object(map) => map,
    _ => Payload::new(),
  }
}

pub fn booking(id: &str, version: u64, status: &str) -> ItemRecord {
  ItemRecord::new(
    id,
    version,
    payload(json!({ "listingTitle": format!("Room {}", id), "status": status })),
  )
}

pub fn ids(items: &[ItemRecord]) -> Vec<String> {
  items.iter().map(|r| r.id.clone()).collect()
}

#[derive(Default)]
struct ServerState {
  collections: HashMap<CollectionId, Vec<ItemRecord>>,
  failures: HashMap<String, String>,
  rejected_searches: Vec<String>,
  requests: Vec<(QueryKey, usize)>,
}

/// A fake backend serving pages and accepting mutations.
///
/// Mutations are applied when the response is produced, after `write_latency`.
pub struct FakeServer {
  state: Mutex<ServerState>,
  read_latency: Duration,
  write_latency: Duration,
  fetches: AtomicUsize,
}

impl FakeServer {
  pub fn new() -> Arc<Self> {
    Self::with_latency(Duration::from_millis(20), Duration::from_millis(20))
  }

  pub fn with_latency(read_latency: Duration, write_latency: Duration) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(ServerState::default()),
      read_latency,
      write_latency,
      fetches: AtomicUsize::new(0),
    })
  }

  pub fn seed(&self, collection: CollectionId, items: Vec<ItemRecord>) {
    self.state.lock().unwrap().collections.insert(collection, items);
  }

  /// Insert at the front, as a new booking would appear under newest-first.
  pub fn insert_front(&self, collection: &CollectionId, item: ItemRecord) {
    self
      .state
      .lock()
      .unwrap()
      .collections
      .entry(collection.clone())
      .or_default()
      .insert(0, item);
  }

  /// Change an item server-side, as another device would.
  pub fn update(&self, collection: &CollectionId, id: &str, patch: Payload) -> u64 {
    let mut state = self.state.lock().unwrap();
    let item = state
      .collections
      .get_mut(collection)
      .and_then(|items| items.iter_mut().find(|r| r.id == id))
      .unwrap();
    item.apply_patch(&patch);
    item.version += 1;
    item.version
  }

  pub fn delete(&self, collection: &CollectionId, id: &str) {
    let mut state = self.state.lock().unwrap();
    if let Some(items) = state.collections.get_mut(collection) {
      items.retain(|r| r.id != id);
    }
  }

  /// Reject every mutation of `id` with `reason`.
  pub fn fail_mutations_of(&self, id: &str, reason: &str) {
    self
      .state
      .lock()
      .unwrap()
      .failures
      .insert(id.to_string(), reason.to_string());
  }

  /// Answer 403 to every page request searching for `term`.
  pub fn reject_search(&self, term: &str) {
    self
      .state
      .lock()
      .unwrap()
      .rejected_searches
      .push(term.to_lowercase());
  }

  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn requests(&self) -> Vec<(QueryKey, usize)> {
    self.state.lock().unwrap().requests.clone()
  }

  fn page(&self, key: &QueryKey, page_index: usize) -> Result<PageResponse, FetchError> {
    let mut state = self.state.lock().unwrap();
    state.requests.push((key.clone(), page_index));
    let search = key.search().to_lowercase();
    if state.rejected_searches.contains(&search) {
      return Err(FetchError::Rejected {
        status: 403,
        message: "search not allowed".into(),
      });
    }
    let matching: Vec<ItemRecord> = state
      .collections
      .get(key.collection())
      .map(|items| {
        items
          .iter()
          .filter(|r| {
            search.is_empty()
              || r
                .field_str("listingTitle")
                .is_some_and(|t| t.to_lowercase().contains(&search))
          })
          .filter(|r| {
            key
              .filters()
              .iter()
              .all(|(field, value)| r.field_str(field) == Some(value.to_param().as_str()))
          })
          .cloned()
          .collect()
      })
      .unwrap_or_default();

    let size = key.page_size() as usize;
    let start = page_index * size;
    Ok(PageResponse {
      items: matching.iter().skip(start).take(size).cloned().collect(),
      has_more: matching.len() > start + size,
    })
  }

  fn write(
    &self,
    collection: &CollectionId,
    id: &str,
    mutation: &Mutation,
  ) -> Result<ItemRecord, MutationError> {
    let mut state = self.state.lock().unwrap();
    if let Some(reason) = state.failures.get(id) {
      return Err(MutationError::Rejected {
        status: 409,
        reason: reason.clone(),
      });
    }
    let items = state.collections.entry(collection.clone()).or_default();
    let pos = items
      .iter()
      .position(|r| r.id == id)
      .ok_or_else(|| MutationError::Rejected {
        status: 404,
        reason: format!("{} not found", id),
      })?;
    match mutation {
      Mutation::Update(patch) => {
        let item = &mut items[pos];
        item.apply_patch(patch);
        item.version += 1;
        Ok(item.clone())
      }
      Mutation::Remove => {
        let mut item = items.remove(pos);
        item.version += 1;
        Ok(item)
      }
    }
  }
}

impl CollectionSource for FakeServer {
  fn fetch_page<'a>(
    &'a self,
    key: &'a QueryKey,
    page_index: usize,
  ) -> BoxFuture<'a, Result<PageResponse, FetchError>> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    async move {
      tokio::time::sleep(self.read_latency).await;
      self.page(key, page_index)
    }
    .boxed()
  }
}

impl MutationSink for FakeServer {
  fn submit<'a>(
    &'a self,
    collection: &'a CollectionId,
    item_id: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<ItemRecord, MutationError>> {
    async move {
      tokio::time::sleep(self.write_latency).await;
      self.write(collection, item_id, mutation)
    }
    .boxed()
  }
}

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, ChannelError>>;

/// Push channel whose connections are opened by the test.
///
/// `connect()` waits until the test calls [`FakePushChannel::open_session`];
/// dropping the returned sender ends that connection.
pub struct FakePushChannel {
  sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventStream>>,
  opener: mpsc::UnboundedSender<EventStream>,
  connects: AtomicUsize,
}

impl FakePushChannel {
  pub fn new() -> Arc<Self> {
    let (opener, sessions) = mpsc::unbounded();
    Arc::new(Self {
      sessions: tokio::sync::Mutex::new(sessions),
      opener,
      connects: AtomicUsize::new(0),
    })
  }

  pub fn open_session(&self) -> EventSender {
    let (tx, rx) = mpsc::unbounded();
    self.opener.unbounded_send(rx.boxed()).unwrap();
    tx
  }

  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }
}

impl PushChannel for FakePushChannel {
  fn connect(&self) -> BoxFuture<'_, Result<EventStream, ChannelError>> {
    async move {
      let stream = self.sessions.lock().await.next().await;
      self.connects.fetch_add(1, Ordering::SeqCst);
      stream.ok_or_else(|| ChannelError::Connect("channel closed".into()))
    }
    .boxed()
  }
}

/// Poll `condition` every 10ms of (usually paused) time, up to 5s.
pub async fn eventually<F>(mut condition: F) -> bool
where
  F: FnMut() -> bool,
{
  for _ in 0..500 {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition()
}
