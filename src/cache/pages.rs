//! Page cache keyed by query key and page index.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::event::Notifier;
use crate::model::{CollectionId, ItemRecord, Payload};
use crate::query::QueryKey;

/// Removals remembered per collection. Past this the oldest are forgotten.
pub const MAX_TOMBSTONES: usize = 1024;

/// One fetched page of a query.
///
/// `items` is what views see: the authoritative records with any optimistic
/// effects applied. The authoritative copy is kept alongside so a failed
/// mutation can be reverted without a network round trip.
#[derive(Debug, Clone)]
pub struct Page {
  pub key: QueryKey,
  pub page_index: usize,
  pub items: Vec<ItemRecord>,
  pub has_more: bool,
  pub fetched_at: DateTime<Utc>,
  authoritative: Vec<ItemRecord>,
}

impl Page {
  /// A page that is not (or no longer) part of the cache.
  pub(crate) fn detached(
    key: QueryKey,
    page_index: usize,
    items: Vec<ItemRecord>,
    has_more: bool,
  ) -> Self {
    Self {
      key,
      page_index,
      items: items.clone(),
      has_more,
      fetched_at: Utc::now(),
      authoritative: items,
    }
  }

  /// Records exactly as the server last described them.
  pub fn authoritative(&self) -> &[ItemRecord] {
    &self.authoritative
  }

  fn holds(&self, id: &str) -> bool {
    self.authoritative.iter().any(|r| r.id == id)
  }

  /// Put the authoritative copy of `id` back into the visible list, at the
  /// position it holds in the authoritative order.
  fn restore(&mut self, id: &str) -> bool {
    let Some(pos) = self.authoritative.iter().position(|r| r.id == id) else {
      return false;
    };
    let record = self.authoritative[pos].clone();

    if let Some(visible) = self.items.iter_mut().find(|r| r.id == id) {
      *visible = record;
      return true;
    }

    // Visible items are always a subsequence of the authoritative order.
    let preceding: HashSet<&str> = self.authoritative[..pos]
      .iter()
      .map(|r| r.id.as_str())
      .collect();
    let insert_at = self
      .items
      .iter()
      .take_while(|r| preceding.contains(r.id.as_str()))
      .count();
    self.items.insert(insert_at, record);
    true
  }
}

#[derive(Debug, Default)]
struct KeyEntry {
  pages: BTreeMap<usize, Page>,
  /// Pages may be out of date: a creation landed at an unknown position, or
  /// changes were missed while the push channel was down
  stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
  /// Version at which the item was authoritatively removed
  version: u64,
  /// Insertion order, for evicting the oldest
  seq: u64,
}

/// In-memory page store shared by every view of a session.
///
/// Pages of one key never contain the same id twice; the earliest page wins.
/// Removing an item leaves a hole in its page instead of pulling items
/// forward from later pages, so page indexes stay stable for "load more".
/// Cache operations never fail; absence is a normal result.
#[derive(Debug)]
pub struct PageCache {
  entries: HashMap<QueryKey, KeyEntry>,
  generations: HashMap<QueryKey, u64>,
  tombstones: HashMap<CollectionId, HashMap<String, Tombstone>>,
  removals: u64,
  notifier: Notifier,
}

impl PageCache {
  pub fn new(notifier: Notifier) -> Self {
    Self {
      entries: HashMap::new(),
      generations: HashMap::new(),
      tombstones: HashMap::new(),
      removals: 0,
      notifier,
    }
  }

  pub fn get(&self, key: &QueryKey, page_index: usize) -> Option<&Page> {
    self.entries.get(key)?.pages.get(&page_index)
  }

  /// Insert or replace a page.
  ///
  /// Ids already held by an earlier page of the same key are dropped from the
  /// incoming page; ids of the incoming page are dropped from later pages.
  /// Records removed at an equal or newer version, or older than the copy
  /// already cached, are not let back in. A newer record clears the item's
  /// tombstone.
  pub fn put(
    &mut self,
    key: &QueryKey,
    page_index: usize,
    items: Vec<ItemRecord>,
    has_more: bool,
  ) -> &Page {
    let empty = HashMap::new();
    let tombstones = self.tombstones.get(key.collection()).unwrap_or(&empty);
    let entry = self.entries.entry(key.clone()).or_default();

    let mut seen: HashSet<String> = entry
      .pages
      .range(..page_index)
      .flat_map(|(_, page)| page.authoritative.iter().map(|r| r.id.clone()))
      .collect();
    let known: HashMap<String, ItemRecord> = entry
      .pages
      .values()
      .flat_map(|page| page.authoritative.iter())
      .map(|r| (r.id.clone(), r.clone()))
      .collect();

    let incoming = items.len();
    let mut accepted = Vec::with_capacity(incoming);
    let mut revived = Vec::new();
    for item in items {
      if !seen.insert(item.id.clone()) {
        continue;
      }
      if let Some(tombstone) = tombstones.get(&item.id) {
        if item.version <= tombstone.version {
          continue;
        }
        revived.push(item.id.clone());
      }
      match known.get(&item.id) {
        Some(cached) if cached.version > item.version => accepted.push(cached.clone()),
        _ => accepted.push(item),
      }
    }

    let accepted_ids: HashSet<&str> = accepted.iter().map(|r| r.id.as_str()).collect();
    for (_, later) in entry.pages.range_mut(page_index + 1..) {
      later.items.retain(|r| !accepted_ids.contains(r.id.as_str()));
      later.authoritative.retain(|r| !accepted_ids.contains(r.id.as_str()));
    }

    debug!(
      key = %key.fingerprint(),
      page = page_index,
      incoming,
      kept = accepted.len(),
      "page stored"
    );

    if !revived.is_empty() {
      if let Some(tombstones) = self.tombstones.get_mut(key.collection()) {
        for id in &revived {
          tombstones.remove(id);
        }
      }
    }

    if page_index == 0 {
      entry.stale = false;
    }
    entry.pages.insert(
      page_index,
      Page {
        key: key.clone(),
        page_index,
        items: accepted.clone(),
        has_more,
        fetched_at: Utc::now(),
        authoritative: accepted,
      },
    );
    self.notifier.key_changed(key);

    &entry.pages[&page_index]
  }

  /// Drop every page of a key. The next read is a guaranteed miss, and pages
  /// fetched under the previous generation are no longer accepted.
  pub fn invalidate(&mut self, key: &QueryKey) {
    self.entries.remove(key);
    *self.generations.entry(key.clone()).or_insert(0) += 1;
    debug!(key = %key.fingerprint(), "key invalidated");
    self.notifier.key_changed(key);
  }

  /// Invalidation generation of a key; a fetch result is only stored if the
  /// generation is unchanged since the fetch started.
  pub fn generation(&self, key: &QueryKey) -> u64 {
    self.generations.get(key).copied().unwrap_or(0)
  }

  /// Optimistically patch the visible copy of an item. No-op if absent.
  pub fn patch_item(&mut self, key: &QueryKey, id: &str, patch: &Payload) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    let patched = entry
      .pages
      .values_mut()
      .flat_map(|page| page.items.iter_mut())
      .find(|r| r.id == id)
      .map(|record| record.apply_patch(patch))
      .is_some();
    if patched {
      self.notifier.key_changed(key);
    }
    patched
  }

  /// Optimistically hide an item, leaving a hole in its page.
  pub fn remove_item(&mut self, key: &QueryKey, id: &str) -> Option<ItemRecord> {
    let entry = self.entries.get_mut(key)?;
    let removed = entry.pages.values_mut().find_map(|page| {
      let pos = page.items.iter().position(|r| r.id == id)?;
      Some(page.items.remove(pos))
    });
    if removed.is_some() {
      self.notifier.key_changed(key);
    }
    removed
  }

  /// Bring the visible copy of an item back to its authoritative state.
  pub fn restore_item(&mut self, key: &QueryKey, id: &str) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    let restored = entry
      .pages
      .values_mut()
      .find(|page| page.holds(id))
      .map(|page| page.restore(id))
      .unwrap_or(false);
    if restored {
      self.notifier.key_changed(key);
    }
    restored
  }

  /// Replace an item with a newer authoritative record, wherever the key
  /// holds it. Older versions are ignored.
  pub fn upsert_authoritative(&mut self, key: &QueryKey, record: &ItemRecord) -> bool {
    self.update_authoritative(key, &record.id, record.version, |current| {
      *current = record.clone();
    })
  }

  /// Merge an authoritative partial update (e.g. from a push event).
  pub fn patch_authoritative(
    &mut self,
    key: &QueryKey,
    id: &str,
    version: u64,
    patch: &Payload,
  ) -> bool {
    self.update_authoritative(key, id, version, |current| {
      current.apply_patch(patch);
      current.version = version;
    })
  }

  fn update_authoritative<F>(&mut self, key: &QueryKey, id: &str, version: u64, update: F) -> bool
  where
    F: FnOnce(&mut ItemRecord),
  {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    let Some(page) = entry.pages.values_mut().find(|page| page.holds(id)) else {
      return false;
    };
    let Some(current) = page.authoritative.iter_mut().find(|r| r.id == id) else {
      return false;
    };
    if version < current.version {
      debug!(id, version, cached = current.version, "ignoring older authoritative update");
      return false;
    }
    update(current);
    page.restore(id);
    self.notifier.key_changed(key);
    true
  }

  /// Authoritatively remove an item from a key's pages.
  pub fn remove_authoritative(&mut self, key: &QueryKey, id: &str, version: u64) -> bool {
    self.record_removal(key.collection(), id, version);
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    let mut removed = false;
    for page in entry.pages.values_mut() {
      if let Some(pos) = page.authoritative.iter().position(|r| r.id == id) {
        if page.authoritative[pos].version > version {
          return false;
        }
        page.authoritative.remove(pos);
        page.items.retain(|r| r.id != id);
        removed = true;
        break;
      }
    }
    if removed {
      self.notifier.key_changed(key);
    }
    removed
  }

  /// Remember that `id` was removed at `version` so stale pages cannot
  /// resurrect it. At most [`MAX_TOMBSTONES`] are kept per collection.
  pub fn record_removal(&mut self, collection: &CollectionId, id: &str, version: u64) {
    self.removals += 1;
    let seq = self.removals;
    let tombstones = self.tombstones.entry(collection.clone()).or_default();

    if let Some(tombstone) = tombstones.get_mut(id) {
      tombstone.version = tombstone.version.max(version);
      tombstone.seq = seq;
      return;
    }
    if tombstones.len() >= MAX_TOMBSTONES {
      let oldest = tombstones
        .iter()
        .min_by_key(|(_, tombstone)| tombstone.seq)
        .map(|(id, _)| id.clone());
      if let Some(oldest) = oldest {
        tombstones.remove(&oldest);
        debug!(collection = %collection, id = %oldest, "tombstone evicted");
      }
    }
    tombstones.insert(id.to_string(), Tombstone { version, seq });
  }

  /// Visible items of a key in page order.
  pub fn items(&self, key: &QueryKey) -> Vec<ItemRecord> {
    self
      .entries
      .get(key)
      .map(|entry| {
        entry
          .pages
          .values()
          .flat_map(|page| page.items.iter().cloned())
          .collect()
      })
      .unwrap_or_default()
  }

  /// Number of contiguous pages loaded from index 0; also the index of the
  /// next page to request.
  pub fn loaded_pages(&self, key: &QueryKey) -> usize {
    self
      .entries
      .get(key)
      .map(|entry| {
        entry
          .pages
          .keys()
          .enumerate()
          .take_while(|(expected, index)| expected == *index)
          .count()
      })
      .unwrap_or(0)
  }

  /// Whether the server has more pages after the last loaded one. A key with
  /// no pages always has more.
  pub fn has_more(&self, key: &QueryKey) -> bool {
    self
      .entries
      .get(key)
      .and_then(|entry| entry.pages.values().next_back())
      .map(|page| page.has_more)
      .unwrap_or(true)
  }

  pub fn mark_stale(&mut self, key: &QueryKey) {
    if let Some(entry) = self.entries.get_mut(key) {
      if !entry.stale {
        entry.stale = true;
        debug!(key = %key.fingerprint(), "key marked possibly stale");
        self.notifier.key_changed(key);
      }
    }
  }

  /// Flag every cached key as possibly stale and return them.
  pub fn mark_all_stale(&mut self) -> Vec<QueryKey> {
    let keys: Vec<QueryKey> = self.entries.keys().cloned().collect();
    for key in &keys {
      self.mark_stale(key);
    }
    keys
  }

  pub fn is_stale(&self, key: &QueryKey) -> bool {
    self.entries.get(key).map(|e| e.stale).unwrap_or(false)
  }

  /// Every cached key of a collection.
  pub fn keys_for(&self, collection: &CollectionId) -> Vec<QueryKey> {
    self
      .entries
      .keys()
      .filter(|key| key.collection() == collection)
      .cloned()
      .collect()
  }

  /// Cached keys of a collection whose pages hold `id`.
  pub fn keys_holding(&self, collection: &CollectionId, id: &str) -> Vec<QueryKey> {
    self
      .entries
      .iter()
      .filter(|(key, entry)| {
        key.collection() == collection && entry.pages.values().any(|page| page.holds(id))
      })
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Newest authoritative version of an item across every cached key.
  pub fn authoritative_version(&self, collection: &CollectionId, id: &str) -> Option<u64> {
    self
      .entries
      .iter()
      .filter(|(key, _)| key.collection() == collection)
      .flat_map(|(_, entry)| entry.pages.values())
      .flat_map(|page| page.authoritative.iter())
      .filter(|r| r.id == id)
      .map(|r| r.version)
      .max()
  }

  /// Drop everything (logout / teardown).
  pub fn clear(&mut self) {
    let keys: Vec<QueryKey> = self.entries.keys().cloned().collect();
    self.entries.clear();
    self.tombstones.clear();
    for key in keys {
      *self.generations.entry(key.clone()).or_insert(0) += 1;
      self.notifier.key_changed(&key);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::event::StoreEvent;
  use serde_json::{json, Value};

  pub(crate) fn record(id: &str, version: u64, status: &str) -> ItemRecord {
    let payload = match json!({ "status": status }) {
      Value::Object(map) => map,
      _ => Payload::new(),
    };
    ItemRecord::new(id, version, payload)
  }

  pub(crate) fn patch(value: Value) -> Payload {
    match value {
      Value::Object(map) => map,
      _ => Payload::new(),
    }
  }

  fn key() -> QueryKey {
    QueryKey::new(CollectionId::bookings()).with_page_size(2)
  }

  fn ids(records: &[ItemRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
  }

  #[test]
  fn test_get_absent_is_none() {
    let cache = PageCache::new(Notifier::new());
    assert!(cache.get(&key(), 0).is_none());
    assert!(cache.items(&key()).is_empty());
    assert!(cache.has_more(&key()));
  }

  #[test]
  fn test_put_dedups_against_earlier_pages() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x"), record("b", 1, "x")], true);
    cache.put(&key, 1, vec![record("b", 2, "y"), record("c", 1, "x")], false);

    assert_eq!(ids(&cache.items(&key)), vec!["a", "b", "c"]);
    // earlier occurrence wins
    assert_eq!(cache.get(&key, 0).unwrap().items[1].version, 1);
    assert_eq!(cache.loaded_pages(&key), 2);
    assert!(!cache.has_more(&key));
  }

  #[test]
  fn test_put_earlier_page_evicts_later_duplicates() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x")], true);
    cache.put(&key, 1, vec![record("b", 1, "x"), record("c", 1, "x")], false);
    cache.put(&key, 0, vec![record("a", 1, "x"), record("b", 1, "x")], true);

    assert_eq!(ids(&cache.items(&key)), vec!["a", "b", "c"]);
    assert_eq!(ids(&cache.get(&key, 1).unwrap().items), vec!["c"]);
  }

  #[test]
  fn test_put_dedups_within_page() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x"), record("a", 2, "y")], false);
    assert_eq!(ids(&cache.items(&key)), vec!["a"]);
  }

  #[test]
  fn test_invalidate_bumps_generation_and_misses() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x")], true);
    assert_eq!(cache.generation(&key), 0);

    cache.invalidate(&key);
    assert!(cache.get(&key, 0).is_none());
    assert_eq!(cache.generation(&key), 1);
    assert_eq!(cache.loaded_pages(&key), 0);
  }

  #[test]
  fn test_patch_item_absent_is_noop() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    assert!(!cache.patch_item(&key, "zz", &patch(json!({"status": "y"}))));
    cache.put(&key, 0, vec![record("a", 1, "x")], false);
    assert!(!cache.patch_item(&key, "zz", &patch(json!({"status": "y"}))));
    assert!(cache.patch_item(&key, "a", &patch(json!({"status": "y"}))));
    assert_eq!(cache.items(&key)[0].field_str("status"), Some("y"));
    // authoritative copy untouched
    assert_eq!(
      cache.get(&key, 0).unwrap().authoritative()[0].field_str("status"),
      Some("x")
    );
  }

  #[test]
  fn test_remove_leaves_hole_and_restore_keeps_order() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x"), record("b", 1, "x")], true);
    cache.put(&key, 1, vec![record("c", 1, "x"), record("d", 1, "x")], false);

    assert!(cache.remove_item(&key, "a").is_some());
    assert!(cache.remove_item(&key, "b").is_some());
    assert!(cache.get(&key, 0).unwrap().items.is_empty());
    assert_eq!(ids(&cache.get(&key, 1).unwrap().items), vec!["c", "d"]);
    assert_eq!(cache.loaded_pages(&key), 2);

    assert!(cache.restore_item(&key, "b"));
    assert!(cache.restore_item(&key, "a"));
    assert_eq!(ids(&cache.items(&key)), vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn test_restore_reverts_optimistic_patch() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 3, "confirmed")], false);
    cache.patch_item(&key, "a", &patch(json!({"status": "cancelled"})));

    assert!(cache.restore_item(&key, "a"));
    assert_eq!(cache.items(&key)[0].field_str("status"), Some("confirmed"));
  }

  #[test]
  fn test_authoritative_updates_ignore_older_versions() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 5, "confirmed")], false);

    assert!(!cache.upsert_authoritative(&key, &record("a", 4, "pending")));
    assert!(cache.patch_authoritative(&key, "a", 6, &patch(json!({"status": "paid"}))));
    let item = &cache.items(&key)[0];
    assert_eq!(item.version, 6);
    assert_eq!(item.field_str("status"), Some("paid"));
  }

  #[test]
  fn test_tombstone_blocks_resurrection() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x"), record("b", 1, "x")], false);
    assert!(cache.remove_authoritative(&key, "a", 2));

    cache.put(&key, 0, vec![record("a", 1, "x"), record("b", 1, "x")], false);
    assert_eq!(ids(&cache.items(&key)), vec!["b"]);

    cache.put(&key, 0, vec![record("a", 3, "x"), record("b", 1, "x")], false);
    assert_eq!(ids(&cache.items(&key)), vec!["a", "b"]);
  }

  #[test]
  fn test_newer_record_clears_tombstone() {
    let mut cache = PageCache::new(Notifier::new());
    let all = key();
    let searched = key().with_search("porto");
    cache.record_removal(all.collection(), "a", 2);

    cache.put(&all, 0, vec![record("a", 3, "x")], false);
    // a copy fetched between removal and re-creation is no longer blocked
    cache.put(&searched, 0, vec![record("a", 2, "x")], false);
    assert_eq!(ids(&cache.items(&searched)), vec!["a"]);
  }

  #[test]
  fn test_tombstones_are_capped_per_collection() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    for i in 0..=MAX_TOMBSTONES {
      cache.record_removal(key.collection(), &format!("r{}", i), 2);
    }
    // the favorites collection keeps its own budget
    cache.record_removal(&CollectionId::favorites(), "f0", 2);

    let newest = format!("r{}", MAX_TOMBSTONES);
    cache.put(
      &key,
      0,
      vec![record("r0", 1, "x"), record("r1", 1, "x"), record(&newest, 1, "x")],
      false,
    );
    assert_eq!(ids(&cache.items(&key)), vec!["r0"]);
  }

  #[test]
  fn test_put_never_downgrades_cached_version() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x")], false);
    cache.patch_authoritative(&key, "a", 2, &patch(json!({"status": "y"})));

    cache.put(&key, 0, vec![record("a", 1, "x")], false);
    assert_eq!(cache.items(&key)[0].version, 2);
    assert_eq!(cache.items(&key)[0].field_str("status"), Some("y"));
  }

  #[test]
  fn test_stale_flag_cleared_by_first_page() {
    let mut cache = PageCache::new(Notifier::new());
    let key = key();
    cache.put(&key, 0, vec![record("a", 1, "x")], true);
    cache.mark_stale(&key);
    assert!(cache.is_stale(&key));
    cache.put(&key, 0, vec![record("a", 1, "x")], true);
    assert!(!cache.is_stale(&key));
  }

  #[test]
  fn test_mark_all_stale_flags_every_cached_key() {
    let mut cache = PageCache::new(Notifier::new());
    let all = key();
    let searched = key().with_search("porto");
    let never_loaded = key().with_search("lisbon");
    cache.put(&all, 0, vec![record("a", 1, "x")], false);
    cache.put(&searched, 0, vec![record("a", 1, "x")], false);

    let mut flagged = cache.mark_all_stale();
    flagged.sort();
    let mut expected = vec![all.clone(), searched.clone()];
    expected.sort();
    assert_eq!(flagged, expected);
    assert!(cache.is_stale(&all));
    assert!(cache.is_stale(&searched));
    assert!(!cache.is_stale(&never_loaded));
    // pages stay readable until refreshed
    assert_eq!(ids(&cache.items(&all)), vec!["a"]);
  }

  #[test]
  fn test_keys_holding_and_versions() {
    let mut cache = PageCache::new(Notifier::new());
    let all = key();
    let confirmed = key().with_search("porto");
    cache.put(&all, 0, vec![record("a", 1, "x"), record("b", 1, "x")], false);
    cache.put(&confirmed, 0, vec![record("a", 2, "x")], false);

    let mut holding = cache.keys_holding(&CollectionId::bookings(), "a");
    holding.sort();
    assert_eq!(holding.len(), 2);
    assert_eq!(cache.keys_holding(&CollectionId::bookings(), "b"), vec![all]);
    assert_eq!(
      cache.authoritative_version(&CollectionId::bookings(), "a"),
      Some(2)
    );
    assert!(cache.keys_for(&CollectionId::favorites()).is_empty());
  }

  #[tokio::test]
  async fn test_mutations_notify_bound_key() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let mut cache = PageCache::new(notifier);
    let key = key();

    cache.put(&key, 0, vec![record("a", 1, "x")], false);
    cache.remove_item(&key, "a");

    assert_eq!(rx.recv().await.unwrap(), StoreEvent::KeyChanged(key.clone()));
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::KeyChanged(key));
    assert!(rx.try_recv().is_err());
  }
}
