//! Optimistic mutations awaiting server confirmation.
//!
//! Each mutation moves through `InFlight -> Committed | Failed`. While in
//! flight its effect is applied to the visible copy of every cached page that
//! holds the item; authoritative data that carries a version at or above the
//! mutation's base version commits it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

use super::pages::PageCache;
use crate::model::{CollectionId, ItemRecord, Payload};
use crate::query::QueryKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "m{}", self.0)
  }
}

/// A change requested by the user for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Partial payload update (shallow merge)
  Update(Payload),
  Remove,
}

impl Mutation {
  pub fn kind(&self) -> MutationKind {
    match self {
      Mutation::Update(_) => MutationKind::Update,
      Mutation::Remove => MutationKind::Remove,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  Update,
  Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  InFlight,
  Committed,
  Failed,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
  pub id: MutationId,
  pub collection: CollectionId,
  pub item_id: String,
  pub kind: MutationKind,
  pub patch: Option<Payload>,
  /// Lowest server version that can reflect this mutation
  pub base_version: u64,
  pub submitted_at: DateTime<Utc>,
  pub status: MutationStatus,
  pub failure: Option<String>,
}

impl PendingMutation {
  /// Describe a mutation against an item last seen at `known_version`.
  /// The id is assigned when the overlay accepts it.
  pub fn new(
    collection: CollectionId,
    item_id: impl Into<String>,
    mutation: &Mutation,
    known_version: Option<u64>,
  ) -> Self {
    let patch = match mutation {
      Mutation::Update(patch) => Some(patch.clone()),
      Mutation::Remove => None,
    };
    Self {
      id: MutationId(0),
      collection,
      item_id: item_id.into(),
      kind: mutation.kind(),
      patch,
      base_version: known_version.map(|v| v + 1).unwrap_or(0),
      submitted_at: Utc::now(),
      status: MutationStatus::InFlight,
      failure: None,
    }
  }

  /// Whether authoritative data at `version` already reflects (or
  /// supersedes) this mutation.
  pub fn is_confirmed_by(&self, version: u64) -> bool {
    version >= self.base_version
  }

  fn apply_effect(&self, cache: &mut PageCache, key: &QueryKey) {
    match self.kind {
      MutationKind::Update => {
        if let Some(patch) = &self.patch {
          cache.patch_item(key, &self.item_id, patch);
        }
      }
      MutationKind::Remove => {
        cache.remove_item(key, &self.item_id);
      }
    }
  }
}

/// The set of in-flight optimistic mutations.
///
/// Reconciliation is idempotent and order independent: pushes, refetches and
/// HTTP responses may arrive in any order and each simply commits whatever
/// its version proves.
#[derive(Debug, Default)]
pub struct LocalOverlay {
  pending: BTreeMap<MutationId, PendingMutation>,
  next_id: u64,
}

impl LocalOverlay {
  pub fn new() -> Self {
    Self::default()
  }

  /// Accept a mutation and make its effect visible immediately.
  pub fn apply(&mut self, cache: &mut PageCache, mut mutation: PendingMutation) -> MutationId {
    self.next_id += 1;
    let id = MutationId(self.next_id);
    mutation.id = id;
    mutation.status = MutationStatus::InFlight;

    for key in cache.keys_holding(&mutation.collection, &mutation.item_id) {
      mutation.apply_effect(cache, &key);
    }
    debug!(
      mutation = %id,
      item = %mutation.item_id,
      kind = ?mutation.kind,
      base_version = mutation.base_version,
      "optimistic mutation applied"
    );
    self.pending.insert(id, mutation);
    id
  }

  /// Commit every mutation confirmed by freshly fetched records of `key`,
  /// then re-apply the ones still in flight on top of the fresh data.
  pub fn reconcile(
    &mut self,
    cache: &mut PageCache,
    key: &QueryKey,
    fresh: &[ItemRecord],
  ) -> Vec<MutationId> {
    let versions: HashMap<&str, u64> = fresh.iter().map(|r| (r.id.as_str(), r.version)).collect();
    let confirmed: Vec<MutationId> = self
      .pending
      .values()
      .filter(|m| &m.collection == key.collection())
      .filter(|m| {
        versions
          .get(m.item_id.as_str())
          .is_some_and(|version| m.is_confirmed_by(*version))
      })
      .map(|m| m.id)
      .collect();

    for id in &confirmed {
      self.commit(*id);
    }
    self.reapply(cache, key);
    confirmed
  }

  /// Commit from an authoritative single-item update (e.g. a push event).
  pub fn reconcile_item(
    &mut self,
    cache: &mut PageCache,
    collection: &CollectionId,
    item_id: &str,
    version: u64,
  ) -> Vec<MutationId> {
    let confirmed: Vec<MutationId> = self
      .pending_for(collection, item_id)
      .filter(|m| m.is_confirmed_by(version))
      .map(|m| m.id)
      .collect();
    for id in &confirmed {
      self.commit(*id);
    }
    self.reapply_item(cache, collection, item_id);
    confirmed
  }

  /// Apply the server's response to a submitted mutation and commit it.
  ///
  /// The record is written to the cache even if the mutation was already
  /// committed by a refetch; the response is authoritative either way.
  /// Returns whether the mutation was still pending.
  pub fn confirm(
    &mut self,
    cache: &mut PageCache,
    id: MutationId,
    collection: &CollectionId,
    kind: MutationKind,
    record: &ItemRecord,
  ) -> bool {
    match kind {
      MutationKind::Update => {
        for key in cache.keys_holding(collection, &record.id) {
          cache.upsert_authoritative(&key, record);
        }
      }
      MutationKind::Remove => {
        cache.record_removal(collection, &record.id, record.version);
        for key in cache.keys_holding(collection, &record.id) {
          cache.remove_authoritative(&key, &record.id, record.version);
        }
      }
    }
    let was_pending = self.commit(id).is_some();
    self.reapply_item(cache, collection, &record.id);
    was_pending
  }

  /// Mark an in-flight mutation failed and revert the item to its last
  /// authoritative state. Other mutations on the same item stay applied.
  /// Returns `None` if the mutation is no longer in flight.
  pub fn fail(
    &mut self,
    cache: &mut PageCache,
    id: MutationId,
    reason: &str,
  ) -> Option<PendingMutation> {
    let mut mutation = self.pending.remove(&id)?;
    mutation.status = MutationStatus::Failed;
    mutation.failure = Some(reason.to_string());

    for key in cache.keys_holding(&mutation.collection, &mutation.item_id) {
      cache.restore_item(&key, &mutation.item_id);
    }
    self.reapply_item(cache, &mutation.collection, &mutation.item_id);

    warn!(mutation = %id, item = %mutation.item_id, reason, "mutation failed, reverted");
    Some(mutation)
  }

  /// Drop every mutation on an item the server reports as removed.
  pub fn resolve_removed(&mut self, collection: &CollectionId, item_id: &str) -> Vec<MutationId> {
    let resolved: Vec<MutationId> = self
      .pending_for(collection, item_id)
      .map(|m| m.id)
      .collect();
    for id in &resolved {
      self.commit(*id);
    }
    resolved
  }

  /// Re-apply in-flight effects to one key, in submission order.
  pub fn reapply(&self, cache: &mut PageCache, key: &QueryKey) {
    for mutation in self
      .pending
      .values()
      .filter(|m| &m.collection == key.collection())
    {
      mutation.apply_effect(cache, key);
    }
  }

  fn reapply_item(&self, cache: &mut PageCache, collection: &CollectionId, item_id: &str) {
    let keys = cache.keys_holding(collection, item_id);
    for mutation in self.pending_for(collection, item_id) {
      for key in &keys {
        mutation.apply_effect(cache, key);
      }
    }
  }

  fn commit(&mut self, id: MutationId) -> Option<PendingMutation> {
    let mut mutation = self.pending.remove(&id)?;
    mutation.status = MutationStatus::Committed;
    debug!(mutation = %id, item = %mutation.item_id, "mutation committed");
    Some(mutation)
  }

  pub fn pending_for<'a>(
    &'a self,
    collection: &'a CollectionId,
    item_id: &'a str,
  ) -> impl Iterator<Item = &'a PendingMutation> + 'a {
    self
      .pending
      .values()
      .filter(move |m| &m.collection == collection && m.item_id == item_id)
  }

  pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
    self.pending.get(&id)
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn clear(&mut self) {
    self.pending.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::pages::tests::{patch, record};
  use crate::event::Notifier;
  use serde_json::json;

  fn setup() -> (PageCache, LocalOverlay, QueryKey) {
    let mut cache = PageCache::new(Notifier::new());
    let key = QueryKey::new(CollectionId::bookings());
    cache.put(
      &key,
      0,
      vec![record("a", 1, "confirmed"), record("b", 1, "confirmed")],
      false,
    );
    (cache, LocalOverlay::new(), key)
  }

  fn cancel(item: &str, known: u64) -> PendingMutation {
    PendingMutation::new(
      CollectionId::bookings(),
      item,
      &Mutation::Update(patch(json!({"status": "cancelled"}))),
      Some(known),
    )
  }

  fn remove(item: &str, known: u64) -> PendingMutation {
    PendingMutation::new(CollectionId::bookings(), item, &Mutation::Remove, Some(known))
  }

  fn visible_ids(cache: &PageCache, key: &QueryKey) -> Vec<String> {
    cache.items(key).into_iter().map(|r| r.id).collect()
  }

  #[test]
  fn test_apply_is_visible_immediately() {
    let (mut cache, mut overlay, key) = setup();
    overlay.apply(&mut cache, remove("a", 1));
    overlay.apply(&mut cache, cancel("b", 1));

    assert_eq!(visible_ids(&cache, &key), vec!["b"]);
    assert_eq!(cache.items(&key)[0].field_str("status"), Some("cancelled"));
    assert_eq!(overlay.len(), 2);
  }

  #[test]
  fn test_stale_fetch_does_not_commit_and_effect_survives() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, remove("a", 1));

    // fetch that started before the mutation: still version 1
    let fresh = vec![record("a", 1, "confirmed"), record("b", 1, "confirmed")];
    cache.put(&key, 0, fresh.clone(), false);
    let committed = overlay.reconcile(&mut cache, &key, &fresh);

    assert!(committed.is_empty());
    assert!(overlay.get(id).is_some());
    assert_eq!(visible_ids(&cache, &key), vec!["b"]);
  }

  #[test]
  fn test_newer_fetch_commits_and_shows_authoritative_payload() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, cancel("a", 1));

    let fresh = vec![record("a", 2, "cancelled_by_host"), record("b", 1, "confirmed")];
    cache.put(&key, 0, fresh.clone(), false);
    let committed = overlay.reconcile(&mut cache, &key, &fresh);

    assert_eq!(committed, vec![id]);
    assert!(overlay.is_empty());
    assert_eq!(
      cache.items(&key)[0].field_str("status"),
      Some("cancelled_by_host")
    );
  }

  #[test]
  fn test_reconcile_is_idempotent() {
    let (mut cache, mut overlay, key) = setup();
    overlay.apply(&mut cache, cancel("a", 1));
    let fresh = vec![record("a", 2, "cancelled")];
    cache.put(&key, 0, fresh.clone(), false);

    assert_eq!(overlay.reconcile(&mut cache, &key, &fresh).len(), 1);
    assert!(overlay.reconcile(&mut cache, &key, &fresh).is_empty());
  }

  #[test]
  fn test_fail_reverts_to_authoritative_state() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, cancel("a", 1));

    let failed = overlay.fail(&mut cache, id, "booking already started").unwrap();

    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.failure.as_deref(), Some("booking already started"));
    assert_eq!(cache.items(&key)[0].field_str("status"), Some("confirmed"));
    assert!(overlay.is_empty());
    // already resolved
    assert!(overlay.fail(&mut cache, id, "again").is_none());
  }

  #[test]
  fn test_fail_restores_removed_item_in_place() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, remove("a", 1));
    assert_eq!(visible_ids(&cache, &key), vec!["b"]);

    overlay.fail(&mut cache, id, "forbidden");
    assert_eq!(visible_ids(&cache, &key), vec!["a", "b"]);
  }

  #[test]
  fn test_fail_keeps_other_mutations_on_same_item() {
    let (mut cache, mut overlay, key) = setup();
    let first = overlay.apply(
      &mut cache,
      PendingMutation::new(
        CollectionId::bookings(),
        "a",
        &Mutation::Update(patch(json!({"note": "late arrival"}))),
        Some(1),
      ),
    );
    let second = overlay.apply(&mut cache, cancel("a", 1));

    overlay.fail(&mut cache, second, "conflict");

    let item = &cache.items(&key)[0];
    assert_eq!(item.field_str("status"), Some("confirmed"));
    assert_eq!(item.field_str("note"), Some("late arrival"));
    assert!(overlay.get(first).is_some());
  }

  #[test]
  fn test_confirm_remove_writes_tombstone() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, remove("a", 1));

    assert!(overlay.confirm(
      &mut cache,
      id,
      &CollectionId::bookings(),
      MutationKind::Remove,
      &record("a", 2, "deleted"),
    ));
    assert!(overlay.is_empty());

    // a page fetched before the delete cannot bring it back
    cache.put(&key, 0, vec![record("a", 1, "confirmed"), record("b", 1, "confirmed")], false);
    assert_eq!(visible_ids(&cache, &key), vec!["b"]);
  }

  #[test]
  fn test_confirm_after_reconcile_still_applies_record() {
    let (mut cache, mut overlay, key) = setup();
    let id = overlay.apply(&mut cache, cancel("a", 1));
    let fresh = vec![record("a", 2, "cancelled"), record("b", 1, "confirmed")];
    cache.put(&key, 0, fresh.clone(), false);
    overlay.reconcile(&mut cache, &key, &fresh);

    let was_pending = overlay.confirm(
      &mut cache,
      id,
      &CollectionId::bookings(),
      MutationKind::Update,
      &record("a", 3, "cancelled"),
    );
    assert!(!was_pending);
    assert_eq!(cache.items(&key)[0].version, 3);
  }

  #[test]
  fn test_reconcile_item_from_push() {
    let (mut cache, mut overlay, _key) = setup();
    let id = overlay.apply(&mut cache, cancel("a", 4));
    assert!(overlay
      .reconcile_item(&mut cache, &CollectionId::bookings(), "a", 4)
      .is_empty());
    assert_eq!(
      overlay.reconcile_item(&mut cache, &CollectionId::bookings(), "a", 5),
      vec![id]
    );
  }

  #[test]
  fn test_resolve_removed_clears_item() {
    let (mut cache, mut overlay, _key) = setup();
    overlay.apply(&mut cache, cancel("a", 1));
    overlay.apply(&mut cache, remove("a", 1));
    overlay.apply(&mut cache, cancel("b", 1));

    assert_eq!(
      overlay
        .resolve_removed(&CollectionId::bookings(), "a")
        .len(),
      2
    );
    assert_eq!(overlay.len(), 1);
  }
}
