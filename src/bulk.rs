//! Apply one mutation to many items with independent outcomes.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::cache::Mutation;
use crate::model::CollectionId;
use crate::store::SyncStore;

/// Per-item result of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
  pub succeeded: BTreeSet<String>,
  /// Item id to rejection reason
  pub failed: BTreeMap<String, String>,
}

impl BulkOutcome {
  pub fn is_complete_success(&self) -> bool {
    self.failed.is_empty()
  }

  /// `"3 removed, 1 failed"`
  pub fn summary(&self, verb: &str) -> String {
    if self.failed.is_empty() {
      format!("{} {}", self.succeeded.len(), verb)
    } else {
      format!(
        "{} {}, {} failed",
        self.succeeded.len(),
        verb,
        self.failed.len()
      )
    }
  }
}

pub struct BulkExecutor {
  store: SyncStore,
}

impl BulkExecutor {
  pub fn new(store: SyncStore) -> Self {
    Self { store }
  }

  /// Submit `mutation` for every id. Optimistic effects are applied to all
  /// items before any request goes out; each failure reverts only its item.
  pub async fn bulk_apply<I, S>(
    &self,
    collection: &CollectionId,
    ids: I,
    mutation: &Mutation,
  ) -> BulkOutcome
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
    let started: Vec<_> = ids
      .iter()
      .map(|id| (id, self.store.begin_mutation(collection, id, mutation)))
      .collect();

    // every submission is spawned before any is awaited
    let submissions: Vec<_> = started
      .iter()
      .map(|(id, mutation_id)| {
        self
          .store
          .spawn_submission(*mutation_id, collection, id, mutation)
      })
      .collect();
    let results = join_all(submissions).await;

    let mut outcome = BulkOutcome::default();
    for ((id, _), result) in started.into_iter().zip(results) {
      match result {
        Ok(_) => {
          outcome.succeeded.insert(id.clone());
        }
        Err(err) => {
          outcome.failed.insert(id.clone(), err.reason());
        }
      }
    }

    info!(
      collection = %collection,
      succeeded = outcome.succeeded.len(),
      failed = outcome.failed.len(),
      "bulk operation finished"
    );
    outcome
  }
}
