use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache::Mutation;
use crate::error::{FetchError, MutationError};
use crate::model::{CollectionId, ItemRecord};
use crate::query::QueryKey;

/// Body of `GET /{collection}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
  pub items: Vec<ItemRecord>,
  #[serde(default)]
  pub has_more: bool,
}

/// Server-paginated collection reads.
pub trait CollectionSource: Send + Sync {
  /// Fetch one page (0-based `page_index`) of the collection named by `key`.
  fn fetch_page<'a>(
    &'a self,
    key: &'a QueryKey,
    page_index: usize,
  ) -> BoxFuture<'a, Result<PageResponse, FetchError>>;
}

/// Per-item writes. Each call returns the authoritative record, including
/// its new `version`; for removals it is the record as deleted.
pub trait MutationSink: Send + Sync {
  fn submit<'a>(
    &'a self,
    collection: &'a CollectionId,
    item_id: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<ItemRecord, MutationError>>;
}
