//! Query keys and per-key fetch state.
//!
//! A `QueryKey` names one parameterised view of a collection (search, filters,
//! sort, page size). Keys are immutable values with structural equality, so
//! two views built from equal keys share every cached page.
//!
//! # Example
//!
//! ```ignore
//! let key = QueryKey::new(CollectionId::bookings())
//!   .with_search("lisbon")
//!   .with_filter("status", FilterValue::text("confirmed"))
//!   .with_sort(SortSpec::descending("checkIn"));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::FetchError;
use crate::model::CollectionId;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// A filter value. No floats: keys must be `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  Flag(bool),
  Number(i64),
  Text(String),
}

impl FilterValue {
  pub fn text(value: impl Into<String>) -> Self {
    FilterValue::Text(value.into())
  }

  /// Parse a CLI/query-string value, preferring the narrowest type.
  pub fn parse(raw: &str) -> Self {
    if let Ok(flag) = raw.parse::<bool>() {
      return FilterValue::Flag(flag);
    }
    if let Ok(number) = raw.parse::<i64>() {
      return FilterValue::Number(number);
    }
    FilterValue::Text(raw.to_string())
  }

  pub fn to_param(&self) -> String {
    match self {
      FilterValue::Flag(b) => b.to_string(),
      FilterValue::Number(n) => n.to_string(),
      FilterValue::Text(s) => s.clone(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SortDirection {
  Ascending,
  #[default]
  Descending,
}

/// Sort order requested from the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SortSpec {
  pub field: String,
  pub direction: SortDirection,
}

impl SortSpec {
  pub fn ascending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Ascending,
    }
  }

  pub fn descending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Descending,
    }
  }

  /// Parse `field` (ascending) or `-field` (descending).
  pub fn parse(raw: &str) -> Self {
    match raw.strip_prefix('-') {
      Some(field) => Self::descending(field),
      None => Self::ascending(raw),
    }
  }

  /// Query parameter form, the inverse of [`SortSpec::parse`].
  pub fn to_param(&self) -> String {
    match self.direction {
      SortDirection::Ascending => self.field.clone(),
      SortDirection::Descending => format!("-{}", self.field),
    }
  }
}

impl Default for SortSpec {
  fn default() -> Self {
    Self::descending("createdAt")
  }
}

/// Identifies "which collection, with which search/filter/sort parameters".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  collection: CollectionId,
  search: String,
  filters: BTreeMap<String, FilterValue>,
  sort: SortSpec,
  page_size: u32,
}

impl QueryKey {
  pub fn new(collection: CollectionId) -> Self {
    Self {
      collection,
      search: String::new(),
      filters: BTreeMap::new(),
      sort: SortSpec::default(),
      page_size: DEFAULT_PAGE_SIZE,
    }
  }

  pub fn with_search(mut self, search: impl Into<String>) -> Self {
    self.search = search.into();
    self
  }

  pub fn with_filter(mut self, field: impl Into<String>, value: FilterValue) -> Self {
    self.filters.insert(field.into(), value);
    self
  }

  pub fn with_filters(mut self, filters: BTreeMap<String, FilterValue>) -> Self {
    self.filters = filters;
    self
  }

  pub fn with_sort(mut self, sort: SortSpec) -> Self {
    self.sort = sort;
    self
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn collection(&self) -> &CollectionId {
    &self.collection
  }

  pub fn search(&self) -> &str {
    &self.search
  }

  pub fn filters(&self) -> &BTreeMap<String, FilterValue> {
    &self.filters
  }

  pub fn sort(&self) -> &SortSpec {
    &self.sort
  }

  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  /// Stable, fixed-length identifier for logs. Distinct keys get distinct
  /// fingerprints.
  pub fn fingerprint(&self) -> String {
    let mut input = format!(
      "{}|{}|{}|{}",
      self.collection,
      self.search,
      self.sort.to_param(),
      self.page_size
    );
    for (field, value) in &self.filters {
      input.push_str(&format!("|{}={}", field, value.to_param()));
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(&hasher.finalize()[..8])
  }

  pub fn description(&self) -> String {
    let mut parts = vec![self.collection.to_string()];
    if !self.search.is_empty() {
      parts.push(format!("search '{}'", self.search));
    }
    for (field, value) in &self.filters {
      parts.push(format!("{}={}", field, value.to_param()));
    }
    parts.push(format!("sort {}", self.sort.to_param()));
    parts.join(", ")
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

/// Normalize a search term for hashing. Trims and lowercases.
/// Fetch state of one query key.
///
/// Tracked per key, never globally, so switching between two cached queries
/// does not flash a loading state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryState {
  /// Nothing requested yet
  #[default]
  Idle,
  /// At least one page request for the key is in flight (including retries)
  Loading,
  /// The last request completed successfully
  Ready,
  /// The last request failed after exhausting retries
  Error(FetchError),
}

impl QueryState {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}
