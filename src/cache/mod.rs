//! In-memory caching of paginated collections.
//!
//! This module provides:
//! - A page cache keyed by query key + page index, de-duplicated by item id
//! - A local overlay of optimistic mutations reconciled against fresh pages
//! - Authoritative copies and tombstones so failed mutations and stale pages
//!   never leave the visible state older than the server's

mod overlay;
mod pages;

pub use overlay::{
  LocalOverlay, Mutation, MutationId, MutationKind, MutationStatus, PendingMutation,
};
pub use pages::{Page, PageCache};
