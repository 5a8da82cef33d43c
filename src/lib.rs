//! Client-side synchronization of paginated rental collections.
//!
//! Bookings and favorites are served by a paginated REST API and change
//! under the client's feet (other tabs, other devices, server-side jobs).
//! This crate keeps an in-memory, de-duplicated view of them that:
//! - caches pages per query and shares in-flight requests
//! - applies cancel/remove/update optimistically and reconciles by version
//! - follows a push channel and catches up after reconnecting
//!
//! [`SyncStore`] is the session-wide store; [`CollectionView`] is what a
//! presentation layer binds to.

pub mod api;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod model;
pub mod query;
pub mod realtime;
pub mod store;
pub mod view;

pub use bulk::{BulkExecutor, BulkOutcome};
pub use cache::{Mutation, MutationKind, MutationStatus};
pub use error::{ChannelError, FetchError, MutationError, Transience};
pub use event::StoreEvent;
pub use model::{CollectionId, ItemRecord, Payload};
pub use query::{FilterValue, QueryKey, QueryState, SortDirection, SortSpec};
pub use realtime::{ChangeEvent, ChangeKind, ConnectionState, ConnectionStatus, RealtimeBridge};
pub use store::{SyncOptions, SyncStore};
pub use view::{CollectionView, ViewSubscription};
