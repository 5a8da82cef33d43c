//! Fetching pages from the collection endpoint.
//!
//! Concurrent requests for the same page share one network call, transient
//! failures are retried with exponential backoff, and search input is
//! debounced before it turns into a request.

mod coordinator;
mod debounce;
mod retry;

pub use coordinator::FetchCoordinator;
pub use debounce::Debouncer;
pub use retry::RetryPolicy;
