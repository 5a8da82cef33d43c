//! Boundary to the rental backend's REST endpoints.

mod http;
mod source;

pub use http::HttpApi;
pub use source::{CollectionSource, MutationSink, PageResponse};
