//! Client-side entity cache with request deduplication, tag invalidation,
//! optimistic updates, and a persisted credentials slice.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;

pub use application::backend::{Backend, RemoteError, RequestContext};
pub use application::client::{CacheClient, CacheClientBuilder};
pub use application::endpoints::{
    ApiDefinition, MutationEndpoint, OptimisticUpdate, QueryEndpoint, ResultUpdate,
};
pub use application::error::CacheError;
pub use application::mutation::{MutationHandle, MutationState};
pub use application::query::QueryHandle;
pub use domain::tags::Tag;
