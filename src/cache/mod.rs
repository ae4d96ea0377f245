//! Query cache core.
//!
//! Everything here is synchronous and runs under the client's state lock:
//!
//! - **Keys**: canonical `(endpoint, args)` encoding
//! - **Store**: entries and their fetch lifecycle
//! - **Subscriptions**: subscriber counts and grace-period eviction
//! - **Registry**: tag ↔ key index for invalidation
//! - **Patches**: reversible change sets for optimistic updates
//! - **Dispatch**: actions, middleware chain and the reducer
//!
//! ## Configuration
//!
//! Defaults come from the `[cache]` section of `querysync.toml`:
//!
//! ```toml
//! [cache]
//! default_ttl_seconds = 300
//! keep_unused_for_seconds = 60
//! max_idle_entries = 256
//! serializable_check = true
//! ```

mod config;
mod entry;
mod events;
mod keys;
mod lock;
mod middleware;
mod patch;
mod registry;
mod state;
mod store;
mod subscriptions;

pub(crate) use lock::mutex_lock;

pub use config::CacheConfig;
pub use entry::{CacheEntry, QueryState, QueryStatus, RequestId};
pub use events::{
    Action, DEFAULT_IGNORED_ACTIONS, FLUSH, MutationId, PERSIST, PURGE, PatchId, Payload,
    PersistKind, REHYDRATE,
};
pub use keys::{CacheKey, EncodedQuery, encode, encode_value, to_plain_value};
pub use middleware::{ActionLogger, Dispatcher, Middleware, Next, SerializableGuard};
pub use patch::{Change, ChangeSet, PathSegment, Revert};
pub use registry::TagRegistry;
pub use state::{
    AppliedPatch, CacheState, Effects, FetchRequest, MutationRecord, MutationStatus,
    PersistenceStatus,
};
pub use store::{BeginFetch, Delivery, EntryStore};
pub use subscriptions::{EvictionTicket, Release, SubscriptionManager};
