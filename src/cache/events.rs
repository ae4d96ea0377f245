//! Cache actions.
//!
//! Every state transition is described by an [`Action`] and applied by the
//! dispatcher. Actions that carry caller-provided data wrap it in a
//! [`Payload`] so the serializability guard can inspect it.

use std::any::type_name;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde::ser::Serializer;
use serde_json::Value;
use uuid::Uuid;

use crate::application::error::CacheError;
use crate::domain::auth::AuthState;
use crate::domain::tags::Tag;
use crate::infra::persist::RehydrateOutcome;

use super::entry::RequestId;
use super::keys::CacheKey;
use super::patch::ChangeSet;

/// Identifier of one in-flight mutation.
pub type MutationId = Uuid;
/// Identifier of one optimistic patch within a mutation.
pub type PatchId = Uuid;

pub const PERSIST: &str = "persist/PERSIST";
pub const REHYDRATE: &str = "persist/REHYDRATE";
pub const PURGE: &str = "persist/PURGE";
pub const FLUSH: &str = "persist/FLUSH";

/// Action types allowed to carry opaque payloads by default.
pub const DEFAULT_IGNORED_ACTIONS: [&str; 4] = [PERSIST, REHYDRATE, PURGE, FLUSH];

/// Caller-provided data attached to an action.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// A value with no plain-data representation (handles, callbacks, maps
    /// keyed by non-strings).
    Opaque { type_name: &'static str },
}

impl Payload {
    /// Capture `value` as JSON, or as opaque when it does not serialize.
    pub fn of<T>(value: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(json) => Self::Json(json),
            Err(_) => Self::opaque::<T>(),
        }
    }

    pub fn opaque<T: ?Sized>() -> Self {
        Self::Opaque {
            type_name: type_name::<T>(),
        }
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Json(_))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Json(value) => value.serialize(serializer),
            Self::Opaque { type_name } => serializer.serialize_str(&format!("<opaque {type_name}>")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistKind {
    Persist,
    Purge,
    Flush,
}

impl PersistKind {
    pub fn action_type(self) -> &'static str {
        match self {
            Self::Persist => PERSIST,
            Self::Purge => PURGE,
            Self::Flush => FLUSH,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    /// A consumer started observing `key`.
    Subscribe {
        key: CacheKey,
        endpoint: String,
        args: Value,
        ttl: Option<Duration>,
    },
    /// A consumer stopped observing `key`.
    Unsubscribe { key: CacheKey, grace: Duration },
    /// Explicit refetch request from a subscriber.
    Refetch { key: CacheKey },
    QueryFulfilled {
        key: CacheKey,
        request_id: RequestId,
        data: Value,
        tags: BTreeSet<Tag>,
    },
    QueryRejected {
        key: CacheKey,
        request_id: RequestId,
        error: CacheError,
    },
    /// A grace-period timer expired.
    EvictionTimerFired { key: CacheKey, epoch: u64 },
    InvalidateTags { tags: Vec<Tag> },
    MutationStarted {
        mutation_id: MutationId,
        endpoint: String,
    },
    /// Optimistic write recorded against a mutation so it can be undone.
    PatchApplied {
        mutation_id: MutationId,
        patch_id: PatchId,
        key: CacheKey,
        changes: ChangeSet,
    },
    /// Write derived from a server result; never undone.
    QueryDataPatched { key: CacheKey, changes: ChangeSet },
    MutationCommitted { mutation_id: MutationId },
    MutationRolledBack { mutation_id: MutationId },
    ResetApiState,
    SetCredentials { auth: AuthState },
    ClearCredentials,
    Persist { kind: PersistKind, storage: Payload },
    Rehydrate {
        auth: AuthState,
        outcome: RehydrateOutcome,
        storage: Payload,
    },
    /// Application-defined action. The reducer ignores it; middleware may not.
    Custom { action_type: String, payload: Payload },
}

impl Action {
    pub fn action_type(&self) -> &str {
        match self {
            Self::Subscribe { .. } => "query/subscribe",
            Self::Unsubscribe { .. } => "query/unsubscribe",
            Self::Refetch { .. } => "query/refetch",
            Self::QueryFulfilled { .. } => "query/fulfilled",
            Self::QueryRejected { .. } => "query/rejected",
            Self::EvictionTimerFired { .. } => "query/evict",
            Self::InvalidateTags { .. } => "tags/invalidate",
            Self::MutationStarted { .. } => "mutation/pending",
            Self::PatchApplied { .. } => "mutation/patch",
            Self::QueryDataPatched { .. } => "query/patch",
            Self::MutationCommitted { .. } => "mutation/commit",
            Self::MutationRolledBack { .. } => "mutation/rollback",
            Self::ResetApiState => "api/reset",
            Self::SetCredentials { .. } => "auth/setCredentials",
            Self::ClearCredentials => "auth/logout",
            Self::Persist { kind, .. } => kind.action_type(),
            Self::Rehydrate { .. } => REHYDRATE,
            Self::Custom { action_type, .. } => action_type,
        }
    }

    /// Caller-provided payload, if this action carries one.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Persist { storage, .. } | Self::Rehydrate { storage, .. } => Some(storage),
            Self::Custom { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Cache key the action targets, for log context.
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Self::Subscribe { key, .. }
            | Self::Unsubscribe { key, .. }
            | Self::Refetch { key }
            | Self::QueryFulfilled { key, .. }
            | Self::QueryRejected { key, .. }
            | Self::EvictionTimerFired { key, .. }
            | Self::PatchApplied { key, .. }
            | Self::QueryDataPatched { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{} {key}", self.action_type()),
            None => f.write_str(self.action_type()),
        }
    }
}
