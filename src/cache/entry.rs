//! Cache entry model and the snapshot published to subscribers.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::error::CacheError;
use crate::domain::tags::Tag;

use super::keys::CacheKey;

/// Identifier of one fetch cycle.
pub type RequestId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// One cached query result.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub endpoint: String,
    pub args: Value,
    pub status: QueryStatus,
    /// Last successfully fetched value. Kept while refetching and after a failed refetch.
    pub data: Option<Value>,
    /// Present only while `status == Rejected`.
    pub error: Option<CacheError>,
    #[serde(skip)]
    pub fetched_at: Option<Instant>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fulfilled_at: Option<OffsetDateTime>,
    pub provides_tags: BTreeSet<Tag>,
    pub subscriber_count: usize,
    /// Set by tag invalidation; cleared by the next successful resolution.
    pub stale: bool,
    pub request_id: Option<RequestId>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, endpoint: impl Into<String>, args: Value) -> Self {
        Self {
            key,
            endpoint: endpoint.into(),
            args,
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            fetched_at: None,
            fulfilled_at: None,
            provides_tags: BTreeSet::new(),
            subscriber_count: 0,
            stale: false,
            request_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Stale when explicitly marked, never fetched, or older than `ttl`.
    pub fn is_stale(&self, ttl: Option<Duration>, now: Instant) -> bool {
        if self.stale {
            return true;
        }
        match (self.fetched_at, ttl) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(fetched_at), Some(ttl)) => now.saturating_duration_since(fetched_at) > ttl,
        }
    }

    /// Whether a subscriber arriving now should trigger a fetch.
    ///
    /// Failed entries always retry for a new subscriber.
    pub fn needs_fetch(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match self.status {
            QueryStatus::Pending => false,
            QueryStatus::Uninitialized | QueryStatus::Rejected => true,
            QueryStatus::Fulfilled => self.is_stale(ttl, now),
        }
    }

    pub fn snapshot(&self) -> QueryState {
        let is_fetching = self.is_pending();
        QueryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: is_fetching && self.data.is_none(),
            is_fetching,
            is_stale: self.stale,
            fulfilled_at: self.fulfilled_at,
        }
    }
}

/// What a subscriber sees of an entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<CacheError>,
    /// Fetching with nothing to show yet.
    pub is_loading: bool,
    /// Any fetch in flight, including background refetches.
    pub is_fetching: bool,
    pub is_stale: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fulfilled_at: Option<OffsetDateTime>,
}

impl QueryState {
    /// State of a key the cache no longer holds.
    pub fn uninitialized() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            is_loading: false,
            is_fetching: false,
            is_stale: false,
            fulfilled_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Fulfilled
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Rejected
    }

    /// Settled means a fetch cycle has completed and none is in flight.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }
}
