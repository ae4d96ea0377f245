//! Entry store.
//!
//! Owns every cache entry and the lifecycle transitions of a fetch cycle.
//! Only the state reducer holds a mutable reference to it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::debug;

use crate::application::error::CacheError;
use crate::domain::tags::Tag;

use super::entry::{CacheEntry, QueryStatus, RequestId};
use super::keys::CacheKey;
use super::patch::ChangeSet;

const METRIC_EVICT_TOTAL: &str = "querysync_evict_total";

/// Result of asking an entry to start fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginFetch {
    /// The entry moved to `Pending` under the given request id.
    Started(RequestId),
    /// A fetch was already in flight; the caller should wait for it.
    Joined(RequestId),
}

/// Outcome of delivering a fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    /// The entry was evicted or a newer fetch superseded this one.
    Discarded,
}

#[derive(Debug, Default, Serialize)]
pub struct EntryStore {
    entries: BTreeMap<CacheKey, CacheEntry>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Return the entry for `key`, creating it in `Uninitialized` state.
    pub fn get_or_create(&mut self, key: &CacheKey, endpoint: &str, args: &Value) -> &mut CacheEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), endpoint, args.clone()))
    }

    /// Move an entry to `Pending`, or report the fetch already in flight.
    ///
    /// Returns `None` when the entry does not exist.
    pub fn begin_fetch(&mut self, key: &CacheKey, request_id: RequestId) -> Option<BeginFetch> {
        let entry = self.entries.get_mut(key)?;
        if let (QueryStatus::Pending, Some(in_flight)) = (entry.status, entry.request_id) {
            return Some(BeginFetch::Joined(in_flight));
        }
        entry.status = QueryStatus::Pending;
        entry.request_id = Some(request_id);
        Some(BeginFetch::Started(request_id))
    }

    /// Complete a fetch cycle successfully.
    pub fn resolve(
        &mut self,
        key: &CacheKey,
        request_id: RequestId,
        data: Value,
        tags: BTreeSet<Tag>,
        now: Instant,
    ) -> Delivery {
        let Some(entry) = self.in_flight_mut(key, request_id) else {
            return Delivery::Discarded;
        };
        entry.status = QueryStatus::Fulfilled;
        entry.data = Some(data);
        entry.error = None;
        entry.fetched_at = Some(now);
        entry.fulfilled_at = Some(OffsetDateTime::now_utc());
        entry.provides_tags = tags;
        entry.stale = false;
        entry.request_id = None;
        Delivery::Applied
    }

    /// Complete a fetch cycle with an error. The last good `data` is kept.
    pub fn reject(&mut self, key: &CacheKey, request_id: RequestId, error: CacheError) -> Delivery {
        let Some(entry) = self.in_flight_mut(key, request_id) else {
            return Delivery::Discarded;
        };
        entry.status = QueryStatus::Rejected;
        entry.error = Some(error);
        entry.request_id = None;
        Delivery::Applied
    }

    fn in_flight_mut(&mut self, key: &CacheKey, request_id: RequestId) -> Option<&mut CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        if entry.status != QueryStatus::Pending || entry.request_id != Some(request_id) {
            debug!(%key, %request_id, "dropping result of superseded fetch");
            return None;
        }
        Some(entry)
    }

    /// Mark an entry stale. Returns false when the entry does not exist.
    pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Stale when the entry is missing, explicitly marked, or older than `ttl`.
    pub fn is_stale(&self, key: &CacheKey, ttl: Option<Duration>, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_none_or(|entry| entry.is_stale(ttl, now))
    }

    /// Apply `changes` to an entry's data in place.
    ///
    /// Returns `None` when the entry is gone or holds no data, otherwise the
    /// number of changes whose location could not be reached.
    pub fn patch_data(&mut self, key: &CacheKey, changes: &ChangeSet) -> Option<usize> {
        let data = self.entries.get_mut(key)?.data.as_mut()?;
        Some(changes.apply(data))
    }

    /// Remove an entry that no consumer observes.
    ///
    /// # Errors
    /// Returns [`CacheError::EntryInUse`] while the entry still has subscribers.
    pub fn evict(&mut self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.entries.get(key)
            && entry.subscriber_count > 0
        {
            return Err(CacheError::EntryInUse {
                key: key.to_string(),
                subscribers: entry.subscriber_count,
            });
        }
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            counter!(METRIC_EVICT_TOTAL, "endpoint" => entry.endpoint.clone()).increment(1);
        }
        Ok(removed)
    }

    /// Reset every entry: unobserved entries are dropped, observed ones lose
    /// their data and return to `Uninitialized`. Returns the observed keys.
    pub fn reset(&mut self) -> Vec<CacheKey> {
        self.entries.retain(|_, entry| entry.subscriber_count > 0);
        self.entries
            .values_mut()
            .map(|entry| {
                let subscribers = entry.subscriber_count;
                *entry = CacheEntry::new(entry.key.clone(), entry.endpoint.clone(), entry.args.clone());
                entry.subscriber_count = subscribers;
                entry.key.clone()
            })
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
