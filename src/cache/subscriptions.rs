//! Subscription counting and grace-period eviction.
//!
//! When the last subscriber leaves, the entry becomes idle and an eviction
//! ticket is issued. The ticket carries an epoch; subscribing again before the
//! timer fires retires the epoch so the stale ticket is ignored. Idle entries
//! are kept in an LRU so a burst of abandoned queries cannot grow the cache
//! without bound while their grace periods run.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tracing::warn;

use super::entry::CacheEntry;
use super::keys::CacheKey;

/// Request to evict `key` after `delay` unless it is subscribed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionTicket {
    pub key: CacheKey,
    pub epoch: u64,
    pub delay: Duration,
}

/// What happened when a subscriber left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Other subscribers remain.
    Observed { remaining: usize },
    /// The entry is idle. `overflow` names an older idle entry pushed out of the LRU.
    Idle {
        ticket: EvictionTicket,
        overflow: Option<CacheKey>,
    },
}

pub struct SubscriptionManager {
    idle: LruCache<CacheKey, u64>,
    next_epoch: u64,
}

impl SubscriptionManager {
    pub fn new(max_idle_entries: NonZeroUsize) -> Self {
        Self {
            idle: LruCache::new(max_idle_entries),
            next_epoch: 0,
        }
    }

    /// Register a subscriber, cancelling any pending eviction.
    pub fn subscribe(&mut self, entry: &mut CacheEntry) -> usize {
        entry.subscriber_count += 1;
        self.idle.pop(&entry.key);
        entry.subscriber_count
    }

    /// Drop a subscriber; when none remain, issue an eviction ticket.
    pub fn unsubscribe(&mut self, entry: &mut CacheEntry, grace: Duration) -> Release {
        if entry.subscriber_count == 0 {
            warn!(key = %entry.key, "unsubscribe on entry without subscribers");
        }
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        if entry.subscriber_count > 0 {
            return Release::Observed {
                remaining: entry.subscriber_count,
            };
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let overflow = self
            .idle
            .push(entry.key.clone(), epoch)
            .and_then(|(pushed_out, _)| (pushed_out != entry.key).then_some(pushed_out));

        Release::Idle {
            ticket: EvictionTicket {
                key: entry.key.clone(),
                epoch,
                delay: grace,
            },
            overflow,
        }
    }

    /// Whether `ticket` still describes the entry's current idle period.
    pub fn is_current(&self, ticket_key: &CacheKey, epoch: u64) -> bool {
        self.idle.peek(ticket_key) == Some(&epoch)
    }

    /// Forget an entry that has been evicted.
    pub fn forget(&mut self, key: &CacheKey) {
        self.idle.pop(key);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn clear(&mut self) {
        self.idle.clear();
    }
}
