//! Cache state container and its reducer.
//!
//! [`CacheState::reduce`] is the only code that mutates cache state. It never
//! performs I/O; everything that must happen outside the state lock (spawning
//! fetches, arming eviction timers, persisting the auth slice, notifying
//! subscribers) is returned as [`Effects`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::auth::AuthState;
use crate::domain::tags::Tag;
use crate::infra::persist::RehydrateOutcome;

use super::config::CacheConfig;
use super::entry::{CacheEntry, QueryState, RequestId};
use super::events::{Action, MutationId, PatchId, PersistKind};
use super::keys::CacheKey;
use super::patch::ChangeSet;
use super::registry::TagRegistry;
use super::store::{BeginFetch, Delivery, EntryStore};
use super::subscriptions::{EvictionTicket, Release, SubscriptionManager};

const METRIC_HIT_TOTAL: &str = "querysync_query_hit_total";
const METRIC_MISS_TOTAL: &str = "querysync_query_miss_total";
const METRIC_FETCH_TOTAL: &str = "querysync_fetch_total";
const METRIC_DEDUP_TOTAL: &str = "querysync_fetch_dedup_total";
const METRIC_INVALIDATE_TOTAL: &str = "querysync_invalidate_total";
const METRIC_ROLLBACK_TOTAL: &str = "querysync_mutation_rollback_total";

/// A fetch the client must start.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub key: CacheKey,
    pub request_id: RequestId,
    pub endpoint: String,
    pub args: Value,
}

/// Side effects of one reduced action.
#[derive(Debug, Default)]
pub struct Effects {
    /// Keys whose published state changed.
    pub notify: BTreeSet<CacheKey>,
    pub fetches: Vec<FetchRequest>,
    /// Grace-period timers to arm.
    pub timers: Vec<EvictionTicket>,
    /// Entries removed from the store; their fetches must be aborted.
    pub evicted: Vec<CacheKey>,
    /// The auth slice changed and should be persisted.
    pub auth_changed: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.notify.is_empty()
            && self.fetches.is_empty()
            && self.timers.is_empty()
            && self.evicted.is_empty()
            && !self.auth_changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Idle,
    Pending,
    Fulfilled,
    Rejected,
}

/// Undo record of one optimistic write.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedPatch {
    pub id: PatchId,
    pub key: CacheKey,
    pub changes: ChangeSet,
}

/// A mutation between its start and its commit or rollback.
#[derive(Debug, Clone, Serialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub endpoint: String,
    pub status: MutationStatus,
    pub patches: Vec<AppliedPatch>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PersistenceStatus {
    pub rehydrated: bool,
    pub outcome: Option<RehydrateOutcome>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_persisted_at: Option<OffsetDateTime>,
}

#[derive(Serialize)]
pub struct CacheState {
    queries: EntryStore,
    mutations: BTreeMap<MutationId, MutationRecord>,
    auth: AuthState,
    persistence: PersistenceStatus,
    #[serde(skip)]
    tags: TagRegistry,
    #[serde(skip)]
    subscriptions: SubscriptionManager,
}

impl CacheState {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            queries: EntryStore::new(),
            mutations: BTreeMap::new(),
            auth: AuthState::default(),
            persistence: PersistenceStatus::default(),
            tags: TagRegistry::new(),
            subscriptions: SubscriptionManager::new(config.max_idle_entries_non_zero()),
        }
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.queries.get(key)
    }

    /// State published for `key`; evicted keys read as uninitialized.
    pub fn query_state(&self, key: &CacheKey) -> QueryState {
        self.queries
            .get(key)
            .map(CacheEntry::snapshot)
            .unwrap_or_else(QueryState::uninitialized)
    }

    pub fn entry_count(&self) -> usize {
        self.queries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.subscriptions.idle_count()
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn persistence(&self) -> &PersistenceStatus {
        &self.persistence
    }

    pub fn mutation(&self, id: &MutationId) -> Option<&MutationRecord> {
        self.mutations.get(id)
    }

    pub fn pending_mutations(&self) -> usize {
        self.mutations.len()
    }

    pub fn tags_for(&self, key: &CacheKey) -> BTreeSet<Tag> {
        self.tags.tags_for_key(key)
    }

    pub fn reduce(&mut self, action: Action) -> Effects {
        let mut effects = Effects::default();
        match action {
            Action::Subscribe {
                key,
                endpoint,
                args,
                ttl,
            } => self.subscribe(key, &endpoint, &args, ttl, &mut effects),
            Action::Unsubscribe { key, grace } => self.unsubscribe(&key, grace, &mut effects),
            Action::Refetch { key } => {
                if self.queries.contains(&key) {
                    self.begin_fetch(&key, &mut effects);
                }
            }
            Action::QueryFulfilled {
                key,
                request_id,
                data,
                tags,
            } => {
                let delivery = self.queries.resolve(
                    &key,
                    request_id,
                    data,
                    tags.clone(),
                    Instant::now(),
                );
                if delivery == Delivery::Applied {
                    self.tags.register(&key, tags);
                    effects.notify.insert(key);
                }
            }
            Action::QueryRejected {
                key,
                request_id,
                error,
            } => {
                if self.queries.reject(&key, request_id, error) == Delivery::Applied {
                    effects.notify.insert(key);
                }
            }
            Action::EvictionTimerFired { key, epoch } => {
                if self.subscriptions.is_current(&key, epoch) {
                    self.evict(&key, &mut effects);
                } else {
                    debug!(%key, epoch, "ignoring superseded eviction timer");
                }
            }
            Action::InvalidateTags { tags } => self.invalidate(&tags, &mut effects),
            Action::MutationStarted {
                mutation_id,
                endpoint,
            } => {
                self.mutations.insert(
                    mutation_id,
                    MutationRecord {
                        id: mutation_id,
                        endpoint,
                        status: MutationStatus::Pending,
                        patches: Vec::new(),
                        started_at: OffsetDateTime::now_utc(),
                    },
                );
            }
            Action::PatchApplied {
                mutation_id,
                patch_id,
                key,
                changes,
            } => self.apply_patch(mutation_id, patch_id, key, changes, &mut effects),
            Action::QueryDataPatched { key, changes } => {
                if self.queries.patch_data(&key, &changes).is_some() {
                    effects.notify.insert(key);
                }
            }
            Action::MutationCommitted { mutation_id } => {
                self.mutations.remove(&mutation_id);
            }
            Action::MutationRolledBack { mutation_id } => self.rollback(&mutation_id, &mut effects),
            Action::ResetApiState => self.reset(&mut effects),
            Action::SetCredentials { auth } => {
                self.auth = auth;
                effects.auth_changed = true;
            }
            Action::ClearCredentials => {
                self.auth = AuthState::default();
                effects.auth_changed = true;
            }
            Action::Persist { kind, .. } => {
                if kind == PersistKind::Persist {
                    self.persistence.last_persisted_at = Some(OffsetDateTime::now_utc());
                }
            }
            Action::Rehydrate { auth, outcome, .. } => {
                match &outcome {
                    RehydrateOutcome::Restored => self.auth = auth,
                    RehydrateOutcome::Migrated { .. } => {
                        self.auth = auth;
                        effects.auth_changed = true;
                    }
                    RehydrateOutcome::Missing | RehydrateOutcome::Discarded { .. } => {}
                }
                info!(outcome = ?outcome, authenticated = self.auth.is_authenticated(), "Auth state rehydrated");
                self.persistence.rehydrated = true;
                self.persistence.outcome = Some(outcome);
            }
            Action::Custom { action_type, .. } => {
                debug!(action = %action_type, "custom action has no cache reducer");
            }
        }
        effects
    }

    fn subscribe(
        &mut self,
        key: CacheKey,
        endpoint: &str,
        args: &Value,
        ttl: Option<Duration>,
        effects: &mut Effects,
    ) {
        let entry = self.queries.get_or_create(&key, endpoint, args);
        let subscribers = self.subscriptions.subscribe(entry);
        let needs_fetch = entry.needs_fetch(ttl, Instant::now());

        if entry.is_pending() {
            counter!(METRIC_DEDUP_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
        } else if needs_fetch {
            counter!(METRIC_MISS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
        } else {
            counter!(METRIC_HIT_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
        }
        debug!(%key, subscribers, needs_fetch, "subscribed");

        if needs_fetch {
            self.begin_fetch(&key, effects);
        }
        effects.notify.insert(key);
    }

    fn unsubscribe(&mut self, key: &CacheKey, grace: Duration, effects: &mut Effects) {
        let Some(entry) = self.queries.get_mut(key) else {
            debug!(%key, "unsubscribe for evicted entry");
            return;
        };

        match self.subscriptions.unsubscribe(entry, grace) {
            Release::Observed { remaining } => {
                debug!(%key, remaining, "unsubscribed");
            }
            Release::Idle { ticket, overflow } => {
                if let Some(overflow) = overflow {
                    debug!(key = %overflow, "idle capacity reached; evicting early");
                    self.evict(&overflow, effects);
                }
                if ticket.delay.is_zero() {
                    self.evict(key, effects);
                } else {
                    effects.timers.push(ticket);
                }
            }
        }
    }

    fn begin_fetch(&mut self, key: &CacheKey, effects: &mut Effects) {
        match self.queries.begin_fetch(key, Uuid::new_v4()) {
            Some(BeginFetch::Started(request_id)) => {
                let Some(entry) = self.queries.get(key) else {
                    return;
                };
                counter!(METRIC_FETCH_TOTAL, "endpoint" => entry.endpoint.clone()).increment(1);
                effects.fetches.push(FetchRequest {
                    key: key.clone(),
                    request_id,
                    endpoint: entry.endpoint.clone(),
                    args: entry.args.clone(),
                });
                effects.notify.insert(key.clone());
            }
            Some(BeginFetch::Joined(request_id)) => {
                let endpoint = self
                    .queries
                    .get(key)
                    .map(|entry| entry.endpoint.clone())
                    .unwrap_or_default();
                counter!(METRIC_DEDUP_TOTAL, "endpoint" => endpoint).increment(1);
                debug!(%key, %request_id, "joined in-flight fetch");
            }
            None => {}
        }
    }

    fn evict(&mut self, key: &CacheKey, effects: &mut Effects) {
        match self.queries.evict(key) {
            Ok(Some(_)) => {
                self.tags.unregister(key);
                self.subscriptions.forget(key);
                debug!(
                    %key,
                    tagged_keys = self.tags.key_count(),
                    tags = self.tags.tag_count(),
                    "evicted"
                );
                effects.evicted.push(key.clone());
            }
            Ok(None) => self.subscriptions.forget(key),
            Err(err) => debug!(%key, error = %err, "eviction skipped"),
        }
    }

    fn invalidate(&mut self, tags: &[Tag], effects: &mut Effects) {
        let keys = self.tags.keys_for_tags(tags);
        counter!(METRIC_INVALIDATE_TOTAL).increment(keys.len() as u64);
        debug!(
            tags = %tags.iter().map(Tag::to_string).collect::<Vec<_>>().join(","),
            entries = keys.len(),
            "invalidating tags"
        );

        for key in keys {
            if !self.queries.mark_stale(&key) {
                continue;
            }
            effects.notify.insert(key.clone());
            let observed = self
                .queries
                .get(&key)
                .is_some_and(|entry| entry.subscriber_count > 0);
            if observed {
                self.begin_fetch(&key, effects);
            }
        }
    }

    fn apply_patch(
        &mut self,
        mutation_id: MutationId,
        patch_id: PatchId,
        key: CacheKey,
        changes: ChangeSet,
        effects: &mut Effects,
    ) {
        let Some(unreachable) = self.queries.patch_data(&key, &changes) else {
            debug!(%key, %mutation_id, "optimistic patch target has no data");
            return;
        };
        if unreachable > 0 {
            warn!(%key, %mutation_id, unreachable, "optimistic patch partially applied");
        }
        effects.notify.insert(key.clone());

        match self.mutations.get_mut(&mutation_id) {
            Some(record) => record.patches.push(AppliedPatch {
                id: patch_id,
                key,
                changes,
            }),
            None => warn!(%key, %mutation_id, "patch applied without a pending mutation"),
        }
    }

    fn rollback(&mut self, mutation_id: &MutationId, effects: &mut Effects) {
        let Some(record) = self.mutations.remove(mutation_id) else {
            return;
        };
        counter!(METRIC_ROLLBACK_TOTAL, "endpoint" => record.endpoint.clone()).increment(1);

        for patch in record.patches.into_iter().rev() {
            let Some(entry) = self.queries.get_mut(&patch.key) else {
                continue;
            };
            let Some(data) = entry.data.as_mut() else {
                continue;
            };
            let outcome = patch.changes.revert(data);
            effects.notify.insert(patch.key.clone());
            if outcome.conflicts == 0 {
                continue;
            }

            warn!(
                key = %patch.key,
                %mutation_id,
                patch_id = %patch.id,
                conflicts = outcome.conflicts,
                "rollback conflicted with a later write; refetching"
            );
            entry.stale = true;
            if entry.subscriber_count > 0 {
                self.begin_fetch(&patch.key, effects);
            }
        }
    }

    fn reset(&mut self, effects: &mut Effects) {
        let before: Vec<CacheKey> = self.queries.keys().cloned().collect();
        let kept: BTreeSet<CacheKey> = self.queries.reset().into_iter().collect();
        self.tags.clear();
        self.subscriptions.clear();
        info!(dropped = before.len() - kept.len(), kept = kept.len(), "API state reset");

        effects
            .evicted
            .extend(before.into_iter().filter(|key| !kept.contains(key)));
        for key in kept {
            self.begin_fetch(&key, effects);
            effects.notify.insert(key);
        }
    }
}
