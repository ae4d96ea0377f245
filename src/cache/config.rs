//! Cache configuration.
//!
//! Defaults applied to every endpoint unless the endpoint overrides them, plus
//! the dispatch guard settings.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::events::DEFAULT_IGNORED_ACTIONS;

const DEFAULT_KEEP_UNUSED_FOR: Duration = Duration::from_secs(60);
const DEFAULT_MAX_IDLE_ENTRIES: usize = 256;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Age after which a fulfilled entry refetches on the next subscribe.
    /// `None` keeps data fresh until it is invalidated.
    pub default_ttl: Option<Duration>,
    /// Grace period between the last unsubscribe and eviction.
    pub keep_unused_for: Duration,
    /// Maximum entries kept without subscribers while their grace period runs.
    pub max_idle_entries: usize,
    /// Reject actions carrying non-plain payloads.
    pub serializable_check: bool,
    /// Action types exempt from the serializability check, in addition to the
    /// persistence actions.
    pub ignored_actions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            keep_unused_for: DEFAULT_KEEP_UNUSED_FOR,
            max_idle_entries: DEFAULT_MAX_IDLE_ENTRIES,
            serializable_check: true,
            ignored_actions: Vec::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            default_ttl: settings.default_ttl,
            keep_unused_for: settings.keep_unused_for,
            max_idle_entries: settings.max_idle_entries.get(),
            serializable_check: settings.serializable_check,
            ignored_actions: settings.ignored_actions.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the idle-entry capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_idle_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_idle_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Every action type the serializability guard lets through unchecked.
    pub fn allowed_opaque_actions(&self) -> impl Iterator<Item = &str> {
        DEFAULT_IGNORED_ACTIONS
            .into_iter()
            .chain(self.ignored_actions.iter().map(String::as_str))
    }
}
