//! Bidirectional tag registry.
//!
//! Tracks which cache entries depend on which tags so invalidation can find
//! affected entries through the index instead of scanning every entry.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::tags::Tag;

use super::keys::CacheKey;

/// Tracks tag → cache_keys and cache_key → tags mappings, plus kind → tags for
/// kind-wide invalidation.
#[derive(Debug, Default)]
pub struct TagRegistry {
    /// Maps tags to all cache keys that depend on them
    tag_to_keys: HashMap<Tag, HashSet<CacheKey>>,
    /// Maps cache keys to all tags they depend on
    key_to_tags: HashMap<CacheKey, BTreeSet<Tag>>,
    /// Maps a tag kind to every registered tag of that kind
    kind_to_tags: HashMap<String, HashSet<Tag>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `cache_key` depends on `tags`, replacing earlier edges.
    pub fn register(&mut self, cache_key: &CacheKey, tags: BTreeSet<Tag>) {
        self.unregister(cache_key);
        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(cache_key.clone());
            self.kind_to_tags
                .entry(tag.kind.clone())
                .or_default()
                .insert(tag.clone());
        }
        self.key_to_tags.insert(cache_key.clone(), tags);
    }

    /// All cache keys depending on any of `tags`.
    ///
    /// A tag without id matches every registered tag of its kind.
    pub fn keys_for_tags<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> BTreeSet<CacheKey> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            if tag.is_kind_wide() {
                for concrete in self.kind_to_tags.get(&tag.kind).into_iter().flatten() {
                    keys.extend(self.keys_for_tag(concrete));
                }
            }
            keys.extend(self.keys_for_tag(tag));
        }
        keys
    }

    fn keys_for_tag(&self, tag: &Tag) -> impl Iterator<Item = CacheKey> + '_ {
        self.tag_to_keys.get(tag).into_iter().flatten().cloned()
    }

    /// Get all tags that a cache key depends on.
    pub fn tags_for_key(&self, cache_key: &CacheKey) -> BTreeSet<Tag> {
        self.key_to_tags.get(cache_key).cloned().unwrap_or_default()
    }

    /// Remove a cache key and clean up tag mappings.
    ///
    /// Called when a cache entry is evicted or re-registered.
    pub fn unregister(&mut self, cache_key: &CacheKey) {
        let Some(tags) = self.key_to_tags.remove(cache_key) else {
            return;
        };
        for tag in tags {
            let Some(keys) = self.tag_to_keys.get_mut(&tag) else {
                continue;
            };
            keys.remove(cache_key);
            if !keys.is_empty() {
                continue;
            }
            self.tag_to_keys.remove(&tag);
            if let Some(kind) = self.kind_to_tags.get_mut(&tag.kind) {
                kind.remove(&tag);
                if kind.is_empty() {
                    self.kind_to_tags.remove(&tag.kind);
                }
            }
        }
    }

    /// Clear all mappings.
    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
        self.kind_to_tags.clear();
    }

    /// Get the number of tracked tags.
    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    /// Get the number of tracked cache keys.
    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}
