//! Cache backend trait and stored-entry types.
//!
//! The coordinator never stores anything itself. Every read, fill and
//! invalidation goes through a [`CacheBackend`] that is constructed once at
//! startup and handed to the reader and the dispatcher by reference.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use canopy_core::{CacheError, CanopyResult};

use crate::tag::Tag;

/// A stored value together with its tags.
///
/// Every entry carries at least one tag; an untagged entry could never be
/// reached by invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub tags: BTreeSet<Tag>,
    pub value: Vec<u8>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Build an entry, rejecting empty tag sets and zero TTLs.
    pub fn new(
        key: impl Into<String>,
        tags: BTreeSet<Tag>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let key = key.into();
        if tags.is_empty() {
            return Err(CacheError::UntaggedEntry { key });
        }
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl { key });
        }
        Ok(Self {
            key,
            tags,
            value,
            ttl,
        })
    }
}

/// Snapshot of tag invalidation generations taken before a compute starts.
///
/// A fill carrying a token is discarded by the backend if any of its tags was
/// invalidated after the token was taken, so a compute that raced with a
/// write cannot re-populate the pre-write value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FillToken {
    generations: Vec<(String, u64)>,
}

impl FillToken {
    pub fn new(generations: Vec<(String, u64)>) -> Self {
        let mut generations = generations;
        generations.sort();
        Self { generations }
    }

    pub fn generation(&self, tag: &str) -> Option<u64> {
        self.generations
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, generation)| *generation)
    }

    pub fn generations(&self) -> &[(String, u64)] {
        &self.generations
    }
}

/// What happened to a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Stored,
    /// One of the entry's tags was invalidated while the value was computed.
    Discarded,
}

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be thread-safe. After `invalidate_tag(t)` returns,
/// no `get` may return a value that was stored with tag `t` before the call.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetch an unexpired value. Expired entries are dropped lazily here.
    async fn get(&self, key: &str) -> CanopyResult<Option<Vec<u8>>>;

    /// Snapshot the invalidation generations of `tags`.
    async fn fill_token(&self, tags: &BTreeSet<Tag>) -> CanopyResult<FillToken>;

    /// Store an entry unless one of its tags moved past `token`.
    async fn set(&self, entry: CacheEntry, token: &FillToken) -> CanopyResult<FillOutcome>;

    /// Drop every entry carrying `tag`. Returns the number of entries dropped.
    async fn invalidate_tag(&self, tag: &Tag) -> CanopyResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> CanopyResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired entries included.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Entries dropped by tag invalidation.
    pub invalidated: u64,
    /// Entries dropped because their TTL ran out.
    pub expired: u64,
    /// Fills discarded because a tag was invalidated mid-compute.
    pub discarded_fills: u64,
    /// Tags holding an invalidation generation. Grows with the number of
    /// distinct tags ever invalidated; generations are never pruned.
    pub tracked_tags: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::ResourceType;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_entry_requires_tags() {
        let err = CacheEntry::new("k", BTreeSet::new(), vec![1], Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, CacheError::UntaggedEntry { key: "k".to_string() });
    }

    #[test]
    fn test_entry_requires_ttl() {
        let tags = BTreeSet::from([Tag::collection(ResourceType::Strain)]);
        let err = CacheEntry::new("k", tags, vec![1], Duration::ZERO).unwrap_err();
        assert_eq!(err, CacheError::ZeroTtl { key: "k".to_string() });
    }

    #[test]
    fn test_fill_token_is_order_independent() {
        let a = FillToken::new(vec![("b".to_string(), 2), ("a".to_string(), 1)]);
        let b = FillToken::new(vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(a, b);
        assert_eq!(a.generation("b"), Some(2));
        assert_eq!(a.generation("c"), None);
    }
}
