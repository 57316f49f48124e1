//! In-process cache backend.
//!
//! Entries, the tag index and the per-tag invalidation generations live
//! behind one mutex so a fill and an invalidation can never interleave
//! halfway. Expiry uses `tokio::time::Instant`, which lets tests drive TTLs
//! with a paused clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use canopy_core::{CacheError, CanopyResult};
use tokio::time::Instant;

use super::traits::{CacheBackend, CacheEntry, CacheStats, FillOutcome, FillToken};
use crate::tag::Tag;

#[derive(Debug)]
struct StoredEntry {
    value: Vec<u8>,
    tags: BTreeSet<String>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, StoredEntry>,
    tag_index: HashMap<String, HashSet<String>>,
    // Kept after the tag's last entry is gone: a token taken before the
    // bump must still fail its check. One row per tag ever invalidated.
    generations: HashMap<String, u64>,
    stats: CacheStats,
}

impl Inner {
    fn generation(&self, tag: &str) -> u64 {
        self.generations.get(tag).copied().unwrap_or(0)
    }

    fn remove_entry(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.stats.entry_count = self.entries.len() as u64;
        true
    }
}

/// HashMap-backed cache for single-process deployments and tests.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the backend. While unavailable every
    /// operation fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Keys currently stored under `tag`, expired ones included.
    pub fn keys_for_tag(&self, tag: &Tag) -> BTreeSet<String> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .tag_index
                    .get(&tag.encode())
                    .map(|keys| keys.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> CanopyResult<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::BackendUnavailable {
                reason: "in-memory backend marked unavailable".to_string(),
            }
            .into());
        }
        self.inner.lock().map_err(|_| {
            CacheError::BackendUnavailable {
                reason: "in-memory backend lock poisoned".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CanopyResult<Option<Vec<u8>>> {
        let mut inner = self.lock()?;
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Ok(Some(value));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove_entry(key);
            inner.stats.expired += 1;
        }
        inner.stats.misses += 1;
        Ok(None)
    }

    async fn fill_token(&self, tags: &BTreeSet<Tag>) -> CanopyResult<FillToken> {
        let inner = self.lock()?;
        let generations = tags
            .iter()
            .map(|tag| {
                let encoded = tag.encode();
                let generation = inner.generation(&encoded);
                (encoded, generation)
            })
            .collect();
        Ok(FillToken::new(generations))
    }

    async fn set(&self, entry: CacheEntry, token: &FillToken) -> CanopyResult<FillOutcome> {
        let mut inner = self.lock()?;
        let tags: BTreeSet<String> = entry.tags.iter().map(Tag::encode).collect();

        let raced = tags
            .iter()
            .any(|tag| token.generation(tag).unwrap_or(0) != inner.generation(tag));
        if raced {
            inner.stats.discarded_fills += 1;
            return Ok(FillOutcome::Discarded);
        }

        inner.remove_entry(&entry.key);
        for tag in &tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        inner.entries.insert(
            entry.key,
            StoredEntry {
                value: entry.value,
                tags,
                expires_at: Instant::now() + entry.ttl,
            },
        );
        inner.stats.entry_count = inner.entries.len() as u64;
        Ok(FillOutcome::Stored)
    }

    async fn invalidate_tag(&self, tag: &Tag) -> CanopyResult<u64> {
        let mut inner = self.lock()?;
        let encoded = tag.encode();

        *inner.generations.entry(encoded.clone()).or_insert(0) += 1;

        let keys: Vec<String> = inner
            .tag_index
            .remove(&encoded)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();

        let mut dropped = 0u64;
        for key in keys {
            if inner.remove_entry(&key) {
                dropped += 1;
            }
        }
        inner.stats.invalidated += dropped;
        Ok(dropped)
    }

    async fn stats(&self) -> CanopyResult<CacheStats> {
        let inner = self.lock()?;
        Ok(CacheStats {
            tracked_tags: inner.generations.len() as u64,
            ..inner.stats.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{ParentKind, ResourceType};
    use std::time::Duration;

    fn tags(list: &[Tag]) -> BTreeSet<Tag> {
        list.iter().cloned().collect()
    }

    async fn put(backend: &InMemoryCacheBackend, key: &str, tag_list: &[Tag], ttl: Duration) {
        let tag_set = tags(tag_list);
        let token = backend.fill_token(&tag_set).await.unwrap();
        let entry = CacheEntry::new(key, tag_set, key.as_bytes().to_vec(), ttl).unwrap();
        assert_eq!(backend.set(entry, &token).await.unwrap(), FillOutcome::Stored);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = InMemoryCacheBackend::new();
        put(&backend, "grow:g1", &[Tag::entity(ResourceType::Grow, "g1")], Duration::from_secs(60)).await;

        assert_eq!(backend.get("grow:g1").await.unwrap(), Some(b"grow:g1".to_vec()));
        assert_eq!(backend.get("grow:g2").await.unwrap(), None);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_dropped_lazily() {
        let backend = InMemoryCacheBackend::new();
        put(&backend, "strains", &[Tag::collection(ResourceType::Strain)], Duration::from_secs(30)).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(backend.get("strains").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.get("strains").await.unwrap().is_none());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_invalidate_tag_drops_every_tagged_entry() {
        let backend = InMemoryCacheBackend::new();
        let grow = Tag::entity(ResourceType::Grow, "g1");
        let plants = Tag::scoped_collection(ResourceType::Plant, ParentKind::Grow, "g1");

        put(&backend, "grow-detail:g1", &[grow.clone()], Duration::from_secs(60)).await;
        put(&backend, "plants:g1", &[plants.clone(), grow.clone()], Duration::from_secs(60)).await;
        put(&backend, "grow-detail:g2", &[Tag::entity(ResourceType::Grow, "g2")], Duration::from_secs(60)).await;

        assert_eq!(backend.invalidate_tag(&grow).await.unwrap(), 2);
        assert!(backend.get("grow-detail:g1").await.unwrap().is_none());
        assert!(backend.get("plants:g1").await.unwrap().is_none());
        assert!(backend.get("grow-detail:g2").await.unwrap().is_some());

        // The secondary index entry went away with the key.
        assert!(backend.keys_for_tag(&plants).is_empty());
        assert_eq!(backend.invalidate_tag(&plants).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fill_started_before_invalidation_is_discarded() {
        let backend = InMemoryCacheBackend::new();
        let tag_set = tags(&[Tag::collection(ResourceType::Product)]);

        let token = backend.fill_token(&tag_set).await.unwrap();
        backend
            .invalidate_tag(&Tag::collection(ResourceType::Product))
            .await
            .unwrap();

        let entry = CacheEntry::new("products", tag_set.clone(), b"stale".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(backend.set(entry, &token).await.unwrap(), FillOutcome::Discarded);
        assert!(backend.get("products").await.unwrap().is_none());
        assert_eq!(backend.stats().await.unwrap().discarded_fills, 1);

        let fresh_token = backend.fill_token(&tag_set).await.unwrap();
        let entry = CacheEntry::new("products", tag_set, b"fresh".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(backend.set(entry, &fresh_token).await.unwrap(), FillOutcome::Stored);
    }

    #[tokio::test]
    async fn test_generation_outlives_tagged_entries() {
        let backend = InMemoryCacheBackend::new();
        let tag = Tag::entity(ResourceType::Plant, "p1");
        put(&backend, "plant-detail:p1", &[tag.clone()], Duration::from_secs(60)).await;

        let early = backend.fill_token(&tags(&[tag.clone()])).await.unwrap();
        backend.invalidate_tag(&tag).await.unwrap();
        assert!(backend.keys_for_tag(&tag).is_empty());
        assert_eq!(backend.stats().await.unwrap().entry_count, 0);

        let entry = CacheEntry::new("plant-detail:p1", tags(&[tag.clone()]), b"old".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(backend.set(entry, &early).await.unwrap(), FillOutcome::Discarded);

        // Invalidating the same tag again reuses its row.
        backend.invalidate_tag(&tag).await.unwrap();
        backend.invalidate_tag(&Tag::collection(ResourceType::Strain)).await.unwrap();
        assert_eq!(backend.stats().await.unwrap().tracked_tags, 2);
    }

    #[tokio::test]
    async fn test_overwrite_moves_tag_membership() {
        let backend = InMemoryCacheBackend::new();
        let old_tag = Tag::entity(ResourceType::Task, "t1");
        let new_tag = Tag::collection(ResourceType::Task);

        put(&backend, "k", &[old_tag.clone()], Duration::from_secs(60)).await;
        put(&backend, "k", &[new_tag.clone()], Duration::from_secs(60)).await;

        assert!(backend.keys_for_tag(&old_tag).is_empty());
        assert_eq!(backend.invalidate_tag(&old_tag).await.unwrap(), 0);
        assert!(backend.get("k").await.unwrap().is_some());
        assert_eq!(backend.invalidate_tag(&new_tag).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_every_call() {
        let backend = InMemoryCacheBackend::new();
        backend.set_available(false);

        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(backend
            .invalidate_tag(&Tag::collection(ResourceType::Strain))
            .await
            .unwrap_err()
            .is_backend_unavailable());

        backend.set_available(true);
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
