//! LMDB-backed cache implementation.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a persistent,
//! memory-mapped cache that survives process restarts. Three named
//! databases are kept in one environment:
//!
//! - `entries`: cache key → [`EntryRecord`]
//! - `tag_index`: [`TagIndexKey`] → empty, one row per (tag, key) pair
//! - `generations`: tag → invalidation counter (u64 LE)
//!
//! Generation rows are never pruned. A fill token taken before an
//! invalidation must keep failing after the tag's last entry is gone, and
//! tokens carry no age to tell when that can no longer happen. The table
//! holds one small row per distinct tag ever invalidated;
//! [`CacheStats::tracked_tags`] reports its size.
//!
//! Fills and invalidations each run in a single write transaction. LMDB
//! serializes writers, so a fill can never observe half of an invalidation.
//! Expiry uses wall-clock time because entries outlive the process.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use canopy_core::{CacheError, CanopyError, CanopyResult};
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use super::record::{is_indexable, EntryRecord, TagIndexKey};
use super::traits::{CacheBackend, CacheEntry, CacheStats, FillOutcome, FillToken};
use crate::tag::Tag;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A tag or key contains the index separator byte.
    #[error("Key or tag cannot be indexed: {0:?}")]
    Unindexable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CanopyError {
    fn from(e: LmdbCacheError) -> Self {
        CanopyError::Cache(CacheError::BackendUnavailable {
            reason: e.to_string(),
        })
    }
}

impl From<heed::Error> for LmdbCacheError {
    fn from(e: heed::Error) -> Self {
        LmdbCacheError::Transaction(e.to_string())
    }
}

/// LMDB-backed cache with a persistent tag index.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(LmdbCacheBackend::new("/var/lib/canopy/cache", 256)?);
/// let reader = CacheReader::new(backend.clone(), ReaderConfig::default());
/// let dispatcher = InvalidationDispatcher::new(backend, RetryPolicy::default());
/// ```
pub struct LmdbCacheBackend {
    env: Env,
    entries: Database<Bytes, Bytes>,
    tag_index: Database<Bytes, Bytes>,
    generations: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbCacheBackend {
    /// Open (or create) a cache environment at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the memory map in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let entries = Self::open_db(&env, &mut wtxn, "entries")?;
        let tag_index = Self::open_db(&env, &mut wtxn, "tag_index")?;
        let generations = Self::open_db(&env, &mut wtxn, "generations")?;
        wtxn.commit()?;

        Ok(Self {
            env,
            entries,
            tag_index,
            generations,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    fn open_db(
        env: &Env,
        wtxn: &mut heed::RwTxn<'_>,
        name: &'static str,
    ) -> Result<Database<Bytes, Bytes>, LmdbCacheError> {
        env.create_database(wtxn, Some(name))
            .map_err(|e| LmdbCacheError::DbOpen {
                name,
                reason: e.to_string(),
            })
    }

    fn record_stat(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    fn generation(&self, txn: &RoTxn<'_>, tag: &str) -> Result<u64, LmdbCacheError> {
        let stored = self.generations.get(txn, tag.as_bytes())?;
        Ok(stored
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0))
    }

    /// Keys indexed under `tag`. Index keys sort by tag first, so this is a
    /// range seek over that tag's rows only.
    fn keys_with_tag(&self, txn: &RoTxn<'_>, tag: &str) -> Result<Vec<String>, LmdbCacheError> {
        let prefix = TagIndexKey::tag_prefix(tag);
        let mut keys = Vec::new();
        for result in self.tag_index.prefix_iter(txn, prefix.as_slice())? {
            let (index_key, _) = result?;
            if let Some(decoded) = TagIndexKey::decode(index_key) {
                keys.push(decoded.key().to_string());
            }
        }
        Ok(keys)
    }

    /// Remove an entry and its index rows inside an open write transaction.
    fn remove_entry(&self, wtxn: &mut heed::RwTxn<'_>, key: &str) -> Result<bool, LmdbCacheError> {
        let previous = self
            .entries
            .get(wtxn, key.as_bytes())?
            .and_then(EntryRecord::decode);

        if let Some(record) = previous {
            for tag in &record.tags {
                self.tag_index
                    .delete(wtxn, &TagIndexKey::new(tag.as_str(), key).encode())?;
            }
        }
        Ok(self.entries.delete(wtxn, key.as_bytes())?)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn get(&self, key: &str) -> CanopyResult<Option<Vec<u8>>> {
        let record = {
            let rtxn = self.env.read_txn().map_err(LmdbCacheError::from)?;
            self.entries
                .get(&rtxn, key.as_bytes())
                .map_err(LmdbCacheError::from)?
                .map(|bytes| EntryRecord::decode(bytes).ok_or(bytes.len()))
        };

        match record {
            Some(Ok(record)) if !record.is_expired_at(Utc::now().timestamp_millis()) => {
                self.record_stat(|s| s.hits += 1);
                Ok(Some(record.value))
            }
            Some(_) => {
                // Expired or unreadable: drop it and report a miss.
                let mut wtxn = self.env.write_txn().map_err(LmdbCacheError::from)?;
                let removed = self.remove_entry(&mut wtxn, key)?;
                wtxn.commit().map_err(LmdbCacheError::from)?;
                self.record_stat(|s| {
                    s.misses += 1;
                    if removed {
                        s.expired += 1;
                    }
                });
                Ok(None)
            }
            None => {
                self.record_stat(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn fill_token(&self, tags: &BTreeSet<Tag>) -> CanopyResult<FillToken> {
        let rtxn = self.env.read_txn().map_err(LmdbCacheError::from)?;
        let mut generations = Vec::with_capacity(tags.len());
        for tag in tags {
            let encoded = tag.encode();
            let generation = self.generation(&rtxn, &encoded)?;
            generations.push((encoded, generation));
        }
        Ok(FillToken::new(generations))
    }

    async fn set(&self, entry: CacheEntry, token: &FillToken) -> CanopyResult<FillOutcome> {
        let tags: Vec<String> = entry.tags.iter().map(Tag::encode).collect();
        if let Some(bad) = std::iter::once(&entry.key)
            .chain(tags.iter())
            .find(|raw| !is_indexable(raw))
        {
            return Err(LmdbCacheError::Unindexable(bad.clone()).into());
        }

        let mut wtxn = self.env.write_txn().map_err(LmdbCacheError::from)?;

        for tag in &tags {
            if token.generation(tag).unwrap_or(0) != self.generation(&wtxn, tag)? {
                self.record_stat(|s| s.discarded_fills += 1);
                return Ok(FillOutcome::Discarded);
            }
        }

        self.remove_entry(&mut wtxn, &entry.key)?;

        let ttl_millis = i64::try_from(entry.ttl.as_millis()).unwrap_or(i64::MAX);
        let record = EntryRecord {
            expires_at_millis: Utc::now().timestamp_millis().saturating_add(ttl_millis),
            tags: tags.clone(),
            value: entry.value,
        };
        self.entries
            .put(&mut wtxn, entry.key.as_bytes(), &record.encode())
            .map_err(LmdbCacheError::from)?;
        for tag in &tags {
            self.tag_index
                .put(&mut wtxn, &TagIndexKey::new(tag.as_str(), entry.key.as_str()).encode(), &[])
                .map_err(LmdbCacheError::from)?;
        }

        wtxn.commit().map_err(LmdbCacheError::from)?;
        Ok(FillOutcome::Stored)
    }

    async fn invalidate_tag(&self, tag: &Tag) -> CanopyResult<u64> {
        let encoded = tag.encode();
        let mut wtxn = self.env.write_txn().map_err(LmdbCacheError::from)?;

        let next = self.generation(&wtxn, &encoded)?.wrapping_add(1);
        self.generations
            .put(&mut wtxn, encoded.as_bytes(), &next.to_le_bytes())
            .map_err(LmdbCacheError::from)?;

        let keys = self.keys_with_tag(&wtxn, &encoded)?;
        let mut dropped = 0u64;
        for key in &keys {
            if self.remove_entry(&mut wtxn, key)? {
                dropped += 1;
            }
        }

        wtxn.commit().map_err(LmdbCacheError::from)?;
        self.record_stat(|s| s.invalidated += dropped);
        Ok(dropped)
    }

    async fn stats(&self) -> CanopyResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(LmdbCacheError::from)?;
        let entry_count = self.entries.len(&rtxn).map_err(LmdbCacheError::from)?;
        let tracked_tags = self.generations.len(&rtxn).map_err(LmdbCacheError::from)?;
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = entry_count;
        stats.tracked_tags = tracked_tags;
        Ok(stats)
    }
}
