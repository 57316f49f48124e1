//! Get-or-compute reads.
//!
//! This module routes a read through the backend, collapses concurrent misses
//! into one computation, and degrades to direct computation when the backend
//! is unavailable.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canopy_core::{CacheError, CanopyError, CanopyResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};

use super::freshness::{CacheRead, ReadSource};
use super::singleflight::{Published, Role, SingleFlight};
use crate::backend::{CacheBackend, CacheEntry, FillOutcome, FillToken};
use crate::tag::Tag;

/// Configuration for the cache reader.
#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    /// Deadline applied by [`CacheReader::get_or_compute`] when the caller
    /// does not pass one. `None` waits indefinitely.
    pub default_deadline: Option<Duration>,
}

impl ReaderConfig {
    /// Create a new reader config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default deadline.
    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }
}

/// Get-or-compute front end over a [`CacheBackend`].
///
/// # Example
///
/// ```ignore
/// let reader = CacheReader::new(backend, ReaderConfig::default());
/// let tags = BTreeSet::from([Tag::collection(ResourceType::Product)]);
///
/// let read = reader
///     .get_or_compute("products", &tags, Duration::from_secs(3600), || async {
///         store.list_products().await
///     })
///     .await?;
/// ```
pub struct CacheReader<B: CacheBackend + ?Sized> {
    backend: Arc<B>,
    flights: Arc<SingleFlight>,
    config: ReaderConfig,
}

impl<B: CacheBackend + ?Sized> Clone for CacheReader<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            flights: Arc::clone(&self.flights),
            config: self.config.clone(),
        }
    }
}

/// Outcome of the cache lookup that precedes a compute.
enum Lookup<T> {
    Hit(T),
    Miss(FillToken),
    Unavailable(CanopyError),
}

impl<B: CacheBackend + ?Sized> CacheReader<B> {
    pub fn new(backend: Arc<B>, config: ReaderConfig) -> Self {
        Self {
            backend,
            flights: Arc::new(SingleFlight::new()),
            config,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Uses the configured default deadline.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        tags: &BTreeSet<Tag>,
        ttl: Duration,
        compute: F,
    ) -> CanopyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CanopyResult<T>>,
    {
        let deadline = self.config.default_deadline;
        self.read(key, tags, ttl, deadline, compute).await
    }

    /// Like [`CacheReader::get_or_compute`], bounded by `deadline`.
    ///
    /// A leader that runs out of time returns `DeadlineExceeded` and releases
    /// its followers with `ComputationAborted`. A follower that runs out of
    /// time returns `DeadlineExceeded` and leaves the flight running.
    pub async fn get_or_compute_with_deadline<T, F, Fut>(
        &self,
        key: &str,
        tags: &BTreeSet<Tag>,
        ttl: Duration,
        deadline: Duration,
        compute: F,
    ) -> CanopyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CanopyResult<T>>,
    {
        self.read(key, tags, ttl, Some(deadline), compute).await
    }

    async fn read<T, F, Fut>(
        &self,
        key: &str,
        tags: &BTreeSet<Tag>,
        ttl: Duration,
        deadline: Option<Duration>,
        compute: F,
    ) -> CanopyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CanopyResult<T>>,
    {
        if tags.is_empty() {
            return Err(CacheError::UntaggedEntry { key: key.to_string() }.into());
        }
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl { key: key.to_string() }.into());
        }
        for tag in tags {
            tag.validate()?;
        }
        let expires = deadline.map(|d| Instant::now() + d);

        let token = match self.lookup(key, tags).await {
            Lookup::Hit(value) => return Ok(CacheRead::new(value, ReadSource::Hit)),
            Lookup::Miss(token) => token,
            Lookup::Unavailable(error) => {
                tracing::warn!(
                    key,
                    backend = self.backend.name(),
                    error = %error,
                    "cache backend unavailable, computing without cache"
                );
                let value = bounded(key, deadline, expires, compute()).await??;
                return Ok(CacheRead::new(value, ReadSource::Bypassed));
            }
        };

        match self.flights.begin(key, &token) {
            Role::Follower(follower) => {
                tracing::debug!(key, "joining in-flight computation");
                match bounded(key, deadline, expires, follower.wait()).await?? {
                    Published::Bytes(bytes) => {
                        let value =
                            serde_json::from_slice(&bytes).map_err(|e| CacheError::Deserialization {
                                key: key.to_string(),
                                reason: e.to_string(),
                            })?;
                        Ok(CacheRead::new(value, ReadSource::Joined))
                    }
                    Published::Uncacheable => {
                        tracing::debug!(key, "leader value uncacheable, computing without cache");
                        let value = bounded(key, deadline, expires, compute()).await??;
                        Ok(CacheRead::new(value, ReadSource::Bypassed))
                    }
                }
            }
            Role::Leader(guard) => {
                tracing::debug!(key, "cache miss, computing");
                let value = match bounded(key, deadline, expires, compute()).await {
                    Ok(Ok(value)) => value,
                    Ok(Err(error)) => {
                        tracing::debug!(key, error = %error, "compute failed, nothing cached");
                        guard.complete(Err(error.clone()));
                        return Err(error);
                    }
                    Err(elapsed) => {
                        tracing::warn!(key, "compute deadline exceeded, aborting waiters");
                        guard.abort();
                        return Err(elapsed);
                    }
                };

                match serde_json::to_vec(&value) {
                    Ok(bytes) => {
                        self.fill(key, tags, ttl, &bytes, &token).await;
                        guard.publish(bytes);
                    }
                    Err(e) => {
                        let error = CacheError::Serialization {
                            key: key.to_string(),
                            reason: e.to_string(),
                        };
                        tracing::warn!(key, error = %error, "value not cacheable");
                        guard.release_uncacheable();
                    }
                }
                Ok(CacheRead::new(value, ReadSource::Computed))
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, tags: &BTreeSet<Tag>) -> Lookup<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    tracing::debug!(key, "cache hit");
                    return Lookup::Hit(value);
                }
                Err(e) => {
                    // Stored under a different shape; recompute overwrites it.
                    tracing::warn!(key, error = %e, "cached value unreadable, treating as miss");
                }
            },
            Ok(None) => {}
            Err(error) => return Lookup::Unavailable(error),
        }

        match self.backend.fill_token(tags).await {
            Ok(token) => Lookup::Miss(token),
            Err(error) => Lookup::Unavailable(error),
        }
    }

    /// Store a computed value. Backend failures are logged, never returned.
    async fn fill(&self, key: &str, tags: &BTreeSet<Tag>, ttl: Duration, bytes: &[u8], token: &FillToken) {
        let entry = match CacheEntry::new(key, tags.clone(), bytes.to_vec(), ttl) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(key, error = %error, "refusing to store entry");
                return;
            }
        };

        match self.backend.set(entry, token).await {
            Ok(FillOutcome::Stored) => {
                tracing::debug!(key, ttl_secs = ttl.as_secs(), tags = tags.len(), "cache filled");
            }
            Ok(FillOutcome::Discarded) => {
                tracing::debug!(key, "tags invalidated during compute, fill discarded");
            }
            Err(error) => {
                tracing::warn!(
                    key,
                    backend = self.backend.name(),
                    error = %error,
                    "cache fill failed, returning computed value"
                );
            }
        }
    }
}

/// Run `fut` until `expires`, mapping expiry to `DeadlineExceeded`.
async fn bounded<Fut: Future>(
    key: &str,
    deadline: Option<Duration>,
    expires: Option<Instant>,
    fut: Fut,
) -> Result<Fut::Output, CanopyError> {
    match (deadline, expires) {
        (Some(deadline), Some(expires)) => timeout_at(expires, fut).await.map_err(|_| {
            CacheError::DeadlineExceeded {
                key: key.to_string(),
                deadline,
            }
            .into()
        }),
        _ => Ok(fut.await),
    }
}
