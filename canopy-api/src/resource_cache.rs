//! Resource Cache
//!
//! Wraps the reader and the invalidation dispatcher behind the two calls
//! handlers make: `read` for a cached view and `record_mutation` after a
//! committed write. Handlers never build keys, tags or TTLs themselves; the
//! [`CachedView`] catalog supplies all three.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canopy_cache::{
    CacheBackend, CacheRead, CacheReader, CacheStats, InvalidationDispatcher, InvalidationReport,
    ReaderConfig,
};
use canopy_core::{CanopyResult, CoordinatorConfig, ResourceMutationEvent, TtlPolicy};
use serde::{de::DeserializeOwned, Serialize};

use crate::views::CachedView;

/// Cache facade shared by every handler.
#[derive(Clone)]
pub struct ResourceCache {
    reader: CacheReader<dyn CacheBackend>,
    dispatcher: InvalidationDispatcher<dyn CacheBackend>,
    ttl: TtlPolicy,
}

impl ResourceCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CoordinatorConfig) -> Self {
        let reader_config =
            ReaderConfig::new().with_default_deadline(config.default_compute_deadline);
        Self {
            reader: CacheReader::new(backend.clone(), reader_config),
            dispatcher: InvalidationDispatcher::new(backend, config.invalidation_retry.clone()),
            ttl: config.ttl.clone(),
        }
    }

    /// Serve `view` from cache, computing it with `compute` on a miss.
    pub async fn read<T, F, Fut>(&self, view: &CachedView, compute: F) -> CanopyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CanopyResult<T>>,
    {
        let ttl = self.ttl_for(view);
        tracing::trace!(view = %view, ttl_secs = ttl.as_secs(), "Cached view read");
        self.reader
            .get_or_compute(&view.key(), &view.tags(), ttl, compute)
            .await
    }

    /// Like [`ResourceCache::read`] with an explicit compute deadline.
    pub async fn read_with_deadline<T, F, Fut>(
        &self,
        view: &CachedView,
        deadline: Duration,
        compute: F,
    ) -> CanopyResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CanopyResult<T>>,
    {
        let ttl = self.ttl_for(view);
        self.reader
            .get_or_compute_with_deadline(&view.key(), &view.tags(), ttl, deadline, compute)
            .await
    }

    /// Expire every view affected by a committed write.
    ///
    /// Call after the write is durable. Errors only for malformed events;
    /// backend trouble shows up as `failed_tags` in the report.
    pub async fn record_mutation(
        &self,
        event: &ResourceMutationEvent,
    ) -> CanopyResult<InvalidationReport> {
        let report = self.dispatcher.invalidate(event).await?;
        if !report.is_complete() {
            tracing::warn!(
                resource_type = %event.resource_type,
                resource_id = %event.resource_id,
                failed = report.failed_tags.len(),
                "Mutation left stale views behind"
            );
        }
        Ok(report)
    }

    pub fn ttl_for(&self, view: &CachedView) -> Duration {
        self.ttl.ttl_for(view.ttl_class())
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        self.reader.backend()
    }

    pub fn in_flight(&self) -> usize {
        self.reader.in_flight()
    }

    pub async fn stats(&self) -> CanopyResult<CacheStats> {
        self.backend().stats().await
    }
}
