//! Shared application state, built once at startup.

use std::sync::Arc;
use std::time::Instant;

use canopy_cache::{CacheBackend, InMemoryCacheBackend, LmdbCacheBackend};
use canopy_core::CanopyResult;

use crate::config::{BackendKind, CacheSettings};
use crate::resource_cache::ResourceCache;

/// Application-wide state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Cache facade for view reads and mutation fan-out.
    pub cache: Arc<ResourceCache>,
    /// The single backend instance every component shares.
    pub backend: Arc<dyn CacheBackend>,
    pub settings: Arc<CacheSettings>,
    pub start_time: Instant,
}

impl AppState {
    /// Construct the configured backend and wire the cache around it.
    pub fn from_settings(settings: CacheSettings) -> CanopyResult<Self> {
        let backend: Arc<dyn CacheBackend> = match settings.backend {
            BackendKind::Memory => Arc::new(InMemoryCacheBackend::new()),
            BackendKind::Lmdb => Arc::new(LmdbCacheBackend::new(
                &settings.lmdb_path,
                settings.lmdb_map_size_mb,
            )?),
        };

        tracing::info!(
            backend = ?settings.backend,
            lmdb_path = %settings.lmdb_path.display(),
            "Cache backend ready"
        );
        Ok(Self::with_backend(backend, settings))
    }

    /// Wire the cache around an existing backend.
    pub fn with_backend(backend: Arc<dyn CacheBackend>, settings: CacheSettings) -> Self {
        let cache = ResourceCache::new(backend.clone(), &settings.coordinator);
        Self {
            cache: Arc::new(cache),
            backend,
            settings: Arc::new(settings),
            start_time: Instant::now(),
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}
