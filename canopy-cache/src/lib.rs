//! Canopy Cache - Tag-Based Cache Coordination
//!
//! Decides what a cached read looks like, how long it may be served, and
//! which cached views a resource mutation must expire.
//!
//! - [`tag`]: tag vocabulary, canonical encoding and the name registry
//! - [`backend`]: the injected storage interface plus in-memory and LMDB backends
//! - [`read`]: get-or-compute with per-key singleflight and fail-open
//! - [`invalidation`]: the mutation fan-out table and its dispatcher
//!
//! # Example
//!
//! ```ignore
//! let backend: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
//! let reader = CacheReader::new(backend.clone(), ReaderConfig::default());
//! let dispatcher = InvalidationDispatcher::new(backend, RetryPolicy::default());
//!
//! let tags = BTreeSet::from([Tag::scoped_collection(ResourceType::Plant, ParentKind::Grow, "g1")]);
//! let plants = reader
//!     .get_or_compute("plants-by-grow:g1", &tags, Duration::from_secs(30), || store.plants("g1"))
//!     .await?;
//!
//! store.update_plant("p1").await?;
//! dispatcher
//!     .invalidate(&ResourceMutationEvent::updated(ResourceType::Plant, "p1").with_parent(ParentKind::Grow, "g1"))
//!     .await?;
//! ```

pub mod backend;
pub mod invalidation;
pub mod read;
pub mod tag;

pub use backend::{
    CacheBackend, CacheEntry, CacheStats, FillOutcome, FillToken, InMemoryCacheBackend,
    LmdbCacheBackend, LmdbCacheError,
};
pub use invalidation::{InvalidationDispatcher, InvalidationGraph, InvalidationReport};
pub use read::{CacheRead, CacheReader, ReadSource, ReaderConfig};
pub use tag::{Relationship, Tag, TagKind, TagRegistry};
