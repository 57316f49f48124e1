//! Cache storage backends.

mod lmdb;
mod memory;
mod record;
mod traits;

pub use lmdb::{LmdbCacheBackend, LmdbCacheError};
pub use memory::InMemoryCacheBackend;
pub use traits::{CacheBackend, CacheEntry, CacheStats, FillOutcome, FillToken};
