//! Canopy Core - Shared Types
//!
//! Pure data structures for the cache coordinator: the resource vocabulary,
//! mutation events, the error taxonomy and configuration. Every other crate
//! depends on this one; it contains no I/O.

pub mod config;
pub mod error;
pub mod resource;
pub mod retry;

pub use config::{CoordinatorConfig, TtlPolicy};
pub use error::{
    CacheError, CanopyError, CanopyResult, ConfigError, EventError, StorageError, TagError,
};
pub use resource::{MutationOperation, ParentKind, ResourceMutationEvent, ResourceType};
pub use retry::{BackoffStrategy, RetryPolicy};
