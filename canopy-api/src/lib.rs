//! Canopy API - Cache Wiring for the Cultivation Backend
//!
//! Connects the tag-based cache coordinator to the application: settings
//! loaded from the environment, tracing setup, the catalog of cached views,
//! and the [`ResourceCache`] facade handlers call for reads and after writes.

pub mod config;
pub mod resource_cache;
pub mod state;
pub mod telemetry;
pub mod views;

// Re-export commonly used types
pub use config::{BackendKind, CacheSettings};
pub use resource_cache::ResourceCache;
pub use state::AppState;
pub use telemetry::{init_tracing, TelemetryError};
pub use views::{CachedView, ViewKind};
