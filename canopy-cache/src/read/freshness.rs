//! Read results with provenance.
//!
//! Every read returns a [`CacheRead<T>`] so the caller can see whether the
//! value came from the cache, from its own compute, from another caller's
//! compute, or from a fail-open bypass.

use chrono::{DateTime, Utc};
use std::fmt;

/// Where a read's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadSource {
    /// Served from an unexpired cache entry.
    Hit,
    /// This caller ran the compute function as singleflight leader.
    Computed,
    /// This caller waited on another caller's compute.
    Joined,
    /// The backend was unavailable; the compute ran outside the cache.
    Bypassed,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Computed => "computed",
            Self::Joined => "joined",
            Self::Bypassed => "bypassed",
        }
    }
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a cache read, carrying its source.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
    read_at: DateTime<Utc>,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, source: ReadSource) -> Self {
        Self {
            value,
            source,
            read_at: Utc::now(),
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// When the coordinator produced this result.
    pub fn read_at(&self) -> DateTime<Utc> {
        self.read_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source == ReadSource::Hit
    }

    /// True when this caller's own compute produced the value.
    pub fn was_computed_here(&self) -> bool {
        matches!(self.source, ReadSource::Computed | ReadSource::Bypassed)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            source: self.source,
            read_at: self.read_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
