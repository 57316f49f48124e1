//! Error types for Canopy operations

use crate::{ParentKind, ResourceType};
use std::time::Duration;
use thiserror::Error;

/// Cache-internal errors.
///
/// None of these reach API callers directly: the read path degrades to direct
/// computation and the write path degrades to TTL-bounded staleness.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Failed to serialize value for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Failed to deserialize value for key {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Refusing to store key {key} without tags")]
    UntaggedEntry { key: String },

    #[error("Refusing to store key {key} with a zero TTL")]
    ZeroTtl { key: String },

    #[error("Computation for key {key} was aborted before producing a result")]
    ComputationAborted { key: String },

    #[error("Deadline of {deadline:?} exceeded while reading key {key}")]
    DeadlineExceeded { key: String, deadline: Duration },
}

/// Tag vocabulary errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("Unknown tag name: {name}")]
    UnknownTagName { name: String },

    #[error("Tag name {name} duplicates canonical tag {canonical} for the same relationship")]
    DuplicateRelationship { name: String, canonical: String },

    #[error("Tag name {name} is already registered for a different relationship")]
    NameTaken { name: String },

    #[error("Tag {name} is {expected}, not {got}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Dynamic tag {name} requires a non-empty parameter")]
    EmptyParam { name: String },

    #[error("Malformed tag string: {raw}")]
    Malformed { raw: String },
}

/// Malformed mutation events. These are write-path bugs, not transient faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("{resource_type} mutation is missing required parent {parent}")]
    MissingParent {
        resource_type: ResourceType,
        parent: ParentKind,
    },

    #[error("{resource_type} mutation neither carries {parent} nor declares it detached")]
    UnresolvedParent {
        resource_type: ResourceType,
        parent: ParentKind,
    },

    #[error("{resource_type} mutation has an empty resource id")]
    EmptyResourceId { resource_type: ResourceType },
}

/// Errors raised by the data-store collaborator.
///
/// The coordinator never produces these itself; it carries them through
/// unchanged from the compute function to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{resource_type} not found with id {id}")]
    NotFound {
        resource_type: ResourceType,
        id: String,
    },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Permission denied on {resource_type}")]
    PermissionDenied { resource_type: ResourceType },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Canopy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanopyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Tag error: {0}")]
    Tag(#[from] TagError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CanopyError {
    /// True for errors that mean the cache backend could not be reached.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, CanopyError::Cache(CacheError::BackendUnavailable { .. }))
    }
}

/// Result type alias for Canopy operations.
pub type CanopyResult<T> = Result<T, CanopyError>;

// =============================================================================
// TESTS
// =============================================================================
