//! Resource vocabulary and mutation events.
//!
//! These are the only facts the coordinator needs about the cultivation
//! domain: which resource classes exist, which foreign keys link them, and
//! what a committed write looks like once the data-store collaborator is done.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;

// ============================================================================
// RESOURCE TYPES
// ============================================================================

/// Resource classes managed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Grow,
    Indoor,
    Plant,
    Strain,
    Product,
    Task,
}

impl ResourceType {
    /// Every resource class, in declaration order.
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Grow,
        ResourceType::Indoor,
        ResourceType::Plant,
        ResourceType::Strain,
        ResourceType::Product,
        ResourceType::Task,
    ];

    /// Singular name used for entity tags (`plant:{id}`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Grow => "grow",
            ResourceType::Indoor => "indoor",
            ResourceType::Plant => "plant",
            ResourceType::Strain => "strain",
            ResourceType::Product => "product",
            ResourceType::Task => "task",
        }
    }

    /// Plural name used for collection tags (`plants`, `plants-by-grow:{id}`).
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceType::Grow => "grows",
            ResourceType::Indoor => "indoors",
            ResourceType::Plant => "plants",
            ResourceType::Strain => "strains",
            ResourceType::Product => "products",
            ResourceType::Task => "tasks",
        }
    }
}

/// Parent relationships that scope a collection.
///
/// Each kind has two spellings: the short segment used inside tag names
/// (`grows-by-org`) and the foreign-key name carried by mutation events
/// (`organizationId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParentKind {
    #[serde(rename = "organizationId")]
    Organization,
    #[serde(rename = "userId")]
    User,
    #[serde(rename = "growId")]
    Grow,
}

impl ParentKind {
    pub const ALL: [ParentKind; 3] = [ParentKind::Organization, ParentKind::User, ParentKind::Grow];

    /// Segment used after `-by-` in scoped collection tag names.
    pub fn tag_segment(&self) -> &'static str {
        match self {
            ParentKind::Organization => "org",
            ParentKind::User => "user",
            ParentKind::Grow => "grow",
        }
    }

    /// Foreign-key name in `ResourceMutationEvent::parent_ids`.
    pub fn id_key(&self) -> &'static str {
        match self {
            ParentKind::Organization => "organizationId",
            ParentKind::User => "userId",
            ParentKind::Grow => "growId",
        }
    }

    pub fn from_tag_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag_segment() == segment)
    }

    pub fn from_id_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id_key() == key)
    }
}

/// Kind of committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

// ============================================================================
// STRING CONVERSIONS
// ============================================================================

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "grow" | "grows" => Ok(ResourceType::Grow),
            "indoor" | "indoors" => Ok(ResourceType::Indoor),
            "plant" | "plants" => Ok(ResourceType::Plant),
            "strain" | "strains" => Ok(ResourceType::Strain),
            "product" | "products" => Ok(ResourceType::Product),
            "task" | "tasks" => Ok(ResourceType::Task),
            _ => Err(format!("unknown resource type: {}", s)),
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id_key())
    }
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        };
        f.write_str(value)
    }
}

impl FromStr for MutationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "create" | "created" | "insert" => Ok(MutationOperation::Create),
            "update" | "updated" => Ok(MutationOperation::Update),
            "delete" | "deleted" | "remove" => Ok(MutationOperation::Delete),
            _ => Err(format!("unknown mutation operation: {}", s)),
        }
    }
}

// ============================================================================
// MUTATION EVENTS
// ============================================================================

/// A committed write, produced by the write path right after the data-store
/// collaborator succeeds and consumed once by the invalidation dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMutationEvent {
    /// Correlation id for logs.
    pub event_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_id: String,
    /// Foreign keys needed to resolve parent-scoped tags.
    pub parent_ids: BTreeMap<ParentKind, String>,
    /// Parents the resource is known not to have, such as a task that
    /// belongs to no grow.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub detached_from: BTreeSet<ParentKind>,
    pub operation: MutationOperation,
    pub occurred_at: DateTime<Utc>,
}

impl ResourceMutationEvent {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        operation: MutationOperation,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            resource_type,
            resource_id: resource_id.into(),
            parent_ids: BTreeMap::new(),
            detached_from: BTreeSet::new(),
            operation,
            occurred_at: Utc::now(),
        }
    }

    pub fn created(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self::new(resource_type, resource_id, MutationOperation::Create)
    }

    pub fn updated(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self::new(resource_type, resource_id, MutationOperation::Update)
    }

    pub fn deleted(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self::new(resource_type, resource_id, MutationOperation::Delete)
    }

    /// Attach a foreign key.
    pub fn with_parent(mut self, kind: ParentKind, id: impl Into<String>) -> Self {
        self.detached_from.remove(&kind);
        self.parent_ids.insert(kind, id.into());
        self
    }

    /// Declare that the resource has no `kind` parent.
    pub fn without_parent(mut self, kind: ParentKind) -> Self {
        self.parent_ids.remove(&kind);
        self.detached_from.insert(kind);
        self
    }

    pub fn is_detached(&self, kind: ParentKind) -> bool {
        self.detached_from.contains(&kind)
    }

    /// Look up a foreign key; blank values count as absent.
    pub fn parent(&self, kind: ParentKind) -> Option<&str> {
        self.parent_ids
            .get(&kind)
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }

    /// Look up a foreign key the resource cannot exist without.
    pub fn require_parent(&self, kind: ParentKind) -> Result<&str, EventError> {
        self.parent(kind).ok_or(EventError::MissingParent {
            resource_type: self.resource_type,
            parent: kind,
        })
    }

    /// Look up a foreign key the resource may lack. The event must either
    /// carry it or declare the resource detached from it; silence is an error.
    pub fn optional_parent(&self, kind: ParentKind) -> Result<Option<&str>, EventError> {
        match self.parent(kind) {
            Some(id) => Ok(Some(id)),
            None if self.is_detached(kind) => Ok(None),
            None => Err(EventError::UnresolvedParent {
                resource_type: self.resource_type,
                parent: kind,
            }),
        }
    }

    /// Check the event is addressable at all.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.resource_id.trim().is_empty() {
            return Err(EventError::EmptyResourceId {
                resource_type: self.resource_type,
            });
        }
        Ok(())
    }
}
