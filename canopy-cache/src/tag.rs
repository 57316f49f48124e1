//! Cache tag vocabulary and canonical encoding.
//!
//! A [`Tag`] is plain data: a kind, a name and an optional parameter. Tags
//! built from a [`Relationship`] derive their name from the relationship
//! itself, so one relationship can only ever be spelled one way:
//!
//! | Relationship | Canonical string |
//! |---|---|
//! | `Entity(Plant)` | `plant:{id}` |
//! | `Collection(Strain)` | `strains` |
//! | `CollectionBy(Grow, Organization)` | `grows-by-org:{organizationId}` |
//!
//! Raw names (legacy spellings, log lines, debugging input) go through the
//! [`TagRegistry`], which maps known aliases onto the canonical name and
//! rejects anything it does not know.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use canopy_core::{ParentKind, ResourceType, TagError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Separator between a dynamic tag's name and its parameter.
const PARAM_SEPARATOR: char = ':';

/// Whether a tag carries a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TagKind {
    Static,
    Dynamic,
}

impl TagKind {
    fn as_str(&self) -> &'static str {
        match self {
            TagKind::Static => "static",
            TagKind::Dynamic => "dynamic",
        }
    }
}

/// A cache tag, the unit of invalidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    kind: TagKind,
    name: String,
    param: Option<String>,
}

impl Tag {
    /// A parameterless tag such as `strains`.
    ///
    /// The raw constructors do not check `name`. A name containing `:` would
    /// encode like a dynamic tag; [`Tag::validate`] rejects it, and the reader
    /// refuses to store entries under such a tag.
    pub fn static_tag(name: impl Into<String>) -> Self {
        Self {
            kind: TagKind::Static,
            name: name.into(),
            param: None,
        }
    }

    /// A parameterized tag such as `grows-by-org:org_123`.
    pub fn dynamic(name: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            kind: TagKind::Dynamic,
            name: name.into(),
            param: Some(param.into()),
        }
    }

    /// Identity tag of a single entity: `{resource}:{id}`.
    pub fn entity(resource: ResourceType, id: impl Into<String>) -> Self {
        Self::dynamic(Relationship::Entity(resource).canonical_name(), id)
    }

    /// Global collection tag: `{resource}s`.
    pub fn collection(resource: ResourceType) -> Self {
        Self::static_tag(Relationship::Collection(resource).canonical_name())
    }

    /// Parent-scoped collection tag: `{resource}s-by-{parentKind}:{parentId}`.
    pub fn scoped_collection(
        resource: ResourceType,
        parent: ParentKind,
        parent_id: impl Into<String>,
    ) -> Self {
        Self::dynamic(
            Relationship::CollectionBy(resource, parent).canonical_name(),
            parent_id,
        )
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }

    /// Canonical string: `name` for static tags, `name:param` for dynamic ones.
    pub fn encode(&self) -> String {
        match &self.param {
            Some(param) => format!("{}{}{}", self.name, PARAM_SEPARATOR, param),
            None => self.name.clone(),
        }
    }

    /// Check that the tag survives an encode/parse round trip: a non-empty
    /// name without `:`, and a non-empty param on dynamic tags.
    pub fn validate(&self) -> Result<(), TagError> {
        if self.name.is_empty() || self.name.contains(PARAM_SEPARATOR) {
            return Err(TagError::Malformed { raw: self.encode() });
        }
        match &self.param {
            Some(param) if param.is_empty() => Err(TagError::EmptyParam {
                name: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Decode a canonical string. Everything after the first `:` is the param.
    pub fn parse(raw: &str) -> Result<Self, TagError> {
        match raw.split_once(PARAM_SEPARATOR) {
            Some((name, _)) if name.is_empty() => Err(TagError::Malformed {
                raw: raw.to_string(),
            }),
            Some((name, "")) => Err(TagError::EmptyParam {
                name: name.to_string(),
            }),
            Some((name, param)) => Ok(Self::dynamic(name, param)),
            None if raw.is_empty() => Err(TagError::Malformed {
                raw: raw.to_string(),
            }),
            None => Ok(Self::static_tag(raw)),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}{}{}", self.name, PARAM_SEPARATOR, param),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::parse(s)
    }
}

// ============================================================================
// RELATIONSHIPS
// ============================================================================

/// What a tag describes. Each relationship has exactly one canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    /// A single entity's own view.
    Entity(ResourceType),
    /// The global list of a resource.
    Collection(ResourceType),
    /// The list of a resource owned by one parent.
    CollectionBy(ResourceType, ParentKind),
}

impl Relationship {
    pub fn canonical_name(&self) -> String {
        match self {
            Relationship::Entity(resource) => resource.as_str().to_string(),
            Relationship::Collection(resource) => resource.plural().to_string(),
            Relationship::CollectionBy(resource, parent) => {
                format!("{}-by-{}", resource.plural(), parent.tag_segment())
            }
        }
    }

    pub fn kind(&self) -> TagKind {
        match self {
            Relationship::Collection(_) => TagKind::Static,
            Relationship::Entity(_) | Relationship::CollectionBy(..) => TagKind::Dynamic,
        }
    }

    /// The resource whose rows make up the tagged view.
    pub fn resource(&self) -> ResourceType {
        match self {
            Relationship::Entity(resource)
            | Relationship::Collection(resource)
            | Relationship::CollectionBy(resource, _) => *resource,
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Known tag names, one canonical name per relationship plus declared aliases.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    relationships: HashMap<String, Relationship>,
    canonical: HashMap<Relationship, String>,
    aliases: HashMap<String, String>,
}

static STANDARD: Lazy<TagRegistry> = Lazy::new(TagRegistry::build_standard);

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry describing every tag the invalidation graph and the view
    /// catalog emit. Immutable after first use.
    pub fn standard() -> &'static TagRegistry {
        &STANDARD
    }

    fn build_standard() -> Self {
        let mut registry = Self::new();
        for resource in ResourceType::ALL {
            registry.insert(Relationship::Entity(resource));
            registry.insert(Relationship::Collection(resource));
        }

        let scoped = [
            (ResourceType::Grow, ParentKind::Organization),
            (ResourceType::Grow, ParentKind::User),
            (ResourceType::Indoor, ParentKind::User),
            (ResourceType::Plant, ParentKind::Grow),
            (ResourceType::Task, ParentKind::Grow),
        ];
        for (resource, parent) in scoped {
            let relationship = Relationship::CollectionBy(resource, parent);
            registry.insert(relationship);
            // Singular spellings like `grow-by-user` were used interchangeably
            // with the plural ones; they resolve to the same tag.
            let singular = format!("{}-by-{}", resource.as_str(), parent.tag_segment());
            registry.aliases.insert(singular, relationship.canonical_name());
        }
        registry
    }

    fn insert(&mut self, relationship: Relationship) {
        let name = relationship.canonical_name();
        self.relationships.insert(name.clone(), relationship);
        self.canonical.insert(relationship, name);
    }

    /// Register `name` as the tag for `relationship`.
    ///
    /// Re-registering the same pair is a no-op. A name that is not the
    /// relationship's canonical spelling, or a relationship that already has
    /// a name, is rejected.
    pub fn register(&mut self, name: &str, relationship: Relationship) -> Result<(), TagError> {
        let canonical = relationship.canonical_name();

        if let Some(existing) = self.relationships.get(name) {
            return if *existing == relationship {
                Ok(())
            } else {
                Err(TagError::NameTaken {
                    name: name.to_string(),
                })
            };
        }

        if name != canonical || self.canonical.contains_key(&relationship) {
            return Err(TagError::DuplicateRelationship {
                name: name.to_string(),
                canonical,
            });
        }

        if self.aliases.contains_key(name) {
            return Err(TagError::NameTaken {
                name: name.to_string(),
            });
        }

        self.insert(relationship);
        Ok(())
    }

    /// Accept `alias` as another spelling of an already-registered relationship.
    pub fn register_alias(&mut self, alias: &str, relationship: Relationship) -> Result<(), TagError> {
        let canonical = self
            .canonical
            .get(&relationship)
            .cloned()
            .ok_or_else(|| TagError::UnknownTagName {
                name: relationship.canonical_name(),
            })?;

        if self.relationships.contains_key(alias) {
            return Err(TagError::NameTaken {
                name: alias.to_string(),
            });
        }
        match self.aliases.get(alias) {
            Some(existing) if *existing != canonical => Err(TagError::NameTaken {
                name: alias.to_string(),
            }),
            _ => {
                self.aliases.insert(alias.to_string(), canonical);
                Ok(())
            }
        }
    }

    /// Resolve a name or alias to its canonical spelling.
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> Result<&'a str, TagError> {
        if self.relationships.contains_key(name) {
            return Ok(name);
        }
        self.aliases
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| TagError::UnknownTagName {
                name: name.to_string(),
            })
    }

    /// Relationship behind a name or alias.
    pub fn relationship(&self, name: &str) -> Option<Relationship> {
        let canonical = self.canonical_name(name).ok()?;
        self.relationships.get(canonical).copied()
    }

    /// Validated `Static(name)`.
    pub fn static_tag(&self, name: &str) -> Result<Tag, TagError> {
        self.normalize(&Tag::static_tag(name))
    }

    /// Validated `Dynamic(name, param)`.
    pub fn dynamic_tag(&self, name: &str, param: &str) -> Result<Tag, TagError> {
        self.normalize(&Tag::dynamic(name, param))
    }

    /// Rewrite a tag to its canonical name, checking kind and param.
    pub fn normalize(&self, tag: &Tag) -> Result<Tag, TagError> {
        let canonical = self.canonical_name(tag.name())?;
        let relationship = self.relationships.get(canonical).copied().ok_or_else(|| {
            TagError::UnknownTagName {
                name: tag.name().to_string(),
            }
        })?;

        if relationship.kind() != tag.kind() {
            return Err(TagError::KindMismatch {
                name: canonical.to_string(),
                expected: relationship.kind().as_str(),
                got: tag.kind().as_str(),
            });
        }

        match tag.param() {
            Some(param) if param.trim().is_empty() => Err(TagError::EmptyParam {
                name: canonical.to_string(),
            }),
            Some(param) => Ok(Tag::dynamic(canonical, param)),
            None => Ok(Tag::static_tag(canonical)),
        }
    }

    /// True when the tag already uses its canonical spelling and shape.
    pub fn is_canonical(&self, tag: &Tag) -> bool {
        self.normalize(tag).map(|n| n == *tag).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }
}
