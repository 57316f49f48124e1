//! Cached read views.
//!
//! Every endpoint that serves a cached read names one of these views. A view
//! fixes the cache key, the tags the entry is stored under, the TTL class,
//! and the resource types whose rows appear in its payload. The coverage
//! test at the bottom of this file checks that a mutation of any embedded
//! resource reaches the view through the invalidation graph.

use std::collections::BTreeSet;
use std::fmt;

use canopy_cache::Tag;
use canopy_core::{ParentKind, ResourceType};
use serde::{Deserialize, Serialize};

/// The catalog of cached views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewKind {
    GrowDetail,
    GrowsByOrg,
    GrowsByUser,
    IndoorDetail,
    IndoorsByUser,
    PlantDetail,
    PlantsByGrow,
    StrainList,
    StrainDetail,
    ProductList,
    ProductDetail,
    TaskList,
    TaskDetail,
    TasksByGrow,
}

impl ViewKind {
    pub const ALL: [ViewKind; 14] = [
        ViewKind::GrowDetail,
        ViewKind::GrowsByOrg,
        ViewKind::GrowsByUser,
        ViewKind::IndoorDetail,
        ViewKind::IndoorsByUser,
        ViewKind::PlantDetail,
        ViewKind::PlantsByGrow,
        ViewKind::StrainList,
        ViewKind::StrainDetail,
        ViewKind::ProductList,
        ViewKind::ProductDetail,
        ViewKind::TaskList,
        ViewKind::TaskDetail,
        ViewKind::TasksByGrow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::GrowDetail => "grow-detail",
            ViewKind::GrowsByOrg => "grows-by-org",
            ViewKind::GrowsByUser => "grows-by-user",
            ViewKind::IndoorDetail => "indoor-detail",
            ViewKind::IndoorsByUser => "indoors-by-user",
            ViewKind::PlantDetail => "plant-detail",
            ViewKind::PlantsByGrow => "plants-by-grow",
            ViewKind::StrainList => "strain-list",
            ViewKind::StrainDetail => "strain-detail",
            ViewKind::ProductList => "product-list",
            ViewKind::ProductDetail => "product-detail",
            ViewKind::TaskList => "task-list",
            ViewKind::TaskDetail => "task-detail",
            ViewKind::TasksByGrow => "tasks-by-grow",
        }
    }

    /// True for views addressed by an id or parent id.
    pub fn is_parameterized(&self) -> bool {
        !matches!(
            self,
            ViewKind::StrainList | ViewKind::ProductList | ViewKind::TaskList
        )
    }

    /// Resource whose TTL bounds this view's staleness.
    pub fn ttl_class(&self) -> ResourceType {
        match self {
            ViewKind::GrowDetail | ViewKind::GrowsByOrg | ViewKind::GrowsByUser => ResourceType::Grow,
            ViewKind::IndoorDetail | ViewKind::IndoorsByUser => ResourceType::Indoor,
            ViewKind::PlantDetail | ViewKind::PlantsByGrow => ResourceType::Plant,
            ViewKind::StrainList | ViewKind::StrainDetail => ResourceType::Strain,
            ViewKind::ProductList | ViewKind::ProductDetail => ResourceType::Product,
            ViewKind::TaskList | ViewKind::TaskDetail | ViewKind::TasksByGrow => ResourceType::Task,
        }
    }

    /// Resource types whose rows appear in the payload.
    pub fn embeds(&self) -> &'static [ResourceType] {
        match self {
            // The grow page lists its plants.
            ViewKind::GrowDetail => &[ResourceType::Grow, ResourceType::Plant],
            ViewKind::GrowsByOrg | ViewKind::GrowsByUser => &[ResourceType::Grow],
            ViewKind::IndoorDetail | ViewKind::IndoorsByUser => &[ResourceType::Indoor],
            ViewKind::PlantDetail | ViewKind::PlantsByGrow => &[ResourceType::Plant],
            ViewKind::StrainList | ViewKind::StrainDetail => &[ResourceType::Strain],
            ViewKind::ProductList | ViewKind::ProductDetail => &[ResourceType::Product],
            ViewKind::TaskList | ViewKind::TaskDetail | ViewKind::TasksByGrow => &[ResourceType::Task],
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable cached view: a kind plus its id, if it takes one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachedView {
    kind: ViewKind,
    param: Option<String>,
}

impl CachedView {
    fn with_param(kind: ViewKind, param: impl Into<String>) -> Self {
        Self {
            kind,
            param: Some(param.into()),
        }
    }

    fn global(kind: ViewKind) -> Self {
        Self { kind, param: None }
    }

    pub fn grow_detail(grow_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::GrowDetail, grow_id)
    }

    pub fn grows_by_org(organization_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::GrowsByOrg, organization_id)
    }

    pub fn grows_by_user(user_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::GrowsByUser, user_id)
    }

    pub fn indoor_detail(indoor_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::IndoorDetail, indoor_id)
    }

    pub fn indoors_by_user(user_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::IndoorsByUser, user_id)
    }

    pub fn plant_detail(plant_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::PlantDetail, plant_id)
    }

    pub fn plants_by_grow(grow_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::PlantsByGrow, grow_id)
    }

    pub fn strain_list() -> Self {
        Self::global(ViewKind::StrainList)
    }

    pub fn strain_detail(strain_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::StrainDetail, strain_id)
    }

    pub fn product_list() -> Self {
        Self::global(ViewKind::ProductList)
    }

    pub fn product_detail(product_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::ProductDetail, product_id)
    }

    pub fn task_list() -> Self {
        Self::global(ViewKind::TaskList)
    }

    pub fn task_detail(task_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::TaskDetail, task_id)
    }

    pub fn tasks_by_grow(grow_id: impl Into<String>) -> Self {
        Self::with_param(ViewKind::TasksByGrow, grow_id)
    }

    /// Build any view from its kind and id. Global views ignore `param`.
    pub fn of(kind: ViewKind, param: &str) -> Self {
        if kind.is_parameterized() {
            Self::with_param(kind, param)
        } else {
            Self::global(kind)
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn param(&self) -> Option<&str> {
        self.param.as_deref()
    }

    /// Cache key: `{kind}` or `{kind}:{param}`.
    pub fn key(&self) -> String {
        match &self.param {
            Some(param) => format!("{}:{}", self.kind, param),
            None => self.kind.to_string(),
        }
    }

    /// Tags the entry is stored under.
    pub fn tags(&self) -> BTreeSet<Tag> {
        let param = self.param.clone().unwrap_or_default();
        let tag = match self.kind {
            ViewKind::GrowDetail => Tag::entity(ResourceType::Grow, param),
            ViewKind::GrowsByOrg => {
                Tag::scoped_collection(ResourceType::Grow, ParentKind::Organization, param)
            }
            ViewKind::GrowsByUser => Tag::scoped_collection(ResourceType::Grow, ParentKind::User, param),
            ViewKind::IndoorDetail => Tag::entity(ResourceType::Indoor, param),
            ViewKind::IndoorsByUser => {
                Tag::scoped_collection(ResourceType::Indoor, ParentKind::User, param)
            }
            ViewKind::PlantDetail => Tag::entity(ResourceType::Plant, param),
            ViewKind::PlantsByGrow => Tag::scoped_collection(ResourceType::Plant, ParentKind::Grow, param),
            ViewKind::StrainList => Tag::collection(ResourceType::Strain),
            ViewKind::StrainDetail => Tag::entity(ResourceType::Strain, param),
            ViewKind::ProductList => Tag::collection(ResourceType::Product),
            ViewKind::ProductDetail => Tag::entity(ResourceType::Product, param),
            ViewKind::TaskList => Tag::collection(ResourceType::Task),
            ViewKind::TaskDetail => Tag::entity(ResourceType::Task, param),
            ViewKind::TasksByGrow => Tag::scoped_collection(ResourceType::Task, ParentKind::Grow, param),
        };
        BTreeSet::from([tag])
    }

    pub fn ttl_class(&self) -> ResourceType {
        self.kind.ttl_class()
    }

    pub fn embeds(&self) -> &'static [ResourceType] {
        self.kind.embeds()
    }
}

impl fmt::Display for CachedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
