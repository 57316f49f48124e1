//! Static fan-out table from resource mutations to cache tags.
//!
//! Each resource type has one rule: its identity tag, the collection tags
//! that list it, and the tags of any other resource's views that embed it.
//! Adding a view that embeds a resource means extending that resource's rule
//! here; the view catalog's coverage test fails until that happens.

use std::collections::BTreeSet;

use canopy_core::{CanopyResult, ParentKind, ResourceMutationEvent, ResourceType};

use crate::tag::Tag;

/// Resolves a mutation event to the set of tags it invalidates.
///
/// Resolution is pure: equal events always resolve to equal tag sets, and no
/// backend is touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationGraph;

impl InvalidationGraph {
    pub fn new() -> Self {
        Self
    }

    /// Parent ids an event of `resource` must carry.
    pub fn required_parents(resource: ResourceType) -> &'static [ParentKind] {
        match resource {
            ResourceType::Grow => &[ParentKind::Organization],
            ResourceType::Indoor => &[ParentKind::User],
            ResourceType::Plant => &[ParentKind::Grow],
            ResourceType::Strain | ResourceType::Product | ResourceType::Task => &[],
        }
    }

    /// Parent ids a resource may lack. An event must either carry each one
    /// or declare the resource detached from it.
    pub fn attachable_parents(resource: ResourceType) -> &'static [ParentKind] {
        match resource {
            ResourceType::Grow => &[ParentKind::User],
            ResourceType::Task => &[ParentKind::Grow],
            _ => &[],
        }
    }

    /// Resolve `event` to its fan-out.
    ///
    /// Fails with `EventError` when the event has no resource id, lacks a
    /// parent id its rule needs, or is silent about an attachable parent.
    pub fn resolve(&self, event: &ResourceMutationEvent) -> CanopyResult<BTreeSet<Tag>> {
        event.validate()?;
        let id = event.resource_id.as_str();
        let mut tags = BTreeSet::new();

        match event.resource_type {
            ResourceType::Grow => {
                let org = event.require_parent(ParentKind::Organization)?;
                tags.insert(Tag::entity(ResourceType::Grow, id));
                tags.insert(Tag::scoped_collection(ResourceType::Grow, ParentKind::Organization, org));
                if let Some(user) = event.optional_parent(ParentKind::User)? {
                    tags.insert(Tag::scoped_collection(ResourceType::Grow, ParentKind::User, user));
                }
            }
            ResourceType::Indoor => {
                let user = event.require_parent(ParentKind::User)?;
                tags.insert(Tag::entity(ResourceType::Indoor, id));
                tags.insert(Tag::scoped_collection(ResourceType::Indoor, ParentKind::User, user));
            }
            ResourceType::Plant => {
                // The grow detail view embeds its plant list.
                let grow = event.require_parent(ParentKind::Grow)?;
                tags.insert(Tag::entity(ResourceType::Plant, id));
                tags.insert(Tag::scoped_collection(ResourceType::Plant, ParentKind::Grow, grow));
                tags.insert(Tag::entity(ResourceType::Grow, grow));
            }
            ResourceType::Strain => {
                tags.insert(Tag::collection(ResourceType::Strain));
                tags.insert(Tag::entity(ResourceType::Strain, id));
            }
            ResourceType::Product => {
                tags.insert(Tag::collection(ResourceType::Product));
                tags.insert(Tag::entity(ResourceType::Product, id));
            }
            ResourceType::Task => {
                tags.insert(Tag::collection(ResourceType::Task));
                tags.insert(Tag::entity(ResourceType::Task, id));
                if let Some(grow) = event.optional_parent(ParentKind::Grow)? {
                    tags.insert(Tag::scoped_collection(ResourceType::Task, ParentKind::Grow, grow));
                }
            }
        }

        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagRegistry;
    use canopy_core::{CanopyError, EventError, MutationOperation};
    use proptest::prelude::*;

    fn encoded(tags: &BTreeSet<Tag>) -> BTreeSet<String> {
        tags.iter().map(Tag::encode).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plant_fan_out_is_exact() {
        let event = ResourceMutationEvent::updated(ResourceType::Plant, "p1")
            .with_parent(ParentKind::Grow, "g1");
        let tags = InvalidationGraph::new().resolve(&event).unwrap();

        assert_eq!(encoded(&tags), set(&["plant:p1", "plants-by-grow:g1", "grow:g1"]));
    }

    #[test]
    fn test_fan_out_table() {
        let graph = InvalidationGraph::new();
        let cases = [
            (
                ResourceMutationEvent::created(ResourceType::Grow, "g1")
                    .with_parent(ParentKind::Organization, "o1")
                    .without_parent(ParentKind::User),
                set(&["grow:g1", "grows-by-org:o1"]),
            ),
            (
                ResourceMutationEvent::updated(ResourceType::Grow, "g1")
                    .with_parent(ParentKind::Organization, "o1")
                    .with_parent(ParentKind::User, "u1"),
                set(&["grow:g1", "grows-by-org:o1", "grows-by-user:u1"]),
            ),
            (
                ResourceMutationEvent::deleted(ResourceType::Indoor, "i1")
                    .with_parent(ParentKind::User, "u1"),
                set(&["indoor:i1", "indoors-by-user:u1"]),
            ),
            (
                ResourceMutationEvent::updated(ResourceType::Strain, "s1"),
                set(&["strains", "strain:s1"]),
            ),
            (
                ResourceMutationEvent::updated(ResourceType::Product, "pr1"),
                set(&["products", "product:pr1"]),
            ),
            (
                ResourceMutationEvent::created(ResourceType::Task, "t1")
                    .with_parent(ParentKind::Grow, "g1"),
                set(&["tasks", "task:t1", "tasks-by-grow:g1"]),
            ),
            (
                ResourceMutationEvent::created(ResourceType::Task, "t2")
                    .without_parent(ParentKind::Grow),
                set(&["tasks", "task:t2"]),
            ),
        ];

        for (event, expected) in cases {
            let tags = graph.resolve(&event).unwrap();
            assert_eq!(encoded(&tags), expected, "fan-out for {:?}", event.resource_type);
        }
    }

    #[test]
    fn test_missing_required_parent_is_rejected() {
        let graph = InvalidationGraph::new();
        for resource in ResourceType::ALL {
            for parent in InvalidationGraph::required_parents(resource) {
                let event = ResourceMutationEvent::updated(resource, "x1");
                let err = graph.resolve(&event).unwrap_err();
                assert_eq!(
                    err,
                    CanopyError::Event(EventError::MissingParent {
                        resource_type: resource,
                        parent: *parent,
                    })
                );
            }
        }
    }

    #[test]
    fn test_silent_attachable_parent_is_rejected() {
        let graph = InvalidationGraph::new();
        let task = ResourceMutationEvent::updated(ResourceType::Task, "t1");
        assert_eq!(
            graph.resolve(&task).unwrap_err(),
            CanopyError::Event(EventError::UnresolvedParent {
                resource_type: ResourceType::Task,
                parent: ParentKind::Grow,
            })
        );

        // A blank grow id is no declaration either.
        let blank = task.with_parent(ParentKind::Grow, " ");
        assert!(graph.resolve(&blank).is_err());

        let grow = ResourceMutationEvent::updated(ResourceType::Grow, "g1")
            .with_parent(ParentKind::Organization, "o1");
        assert!(matches!(
            graph.resolve(&grow).unwrap_err(),
            CanopyError::Event(EventError::UnresolvedParent { parent: ParentKind::User, .. })
        ));
    }

    #[test]
    fn test_blank_parent_counts_as_missing() {
        let event = ResourceMutationEvent::updated(ResourceType::Plant, "p1")
            .with_parent(ParentKind::Grow, "  ");
        assert!(InvalidationGraph::new().resolve(&event).is_err());
    }

    #[test]
    fn test_empty_resource_id_is_rejected() {
        let event = ResourceMutationEvent::updated(ResourceType::Strain, "");
        let err = InvalidationGraph::new().resolve(&event).unwrap_err();
        assert!(matches!(err, CanopyError::Event(EventError::EmptyResourceId { .. })));
    }

    fn arb_resource() -> impl Strategy<Value = ResourceType> {
        prop::sample::select(ResourceType::ALL.to_vec())
    }

    fn arb_operation() -> impl Strategy<Value = MutationOperation> {
        prop_oneof![
            Just(MutationOperation::Create),
            Just(MutationOperation::Update),
            Just(MutationOperation::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_fan_out_contains_identity_and_only_canonical_tags(
            resource in arb_resource(),
            operation in arb_operation(),
            id in "[a-z0-9_]{1,12}",
            parent_id in "[a-z0-9_]{1,12}",
        ) {
            let mut event = ResourceMutationEvent::new(resource, id.clone(), operation);
            for parent in InvalidationGraph::required_parents(resource)
                .iter()
                .chain(InvalidationGraph::attachable_parents(resource))
            {
                event = event.with_parent(*parent, parent_id.clone());
            }

            let graph = InvalidationGraph::new();
            let tags = graph.resolve(&event).unwrap();

            prop_assert!(tags.contains(&Tag::entity(resource, id)));
            for tag in &tags {
                prop_assert!(TagRegistry::standard().is_canonical(tag), "{} not canonical", tag);
            }
            // Operation does not change the fan-out.
            let mut other = event.clone();
            other.operation = MutationOperation::Delete;
            prop_assert_eq!(graph.resolve(&other).unwrap(), tags);
        }
    }
}
