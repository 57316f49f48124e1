//! Canopy Test Utilities
//!
//! Shared test infrastructure for the Canopy workspace:
//! - Fault-injecting cache backend
//! - In-memory data-store collaborator that counts reads
//! - Proptest generators for events and tags
//! - Fixtures and assertions for common scenarios

pub use canopy_cache::{
    CacheBackend, CacheEntry, CacheStats, FillOutcome, FillToken, InMemoryCacheBackend, Tag,
};
pub use canopy_core::{
    CacheError, CanopyError, CanopyResult, MutationOperation, ParentKind, ResourceMutationEvent,
    ResourceType, StorageError,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// FAULT-INJECTING BACKEND
// ============================================================================

/// Wraps a backend and fails selected calls with `BackendUnavailable`.
#[derive(Debug)]
pub struct FlakyBackend<B> {
    inner: B,
    failing_invalidations: AtomicU32,
    unavailable: AtomicBool,
    invalidation_calls: AtomicU64,
}

impl<B: CacheBackend> FlakyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            failing_invalidations: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            invalidation_calls: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Fail the next `count` invalidation calls, whatever their tag.
    pub fn fail_next_invalidations(&self, count: u32) {
        self.failing_invalidations.store(count, Ordering::SeqCst);
    }

    /// Fail every call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Invalidation calls seen, failed ones included.
    pub fn invalidation_calls(&self) -> u64 {
        self.invalidation_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> CanopyResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("backend switched off"));
        }
        Ok(())
    }
}

impl FlakyBackend<InMemoryCacheBackend> {
    pub fn in_memory() -> Self {
        Self::new(InMemoryCacheBackend::new())
    }
}

fn unavailable(reason: &str) -> CanopyError {
    CacheError::BackendUnavailable {
        reason: reason.to_string(),
    }
    .into()
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for FlakyBackend<B> {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> CanopyResult<Option<Vec<u8>>> {
        self.check_available()?;
        self.inner.get(key).await
    }

    async fn fill_token(&self, tags: &BTreeSet<Tag>) -> CanopyResult<FillToken> {
        self.check_available()?;
        self.inner.fill_token(tags).await
    }

    async fn set(&self, entry: CacheEntry, token: &FillToken) -> CanopyResult<FillOutcome> {
        self.check_available()?;
        self.inner.set(entry, token).await
    }

    async fn invalidate_tag(&self, tag: &Tag) -> CanopyResult<u64> {
        self.invalidation_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let injected = self
            .failing_invalidations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(unavailable("injected invalidation failure"));
        }
        self.inner.invalidate_tag(tag).await
    }

    async fn stats(&self) -> CanopyResult<CacheStats> {
        self.check_available()?;
        self.inner.stats().await
    }
}

// ============================================================================
// DATA-STORE COLLABORATOR
// ============================================================================

/// A row in the fake relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub resource_type: ResourceType,
    pub id: String,
    pub name: String,
    pub parent_ids: BTreeMap<ParentKind, String>,
    pub version: u64,
}

impl StoredRecord {
    pub fn parent(&self, kind: ParentKind) -> Option<&str> {
        self.parent_ids.get(&kind).map(String::as_str)
    }
}

/// In-memory stand-in for the data-store collaborator.
///
/// Writes return the mutation event the write path would hand to the
/// dispatcher. Reads count themselves and optionally sleep, so tests can
/// observe how often the cache falls through.
#[derive(Debug, Default)]
pub struct MockDataStore {
    rows: Mutex<BTreeMap<(ResourceType, String), StoredRecord>>,
    reads: AtomicU64,
    latency: Option<Duration>,
}

impl MockDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read sleep for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reset_reads(&self) {
        self.reads.store(0, Ordering::SeqCst);
    }

    /// Insert a row and return its `Create` event.
    pub fn create(
        &self,
        resource_type: ResourceType,
        id: &str,
        name: &str,
        parents: &[(ParentKind, &str)],
    ) -> CanopyResult<ResourceMutationEvent> {
        let parent_ids: BTreeMap<ParentKind, String> = parents
            .iter()
            .map(|(kind, value)| (*kind, value.to_string()))
            .collect();
        let record = StoredRecord {
            resource_type,
            id: id.to_string(),
            name: name.to_string(),
            parent_ids: parent_ids.clone(),
            version: 1,
        };
        self.lock()?.insert((resource_type, id.to_string()), record);

        Ok(with_row_parents(ResourceMutationEvent::created(resource_type, id), &parent_ids))
    }

    /// Rename a row and return its `Update` event.
    pub fn rename(
        &self,
        resource_type: ResourceType,
        id: &str,
        name: &str,
    ) -> CanopyResult<ResourceMutationEvent> {
        let mut rows = self.lock()?;
        let record = rows
            .get_mut(&(resource_type, id.to_string()))
            .ok_or_else(|| not_found(resource_type, id))?;
        record.name = name.to_string();
        record.version += 1;

        Ok(with_row_parents(
            ResourceMutationEvent::updated(resource_type, id),
            &record.parent_ids,
        ))
    }

    /// Remove a row and return its `Delete` event.
    pub fn delete(&self, resource_type: ResourceType, id: &str) -> CanopyResult<ResourceMutationEvent> {
        let record = self
            .lock()?
            .remove(&(resource_type, id.to_string()))
            .ok_or_else(|| not_found(resource_type, id))?;

        Ok(with_row_parents(
            ResourceMutationEvent::deleted(resource_type, id),
            &record.parent_ids,
        ))
    }

    pub async fn get(&self, resource_type: ResourceType, id: &str) -> CanopyResult<StoredRecord> {
        let row = self.lock()?.get(&(resource_type, id.to_string())).cloned();
        self.deliver().await;
        row.ok_or_else(|| not_found(resource_type, id))
    }

    pub async fn list(&self, resource_type: ResourceType) -> CanopyResult<Vec<StoredRecord>> {
        let rows = self.select(|r| r.resource_type == resource_type)?;
        self.deliver().await;
        Ok(rows)
    }

    pub async fn list_by_parent(
        &self,
        resource_type: ResourceType,
        parent: ParentKind,
        parent_id: &str,
    ) -> CanopyResult<Vec<StoredRecord>> {
        let rows =
            self.select(|r| r.resource_type == resource_type && r.parent(parent) == Some(parent_id))?;
        self.deliver().await;
        Ok(rows)
    }

    fn select(&self, filter: impl Fn(&StoredRecord) -> bool) -> CanopyResult<Vec<StoredRecord>> {
        Ok(self.lock()?.values().filter(|r| filter(r)).cloned().collect())
    }

    // Rows are read when the query starts; the latency applies to delivery.
    async fn deliver(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lock(
        &self,
    ) -> CanopyResult<std::sync::MutexGuard<'_, BTreeMap<(ResourceType, String), StoredRecord>>> {
        self.rows.lock().map_err(|_| {
            StorageError::QueryFailed {
                reason: "store lock poisoned".to_string(),
            }
            .into()
        })
    }
}

// A row knows all of its foreign keys, so a missing one means detached.
fn with_row_parents(
    mut event: ResourceMutationEvent,
    parent_ids: &BTreeMap<ParentKind, String>,
) -> ResourceMutationEvent {
    for kind in ParentKind::ALL {
        event = match parent_ids.get(&kind) {
            Some(id) => event.with_parent(kind, id.clone()),
            None => event.without_parent(kind),
        };
    }
    event
}

fn not_found(resource_type: ResourceType, id: &str) -> CanopyError {
    StorageError::NotFound {
        resource_type,
        id: id.to_string(),
    }
    .into()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Canopy types.

    use super::*;
    use proptest::prelude::*;

    /// Generate an id in the shape the stores hand out.
    pub fn arb_id() -> impl Strategy<Value = String> {
        "[a-z]{1,3}_[a-z0-9]{1,10}"
    }

    pub fn arb_resource_type() -> impl Strategy<Value = ResourceType> {
        prop::sample::select(ResourceType::ALL.to_vec())
    }

    pub fn arb_operation() -> impl Strategy<Value = MutationOperation> {
        prop_oneof![
            Just(MutationOperation::Create),
            Just(MutationOperation::Update),
            Just(MutationOperation::Delete),
        ]
    }

    /// Generate an event carrying every parent id, for any resource.
    pub fn arb_event() -> impl Strategy<Value = ResourceMutationEvent> {
        (
            arb_resource_type(),
            arb_id(),
            arb_operation(),
            (arb_id(), arb_id(), arb_id()),
        )
            .prop_map(|(resource, id, operation, (org, user, grow))| {
                ResourceMutationEvent::new(resource, id, operation)
                    .with_parent(ParentKind::Organization, org)
                    .with_parent(ParentKind::User, user)
                    .with_parent(ParentKind::Grow, grow)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built events for common scenarios.

    use super::*;

    pub fn grow_created(id: &str, organization_id: &str) -> ResourceMutationEvent {
        ResourceMutationEvent::created(ResourceType::Grow, id)
            .with_parent(ParentKind::Organization, organization_id)
            .without_parent(ParentKind::User)
    }

    pub fn indoor_updated(id: &str, user_id: &str) -> ResourceMutationEvent {
        ResourceMutationEvent::updated(ResourceType::Indoor, id).with_parent(ParentKind::User, user_id)
    }

    pub fn plant_updated(id: &str, grow_id: &str) -> ResourceMutationEvent {
        ResourceMutationEvent::updated(ResourceType::Plant, id).with_parent(ParentKind::Grow, grow_id)
    }

    pub fn product_updated(id: &str) -> ResourceMutationEvent {
        ResourceMutationEvent::updated(ResourceType::Product, id)
    }

    pub fn task_created(id: &str, grow_id: Option<&str>) -> ResourceMutationEvent {
        let event = ResourceMutationEvent::created(ResourceType::Task, id);
        match grow_id {
            Some(grow) => event.with_parent(ParentKind::Grow, grow),
            None => event.without_parent(ParentKind::Grow),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for fan-outs and error variants.

    use super::*;

    /// Assert a tag set, or the strings a report carries, encodes to exactly `expected`.
    #[track_caller]
    pub fn assert_tags<I>(tags: I, expected: &[&str])
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        let got: BTreeSet<String> = tags.into_iter().map(|tag| tag.to_string()).collect();
        let want: BTreeSet<String> = expected.iter().map(|s| s.to_string()).collect();
        assert_eq!(got, want, "tag set mismatch");
    }

    /// Assert a result is a `BackendUnavailable` cache error.
    #[track_caller]
    pub fn assert_backend_unavailable<T: std::fmt::Debug>(result: &CanopyResult<T>) {
        match result {
            Err(e) if e.is_backend_unavailable() => {}
            other => panic!("Expected BackendUnavailable, got: {:?}", other),
        }
    }

    /// Assert a result is a storage error from the data store.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &CanopyResult<T>) {
        match result {
            Err(CanopyError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_backend_fails_then_recovers() {
        let backend = FlakyBackend::in_memory();
        backend.fail_next_invalidations(2);
        let tag = Tag::collection(ResourceType::Strain);

        assert!(backend.invalidate_tag(&tag).await.is_err());
        assert!(backend.invalidate_tag(&tag).await.is_err());
        assert!(backend.invalidate_tag(&tag).await.is_ok());
        assert_eq!(backend.invalidation_calls(), 3);
    }

    #[tokio::test]
    async fn test_store_round_trip_and_read_count() {
        let store = MockDataStore::new();
        let event = store
            .create(ResourceType::Plant, "p1", "Blue Dream", &[(ParentKind::Grow, "g1")])
            .unwrap();
        assert_eq!(event.parent(ParentKind::Grow), Some("g1"));
        assert!(event.is_detached(ParentKind::User));

        store.rename(ResourceType::Plant, "p1", "Blue Dream #2").unwrap();
        let record = store.get(ResourceType::Plant, "p1").await.unwrap();
        assert_eq!(record.version, 2);

        let plants = store
            .list_by_parent(ResourceType::Plant, ParentKind::Grow, "g1")
            .await
            .unwrap();
        assert_eq!(plants.len(), 1);
        assert_eq!(store.reads(), 2);

        let missing = store.get(ResourceType::Plant, "p2").await;
        assertions::assert_storage_error(&missing);
    }
}
