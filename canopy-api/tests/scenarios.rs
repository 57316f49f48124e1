//! End-to-end cache scenarios: data store, views, reads and mutation fan-out.

use std::sync::Arc;
use std::time::Duration;

use canopy_api::{AppState, BackendKind, CacheSettings, CachedView};
use canopy_cache::{CacheRead, ReadSource};
use canopy_test_utils::assertions::{assert_backend_unavailable, assert_tags};
use canopy_test_utils::fixtures;
use canopy_test_utils::{
    CacheBackend, FlakyBackend, MockDataStore, ParentKind, ResourceType, StoredRecord,
};

fn memory_state() -> AppState {
    AppState::from_settings(CacheSettings::default()).unwrap()
}

fn names(records: &[StoredRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

#[tokio::test]
async fn test_created_grow_appears_in_org_list() {
    let state = memory_state();
    let store = MockDataStore::new();
    store
        .create(ResourceType::Grow, "g1", "Tent A", &[(ParentKind::Organization, "o1")])
        .unwrap();
    let view = CachedView::grows_by_org("o1");

    let first: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || {
            store.list_by_parent(ResourceType::Grow, ParentKind::Organization, "o1")
        })
        .await
        .unwrap();
    assert_eq!(names(first.value()), vec!["Tent A"]);

    let event = store
        .create(ResourceType::Grow, "g2", "Tent B", &[(ParentKind::Organization, "o1")])
        .unwrap();
    let report = state.cache.record_mutation(&event).await.unwrap();
    assert!(report.tags.contains("grows-by-org:o1"));
    assert!(report.is_complete());

    let second: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || {
            store.list_by_parent(ResourceType::Grow, ParentKind::Organization, "o1")
        })
        .await
        .unwrap();
    assert_eq!(second.source(), ReadSource::Computed);
    assert_eq!(names(second.value()), vec!["Tent A", "Tent B"]);
    assert_eq!(store.reads(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_readers_after_update_compute_once() {
    let state = memory_state();
    let store = Arc::new(MockDataStore::new().with_latency(Duration::from_millis(50)));
    store.create(ResourceType::Product, "pr1", "Neem Oil", &[]).unwrap();
    let view = CachedView::product_list();

    let _: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list(ResourceType::Product))
        .await
        .unwrap();

    let event = store.rename(ResourceType::Product, "pr1", "Neem Oil 2L").unwrap();
    state.cache.record_mutation(&event).await.unwrap();
    store.reset_reads();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = state.cache.clone();
        let store = store.clone();
        let view = view.clone();
        handles.push(tokio::spawn(async move {
            cache
                .read::<Vec<StoredRecord>, _, _>(&view, || async move {
                    store.list(ResourceType::Product).await
                })
                .await
        }));
    }

    let mut computed = 0;
    for handle in handles {
        let read = handle.await.unwrap().unwrap();
        if read.was_computed_here() {
            computed += 1;
        }
        assert_eq!(names(read.value()), vec!["Neem Oil 2L"]);
    }
    assert_eq!(computed, 1);
    assert_eq!(store.reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_after_write_skips_inflight_stale_compute() {
    let state = memory_state();
    let store = Arc::new(MockDataStore::new().with_latency(Duration::from_millis(100)));
    store
        .create(ResourceType::Plant, "p1", "Seedling", &[(ParentKind::Grow, "g1")])
        .unwrap();
    let view = CachedView::plant_detail("p1");

    // A slow read starts against the old row.
    let stale = {
        let cache = state.cache.clone();
        let store = store.clone();
        let view = view.clone();
        tokio::spawn(async move {
            cache
                .read::<StoredRecord, _, _>(&view, || async move {
                    store.get(ResourceType::Plant, "p1").await
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The write commits while that compute is still running, then a fresh read follows.
    let event = store.rename(ResourceType::Plant, "p1", "Vegetative").unwrap();
    state.cache.record_mutation(&event).await.unwrap();

    let fresh: CacheRead<StoredRecord> = state
        .cache
        .read(&view, || store.get(ResourceType::Plant, "p1"))
        .await
        .unwrap();
    assert_ne!(fresh.source(), ReadSource::Joined);
    assert_eq!(fresh.value().name, "Vegetative");

    let stale = stale.await.unwrap().unwrap();
    assert_eq!(stale.value().name, "Seedling");

    let later: CacheRead<StoredRecord> = state
        .cache
        .read(&view, || store.get(ResourceType::Plant, "p1"))
        .await
        .unwrap();
    assert_eq!(later.source(), ReadSource::Hit);
    assert_eq!(later.value().name, "Vegetative");
}

#[tokio::test]
async fn test_unavailable_backend_fails_open() {
    let flaky = Arc::new(FlakyBackend::in_memory());
    let backend: Arc<dyn CacheBackend> = flaky.clone();
    let state = AppState::with_backend(backend, CacheSettings::default());
    let store = MockDataStore::new();
    store.create(ResourceType::Strain, "s1", "Blue Dream", &[]).unwrap();
    flaky.set_unavailable(true);

    for _ in 0..2 {
        let read: CacheRead<Vec<StoredRecord>> = state
            .cache
            .read(&CachedView::strain_list(), || store.list(ResourceType::Strain))
            .await
            .unwrap();
        assert_eq!(read.source(), ReadSource::Bypassed);
        assert_eq!(names(read.value()), vec!["Blue Dream"]);
    }
    assert_eq!(store.reads(), 2);

    let event = store.rename(ResourceType::Strain, "s1", "Blue Dream #2").unwrap();
    let report = state.cache.record_mutation(&event).await.unwrap();
    assert!(!report.is_complete());
    assert_backend_unavailable(&state.cache.stats().await);
}

#[tokio::test]
async fn test_common_mutations_reach_their_views() {
    let state = memory_state();
    let cases = [
        (fixtures::grow_created("g1", "o1"), CachedView::grows_by_org("o1"), &["grow:g1", "grows-by-org:o1"][..]),
        (
            fixtures::indoor_updated("i1", "u1"),
            CachedView::indoors_by_user("u1"),
            &["indoor:i1", "indoors-by-user:u1"][..],
        ),
        (
            fixtures::plant_updated("p1", "g1"),
            CachedView::grow_detail("g1"),
            &["plant:p1", "plants-by-grow:g1", "grow:g1"][..],
        ),
        (fixtures::product_updated("pr1"), CachedView::product_list(), &["products", "product:pr1"][..]),
        (
            fixtures::task_created("t1", Some("g1")),
            CachedView::tasks_by_grow("g1"),
            &["tasks", "task:t1", "tasks-by-grow:g1"][..],
        ),
        (fixtures::task_created("t2", None), CachedView::task_list(), &["tasks", "task:t2"][..]),
    ];

    for (event, view, expected) in cases {
        let _: CacheRead<u32> = state.cache.read(&view, || async { Ok(1) }).await.unwrap();

        let report = state.cache.record_mutation(&event).await.unwrap();
        assert_tags(&report.tags, expected);
        assert!(report.is_complete());

        let after: CacheRead<u32> = state.cache.read(&view, || async { Ok(2) }).await.unwrap();
        assert_eq!(after.source(), ReadSource::Computed, "{} survived {:?}", view, event.resource_type);
    }
}

#[tokio::test]
async fn test_grow_less_task_keeps_grow_lists() {
    let state = memory_state();
    let store = MockDataStore::new();
    store
        .create(ResourceType::Task, "t1", "Water", &[(ParentKind::Grow, "g1")])
        .unwrap();
    let view = CachedView::tasks_by_grow("g1");
    let _: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list_by_parent(ResourceType::Task, ParentKind::Grow, "g1"))
        .await
        .unwrap();

    // The store knows the new task has no grow and says so on the event.
    let event = store.create(ResourceType::Task, "t2", "Sweep", &[]).unwrap();
    assert!(event.is_detached(ParentKind::Grow));
    let report = state.cache.record_mutation(&event).await.unwrap();
    assert_tags(&report.tags, &["tasks", "task:t2"]);

    let hit: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list_by_parent(ResourceType::Task, ParentKind::Grow, "g1"))
        .await
        .unwrap();
    assert_eq!(hit.source(), ReadSource::Hit);
    assert_eq!(names(hit.value()), vec!["Water"]);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_invalidation_failure_does_not_fail_write() {
    let flaky = Arc::new(FlakyBackend::in_memory());
    let backend: Arc<dyn CacheBackend> = flaky.clone();
    let state = AppState::with_backend(backend, CacheSettings::default());
    let store = MockDataStore::new();

    let event = store
        .create(ResourceType::Indoor, "i1", "Closet", &[(ParentKind::User, "u1")])
        .unwrap();
    flaky.fail_next_invalidations(u32::MAX);

    let report = state.cache.record_mutation(&event).await.unwrap();
    let max_attempts = state.settings.coordinator.invalidation_retry.max_attempts;
    assert_eq!(report.attempts, max_attempts);
    assert_eq!(report.failed_tags.len(), 2);
    assert_eq!(flaky.invalidation_calls(), 2 * u64::from(max_attempts));
}

#[tokio::test]
async fn test_lmdb_state_serves_and_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CacheSettings {
        backend: BackendKind::Lmdb,
        lmdb_path: dir.path().to_path_buf(),
        lmdb_map_size_mb: 16,
        ..CacheSettings::default()
    };
    let state = AppState::from_settings(settings).unwrap();
    let store = MockDataStore::new();
    store
        .create(ResourceType::Task, "t1", "Water", &[(ParentKind::Grow, "g1")])
        .unwrap();
    let view = CachedView::tasks_by_grow("g1");

    let first: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list_by_parent(ResourceType::Task, ParentKind::Grow, "g1"))
        .await
        .unwrap();
    assert_eq!(first.source(), ReadSource::Computed);

    let hit: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list_by_parent(ResourceType::Task, ParentKind::Grow, "g1"))
        .await
        .unwrap();
    assert_eq!(hit.source(), ReadSource::Hit);

    let event = store.delete(ResourceType::Task, "t1").unwrap();
    let report = state.cache.record_mutation(&event).await.unwrap();
    assert_eq!(report.dropped, 1);

    let after: CacheRead<Vec<StoredRecord>> = state
        .cache
        .read(&view, || store.list_by_parent(ResourceType::Task, ParentKind::Grow, "g1"))
        .await
        .unwrap();
    assert!(after.value().is_empty());
    assert_eq!(state.backend.stats().await.unwrap().entry_count, 1);
}
