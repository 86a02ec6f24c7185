//! Integration tests for the resource manager.
//!
//! Loads go through `MockLoader` unless a test needs real files, in which case tempfile
//! provides an isolated directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use keel_resources::*;
use keel_test_utils::{
    EventLog, LoaderCall, MeshDescriptor, MockLoader, TestMesh, TestShader, TestTexture,
    init_test_logging,
};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

fn manager_with(config: ResourceManagerConfig, loader: &Arc<MockLoader>) -> ResourceManager {
    init_test_logging();
    let manager = ResourceManager::new(config).unwrap();
    manager.set_default_loader(loader.clone());
    manager
}

fn setup() -> (ResourceManager, Arc<MockLoader>) {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(ResourceManagerConfig::default(), &loader);
    (manager, loader)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn state_of<T: Resource>(manager: &ResourceManager, handle: &Handle<T>) -> ResourceState {
    manager.resource_info(handle).unwrap().state
}

static TRACKED_UNLOADS: AtomicUsize = AtomicUsize::new(0);

/// Counts how often its data is released.
struct Tracked;

impl Loadable for Tracked {
    type Descriptor = ();

    fn update_content(
        _previous: Option<&Self>,
        _ctx: LoadContext<'_>,
    ) -> ResourceResult<Loaded<Self>> {
        Ok(Loaded::complete(Tracked))
    }

    fn unload_data(&mut self, _what: Unload) -> LoadDesc {
        TRACKED_UNLOADS.fetch_add(1, Ordering::SeqCst);
        LoadDesc::unloaded()
    }
}

impl MemoryReportable for Tracked {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::new(1, 0)
    }
}

impl Resource for Tracked {
    fn type_name() -> &'static str {
        "Tracked"
    }
}

/// Marks empty data as missing instead of returning an error.
struct Rejected;

impl Loadable for Rejected {
    type Descriptor = ();

    fn update_content(
        _previous: Option<&Self>,
        ctx: LoadContext<'_>,
    ) -> ResourceResult<Loaded<Self>> {
        let desc = if ctx.bytes().is_empty() {
            LoadDesc::missing()
        } else {
            LoadDesc::loaded()
        };
        Ok(Loaded::new(Rejected, desc))
    }
}

impl MemoryReportable for Rejected {
    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::default()
    }
}

impl Resource for Rejected {
    fn type_name() -> &'static str {
        "Rejected"
    }
}

// ============================================================================
// Handles
// ============================================================================

#[test]
fn test_acquire_coalesces_requests() {
    let (manager, loader) = setup();
    loader.insert("rock.mesh", TestMesh::encode(12));

    let a: Handle<TestMesh> = manager.acquire_handle("rock.mesh", AcquireMode::Load).unwrap();
    let b: Handle<TestMesh> = manager.acquire_handle("rock.mesh", AcquireMode::Load).unwrap();

    assert_eq!(a, b);
    assert_eq!(a.ref_count(), 2);
    assert_eq!(manager.resource_count(), 1);

    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(loader.open_count_for("rock.mesh"), 1);

    let mesh = manager.begin_access(&a, FallbackPolicy::NoFallback).unwrap();
    assert_eq!(mesh.vertex_count, 12);
    assert_eq!(mesh.source(), LockSource::Loaded);
}

#[test]
fn test_concurrent_acquire_and_release() {
    let (manager, _loader) = setup();
    let keep: Handle<TestMesh> = manager.acquire_handle("shared.mesh", AcquireMode::NoLoad).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..200 {
                    let handle: Handle<TestMesh> = manager
                        .acquire_handle("shared.mesh", AcquireMode::NoLoad)
                        .unwrap();
                    let copy = handle.clone();
                    assert!(copy.ref_count() >= 3);
                }
            });
        }
    });

    assert_eq!(keep.ref_count(), 1);
    assert_eq!(manager.resource_count(), 1);
}

#[test]
fn test_handles_from_another_manager_are_rejected() {
    let (first, _first_loader) = setup();
    let loader = Arc::new(MockLoader::new());
    let second = manager_with(
        ResourceManagerConfig::default().with_contract_policy(ContractPolicy::Log),
        &loader,
    );

    let handle: Handle<TestMesh> = first.acquire_handle("a.mesh", AcquireMode::NoLoad).unwrap();
    let result = second.begin_access(&handle, FallbackPolicy::AllowFallback);
    assert!(matches!(result, Err(ResourceError::InvalidHandle { .. })));
}

#[test]
fn test_type_mismatch_is_reported() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(
        ResourceManagerConfig::default().with_contract_policy(ContractPolicy::Log),
        &loader,
    );

    let _texture: Handle<TestTexture> = manager.acquire_handle("thing", AcquireMode::NoLoad).unwrap();
    let mesh = manager.acquire_handle::<TestMesh>("thing", AcquireMode::NoLoad);

    match mesh {
        Err(ResourceError::TypeMismatch {
            requested,
            existing,
            ..
        }) => {
            assert_eq!(requested, "TestMesh");
            assert_eq!(existing, "TestTexture");
        }
        _ => panic!("expected a type mismatch"),
    }
    assert!(manager.get_existing::<TestMesh>("thing").is_none());
    assert!(manager.get_existing::<TestTexture>("thing").is_some());
}

#[test]
fn test_get_existing_does_not_create() {
    let (manager, loader) = setup();
    assert!(manager.get_existing::<TestMesh>("nope.mesh").is_none());
    assert_eq!(manager.resource_count(), 0);
    assert_eq!(loader.open_count(), 0);
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_file_loader_end_to_end() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("brick.tex"),
        TestTexture::encode(&[&[1, 2, 3, 4]]),
    )
    .unwrap();

    let manager =
        ResourceManager::new(ResourceManagerConfig::default().with_base_path(dir.path())).unwrap();
    let log = EventLog::attach(&manager);

    // Reads go through the file loader once the test opens the gate
    let files = FileLoader::new(dir.path());
    let gate = Arc::new(Barrier::new(2));
    let opened = Arc::clone(&gate);
    manager.set_default_loader(Arc::new(FnLoader::new(move |id: &ResourceId| {
        opened.wait();
        files.open_data_stream(id)
    })));

    let brick: Handle<TestTexture> = manager.acquire_handle("brick.tex", AcquireMode::Load).unwrap();
    {
        let placeholder = manager
            .begin_access(&brick, FallbackPolicy::AllowFallback)
            .unwrap();
        assert_eq!(placeholder.source(), LockSource::LoadingFallback);
        assert!(placeholder.is_placeholder());
    }
    assert_eq!(state_of(&manager, &brick), ResourceState::Loading);

    gate.wait();
    assert!(manager.pump_until_idle(WAIT));
    {
        let texture = manager
            .begin_access(&brick, FallbackPolicy::NoFallback)
            .unwrap();
        assert_eq!(texture.source(), LockSource::Loaded);
        assert_eq!(texture.mip_count(), 1);
        assert_eq!(texture.mip(0), Some(&[1, 2, 3, 4][..]));
        assert!(!texture.is_placeholder());
    }

    let info = manager.resource_info(&brick).unwrap();
    assert_eq!(info.state, ResourceState::Loaded);
    assert_eq!(info.loaded_via, Some("default"));
    assert_eq!(manager.memory_usage().gpu_bytes, 4);

    assert!(log.wait_for(|e| e.is_transition_to(ResourceState::Loaded), WAIT));
    assert_eq!(
        log.transitions_for("brick.tex"),
        vec![
            (ResourceState::Unloaded, ResourceState::Loading),
            (ResourceState::Loading, ResourceState::Loaded),
        ]
    );
}

#[test]
fn test_missing_resource_fails_once() {
    let (manager, loader) = setup();
    let log = EventLog::attach(&manager);

    let ghost: Handle<TestTexture> = manager.acquire_handle("ghost.tex", AcquireMode::Load).unwrap();
    assert!(log.wait_for(|e| e.is_failed(), WAIT));
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(state_of(&manager, &ghost), ResourceState::LoadedResourceMissing);

    // Served as the placeholder, which doubles as the missing fallback
    let lock = manager
        .begin_access(&ghost, FallbackPolicy::AllowFallback)
        .unwrap();
    assert_eq!(lock.source(), LockSource::MissingFallback);
    assert!(lock.is_placeholder());
    drop(lock);

    let strict = manager.begin_access(&ghost, FallbackPolicy::NoFallback);
    assert!(matches!(strict, Err(ResourceError::Missing { .. })));

    // Accessing a missing resource does not retry the load
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(loader.open_count_for("ghost.tex"), 1);
    assert_eq!(
        log.failures(),
        vec![(ResourceId::new("ghost.tex"), ResourceErrorKind::NotFound)]
    );
}

#[test]
fn test_missing_without_fallback_is_an_error() {
    let (manager, _loader) = setup();
    let mesh: Handle<TestMesh> = manager.acquire_handle("ghost.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    let result = manager.begin_access(&mesh, FallbackPolicy::AllowFallback);
    assert!(matches!(result, Err(ResourceError::Missing { .. })));

    manager.set_type_missing_fallback(TestMesh { vertex_count: 1 });
    let lock = manager
        .begin_access(&mesh, FallbackPolicy::BlockTillLoaded)
        .unwrap();
    assert_eq!(lock.source(), LockSource::MissingFallback);
    assert_eq!(lock.vertex_count, 1);
}

#[test]
fn test_malformed_payload_reports_kind() {
    let (manager, loader) = setup();
    let log = EventLog::attach(&manager);
    loader.insert("bad.mesh", b"NOT A MESH".to_vec());

    let mesh: Handle<TestMesh> = manager.acquire_handle("bad.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    assert_eq!(state_of(&manager, &mesh), ResourceState::LoadedResourceMissing);
    assert_eq!(
        log.failures(),
        vec![(ResourceId::new("bad.mesh"), ResourceErrorKind::MalformedPayload)]
    );
}

#[test]
fn test_content_reported_missing_is_a_failure() {
    let (manager, loader) = setup();
    let log = EventLog::attach(&manager);
    loader.insert("empty.rejected", Vec::new());

    let rejected: Handle<Rejected> = manager
        .acquire_handle("empty.rejected", AcquireMode::Load)
        .unwrap();
    assert!(manager.pump_until_idle(WAIT));

    assert_eq!(state_of(&manager, &rejected), ResourceState::LoadedResourceMissing);
    assert_eq!(
        log.failures(),
        vec![(ResourceId::new("empty.rejected"), ResourceErrorKind::MalformedPayload)]
    );
    assert_eq!(
        log.transitions_for("empty.rejected"),
        vec![
            (ResourceState::Unloaded, ResourceState::Loading),
            (ResourceState::Loading, ResourceState::LoadedResourceMissing),
        ]
    );
}

#[test]
fn test_one_request_in_flight_per_resource() {
    let (manager, loader) = setup();
    loader.insert("stream.tex", TestTexture::encode(&[&[1], &[2, 2], &[3, 3, 3]]));
    loader.hold();

    let texture: Handle<TestTexture> = manager.acquire_handle("stream.tex", AcquireMode::Load).unwrap();
    assert!(wait_until(|| loader.open_count() == 1));

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    manager.request_quality_level(&texture, 3).unwrap();
                }
            });
        }
    });
    assert_eq!(loader.open_count(), 1);
    assert!(manager.is_any_loading_in_progress());

    loader.release();
    assert!(manager.pump_until_idle(WAIT));

    let info = manager.resource_info(&texture).unwrap();
    assert_eq!(info.quality_level, 3);
    assert_eq!(info.quality_levels_loadable, 0);
    // One open per quality level, never two at once
    assert_eq!(loader.open_count_for("stream.tex"), 3);
    assert_eq!(loader.max_concurrent_opens(), 1);
}

#[test]
fn test_quality_levels_stream_in_on_request() {
    let (manager, loader) = setup();
    loader.insert("stream.tex", TestTexture::encode(&[&[1], &[2, 2]]));

    let texture: Handle<TestTexture> = manager.acquire_handle("stream.tex", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(manager.resource_info(&texture).unwrap().quality_level, 1);

    manager.request_quality_level(&texture, 2).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    let lock = manager
        .begin_access(&texture, FallbackPolicy::NoFallback)
        .unwrap();
    assert_eq!(lock.mip_count(), 2);
    assert_eq!(lock.mip(1), Some(&[2, 2][..]));
}

#[test]
fn test_loading_fallback_serves_previous_quality() {
    let (manager, loader) = setup();
    loader.insert("stream.tex", TestTexture::encode(&[&[1], &[2, 2]]));

    let texture: Handle<TestTexture> = manager.acquire_handle("stream.tex", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    loader.hold();
    manager.request_quality_level(&texture, 2).unwrap();
    assert_eq!(state_of(&manager, &texture), ResourceState::Loading);

    {
        let previous = manager
            .begin_access(&texture, FallbackPolicy::AllowLoadingFallback)
            .unwrap();
        assert_eq!(previous.source(), LockSource::PreviousQuality);
        assert_eq!(previous.mip_count(), 1);

        let placeholder = manager
            .begin_access(&texture, FallbackPolicy::AllowFallback)
            .unwrap();
        assert_eq!(placeholder.source(), LockSource::LoadingFallback);
        assert!(placeholder.is_placeholder());
    }

    loader.release();
    assert!(manager.pump_until_idle(WAIT));
    let full = manager
        .begin_access(&texture, FallbackPolicy::AllowLoadingFallback)
        .unwrap();
    assert_eq!(full.source(), LockSource::Loaded);
    assert_eq!(full.mip_count(), 2);
}

#[test]
fn test_explicit_loading_fallback_replaces_placeholder() {
    let (manager, loader) = setup();
    loader.insert("slow.tex", TestTexture::encode(&[&[9]]));
    manager.set_type_loading_fallback(TestTexture::create_resource(vec![vec![7, 7]]).unwrap().payload);
    loader.hold();

    let texture: Handle<TestTexture> = manager.acquire_handle("slow.tex", AcquireMode::Load).unwrap();
    {
        let lock = manager
            .begin_access(&texture, FallbackPolicy::AllowFallback)
            .unwrap();
        assert_eq!(lock.source(), LockSource::LoadingFallback);
        assert!(!lock.is_placeholder());
        assert_eq!(lock.mip(0), Some(&[7, 7][..]));
    }
    loader.release();
    assert!(manager.pump_until_idle(WAIT));
}

#[test]
fn test_no_fallback_does_not_queue_a_load() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));

    let mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::NoLoad).unwrap();
    let result = manager.begin_access(&mesh, FallbackPolicy::NoFallback);
    assert!(matches!(result, Err(ResourceError::NotReady { .. })));

    assert!(!manager.is_any_loading_in_progress());
    assert_eq!(state_of(&manager, &mesh), ResourceState::Unloaded);
    assert_eq!(loader.open_count(), 0);
}

#[test]
fn test_block_till_loaded_from_another_thread() {
    let (manager, loader) = setup();
    loader.insert("slow.mesh", TestMesh::encode(5));
    loader.set_delay(Some(Duration::from_millis(20)));

    let mesh: Handle<TestMesh> = manager.acquire_handle("slow.mesh", AcquireMode::NoLoad).unwrap();
    let count = thread::scope(|s| {
        s.spawn(|| {
            manager
                .begin_access(&mesh, FallbackPolicy::BlockTillLoaded)
                .map(|lock| lock.vertex_count)
        })
        .join()
        .unwrap()
    });
    assert_eq!(count.unwrap(), 5);
}

#[test]
fn test_force_no_fallback_acquisition() {
    let (manager, loader) = setup();
    loader.insert("a.tex", TestTexture::encode(&[&[1]]));
    loader.insert("b.tex", TestTexture::encode(&[&[2]]));
    loader.set_delay(Some(Duration::from_millis(10)));

    manager.force_no_fallback_acquisition(1);
    let a: Handle<TestTexture> = manager.acquire_handle("a.tex", AcquireMode::NoLoad).unwrap();
    {
        let lock = manager.begin_access(&a, FallbackPolicy::AllowFallback).unwrap();
        assert_eq!(lock.source(), LockSource::Loaded);
    }

    // One frame later fallbacks are allowed again
    manager.per_frame_update();
    loader.hold();
    let b: Handle<TestTexture> = manager.acquire_handle("b.tex", AcquireMode::NoLoad).unwrap();
    {
        let lock = manager.begin_access(&b, FallbackPolicy::AllowFallback).unwrap();
        assert!(lock.is_placeholder());
    }
    loader.release();
    assert!(manager.pump_until_idle(WAIT));
}

#[test]
fn test_force_no_fallback_keeps_the_longer_request() {
    let (manager, loader) = setup();
    loader.insert("c.tex", TestTexture::encode(&[&[3]]));

    manager.force_no_fallback_acquisition(3);
    manager.force_no_fallback_acquisition(1);
    manager.per_frame_update();
    manager.per_frame_update();

    // Two frames in, the three-frame request is still counting down
    let c: Handle<TestTexture> = manager.acquire_handle("c.tex", AcquireMode::NoLoad).unwrap();
    let lock = manager.begin_access(&c, FallbackPolicy::AllowFallback).unwrap();
    assert_eq!(lock.source(), LockSource::Loaded);
    assert_eq!(lock.mip(0), Some(&[3][..]));
}

#[test]
fn test_main_thread_affinity() {
    let (manager, loader) = setup();
    loader.insert("lit.shader", b"void main() {}".to_vec());
    loader.insert("unlit.shader", b"void main() { discard; }".to_vec());

    let lit: Handle<TestShader> = manager.acquire_handle("lit.shader", AcquireMode::Load).unwrap();
    assert!(wait_until(|| {
        manager.run_main_thread_update_tasks();
        state_of(&manager, &lit) == ResourceState::Loaded
    }));

    let current = thread::current().name().map(str::to_string);
    let shader = manager.begin_access(&lit, FallbackPolicy::NoFallback).unwrap();
    assert_eq!(shader.source, "void main() {}");
    assert_eq!(shader.compiled_on, current);

    // Blocking on the main thread keeps main-thread updates running
    let unlit: Handle<TestShader> = manager.acquire_handle("unlit.shader", AcquireMode::NoLoad).unwrap();
    let shader = manager
        .begin_access(&unlit, FallbackPolicy::BlockTillLoaded)
        .unwrap();
    assert_eq!(shader.compiled_on, current);
}

#[test]
fn test_main_thread_updates_only_run_on_the_main_thread() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(
        ResourceManagerConfig::default().with_contract_policy(ContractPolicy::Log),
        &loader,
    );
    loader.insert("lit.shader", b"void main() {}".to_vec());

    let lit: Handle<TestShader> = manager.acquire_handle("lit.shader", AcquireMode::Load).unwrap();
    assert!(wait_until(|| loader.open_count() == 1));

    thread::scope(|s| {
        s.spawn(|| {
            let until = Instant::now() + Duration::from_millis(50);
            while Instant::now() < until {
                assert_eq!(manager.run_main_thread_update_tasks(), 0);
                thread::sleep(Duration::from_millis(1));
            }
            // Waiting off the main thread never drains the main-thread queue
            assert!(!manager.pump_until_idle(Duration::from_millis(20)));
        });
    });
    assert_eq!(state_of(&manager, &lit), ResourceState::Loading);

    assert!(manager.pump_until_idle(WAIT));
    let shader = manager.begin_access(&lit, FallbackPolicy::NoFallback).unwrap();
    assert_eq!(shader.compiled_on, thread::current().name().map(str::to_string));
}

#[test]
fn test_priority_orders_loads() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(ResourceManagerConfig::default().with_data_load_workers(1), &loader);
    for id in ["blocker.mesh", "low.mesh", "high.mesh", "medium.mesh"] {
        loader.insert(id, TestMesh::encode(1));
    }

    loader.hold();
    let _blocker: Handle<TestMesh> = manager.acquire_handle("blocker.mesh", AcquireMode::Load).unwrap();
    assert!(wait_until(|| loader.open_count() == 1));

    let low: Handle<TestMesh> = manager.acquire_handle("low.mesh", AcquireMode::NoLoad).unwrap();
    let high: Handle<TestMesh> = manager.acquire_handle("high.mesh", AcquireMode::NoLoad).unwrap();
    manager.set_resource_priority(&low, Some(ResourcePriority::Low)).unwrap();
    manager
        .set_resource_priority(&high, Some(ResourcePriority::Critical))
        .unwrap();

    manager.request_quality_level(&low, 1).unwrap();
    let _medium: Handle<TestMesh> = manager.acquire_handle("medium.mesh", AcquireMode::Load).unwrap();
    manager.request_quality_level(&high, 1).unwrap();
    assert_eq!(
        manager.resource_info(&high).unwrap().priority,
        ResourcePriority::Critical
    );

    loader.release();
    assert!(manager.pump_until_idle(WAIT));

    let opened: Vec<String> = loader
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            LoaderCall::Open { id } => Some(id),
            LoaderCall::Close { .. } => None,
        })
        .collect();
    assert_eq!(opened, ["blocker.mesh", "high.mesh", "medium.mesh", "low.mesh"]);
}

#[test]
fn test_type_priority_applies_to_queued_loads() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(ResourceManagerConfig::default().with_data_load_workers(1), &loader);
    loader.insert("blocker.mesh", TestMesh::encode(1));
    loader.insert("a.tex", TestTexture::encode(&[&[1]]));
    loader.insert("b.mesh", TestMesh::encode(1));

    loader.hold();
    let _blocker: Handle<TestMesh> = manager.acquire_handle("blocker.mesh", AcquireMode::Load).unwrap();
    assert!(wait_until(|| loader.open_count() == 1));

    let _mesh: Handle<TestMesh> = manager.acquire_handle("b.mesh", AcquireMode::Load).unwrap();
    let texture: Handle<TestTexture> = manager.acquire_handle("a.tex", AcquireMode::Load).unwrap();
    // Raised after queueing, still moves the queued load forward
    manager.set_type_priority::<TestTexture>(ResourcePriority::VeryHigh);
    assert_eq!(
        manager.resource_info(&texture).unwrap().priority,
        ResourcePriority::VeryHigh
    );

    loader.release();
    assert!(manager.pump_until_idle(WAIT));
    let order: Vec<LoaderCall> = loader
        .calls()
        .into_iter()
        .filter(|call| matches!(call, LoaderCall::Open { .. }))
        .collect();
    assert_eq!(
        order,
        [
            LoaderCall::Open { id: "blocker.mesh".into() },
            LoaderCall::Open { id: "a.tex".into() },
            LoaderCall::Open { id: "b.mesh".into() },
        ]
    );
}

// ============================================================================
// Creation, reload and loaders
// ============================================================================

#[test]
fn test_create_resource_is_loaded_and_not_reloadable() {
    let (manager, loader) = setup();
    let log = EventLog::attach(&manager);

    let mesh: Handle<TestMesh> = manager
        .create_resource("generated.mesh", MeshDescriptor { vertex_count: 64 })
        .unwrap();
    let info = manager.resource_info(&mesh).unwrap();
    assert_eq!(info.state, ResourceState::Loaded);
    assert_eq!(info.loaded_via, Some("created"));
    assert!(!info.reloadable);
    assert_eq!(info.memory, MemoryUsage::new(64 * 32, 64 * 32));

    assert!(!manager.reload_resource(&mesh, true).unwrap());
    assert_eq!(manager.reload_all_resources(true), 0);
    assert_eq!(loader.open_count(), 0);

    // A second create returns the existing resource
    let again: Handle<TestMesh> = manager
        .create_resource("generated.mesh", MeshDescriptor { vertex_count: 1 })
        .unwrap();
    assert_eq!(again, mesh);
    assert_eq!(
        manager
            .begin_access(&again, FallbackPolicy::NoFallback)
            .unwrap()
            .vertex_count,
        64
    );
    assert_eq!(log.count(|e| e.is_created()), 1);
}

#[test]
fn test_generate_unique_resource_id() {
    let (manager, _loader) = setup();
    let first = manager.generate_unique_resource_id("mesh");
    let _taken: Handle<TestMesh> = manager
        .create_resource(first.clone(), MeshDescriptor { vertex_count: 1 })
        .unwrap();
    let second = manager.generate_unique_resource_id("mesh");

    assert_ne!(first, second);
    assert!(first.as_str().starts_with("mesh-"));
    assert!(second.as_str().starts_with("mesh-"));
}

#[test]
fn test_reload_only_outdated_unless_forced() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));

    let mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    assert!(!manager.reload_resource(&mesh, false).unwrap());

    loader.insert("a.mesh", TestMesh::encode(7));
    assert!(manager.reload_resource(&mesh, false).unwrap());
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(
        manager
            .begin_access(&mesh, FallbackPolicy::NoFallback)
            .unwrap()
            .vertex_count,
        7
    );

    assert!(manager.reload_resource(&mesh, true).unwrap());
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(loader.open_count_for("a.mesh"), 3);
}

#[test]
fn test_reload_recovers_missing_resource() {
    let (manager, loader) = setup();
    let mesh: Handle<TestMesh> = manager.acquire_handle("late.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(state_of(&manager, &mesh), ResourceState::LoadedResourceMissing);

    loader.insert("late.mesh", TestMesh::encode(2));
    assert_eq!(manager.reload_all_resources(false), 1);
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(state_of(&manager, &mesh), ResourceState::Loaded);
}

#[test]
fn test_custom_loader_update_and_restore() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));

    let mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    let custom = Arc::new(MemoryLoader::new());
    custom.insert("a.mesh", TestMesh::encode(9));
    assert!(manager.update_with_custom_loader(&mesh, custom).unwrap());
    assert!(manager.pump_until_idle(WAIT));

    let info = manager.resource_info(&mesh).unwrap();
    assert_eq!(info.loaded_via, Some("custom"));
    assert!(!info.reloadable);
    assert_eq!(
        manager
            .begin_access(&mesh, FallbackPolicy::NoFallback)
            .unwrap()
            .vertex_count,
        9
    );
    // File reloads leave custom data alone
    assert_eq!(manager.reload_all_resources(true), 0);

    assert!(manager.restore_resource(&mesh).unwrap());
    assert!(manager.pump_until_idle(WAIT));
    let info = manager.resource_info(&mesh).unwrap();
    assert_eq!(info.loaded_via, Some("default"));
    assert_eq!(
        manager
            .begin_access(&mesh, FallbackPolicy::NoFallback)
            .unwrap()
            .vertex_count,
        3
    );
}

#[test]
fn test_acquire_with_custom_loader() {
    let (manager, loader) = setup();
    let custom = Arc::new(FnLoader::new(|_: &ResourceId| {
        Ok(ResourceStream::from_bytes(TestMesh::encode(4)))
    }));

    let mesh: Handle<TestMesh> = manager.acquire_with_custom_loader("proc.mesh", custom).unwrap();
    let lock = manager
        .begin_access(&mesh, FallbackPolicy::BlockTillLoaded)
        .unwrap();
    assert_eq!(lock.vertex_count, 4);
    assert_eq!(loader.open_count(), 0);
}

#[test]
fn test_type_loader_and_overrides() {
    let (manager, default_loader) = setup();
    default_loader.insert("hero.mesh", TestMesh::encode(1));

    let meshes = Arc::new(MemoryLoader::new());
    meshes.insert("hero.mesh", TestMesh::encode(100));
    meshes.insert("low/hero.mesh", TestMesh::encode(999));
    manager.set_type_loader::<TestMesh>(meshes);

    let lowpoly = Arc::new(MemoryLoader::new());
    lowpoly.insert("low/hero.mesh", TestMesh::encode(10));
    manager.register_type_override::<TestMesh>(
        "lowpoly",
        |id| id.as_str().starts_with("low/"),
        lowpoly,
    );

    let hero: Handle<TestMesh> = manager.acquire_handle("hero.mesh", AcquireMode::Load).unwrap();
    let low: Handle<TestMesh> = manager.acquire_handle("low/hero.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    assert_eq!(manager.resource_info(&hero).unwrap().loaded_via, Some("type"));
    assert_eq!(manager.resource_info(&low).unwrap().loaded_via, Some("lowpoly"));
    assert_eq!(
        manager
            .begin_access(&low, FallbackPolicy::NoFallback)
            .unwrap()
            .vertex_count,
        10
    );

    assert!(manager.unregister_type_override::<TestMesh>("lowpoly"));
    assert!(manager.reload_resource(&low, true).unwrap());
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(manager.resource_info(&low).unwrap().loaded_via, Some("type"));
    assert_eq!(default_loader.open_count(), 0);
}

#[test]
fn test_named_resources_resolve_to_target() {
    let (manager, loader) = setup();
    loader.insert("meshes/rock_v2.mesh", TestMesh::encode(8));
    manager.register_named_resource("rock", "meshes/rock_v2.mesh");

    let by_name: Handle<TestMesh> = manager.acquire_handle("rock", AcquireMode::Load).unwrap();
    let by_id: Handle<TestMesh> = manager
        .acquire_handle("meshes/rock_v2.mesh", AcquireMode::Load)
        .unwrap();
    assert_eq!(by_name, by_id);
    assert_eq!(by_name.id().as_str(), "meshes/rock_v2.mesh");

    assert!(manager.unregister_named_resource("rock"));
    assert!(manager.get_existing::<TestMesh>("rock").is_none());
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(loader.open_count(), 1);
}

// ============================================================================
// Reclamation
// ============================================================================

#[test]
fn test_sweep_hysteresis() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));
    let log = EventLog::attach(&manager);

    let keep: Handle<TestMesh> = manager.acquire_handle("keep.mesh", AcquireMode::NoLoad).unwrap();
    let mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    drop(mesh);
    let released = Instant::now();

    // Unreferenced for less than the timeout
    assert_eq!(manager.sweep_auto_unload(released + Duration::from_secs(5)), 0);
    // Past the timeout, but acquired more recently than the threshold
    assert_eq!(manager.sweep_auto_unload(released + Duration::from_secs(20)), 0);
    assert_eq!(manager.resource_count(), 2);

    assert_eq!(manager.sweep_auto_unload(released + Duration::from_secs(31)), 1);
    assert_eq!(manager.resource_count(), 1);
    assert!(manager.get_existing::<TestMesh>("a.mesh").is_none());
    assert_eq!(log.count(|e| e.is_deleted()), 1);

    // Referenced resources are never swept
    assert_eq!(manager.sweep_auto_unload(released + Duration::from_secs(3600)), 0);
    assert_eq!(keep.ref_count(), 1);
}

#[test]
fn test_reacquire_cancels_pending_sweep() {
    let (manager, _loader) = setup();
    let mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::NoLoad).unwrap();
    drop(mesh);

    let again: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::NoLoad).unwrap();
    assert_eq!(manager.sweep_auto_unload(Instant::now() + Duration::from_secs(3600)), 0);
    drop(again);
    assert_eq!(manager.sweep_auto_unload(Instant::now() + Duration::from_secs(3600)), 1);
}

#[test]
fn test_sweep_budget_limits_each_pass() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(ResourceManagerConfig::default().with_sweep_budget(Some(2)), &loader);
    for i in 0..5 {
        let _: Handle<TestMesh> = manager
            .acquire_handle(format!("m{}.mesh", i), AcquireMode::NoLoad)
            .unwrap();
    }
    let later = Instant::now() + Duration::from_secs(3600);

    assert_eq!(manager.sweep_auto_unload(later), 2);
    assert_eq!(manager.sweep_auto_unload(later), 2);
    assert_eq!(manager.sweep_auto_unload(later), 1);
    assert_eq!(manager.resource_count(), 0);
}

#[test]
fn test_free_all_unused_resources() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));
    loader.insert("b.mesh", TestMesh::encode(4));

    let a: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    let b: Handle<TestMesh> = manager.acquire_handle("b.mesh", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    drop(b);

    assert_eq!(manager.free_all_unused_resources(), 1);
    assert_eq!(manager.resource_count(), 1);
    assert_eq!(manager.memory_usage(), MemoryUsage::new(3 * 32, 3 * 32));
    assert_eq!(state_of(&manager, &a), ResourceState::Loaded);
}

#[test]
fn test_sweep_unloads_payload_data() {
    let (manager, loader) = setup();
    loader.insert("a.tracked", b"a".to_vec());
    loader.insert("b.tracked", b"b".to_vec());

    let a: Handle<Tracked> = manager.acquire_handle("a.tracked", AcquireMode::Load).unwrap();
    let b: Handle<Tracked> = manager.acquire_handle("b.tracked", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    {
        let lock = manager.begin_access(&a, FallbackPolicy::NoFallback).unwrap();
        assert_eq!(lock.source(), LockSource::Loaded);
    }
    drop(a);
    drop(b);

    let later = Instant::now() + Duration::from_secs(3600);
    assert_eq!(manager.sweep_auto_unload(later), 2);
    assert_eq!(TRACKED_UNLOADS.load(Ordering::SeqCst), 2);
}

#[test]
fn test_discard_quality_level() {
    let (manager, loader) = setup();
    loader.insert("stream.tex", TestTexture::encode(&[&[1], &[2, 2]]));

    let texture: Handle<TestTexture> = manager.acquire_handle("stream.tex", AcquireMode::Load).unwrap();
    manager.request_quality_level(&texture, 2).unwrap();
    assert!(manager.pump_until_idle(WAIT));
    assert_eq!(manager.resource_info(&texture).unwrap().quality_level, 2);

    {
        let _reader = manager
            .begin_access(&texture, FallbackPolicy::NoFallback)
            .unwrap();
        // A live reader still holds this payload
        assert!(!manager.discard_quality_level(&texture).unwrap());
    }

    assert!(manager.discard_quality_level(&texture).unwrap());
    let info = manager.resource_info(&texture).unwrap();
    assert_eq!(info.quality_level, 1);
    assert_eq!(info.quality_levels_loadable, 1);
    assert_eq!(info.memory.gpu_bytes, 1);

    assert!(manager.discard_quality_level(&texture).unwrap());
    assert_eq!(state_of(&manager, &texture), ResourceState::Unloaded);
    assert!(!manager.discard_quality_level(&texture).unwrap());
}

// ============================================================================
// Events and diagnostics
// ============================================================================

#[test]
fn test_broadcast_exists() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));
    let _a: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    let _b: Handle<TestTexture> = manager.acquire_handle("b.tex", AcquireMode::NoLoad).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    let log = EventLog::attach(&manager);
    manager.broadcast_exists();

    let exists: Vec<(String, ResourceState)> = log
        .collect()
        .into_iter()
        .filter_map(|event| match event {
            ResourceEvent::Exists { id, state, .. } => Some((id.to_string(), state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        exists,
        [
            ("a.mesh".to_string(), ResourceState::Loaded),
            ("b.tex".to_string(), ResourceState::Unloaded),
        ]
    );
}

#[test]
fn test_events_filter_by_type() {
    let (manager, loader) = setup();
    loader.insert("a.mesh", TestMesh::encode(3));
    loader.insert("a.tex", TestTexture::encode(&[&[1]]));
    let log = EventLog::attach(&manager);

    let _mesh: Handle<TestMesh> = manager.acquire_handle("a.mesh", AcquireMode::Load).unwrap();
    let _texture: Handle<TestTexture> = manager.acquire_handle("a.tex", AcquireMode::Load).unwrap();
    assert!(manager.pump_until_idle(WAIT));

    let mesh_events = log.count(|e| e.is_for::<TestMesh>());
    let texture_events = log.count(|e| e.is_for::<TestTexture>());
    // Created, Unloaded -> Loading, Loading -> Loaded
    assert_eq!(mesh_events, 3);
    assert_eq!(texture_events, 3);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_discards_pending_loads() {
    let loader = Arc::new(MockLoader::new());
    let manager = manager_with(ResourceManagerConfig::default().with_data_load_workers(1), &loader);
    loader.set_delay(Some(Duration::from_millis(5)));
    for i in 0..100 {
        loader.insert(format!("m{}.mesh", i), TestMesh::encode(i));
    }
    let log = EventLog::attach(&manager);

    let handles: Vec<Handle<TestMesh>> = (0..100)
        .map(|i| {
            manager
                .acquire_handle(format!("m{}.mesh", i), AcquireMode::Load)
                .unwrap()
        })
        .collect();
    assert!(manager.is_any_loading_in_progress());

    manager.shutdown();

    assert!(manager.is_shutting_down());
    assert!(!manager.is_any_loading_in_progress());
    assert_eq!(manager.resource_count(), 0);
    assert!(loader.open_count() < 100);
    assert_eq!(log.count(|e| e.is_deleted()), 100);

    let late = manager.acquire_handle::<TestMesh>("late.mesh", AcquireMode::Load);
    assert!(matches!(late, Err(ResourceError::ManagerShuttingDown)));
    let access = manager.begin_access(&handles[0], FallbackPolicy::BlockTillLoaded);
    assert!(matches!(access, Err(ResourceError::ManagerShuttingDown)));

    // Idempotent, and handles outliving the manager drop cleanly
    manager.shutdown();
    drop(manager);
    drop(handles);
}
