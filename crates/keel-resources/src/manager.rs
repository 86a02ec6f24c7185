//! The resource manager: the coordinator for resource lookup, loading, access and
//! reclamation.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use keel_core::alloc::{HashMap, IndexMap, index_map};
use keel_core::profiling::profile_function;
use parking_lot::Mutex;

use crate::config::{AcquireMode, ContractPolicy, FallbackPolicy, ResourceManagerConfig};
use crate::error::{ResourceError, ResourceResult};
use crate::event::{EventBus, ResourceEvent, Subscription};
use crate::handle::{Handle, LockSource, ResourceLock};
use crate::id::{ResourceId, ResourceType};
use crate::loader::{LoaderRegistry, OverrideDecider, ResourceTypeLoader};
use crate::pipeline::{self, ContentUpdateJob, DataLoadJob};
use crate::queue::ResourcePriority;
use crate::resource::Resource;
use crate::slot::{ErasedSlot, ResourceSlot, SlotHeader, Transition, downcast_slot, publish_created};
use crate::state::{MemoryUsage, ResourceInfo, ResourceState, Unload};
use crate::worker::{PUMP_INTERVAL, WorkQueue, WorkerPool};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Loading and missing fallbacks registered for one type.
struct TypeFallbacks<T> {
    /// `None` until `Resource::placeholder` has been asked.
    placeholder: Option<Option<Arc<T>>>,
    loading: Option<Arc<T>>,
    missing: Option<Arc<T>>,
}

impl<T> Default for TypeFallbacks<T> {
    fn default() -> Self {
        Self {
            placeholder: None,
            loading: None,
            missing: None,
        }
    }
}

/// Lookup tables guarded by the manager's coarse lock.
pub(crate) struct Tables {
    pub resources: IndexMap<ResourceId, Arc<dyn ErasedSlot>>,
    pub loaders: LoaderRegistry,
    type_priorities: HashMap<&'static str, ResourcePriority>,
    fallbacks: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    named: HashMap<ResourceId, ResourceId>,
    sweep_cursor: usize,
}

impl Tables {
    fn resolve_name(&self, id: ResourceId) -> ResourceId {
        match self.named.get(&id) {
            Some(target) => target.clone(),
            None => id,
        }
    }

    fn fallbacks_mut<T: Resource>(&mut self) -> Option<&mut TypeFallbacks<T>> {
        self.fallbacks
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(TypeFallbacks::<T>::default()))
            .downcast_mut::<TypeFallbacks<T>>()
    }

    fn slots(&self) -> Vec<Arc<dyn ErasedSlot>> {
        self.resources.values().cloned().collect()
    }
}

/// State shared between the manager and its workers.
pub(crate) struct ManagerShared {
    pub id: u64,
    pub config: ResourceManagerConfig,
    pub tables: Mutex<Tables>,
    pub data_queue: Arc<WorkQueue<DataLoadJob>>,
    pub update_queue: Arc<WorkQueue<ContentUpdateJob>>,
    pub main_queue: WorkQueue<ContentUpdateJob>,
    pub events: EventBus,
    shutting_down: AtomicBool,
    /// Resources with a request somewhere in the pipeline.
    in_flight: AtomicUsize,
    main_thread: Mutex<ThreadId>,
    force_no_fallback_frames: AtomicU32,
    unique_counter: AtomicU64,
}

impl ManagerShared {
    fn new(config: ResourceManagerConfig) -> Self {
        let tables = Tables {
            resources: index_map(),
            loaders: LoaderRegistry::new(&config.base_path),
            type_priorities: config.type_priorities.clone(),
            fallbacks: HashMap::new(),
            named: HashMap::new(),
            sweep_cursor: 0,
        };

        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            tables: Mutex::new(tables),
            data_queue: Arc::new(WorkQueue::new()),
            update_queue: Arc::new(WorkQueue::new()),
            main_queue: WorkQueue::new(),
            events: EventBus::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            main_thread: Mutex::new(thread::current().id()),
            force_no_fallback_frames: AtomicU32::new(0),
            unique_counter: AtomicU64::new(0),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn finish_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn emit_transition(&self, header: &SlotHeader, transition: Transition) {
        if transition.old == transition.new {
            return;
        }
        self.events.broadcast(ResourceEvent::StateChanged {
            id: header.id.clone(),
            resource_type: header.resource_type,
            old: transition.old,
            new: transition.new,
        });
    }

    /// Per-resource override, else the type's priority, else the configured default.
    ///
    /// Must not be called with the tables locked.
    pub fn effective_priority(&self, slot: &dyn ErasedSlot) -> ResourcePriority {
        if let Some(priority) = slot.priority_override() {
            return priority;
        }
        self.tables
            .lock()
            .type_priorities
            .get(slot.header().resource_type.name())
            .copied()
            .unwrap_or(self.config.default_priority)
    }

    /// Queue a load for `slot` if it needs one and nothing is in flight.
    ///
    /// Must not be called with the tables locked.
    pub fn request_load(&self, slot: &Arc<dyn ErasedSlot>, force: bool) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let Some(transition) = slot.try_begin_load(force) else {
            return false;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let header = slot.header();
        self.emit_transition(header, transition);

        let priority = self.effective_priority(slot.as_ref());
        let job = DataLoadJob {
            slot: Arc::clone(slot),
        };
        match self.data_queue.push(header.id.hash(), priority, job) {
            Ok(_) => {
                tracing::trace!(
                    "Queued load of {} '{}' (priority {})",
                    header.resource_type,
                    header.id,
                    priority
                );
                true
            }
            Err(job) => {
                if let Some(transition) = job.slot.cancel_load() {
                    self.emit_transition(header, transition);
                }
                self.finish_flight();
                false
            }
        }
    }

    fn reprioritize(&self, key: u64, priority: ResourcePriority) {
        self.data_queue.reprioritize(key, priority);
        self.update_queue.reprioritize(key, priority);
        self.main_queue.reprioritize(key, priority);
    }

    fn is_main_thread(&self) -> bool {
        *self.main_thread.lock() == thread::current().id()
    }

    /// Report a caller-contract violation according to the configured policy.
    fn contract_violation(&self, error: ResourceError) -> ResourceError {
        match self.config.contract_policy {
            ContractPolicy::Panic => panic!("{}", error),
            ContractPolicy::Log => {
                tracing::error!("{}", error);
                error
            }
        }
    }

    fn typed<T: Resource>(&self, slot: &Arc<dyn ErasedSlot>) -> ResourceResult<Arc<ResourceSlot<T>>> {
        let header = slot.header();
        let requested = ResourceType::of::<T>();
        let mismatch = || ResourceError::TypeMismatch {
            id: header.id.to_string(),
            requested: requested.name(),
            existing: header.resource_type.name(),
        };
        if header.resource_type != requested {
            return Err(mismatch());
        }
        downcast_slot::<T>(Arc::clone(slot)).ok_or_else(mismatch)
    }

    /// Destroy slots already removed from the table.
    fn destroy_slots(&self, slots: Vec<Arc<dyn ErasedSlot>>) -> usize {
        let count = slots.len();
        for slot in slots {
            let header = slot.header();
            let old = slot.reclaim();
            slot.destroy();
            tracing::debug!(
                "Destroyed {} '{}' (was {})",
                header.resource_type,
                header.id,
                old
            );
            self.emit_transition(
                header,
                Transition {
                    old,
                    new: ResourceState::Unloaded,
                },
            );
            self.events.broadcast(ResourceEvent::Deleted {
                id: header.id.clone(),
                resource_type: header.resource_type,
            });
        }
        count
    }
}

/// The resource manager.
///
/// Turns resource identifiers into typed handles, streams their data in on background
/// workers and reclaims resources nobody uses anymore.
///
/// # Example
///
/// ```ignore
/// let manager = ResourceManager::new(ResourceManagerConfig::default())?;
///
/// let brick: Handle<Texture> = manager.acquire_handle("brick.tex", AcquireMode::Load)?;
/// manager.request_quality_level(&brick, 3)?;
///
/// // Once per frame on the main thread
/// manager.per_frame_update();
///
/// let texture = manager.begin_access(&brick, FallbackPolicy::AllowLoadingFallback)?;
/// ```
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
    workers: Mutex<Vec<WorkerPool>>,
}

impl ResourceManager {
    /// Create a manager and start its worker pools.
    ///
    /// The calling thread becomes the main thread.
    pub fn new(config: ResourceManagerConfig) -> ResourceResult<Self> {
        let shared = Arc::new(ManagerShared::new(config));

        let data_load_workers = {
            let worker_shared = Arc::clone(&shared);
            WorkerPool::spawn(
                "data-load",
                shared.config.data_load_workers.max(1),
                Arc::clone(&shared.data_queue),
                move |job| pipeline::run_data_load(&worker_shared, job),
            )
        };
        let mut data_load_workers = match data_load_workers {
            Ok(pool) => pool,
            Err(e) => {
                shared.data_queue.close();
                return Err(e.into());
            }
        };

        let content_update_workers = {
            let worker_shared = Arc::clone(&shared);
            WorkerPool::spawn(
                "content-update",
                shared.config.content_update_workers.max(1),
                Arc::clone(&shared.update_queue),
                move |job| pipeline::run_content_update(&worker_shared, job),
            )
        };
        let content_update_workers = match content_update_workers {
            Ok(pool) => pool,
            Err(e) => {
                shared.data_queue.close();
                shared.update_queue.close();
                data_load_workers.join();
                return Err(e.into());
            }
        };

        tracing::info!(
            "ResourceManager started with {} data-load and {} content-update workers",
            data_load_workers.thread_count(),
            content_update_workers.thread_count()
        );

        Ok(Self {
            shared,
            workers: Mutex::new(vec![data_load_workers, content_update_workers]),
        })
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.shared.config
    }

    /// Make the calling thread the one that runs main-thread update tasks.
    pub fn designate_main_thread(&self) {
        *self.shared.main_thread.lock() = thread::current().id();
    }

    fn ensure_running(&self) -> ResourceResult<()> {
        if self.shared.is_shutting_down() {
            Err(ResourceError::ManagerShuttingDown)
        } else {
            Ok(())
        }
    }

    fn check_handle<T: Resource>(&self, handle: &Handle<T>) -> ResourceResult<()> {
        self.ensure_running()?;
        let header = &handle.slot.header;
        if header.owner != self.shared.id {
            return Err(self.shared.contract_violation(ResourceError::InvalidHandle {
                reason: format!("'{}' belongs to another resource manager", header.id),
            }));
        }
        if header.is_destroyed() {
            return Err(self.shared.contract_violation(ResourceError::InvalidHandle {
                reason: format!("'{}' has already been destroyed", header.id),
            }));
        }
        Ok(())
    }

    fn erased<T: Resource>(handle: &Handle<T>) -> Arc<dyn ErasedSlot> {
        handle.slot.clone()
    }

    // --- Handles -------------------------------------------------------------------

    /// Get a handle to the resource `id` of type `T`, creating the entry if needed.
    ///
    /// Never blocks on I/O. With [`AcquireMode::Load`] a load is queued unless the
    /// resource is already loaded or loading.
    pub fn acquire_handle<T: Resource>(
        &self,
        id: impl Into<ResourceId>,
        mode: AcquireMode,
    ) -> ResourceResult<Handle<T>> {
        self.acquire_inner(id.into(), mode, None)
    }

    /// Like [`acquire_handle`](Self::acquire_handle), but a newly created resource loads
    /// through `loader` for its whole lifetime.
    pub fn acquire_with_custom_loader<T: Resource>(
        &self,
        id: impl Into<ResourceId>,
        loader: Arc<dyn ResourceTypeLoader>,
    ) -> ResourceResult<Handle<T>> {
        self.acquire_inner(id.into(), AcquireMode::Load, Some(loader))
    }

    fn acquire_inner<T: Resource>(
        &self,
        id: ResourceId,
        mode: AcquireMode,
        custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
    ) -> ResourceResult<Handle<T>> {
        profile_function!();
        self.ensure_running()?;
        let now = Instant::now();

        let lookup = {
            let mut tables = self.shared.tables.lock();
            let id = tables.resolve_name(id);
            match tables.resources.get(&id) {
                Some(existing) => self.shared.typed::<T>(existing).map(|slot| {
                    slot.retain(now);
                    (slot, false)
                }),
                None => {
                    let slot = Arc::new(ResourceSlot::<T>::new(id.clone(), self.shared.id, now));
                    slot.retain(now);
                    if let Some(loader) = custom_loader.clone() {
                        slot.inner.lock().custom_loader = Some(loader);
                    }
                    let erased: Arc<dyn ErasedSlot> = slot.clone();
                    tables.resources.insert(id, erased);
                    Ok((slot, true))
                }
            }
        };

        let (slot, created) = lookup.map_err(|e| self.shared.contract_violation(e))?;
        let handle = Handle::from_retained(slot);

        if created {
            tracing::debug!("Created {} '{}'", T::type_name(), handle.id());
            self.shared.events.broadcast(ResourceEvent::Created {
                id: handle.id().clone(),
                resource_type: handle.resource_type(),
            });
        } else if custom_loader.is_some() {
            tracing::debug!(
                "{} '{}' already exists, custom loader ignored",
                T::type_name(),
                handle.id()
            );
        }

        if mode == AcquireMode::Load {
            self.shared.request_load(&Self::erased(&handle), false);
        }
        Ok(handle)
    }

    /// Get a handle to an existing resource without creating one.
    pub fn get_existing<T: Resource>(&self, id: impl Into<ResourceId>) -> Option<Handle<T>> {
        if self.shared.is_shutting_down() {
            return None;
        }
        let now = Instant::now();
        let lookup = {
            let tables = self.shared.tables.lock();
            let id = tables.resolve_name(id.into());
            let existing = tables.resources.get(&id)?;
            self.shared.typed::<T>(existing).inspect(|slot| slot.retain(now))
        };
        match lookup {
            Ok(slot) => Some(Handle::from_retained(slot)),
            Err(e) => {
                self.shared.contract_violation(e);
                None
            }
        }
    }

    /// Create a resource directly from a descriptor.
    ///
    /// The resource is `Loaded` right away and is never reloaded. If `id` already exists
    /// the existing resource is returned untouched.
    pub fn create_resource<T: Resource>(
        &self,
        id: impl Into<ResourceId>,
        descriptor: T::Descriptor,
    ) -> ResourceResult<Handle<T>> {
        profile_function!();
        self.ensure_running()?;
        let id = self.shared.tables.lock().resolve_name(id.into());
        if let Some(existing) = self.get_existing::<T>(id.clone()) {
            return Ok(existing);
        }

        let loaded = T::create_resource(descriptor).map_err(|e| match e {
            ResourceError::MalformedPayload { message, .. } => {
                ResourceError::malformed(&id, message)
            }
            other => other,
        })?;

        let now = Instant::now();
        let lookup = {
            let mut tables = self.shared.tables.lock();
            match tables.resources.get(&id) {
                // Lost a race against another creator
                Some(existing) => self.shared.typed::<T>(existing).map(|slot| {
                    slot.retain(now);
                    (slot, None)
                }),
                None => {
                    let slot = Arc::new(ResourceSlot::<T>::new(id.clone(), self.shared.id, now));
                    slot.retain(now);
                    let transition = publish_created(&slot, loaded);
                    let erased: Arc<dyn ErasedSlot> = slot.clone();
                    tables.resources.insert(id, erased);
                    Ok((slot, Some(transition)))
                }
            }
        };

        let (slot, transition) = lookup.map_err(|e| self.shared.contract_violation(e))?;
        let handle = Handle::from_retained(slot);
        if let Some(transition) = transition {
            tracing::debug!("Created {} '{}' from a descriptor", T::type_name(), handle.id());
            self.shared.events.broadcast(ResourceEvent::Created {
                id: handle.id().clone(),
                resource_type: handle.resource_type(),
            });
            self.shared.emit_transition(&handle.slot.header, transition);
        }
        Ok(handle)
    }

    /// Produce an identifier that no live resource uses.
    pub fn generate_unique_resource_id(&self, prefix: &str) -> ResourceId {
        let tables = self.shared.tables.lock();
        loop {
            let n = self.shared.unique_counter.fetch_add(1, Ordering::Relaxed);
            let id = ResourceId::new(format!("{}-{}", prefix, n));
            if !tables.resources.contains_key(&id) {
                return id;
            }
        }
    }

    // --- Quality and priority -----------------------------------------------------

    /// Ask for `level` quality levels. Queues a load when the resource holds fewer and
    /// more can be streamed in.
    pub fn request_quality_level<T: Resource>(&self, handle: &Handle<T>, level: u32) -> ResourceResult<()> {
        self.check_handle(handle)?;
        handle.slot.inner.lock().requested_quality = level;
        self.shared.request_load(&Self::erased(handle), false);
        Ok(())
    }

    /// Drop the finest quality level of a loaded resource.
    ///
    /// Refused while a request is in flight or while any lock still holds the payload.
    /// A resource left without levels returns to `Unloaded`.
    pub fn discard_quality_level<T: Resource>(&self, handle: &Handle<T>) -> ResourceResult<bool> {
        self.check_handle(handle)?;
        let slot = &handle.slot;
        let transition = {
            let mut inner = slot.inner.lock();
            if inner.in_flight || inner.state != ResourceState::Loaded {
                return Ok(false);
            }
            let Some(payload) = inner.payload.as_mut().and_then(Arc::get_mut) else {
                return Ok(false);
            };
            let desc = payload.unload_data(Unload::OneQualityLevel);
            let memory = payload.memory_usage();

            inner.memory = memory;
            inner.quality_loaded = desc.quality_levels_discardable;
            inner.quality_loadable = desc.quality_levels_loadable;
            inner.requested_quality = inner.requested_quality.min(desc.quality_levels_discardable);

            if desc.quality_levels_discardable == 0 || desc.state == ResourceState::Unloaded {
                inner.clear_payload();
                Some(inner.transition(ResourceState::Unloaded))
            } else {
                None
            }
        };

        tracing::debug!("Discarded a quality level of {} '{}'", T::type_name(), handle.id());
        if let Some(transition) = transition {
            self.shared.emit_transition(&slot.header, transition);
        }
        Ok(true)
    }

    /// Set the scheduling priority of every resource of type `T` without an override.
    pub fn set_type_priority<T: Resource>(&self, priority: ResourcePriority) {
        let ty = ResourceType::of::<T>();
        let affected: Vec<Arc<dyn ErasedSlot>> = {
            let mut tables = self.shared.tables.lock();
            tables.type_priorities.insert(ty.name(), priority);
            tables
                .resources
                .values()
                .filter(|slot| slot.header().resource_type == ty)
                .cloned()
                .collect()
        };

        for slot in affected {
            if slot.priority_override().is_none() {
                self.shared.reprioritize(slot.header().id.hash(), priority);
            }
        }
    }

    /// Override the priority of one resource, or clear the override with `None`.
    pub fn set_resource_priority<T: Resource>(
        &self,
        handle: &Handle<T>,
        priority: Option<ResourcePriority>,
    ) -> ResourceResult<()> {
        self.check_handle(handle)?;
        handle.slot.inner.lock().priority_override = priority;
        let effective = self.shared.effective_priority(handle.slot.as_ref());
        self.shared.reprioritize(handle.id().hash(), effective);
        Ok(())
    }

    // --- Access ---------------------------------------------------------------------

    /// Read a resource under `policy`.
    ///
    /// Accessing an unloaded resource queues its load (except under
    /// [`FallbackPolicy::NoFallback`]). A resource whose load failed is served as the
    /// type's missing fallback, or fails with [`ResourceError::Missing`].
    pub fn begin_access<'a, T: Resource>(
        &self,
        handle: &'a Handle<T>,
        policy: FallbackPolicy,
    ) -> ResourceResult<ResourceLock<'a, T>> {
        profile_function!();
        self.check_handle(handle)?;
        let slot = &handle.slot;
        slot.touch(Instant::now());

        let forced = self.shared.force_no_fallback_frames.load(Ordering::Acquire) > 0;
        let policy = if forced && policy.allows_fallback() {
            FallbackPolicy::BlockTillLoaded
        } else {
            policy
        };

        if policy != FallbackPolicy::NoFallback {
            self.shared.request_load(&Self::erased(handle), false);
        }

        let (state, payload) = {
            let inner = slot.inner.lock();
            (inner.state, inner.payload.clone())
        };

        match (state, payload) {
            (ResourceState::Loaded, Some(payload)) => {
                return Ok(ResourceLock::new(handle, payload, LockSource::Loaded));
            }
            (ResourceState::LoadedResourceMissing, _) => {
                return self.missing_access(handle, policy);
            }
            (_, previous) => match policy {
                FallbackPolicy::NoFallback => {
                    return Err(ResourceError::NotReady {
                        id: handle.id().to_string(),
                    });
                }
                FallbackPolicy::AllowFallback => {
                    if let Some(fallback) = self.loading_fallback::<T>() {
                        return Ok(ResourceLock::new(handle, fallback, LockSource::LoadingFallback));
                    }
                    if let Some(previous) = previous {
                        return Ok(ResourceLock::new(handle, previous, LockSource::PreviousQuality));
                    }
                }
                FallbackPolicy::AllowLoadingFallback => {
                    if let Some(previous) = previous {
                        return Ok(ResourceLock::new(handle, previous, LockSource::PreviousQuality));
                    }
                    if let Some(fallback) = self.loading_fallback::<T>() {
                        return Ok(ResourceLock::new(handle, fallback, LockSource::LoadingFallback));
                    }
                }
                FallbackPolicy::BlockTillLoaded => {}
            },
        }

        self.block_till_loaded(handle)
    }

    fn missing_access<'a, T: Resource>(
        &self,
        handle: &'a Handle<T>,
        policy: FallbackPolicy,
    ) -> ResourceResult<ResourceLock<'a, T>> {
        if policy != FallbackPolicy::NoFallback
            && let Some(fallback) = self.missing_fallback::<T>()
        {
            return Ok(ResourceLock::new(handle, fallback, LockSource::MissingFallback));
        }
        tracing::warn!("{} '{}' is missing", T::type_name(), handle.id());
        Err(ResourceError::Missing {
            id: handle.id().to_string(),
        })
    }

    fn block_till_loaded<'a, T: Resource>(&self, handle: &'a Handle<T>) -> ResourceResult<ResourceLock<'a, T>> {
        profile_function!();
        let slot = &handle.slot;
        let on_main_thread = self.shared.is_main_thread();

        let mut inner = slot.inner.lock();
        loop {
            if self.shared.is_shutting_down() || slot.header.is_destroyed() {
                return Err(ResourceError::ManagerShuttingDown);
            }

            let (state, in_flight) = (inner.state, inner.in_flight);
            match state {
                ResourceState::Loaded => {
                    if let Some(payload) = inner.payload.clone() {
                        return Ok(ResourceLock::new(handle, payload, LockSource::Loaded));
                    }
                }
                ResourceState::LoadedResourceMissing => {
                    drop(inner);
                    return self.missing_access(handle, FallbackPolicy::BlockTillLoaded);
                }
                ResourceState::Unloaded if !in_flight => {
                    // Reverted by a stale request while we were waiting
                    drop(inner);
                    self.shared.request_load(&Self::erased(handle), false);
                    inner = slot.inner.lock();
                    continue;
                }
                _ => {}
            }

            if on_main_thread {
                // Keep main-thread updates flowing, ours may be one of them
                slot.done.wait_for(&mut inner, PUMP_INTERVAL);
                drop(inner);
                self.run_main_thread_update_tasks();
                inner = slot.inner.lock();
            } else {
                slot.done.wait(&mut inner);
            }
        }
    }

    fn fallbacks<T: Resource>(&self) -> (Option<Arc<T>>, Option<Arc<T>>) {
        let ask_placeholder = {
            let mut tables = self.shared.tables.lock();
            match tables.fallbacks_mut::<T>() {
                Some(fallbacks) if fallbacks.placeholder.is_some() => {
                    return (
                        fallbacks.loading.clone().or_else(|| fallbacks.placeholder.clone().flatten()),
                        fallbacks.missing.clone(),
                    );
                }
                Some(_) => true,
                None => false,
            }
        };

        if !ask_placeholder {
            return (None, None);
        }

        // Built outside the lock, it is user code
        let placeholder = T::placeholder().map(Arc::new);
        let mut tables = self.shared.tables.lock();
        match tables.fallbacks_mut::<T>() {
            Some(fallbacks) => {
                let placeholder = fallbacks.placeholder.get_or_insert(placeholder).clone();
                (
                    fallbacks.loading.clone().or(placeholder),
                    fallbacks.missing.clone(),
                )
            }
            None => (None, None),
        }
    }

    fn loading_fallback<T: Resource>(&self) -> Option<Arc<T>> {
        self.fallbacks::<T>().0
    }

    fn missing_fallback<T: Resource>(&self) -> Option<Arc<T>> {
        let (loading, missing) = self.fallbacks::<T>();
        missing.or(loading)
    }

    /// Serve `payload` instead of the type's placeholder while resources load.
    pub fn set_type_loading_fallback<T: Resource>(&self, payload: T) {
        let payload = Arc::new(payload);
        if let Some(fallbacks) = self.shared.tables.lock().fallbacks_mut::<T>() {
            fallbacks.loading = Some(payload);
        }
    }

    /// Serve `payload` for resources whose load failed.
    pub fn set_type_missing_fallback<T: Resource>(&self, payload: T) {
        let payload = Arc::new(payload);
        if let Some(fallbacks) = self.shared.tables.lock().fallbacks_mut::<T>() {
            fallbacks.missing = Some(payload);
        }
    }

    /// Treat fallback policies as [`FallbackPolicy::BlockTillLoaded`] for the next
    /// `frames` calls of [`per_frame_update`](Self::per_frame_update).
    ///
    /// A shorter request never shortens a longer one that is still counting down.
    pub fn force_no_fallback_acquisition(&self, frames: u32) {
        self.shared
            .force_no_fallback_frames
            .fetch_max(frames, Ordering::AcqRel);
    }

    // --- Loaders ------------------------------------------------------------------

    /// Set the loader for resources of type `T`.
    pub fn set_type_loader<T: Resource>(&self, loader: Arc<dyn ResourceTypeLoader>) {
        self.shared
            .tables
            .lock()
            .loaders
            .set_type_loader(ResourceType::of::<T>(), loader);
    }

    /// Replace the default file loader.
    pub fn set_default_loader(&self, loader: Arc<dyn ResourceTypeLoader>) {
        self.shared.tables.lock().loaders.set_default(loader);
    }

    /// Register a loader variant for `T`, used for identifiers `decider` accepts.
    ///
    /// Variants are tried in registration order, so register the most specific first.
    pub fn register_type_override<T: Resource>(
        &self,
        variant: &'static str,
        decider: impl Fn(&ResourceId) -> bool + Send + Sync + 'static,
        loader: Arc<dyn ResourceTypeLoader>,
    ) {
        let decider: OverrideDecider = Arc::new(decider);
        self.shared.tables.lock().loaders.register_override(
            ResourceType::of::<T>(),
            variant,
            decider,
            loader,
        );
    }

    pub fn unregister_type_override<T: Resource>(&self, variant: &str) -> bool {
        self.shared
            .tables
            .lock()
            .loaders
            .unregister_override(ResourceType::of::<T>(), variant)
    }

    /// Replace the data of a resource through `loader` and stop file reloads from
    /// overwriting it.
    pub fn update_with_custom_loader<T: Resource>(
        &self,
        handle: &Handle<T>,
        loader: Arc<dyn ResourceTypeLoader>,
    ) -> ResourceResult<bool> {
        self.check_handle(handle)?;
        {
            let mut inner = handle.slot.inner.lock();
            inner.custom_loader = Some(loader);
            inner.prevent_file_reload = true;
        }
        Ok(self.shared.request_load(&Self::erased(handle), true))
    }

    /// Undo [`update_with_custom_loader`](Self::update_with_custom_loader) and reload
    /// through the regular loader.
    pub fn restore_resource<T: Resource>(&self, handle: &Handle<T>) -> ResourceResult<bool> {
        self.check_handle(handle)?;
        {
            let mut inner = handle.slot.inner.lock();
            inner.custom_loader = None;
            inner.prevent_file_reload = false;
        }
        Ok(self.shared.request_load(&Self::erased(handle), true))
    }

    // --- Named resources ------------------------------------------------------------

    /// Make `alias` resolve to `target` for future lookups.
    pub fn register_named_resource(&self, alias: impl Into<ResourceId>, target: impl Into<ResourceId>) {
        let (alias, target) = (alias.into(), target.into());
        tracing::debug!("Named resource '{}' -> '{}'", alias, target);
        self.shared.tables.lock().named.insert(alias, target);
    }

    pub fn unregister_named_resource(&self, alias: impl Into<ResourceId>) -> bool {
        self.shared.tables.lock().named.remove(&alias.into()).is_some()
    }

    // --- Reload -------------------------------------------------------------------

    /// Reload a loaded or missing resource.
    ///
    /// Without `force` the reload only happens if the loader reports the data as
    /// outdated. Created resources and resources updated through a custom loader are
    /// never reloaded.
    pub fn reload_resource<T: Resource>(&self, handle: &Handle<T>, force: bool) -> ResourceResult<bool> {
        self.check_handle(handle)?;
        Ok(self.reload_slot(&Self::erased(handle), force))
    }

    /// Reload every resource. Returns how many reloads were queued.
    pub fn reload_all_resources(&self, force: bool) -> usize {
        profile_function!();
        if self.shared.is_shutting_down() {
            return 0;
        }
        let slots = self.shared.tables.lock().slots();
        let reloaded = slots
            .iter()
            .filter(|slot| self.reload_slot(slot, force))
            .count();
        tracing::debug!("Reloading {} of {} resources", reloaded, slots.len());
        reloaded
    }

    fn reload_slot(&self, slot: &Arc<dyn ErasedSlot>, force: bool) -> bool {
        let Some(candidate) = slot.reload_candidate() else {
            return false;
        };
        let header = slot.header();

        if !force {
            let resolved = self.shared.tables.lock().loaders.resolve(
                header.resource_type,
                &header.id,
                candidate.custom_loader.as_ref(),
            );
            if !resolved
                .loader
                .is_resource_outdated(&header.id, candidate.loaded_modified)
            {
                tracing::trace!("{} '{}' is up to date", header.resource_type, header.id);
                return false;
            }
        }

        let started = self.shared.request_load(slot, true);
        if started {
            tracing::debug!("Reloading {} '{}'", header.resource_type, header.id);
        }
        started
    }

    // --- Per-frame work -------------------------------------------------------------

    /// Run every queued content update with main-thread affinity.
    ///
    /// Call once per frame on the main thread. Calls from any other thread are a contract
    /// violation and run nothing.
    pub fn run_main_thread_update_tasks(&self) -> usize {
        profile_function!();
        if !self.shared.is_main_thread() {
            self.shared.contract_violation(ResourceError::WrongThread {
                operation: "run_main_thread_update_tasks",
            });
            return 0;
        }
        let mut ran = 0;
        while let Some(job) = self.shared.main_queue.try_pop() {
            pipeline::run_content_update(&self.shared, job);
            ran += 1;
        }
        ran
    }

    /// Run main-thread updates, count down forced blocking and sweep unused resources.
    pub fn per_frame_update(&self) {
        profile_function!();
        self.run_main_thread_update_tasks();

        let _ = self.shared.force_no_fallback_frames.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |frames| frames.checked_sub(1),
        );

        if !self.shared.config.auto_free_unused_timeout.is_zero() {
            self.sweep_auto_unload(Instant::now());
        }
    }

    /// Reclaim resources that have been unused for long enough. Returns how many were
    /// destroyed.
    ///
    /// A resource qualifies when nothing references it, no request is in flight, it was
    /// last acquired more than `auto_free_unused_threshold` ago and it has been
    /// unreferenced for more than `auto_free_unused_timeout`.
    pub fn sweep_auto_unload(&self, now: Instant) -> usize {
        profile_function!();
        let threshold = self.shared.config.auto_free_unused_threshold;
        let timeout = self.shared.config.auto_free_unused_timeout;

        let reclaimed = {
            let mut tables = self.shared.tables.lock();
            let len = tables.resources.len();
            if len == 0 {
                return 0;
            }
            let budget = self.shared.config.sweep_budget.unwrap_or(len).min(len);
            let start = tables.sweep_cursor % len;

            let mut doomed: Vec<usize> = (0..budget)
                .map(|offset| (start + offset) % len)
                .filter(|&index| {
                    tables
                        .resources
                        .get_index(index)
                        .is_some_and(|(_, slot)| slot.is_sweepable(now, threshold, timeout))
                })
                .collect();

            // Highest first, so swap_remove never moves a doomed entry
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            let removed: Vec<Arc<dyn ErasedSlot>> = doomed
                .into_iter()
                .filter_map(|index| tables.resources.swap_remove_index(index))
                .map(|(_, slot)| slot)
                .collect();

            let remaining = tables.resources.len();
            tables.sweep_cursor = if remaining == 0 {
                0
            } else {
                (start + budget) % remaining
            };
            removed
        };

        let count = self.shared.destroy_slots(reclaimed);
        if count > 0 {
            tracing::debug!("Auto-unload reclaimed {} resources", count);
        }
        count
    }

    /// Destroy every unreferenced resource that has no request in flight, ignoring the
    /// sweep's hysteresis.
    pub fn free_all_unused_resources(&self) -> usize {
        profile_function!();
        let unused = {
            let mut tables = self.shared.tables.lock();
            let mut unused = Vec::new();
            tables.resources.retain(|_, slot| {
                if slot.is_unused() {
                    unused.push(Arc::clone(slot));
                    false
                } else {
                    true
                }
            });
            tables.sweep_cursor = 0;
            unused
        };
        self.shared.destroy_slots(unused)
    }

    // --- Diagnostics ----------------------------------------------------------------

    /// Whether any resource has a request somewhere in the pipeline.
    pub fn is_any_loading_in_progress(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) > 0
    }

    /// Pump main-thread updates until nothing is loading. Returns `false` if `max_wait`
    /// ran out first.
    ///
    /// Off the main thread this only waits.
    pub fn pump_until_idle(&self, max_wait: Duration) -> bool {
        let start = Instant::now();
        let on_main_thread = self.shared.is_main_thread();
        loop {
            if on_main_thread {
                self.run_main_thread_update_tasks();
            }
            if !self.is_any_loading_in_progress() {
                return true;
            }
            if start.elapsed() >= max_wait {
                return false;
            }
            thread::sleep(PUMP_INTERVAL);
        }
    }

    pub fn resource_info<T: Resource>(&self, handle: &Handle<T>) -> ResourceResult<ResourceInfo> {
        self.check_handle(handle)?;
        let priority = self.shared.effective_priority(handle.slot.as_ref());
        Ok(handle.slot.info(priority))
    }

    /// Memory held by every resource.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.shared
            .tables
            .lock()
            .resources
            .values()
            .fold(MemoryUsage::default(), |total, slot| total + slot.memory_usage())
    }

    pub fn resource_count(&self) -> usize {
        self.shared.tables.lock().resources.len()
    }

    /// Send a [`ResourceEvent::Exists`] for every live resource.
    pub fn broadcast_exists(&self) {
        let slots = self.shared.tables.lock().slots();
        for slot in slots {
            let header = slot.header();
            self.shared.events.broadcast(ResourceEvent::Exists {
                id: header.id.clone(),
                resource_type: header.resource_type,
                state: slot.state(),
            });
        }
    }

    /// Listen to resource events until the returned subscription is dropped.
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    // --- Shutdown -------------------------------------------------------------------

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Stop the manager.
    ///
    /// New requests are rejected, queued work is discarded, blocked callers are woken,
    /// the workers are joined and every remaining resource is destroyed regardless of
    /// its handles. Runs at most once.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down ResourceManager");

        let discarded_loads = self.shared.data_queue.close();
        let mut discarded_updates = self.shared.update_queue.close();
        discarded_updates.extend(self.shared.main_queue.close());
        tracing::debug!(
            "Discarding {} queued loads and {} queued updates",
            discarded_loads.len(),
            discarded_updates.len()
        );

        for job in discarded_loads {
            if let Some(transition) = job.slot.cancel_load() {
                self.shared.emit_transition(job.slot.header(), transition);
            }
            self.shared.finish_flight();
        }
        for job in discarded_updates {
            job.loader
                .close_data_stream(&job.slot.header().id, &job.stream);
            if let Some(transition) = job.slot.cancel_load() {
                self.shared.emit_transition(job.slot.header(), transition);
            }
            self.shared.finish_flight();
        }

        let slots = self.shared.tables.lock().slots();
        for slot in slots {
            slot.wake_all();
        }

        for pool in self.workers.lock().iter_mut() {
            pool.join();
        }

        let remaining: Vec<Arc<dyn ErasedSlot>> = self
            .shared
            .tables
            .lock()
            .resources
            .drain(..)
            .map(|(_, slot)| slot)
            .collect();
        let destroyed = self.shared.destroy_slots(remaining);
        tracing::info!("ResourceManager shutdown complete ({} resources destroyed)", destroyed);
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
