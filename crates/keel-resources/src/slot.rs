//! Per-resource bookkeeping and the type-erased interface the manager drives.
//!
//! A [`ResourceSlot`] owns one resource: its state machine, its published payload and
//! everything the scheduler and the sweep need to know about it. The manager stores
//! slots of every type in a single table behind the crate-private [`ErasedSlot`] trait.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::error::ResourceError;
use crate::id::{ResourceId, ResourceType};
use crate::loader::{LoaderOrigin, ResourceStream, ResourceTypeLoader};
use crate::queue::ResourcePriority;
use crate::resource::{LoadContext, Loaded, Resource, UpdateAffinity};
use crate::state::{MemoryUsage, ResourceInfo, ResourceState, Unload};

/// A state change, reported back to the manager so it can broadcast it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub old: ResourceState,
    pub new: ResourceState,
}

/// Outcome of popping a data-load job.
pub(crate) enum DataLoadStart {
    /// Go ahead, using the instance's custom loader if it has one.
    Proceed {
        custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
    },
    /// Nobody wants the resource anymore. It was reverted.
    Stale(Transition),
}

/// Outcome of running `update_content`.
pub(crate) enum UpdateOutcome {
    Stale(Transition),
    Updated {
        transition: Transition,
        /// More quality levels were requested and can still be streamed in.
        wants_more: bool,
    },
    Failed {
        transition: Transition,
        error: ResourceError,
    },
}

/// What a reload needs to know about a resource.
pub(crate) struct ReloadCandidate {
    pub custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
    pub loaded_modified: Option<SystemTime>,
}

/// Fields shared by every slot regardless of its payload type.
pub(crate) struct SlotHeader {
    pub id: ResourceId,
    pub resource_type: ResourceType,
    /// The manager that owns this slot.
    pub owner: u64,
    ref_count: AtomicU32,
    destroyed: AtomicBool,
}

impl SlotHeader {
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// Mutable state of one resource. Guarded by the slot's mutex.
pub(crate) struct SlotInner<T> {
    pub state: ResourceState,
    /// State before the in-flight request, restored if the request goes stale.
    pub previous_state: ResourceState,
    pub in_flight: bool,
    /// The in-flight request rebuilds from scratch instead of adding a quality level.
    pub fresh_load: bool,
    /// Last fully built payload.
    pub payload: Option<Arc<T>>,
    pub quality_loaded: u32,
    pub quality_loadable: u32,
    pub requested_quality: u32,
    pub memory: MemoryUsage,
    pub last_acquired: Instant,
    pub unreferenced_since: Option<Instant>,
    pub priority_override: Option<ResourcePriority>,
    pub custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
    pub prevent_file_reload: bool,
    /// Created resources have no backing data and cannot be reloaded.
    pub reloadable: bool,
    pub loaded_via: Option<&'static str>,
    pub modified: Option<SystemTime>,
}

impl<T> SlotInner<T> {
    fn new(now: Instant) -> Self {
        Self {
            state: ResourceState::Unloaded,
            previous_state: ResourceState::Unloaded,
            in_flight: false,
            fresh_load: false,
            payload: None,
            quality_loaded: 0,
            quality_loadable: 0,
            requested_quality: 0,
            memory: MemoryUsage::default(),
            last_acquired: now,
            unreferenced_since: None,
            priority_override: None,
            custom_loader: None,
            prevent_file_reload: false,
            reloadable: true,
            loaded_via: None,
            modified: None,
        }
    }

    pub(crate) fn transition(&mut self, new: ResourceState) -> Transition {
        let old = self.state;
        self.state = new;
        Transition { old, new }
    }

    /// Undo an in-flight request.
    fn revert(&mut self) -> Transition {
        self.in_flight = false;
        self.fresh_load = false;
        let previous = self.previous_state;
        self.transition(previous)
    }

    pub(crate) fn clear_payload(&mut self) {
        self.payload = None;
        self.quality_loaded = 0;
        self.quality_loadable = 0;
        self.memory = MemoryUsage::default();
    }
}

impl<T: Resource> SlotInner<T> {
    /// Publish a freshly built payload.
    pub(crate) fn publish(&mut self, loaded: Loaded<T>) -> ResourceState {
        let Loaded { payload, desc } = loaded;
        self.memory = payload.memory_usage();
        self.payload = Some(Arc::new(payload));
        self.quality_loaded = desc.quality_levels_discardable;
        self.quality_loadable = desc.quality_levels_loadable;
        match desc.state {
            ResourceState::LoadedResourceMissing => ResourceState::LoadedResourceMissing,
            _ => ResourceState::Loaded,
        }
    }

    /// Whether the resource should be loaded (further) right now.
    fn needs_load(&self) -> bool {
        match self.state {
            ResourceState::Unloaded => true,
            ResourceState::Loaded => {
                self.quality_loadable > 0 && self.quality_loaded < self.requested_quality
            }
            ResourceState::Loading | ResourceState::LoadedResourceMissing => false,
        }
    }
}

/// One resource of type `T`.
pub(crate) struct ResourceSlot<T> {
    pub(crate) header: SlotHeader,
    pub(crate) inner: Mutex<SlotInner<T>>,
    /// Signalled whenever the pipeline finishes with the resource.
    pub(crate) done: Condvar,
}

impl<T: Resource> ResourceSlot<T> {
    pub(crate) fn new(id: ResourceId, owner: u64, now: Instant) -> Self {
        Self {
            header: SlotHeader {
                id,
                resource_type: ResourceType::of::<T>(),
                owner,
                ref_count: AtomicU32::new(0),
                destroyed: AtomicBool::new(false),
            },
            inner: Mutex::new(SlotInner::new(now)),
            done: Condvar::new(),
        }
    }

    /// Drop one logical reference.
    pub(crate) fn release(&self) {
        if self.header.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner.lock();
            // Re-check under the lock: an acquire may have raced us back above zero
            if self.header.ref_count() == 0 {
                inner.unreferenced_since = Some(Instant::now());
            }
        }
    }

    /// Add a logical reference on behalf of an existing handle.
    pub(crate) fn retain_clone(&self) {
        self.header.ref_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Type-erased view of a [`ResourceSlot`].
pub(crate) trait ErasedSlot: Send + Sync {
    fn header(&self) -> &SlotHeader;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn affinity(&self) -> UpdateAffinity;

    fn state(&self) -> ResourceState;

    fn priority_override(&self) -> Option<ResourcePriority>;

    /// Add a logical reference for a new handle and mark the resource as used.
    fn retain(&self, now: Instant);

    /// Mark the resource as used without adding a reference.
    fn touch(&self, now: Instant);

    /// Move to `Loading` if a load is needed (or forced) and nothing is in flight.
    fn try_begin_load(&self, force: bool) -> Option<Transition>;

    fn begin_data_load(&self, shutting_down: bool) -> DataLoadStart;

    fn update_content(
        &self,
        stream: &ResourceStream,
        origin: LoaderOrigin,
        shutting_down: bool,
    ) -> UpdateOutcome;

    /// Record a failed load.
    fn fail_load(&self) -> Transition;

    /// Undo a request that will never be serviced.
    fn cancel_load(&self) -> Option<Transition>;

    fn reload_candidate(&self) -> Option<ReloadCandidate>;

    /// Whether the sweep may reclaim the resource at `now`.
    fn is_sweepable(&self, now: Instant, threshold: Duration, timeout: Duration) -> bool;

    /// Whether the resource is unreferenced and idle.
    fn is_unused(&self) -> bool;

    /// Drop all data and return the state the resource was in.
    fn reclaim(&self) -> ResourceState;

    /// Mark the resource as destroyed and wake every waiter.
    fn destroy(&self);

    /// Wake every thread blocked on the resource.
    fn wake_all(&self);

    fn memory_usage(&self) -> MemoryUsage;

    fn info(&self, priority: ResourcePriority) -> ResourceInfo;
}

impl<T: Resource> ErasedSlot for ResourceSlot<T> {
    fn header(&self) -> &SlotHeader {
        &self.header
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn affinity(&self) -> UpdateAffinity {
        T::UPDATE_AFFINITY
    }

    fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    fn priority_override(&self) -> Option<ResourcePriority> {
        self.inner.lock().priority_override
    }

    fn retain(&self, now: Instant) {
        self.header.ref_count.fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.lock();
        inner.last_acquired = now;
        inner.unreferenced_since = None;
    }

    fn touch(&self, now: Instant) {
        self.inner.lock().last_acquired = now;
    }

    fn try_begin_load(&self, force: bool) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if inner.in_flight || !(force || inner.needs_load()) {
            return None;
        }
        inner.previous_state = inner.state;
        inner.in_flight = true;
        inner.fresh_load = force;
        Some(inner.transition(ResourceState::Loading))
    }

    fn begin_data_load(&self, shutting_down: bool) -> DataLoadStart {
        let mut inner = self.inner.lock();
        if shutting_down || self.header.ref_count() == 0 {
            let transition = inner.revert();
            self.done.notify_all();
            return DataLoadStart::Stale(transition);
        }
        DataLoadStart::Proceed {
            custom_loader: inner.custom_loader.clone(),
        }
    }

    fn update_content(
        &self,
        stream: &ResourceStream,
        origin: LoaderOrigin,
        shutting_down: bool,
    ) -> UpdateOutcome {
        let (previous, quality_loaded, requested_quality) = {
            let mut inner = self.inner.lock();
            if shutting_down || self.header.ref_count() == 0 {
                let transition = inner.revert();
                self.done.notify_all();
                return UpdateOutcome::Stale(transition);
            }
            if inner.fresh_load {
                (None, 0, inner.requested_quality)
            } else {
                (
                    inner.payload.clone(),
                    inner.quality_loaded,
                    inner.requested_quality,
                )
            }
        };

        // The slot stays in flight, so nobody else touches it while the lock is released
        let result = {
            keel_core::profiling::profile_scope!("update_content", T::type_name());
            let ctx = LoadContext::new(&self.header.id, stream, quality_loaded, requested_quality);
            catch_unwind(AssertUnwindSafe(|| T::update_content(previous.as_deref(), ctx)))
                .unwrap_or_else(|panic| {
                    Err(ResourceError::malformed(
                        &self.header.id,
                        format!("update_content panicked: {}", panic_message(panic.as_ref())),
                    ))
                })
        };
        drop(previous);

        let mut inner = self.inner.lock();
        let outcome = match result {
            Ok(loaded) => {
                let new_state = inner.publish(loaded);
                inner.loaded_via = Some(origin.name());
                inner.modified = stream.modified();
                inner.in_flight = false;
                inner.fresh_load = false;
                let transition = inner.transition(new_state);
                let wants_more = self.header.ref_count() > 0 && inner.needs_load();
                UpdateOutcome::Updated {
                    transition,
                    wants_more,
                }
            }
            Err(error) => {
                drop(inner);
                let transition = self.fail_load();
                return UpdateOutcome::Failed { transition, error };
            }
        };
        self.done.notify_all();
        outcome
    }

    fn fail_load(&self) -> Transition {
        let mut inner = self.inner.lock();
        inner.in_flight = false;
        inner.fresh_load = false;
        inner.clear_payload();
        let transition = inner.transition(ResourceState::LoadedResourceMissing);
        self.done.notify_all();
        transition
    }

    fn cancel_load(&self) -> Option<Transition> {
        let mut inner = self.inner.lock();
        if !inner.in_flight {
            return None;
        }
        let transition = inner.revert();
        self.done.notify_all();
        Some(transition)
    }

    fn reload_candidate(&self) -> Option<ReloadCandidate> {
        let inner = self.inner.lock();
        let settled = matches!(
            inner.state,
            ResourceState::Loaded | ResourceState::LoadedResourceMissing
        );
        if !settled || inner.in_flight || !inner.reloadable || inner.prevent_file_reload {
            return None;
        }
        Some(ReloadCandidate {
            custom_loader: inner.custom_loader.clone(),
            loaded_modified: inner.modified,
        })
    }

    fn is_sweepable(&self, now: Instant, threshold: Duration, timeout: Duration) -> bool {
        if self.header.ref_count() != 0 {
            return false;
        }
        let inner = self.inner.lock();
        if inner.in_flight {
            return false;
        }
        let idle = now.saturating_duration_since(inner.last_acquired) > threshold;
        let unreferenced = inner
            .unreferenced_since
            .is_some_and(|since| now.saturating_duration_since(since) > timeout);
        idle && unreferenced
    }

    fn is_unused(&self) -> bool {
        self.header.ref_count() == 0 && !self.inner.lock().in_flight
    }

    fn reclaim(&self) -> ResourceState {
        let mut inner = self.inner.lock();
        // Locks hold a handle, so an unreferenced resource owns its payload alone
        match inner.payload.take().map(Arc::try_unwrap) {
            Some(Ok(mut payload)) => {
                payload.unload_data(Unload::AllQualityLevels);
            }
            Some(Err(_)) => {
                tracing::warn!(
                    "Reclaiming '{}' while its payload is still shared",
                    self.header.id
                );
            }
            None => {}
        }
        inner.clear_payload();
        inner.in_flight = false;
        inner.fresh_load = false;
        let old = inner.state;
        inner.state = ResourceState::Unloaded;
        self.done.notify_all();
        old
    }

    fn destroy(&self) {
        self.header.destroyed.store(true, Ordering::Release);
        self.wake_all();
    }

    fn wake_all(&self) {
        let _inner = self.inner.lock();
        self.done.notify_all();
    }

    fn memory_usage(&self) -> MemoryUsage {
        self.inner.lock().memory
    }

    fn info(&self, priority: ResourcePriority) -> ResourceInfo {
        let inner = self.inner.lock();
        ResourceInfo {
            id: self.header.id.clone(),
            resource_type: self.header.resource_type,
            state: inner.state,
            quality_level: inner.quality_loaded,
            quality_levels_loadable: inner.quality_loadable,
            requested_quality: inner.requested_quality,
            memory: inner.memory,
            ref_count: self.header.ref_count(),
            priority,
            loaded_via: inner.loaded_via,
            reloadable: inner.reloadable && !inner.prevent_file_reload,
        }
    }
}

/// Recover a typed slot from the table.
pub(crate) fn downcast_slot<T: Resource>(
    slot: Arc<dyn ErasedSlot>,
) -> Option<Arc<ResourceSlot<T>>> {
    slot.into_any().downcast::<ResourceSlot<T>>().ok()
}

/// Publish a payload built outside the pipeline (created resources).
pub(crate) fn publish_created<T: Resource>(
    slot: &ResourceSlot<T>,
    loaded: Loaded<T>,
) -> Transition {
    let mut inner = slot.inner.lock();
    let new_state = inner.publish(loaded);
    inner.reloadable = false;
    inner.loaded_via = Some("created");
    let transition = inner.transition(new_state);
    slot.done.notify_all();
    transition
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
