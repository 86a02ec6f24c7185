//! Resource state machine types and load descriptors.

use std::fmt;
use std::ops::{Add, AddAssign};

use crate::id::{ResourceId, ResourceType};
use crate::queue::ResourcePriority;

/// The current state of a resource in the loading pipeline.
///
/// Ordered so that `state <= LoadedResourceMissing` means "no usable payload yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceState {
    /// The resource exists but holds no data.
    #[default]
    Unloaded,

    /// A load request is queued or being serviced.
    Loading,

    /// Loading failed. Terminal until an explicit reload.
    LoadedResourceMissing,

    /// The resource holds usable data.
    Loaded,
}

impl ResourceState {
    /// Returns `true` if the resource is in the `Unloaded` state.
    pub fn is_unloaded(&self) -> bool {
        matches!(self, ResourceState::Unloaded)
    }

    /// Returns `true` if a load is queued or in progress.
    pub fn is_loading(&self) -> bool {
        matches!(self, ResourceState::Loading)
    }

    /// Returns `true` if the resource holds usable data.
    pub fn is_loaded(&self) -> bool {
        matches!(self, ResourceState::Loaded)
    }

    /// Returns `true` if the last load failed.
    pub fn is_missing(&self) -> bool {
        matches!(self, ResourceState::LoadedResourceMissing)
    }

    /// Returns true if loading has completed (successfully or not).
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ResourceState::Loaded | ResourceState::LoadedResourceMissing
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceState::Unloaded => "Unloaded",
            ResourceState::Loading => "Loading",
            ResourceState::LoadedResourceMissing => "LoadedResourceMissing",
            ResourceState::Loaded => "Loaded",
        };
        f.write_str(name)
    }
}

/// Result of a resource hook: the new state and how many quality levels it holds.
///
/// `quality_levels_discardable` is the number of levels currently in memory (the
/// current quality). `quality_levels_loadable` is how many more levels could still be
/// streamed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadDesc {
    pub state: ResourceState,
    pub quality_levels_loadable: u32,
    pub quality_levels_discardable: u32,
}

impl LoadDesc {
    /// A fully loaded resource with a single quality level.
    pub fn loaded() -> Self {
        Self {
            state: ResourceState::Loaded,
            quality_levels_loadable: 0,
            quality_levels_discardable: 1,
        }
    }

    /// A loaded resource that can stream `loadable` more levels.
    pub fn partial(discardable: u32, loadable: u32) -> Self {
        Self {
            state: ResourceState::Loaded,
            quality_levels_loadable: loadable,
            quality_levels_discardable: discardable,
        }
    }

    /// A resource with no data left.
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// The data was found but describes a resource that cannot be used.
    pub fn missing() -> Self {
        Self {
            state: ResourceState::LoadedResourceMissing,
            ..Self::default()
        }
    }
}

/// Which data `unload_data` should drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unload {
    /// Drop every quality level.
    AllQualityLevels,
    /// Drop only the finest level currently held.
    OneQualityLevel,
}

/// Estimated memory held by a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    pub cpu_bytes: u64,
    pub gpu_bytes: u64,
}

impl MemoryUsage {
    pub fn new(cpu_bytes: u64, gpu_bytes: u64) -> Self {
        Self {
            cpu_bytes,
            gpu_bytes,
        }
    }

    pub fn total(&self) -> u64 {
        self.cpu_bytes + self.gpu_bytes
    }
}

impl Add for MemoryUsage {
    type Output = MemoryUsage;

    fn add(self, rhs: Self) -> Self::Output {
        MemoryUsage {
            cpu_bytes: self.cpu_bytes + rhs.cpu_bytes,
            gpu_bytes: self.gpu_bytes + rhs.gpu_bytes,
        }
    }
}

impl AddAssign for MemoryUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Snapshot of a resource's bookkeeping, for tools and tests.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub resource_type: ResourceType,
    pub state: ResourceState,
    /// Quality levels currently in memory.
    pub quality_level: u32,
    /// Quality levels that could still be streamed in.
    pub quality_levels_loadable: u32,
    /// Quality the callers asked for.
    pub requested_quality: u32,
    pub memory: MemoryUsage,
    pub ref_count: u32,
    pub priority: ResourcePriority,
    /// Name of the loader variant that served the last load, if any.
    pub loaded_via: Option<&'static str>,
    pub reloadable: bool,
}
