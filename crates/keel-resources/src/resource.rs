//! The lifecycle contract every concrete resource type implements.
//!
//! The contract is split into capability traits. [`Loadable`] covers creation, content
//! updates and unloading. [`MemoryReportable`] covers memory estimation. [`Resource`]
//! ties them together with the type's name, placeholder and thread affinity.

use crate::error::{ResourceError, ResourceResult};
use crate::id::ResourceId;
use crate::loader::ResourceStream;
use crate::state::{LoadDesc, MemoryUsage, Unload};

/// Where a type's `update_content` is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateAffinity {
    /// Any content-update worker may run it.
    #[default]
    AnyThread,
    /// Only the thread calling `run_main_thread_update_tasks` may run it.
    MainThread,
}

/// Context provided to [`Loadable::update_content`].
pub struct LoadContext<'a> {
    /// The identifier of the resource being loaded.
    pub id: &'a ResourceId,
    /// The stream produced by the resource's loader.
    pub stream: &'a ResourceStream,
    /// Quality levels already in memory before this update.
    pub quality_levels_loaded: u32,
    /// Quality the callers asked for.
    pub requested_quality: u32,
}

impl<'a> LoadContext<'a> {
    /// Create a new load context.
    pub fn new(
        id: &'a ResourceId,
        stream: &'a ResourceStream,
        quality_levels_loaded: u32,
        requested_quality: u32,
    ) -> Self {
        Self {
            id,
            stream,
            quality_levels_loaded,
            requested_quality,
        }
    }

    /// The raw bytes of the stream.
    pub fn bytes(&self) -> &[u8] {
        self.stream.bytes()
    }

    /// Build a [`ResourceError::MalformedPayload`] for this resource.
    pub fn malformed(&self, message: impl Into<String>) -> ResourceError {
        ResourceError::malformed(self.id, message)
    }
}

/// A freshly built payload together with its load descriptor.
#[derive(Debug)]
pub struct Loaded<T> {
    pub payload: T,
    pub desc: LoadDesc,
}

impl<T> Loaded<T> {
    pub fn new(payload: T, desc: LoadDesc) -> Self {
        Self { payload, desc }
    }

    /// A payload that holds its one and only quality level.
    pub fn complete(payload: T) -> Self {
        Self::new(payload, LoadDesc::loaded())
    }
}

/// Creation, content update and unloading hooks.
///
/// `update_content` builds a *new* payload instead of mutating the live one. Readers
/// keep seeing the previous payload until the new one is complete, so nobody can observe
/// a half-built object.
pub trait Loadable: Sized {
    /// Data accepted by [`Loadable::create_resource`].
    type Descriptor: Send + 'static;

    /// Build the payload from a loaded stream.
    ///
    /// `previous` is the last fully loaded payload, if any. Incremental types use it to
    /// add one more quality level.
    fn update_content(previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>>;

    /// Build the payload directly from a descriptor, without a loader.
    fn create_resource(descriptor: Self::Descriptor) -> ResourceResult<Loaded<Self>> {
        let _ = descriptor;
        Err(ResourceError::MalformedPayload {
            id: String::new(),
            message: "resource type cannot be created from a descriptor".to_string(),
        })
    }

    /// Release data. The returned descriptor tells the manager what is left.
    fn unload_data(&mut self, what: Unload) -> LoadDesc {
        let _ = what;
        LoadDesc::unloaded()
    }
}

/// Memory estimation hook.
pub trait MemoryReportable {
    fn memory_usage(&self) -> MemoryUsage;
}

/// A cacheable, lazily loaded resource type.
pub trait Resource: Loadable + MemoryReportable + Send + Sync + 'static {
    /// Stable, human-readable type name. Also the key of the per-type priority table.
    fn type_name() -> &'static str;

    /// Where `update_content` must run.
    const UPDATE_AFFINITY: UpdateAffinity = UpdateAffinity::AnyThread;

    /// Built-in placeholder served while the real data is unavailable.
    fn placeholder() -> Option<Self> {
        None
    }
}
