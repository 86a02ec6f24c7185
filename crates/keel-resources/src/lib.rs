//! Keel Resources
//!
//! A generic resource cache and asynchronous streaming manager. It turns opaque
//! identifiers into typed, ready-to-use objects:
//!
//! - **Handles**: counted references that keep a resource alive
//! - **Streaming**: loads run on background worker pools, ordered by priority
//! - **Quality levels**: resources can stream in incrementally
//! - **Fallbacks**: placeholders or lower-quality data while loading
//! - **Auto-unload**: unused resources are reclaimed after a grace period
//!
//! # Quick Start
//!
//! ```ignore
//! use keel_resources::prelude::*;
//!
//! struct Texture { mips: Vec<Vec<u8>> }
//!
//! impl Loadable for Texture {
//!     type Descriptor = ();
//!
//!     fn update_content(previous: Option<&Self>, ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
//!         let texture = decode(ctx.bytes()).map_err(|e| ctx.malformed(e.to_string()))?;
//!         Ok(Loaded::complete(texture))
//!     }
//! }
//!
//! impl MemoryReportable for Texture {
//!     fn memory_usage(&self) -> MemoryUsage {
//!         MemoryUsage::new(self.mips.iter().map(|m| m.len() as u64).sum(), 0)
//!     }
//! }
//!
//! impl Resource for Texture {
//!     fn type_name() -> &'static str { "Texture" }
//! }
//!
//! let manager = ResourceManager::new(ResourceManagerConfig::default().with_base_path("assets"))?;
//! let brick: Handle<Texture> = manager.acquire_handle("brick.tex", AcquireMode::Load)?;
//!
//! loop {
//!     manager.per_frame_update();
//!     let texture = manager.begin_access(&brick, FallbackPolicy::AllowFallback)?;
//!     // draw with *texture
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod id;
pub mod loader;
pub mod manager;
pub mod queue;
pub mod resource;
pub mod state;
pub mod worker;

mod pipeline;
mod slot;

pub use config::{AcquireMode, ContractPolicy, FallbackPolicy, ResourceManagerConfig};
pub use error::{ResourceError, ResourceErrorKind, ResourceResult};
pub use event::{ResourceEvent, Subscription};
pub use handle::{Handle, LockSource, ResourceLock};
pub use id::{ResourceId, ResourceType};
pub use loader::{
    FileLoader, FnLoader, LoaderOrigin, LoaderRegistry, MemoryLoader, OverrideDecider,
    ResourceStream, ResourceTypeLoader,
};
pub use manager::ResourceManager;
pub use queue::{LoadingQueue, ResourcePriority};
pub use resource::{LoadContext, Loadable, Loaded, MemoryReportable, Resource, UpdateAffinity};
pub use state::{LoadDesc, MemoryUsage, ResourceInfo, ResourceState, Unload};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{AcquireMode, FallbackPolicy, ResourceManagerConfig};
    pub use crate::error::{ResourceError, ResourceResult};
    pub use crate::event::ResourceEvent;
    pub use crate::handle::{Handle, ResourceLock};
    pub use crate::id::ResourceId;
    pub use crate::loader::{MemoryLoader, ResourceStream, ResourceTypeLoader};
    pub use crate::manager::ResourceManager;
    pub use crate::queue::ResourcePriority;
    pub use crate::resource::{LoadContext, Loadable, Loaded, MemoryReportable, Resource, UpdateAffinity};
    pub use crate::state::{LoadDesc, MemoryUsage, ResourceState, Unload};
}
