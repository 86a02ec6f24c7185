//! Resource handles and scoped access locks.
//!
//! A [`Handle`] is a counted reference to one resource. It never exposes the resource
//! directly: reading goes through [`ResourceManager::begin_access`](crate::ResourceManager::begin_access),
//! which returns a [`ResourceLock`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::id::{ResourceId, ResourceType};
use crate::resource::Resource;
use crate::slot::ResourceSlot;

/// A typed, counted reference to a resource.
///
/// Cloning adds a reference and dropping removes one. A resource can only be reclaimed
/// once no handle to it is left.
///
/// # Example
///
/// ```ignore
/// let handle: Handle<Texture> = manager.acquire_handle("brick.tex", AcquireMode::Load)?;
///
/// let texture = manager.begin_access(&handle, FallbackPolicy::AllowFallback)?;
/// draw(&*texture);
/// ```
pub struct Handle<T: Resource> {
    pub(crate) slot: Arc<ResourceSlot<T>>,
}

impl<T: Resource> Handle<T> {
    /// Wrap a slot whose reference count already accounts for this handle.
    pub(crate) fn from_retained(slot: Arc<ResourceSlot<T>>) -> Self {
        Self { slot }
    }

    /// Get the resource identifier.
    pub fn id(&self) -> &ResourceId {
        &self.slot.header.id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.slot.header.resource_type
    }

    /// Get the type name of the resource.
    pub fn type_name(&self) -> &'static str {
        T::type_name()
    }

    /// Number of live handles to the resource.
    pub fn ref_count(&self) -> u32 {
        self.slot.header.ref_count()
    }
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.slot.retain_clone();
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Resource> Drop for Handle<T> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl<T: Resource> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Resource> Eq for Handle<T> {}

impl<T: Resource> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Hash::hash(self.id(), state);
    }
}

impl<T: Resource> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type", &T::type_name())
            .field("id", &self.id().as_str())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// What a [`ResourceLock`] is actually showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSource {
    /// The resource's loaded payload.
    Loaded,
    /// The last fully loaded payload, while a better one is being built.
    PreviousQuality,
    /// The type's loading fallback.
    LoadingFallback,
    /// The type's missing fallback.
    MissingFallback,
}

impl LockSource {
    /// Whether the lock shows something other than the resource's current payload.
    pub fn is_fallback(self) -> bool {
        !matches!(self, LockSource::Loaded)
    }
}

/// Scoped read access to a resource.
///
/// The lock holds a snapshot of the payload. A content update that completes while the
/// lock is held publishes a new payload without disturbing this one.
pub struct ResourceLock<'a, T: Resource> {
    handle: &'a Handle<T>,
    payload: Arc<T>,
    served_from: LockSource,
}

impl<'a, T: Resource> ResourceLock<'a, T> {
    pub(crate) fn new(handle: &'a Handle<T>, payload: Arc<T>, source: LockSource) -> Self {
        Self {
            handle,
            payload,
            served_from: source,
        }
    }

    pub fn handle(&self) -> &'a Handle<T> {
        self.handle
    }

    pub fn source(&self) -> LockSource {
        self.served_from
    }

    pub fn is_fallback(&self) -> bool {
        self.served_from.is_fallback()
    }
}

impl<T: Resource> Deref for ResourceLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T: Resource> fmt::Debug for ResourceLock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("id", &self.handle.id().as_str())
            .field("source", &self.served_from)
            .finish()
    }
}
