//! Resource identity: stable identifiers and type tags.

use std::any::TypeId;
use std::fmt;

use keel_core::hash::HashedString;

use crate::resource::Resource;

/// Identifies one logical resource regardless of its type.
///
/// The identifier keeps its original text for logging and for loaders, but compares and
/// hashes by a stable 64-bit hash. Different spellings or casing are different resources.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(HashedString);

impl ResourceId {
    /// Create an identifier from its text form.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(HashedString::new(id))
    }

    /// The stable hash of the identifier.
    pub fn hash(&self) -> u64 {
        self.0.hash()
    }

    /// The human-readable identifier.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The extension of the identifier, if it looks like a path.
    pub fn extension(&self) -> Option<&str> {
        let (stem, ext) = self.as_str().rsplit_once('.')?;
        if stem.is_empty() || ext.contains('/') || ext.contains('\\') {
            None
        } else {
            Some(ext)
        }
    }

    /// Whether the identifier is empty.
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({:?})", self.as_str())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&String> for ResourceId {
    fn from(id: &String) -> Self {
        Self::new(id)
    }
}

impl From<&ResourceId> for ResourceId {
    fn from(id: &ResourceId) -> Self {
        id.clone()
    }
}

/// Stable tag for a resource type, used as the key of every per-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType {
    type_id: TypeId,
    name: &'static str,
}

impl ResourceType {
    /// The tag of resource type `T`.
    pub fn of<T: Resource>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::type_name(),
        }
    }

    /// The Rust type id.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The type's stable name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
