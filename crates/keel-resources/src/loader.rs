//! Resource type loaders: the pluggable strategies that turn an identifier into bytes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use keel_core::alloc::HashMap;
use parking_lot::RwLock;

use crate::error::{ResourceError, ResourceResult};
use crate::id::{ResourceId, ResourceType};

/// Bytes produced by a loader, plus what is known about where they came from.
#[derive(Debug, Clone, Default)]
pub struct ResourceStream {
    data: Vec<u8>,
    modified: Option<SystemTime>,
    path: Option<PathBuf>,
}

impl ResourceStream {
    /// A stream over in-memory bytes.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            modified: None,
            path: None,
        }
    }

    /// Record the modification time of the backing data.
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Record the file the bytes were read from.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Modification time of the backing data, if the loader knows it.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Turns a resource identifier into a byte stream.
///
/// Loaders run on data-load workers and must not touch the resource itself.
///
/// # Example
///
/// ```ignore
/// struct PakLoader { pak: Pak }
///
/// impl ResourceTypeLoader for PakLoader {
///     fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream> {
///         let bytes = self.pak.read(id.as_str()).ok_or_else(|| ResourceError::not_found(id))?;
///         Ok(ResourceStream::from_bytes(bytes))
///     }
/// }
/// ```
pub trait ResourceTypeLoader: Send + Sync {
    /// Produce the bytes for `id`. Absent data must be reported as
    /// [`ResourceError::NotFound`].
    fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream>;

    /// Called once the stream has been consumed by `update_content`.
    fn close_data_stream(&self, id: &ResourceId, stream: &ResourceStream) {
        let _ = (id, stream);
    }

    /// Whether the data changed since it was loaded. Used by non-forced reloads.
    fn is_resource_outdated(&self, id: &ResourceId, loaded_modified: Option<SystemTime>) -> bool {
        let _ = (id, loaded_modified);
        true
    }
}

/// Default loader reading files relative to a base path.
pub struct FileLoader {
    /// Base path for relative identifiers.
    base_path: PathBuf,
}

impl FileLoader {
    /// Create a new file loader with a base path.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Resolve an identifier relative to the base path.
    pub fn resolve_path(&self, id: &ResourceId) -> PathBuf {
        let path = Path::new(id.as_str());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ResourceTypeLoader for FileLoader {
    fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream> {
        let full_path = self.resolve_path(id);
        let data = std::fs::read(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResourceError::NotFound {
                    id: id.to_string(),
                }
            } else {
                ResourceError::Io {
                    path: full_path.clone(),
                    source: e,
                }
            }
        })?;

        let mut stream = ResourceStream::from_bytes(data);
        if let Ok(modified) = std::fs::metadata(&full_path).and_then(|m| m.modified()) {
            stream = stream.with_modified(modified);
        }
        Ok(stream.with_path(full_path))
    }

    fn is_resource_outdated(&self, id: &ResourceId, loaded_modified: Option<SystemTime>) -> bool {
        let Some(loaded) = loaded_modified else {
            return true;
        };
        match std::fs::metadata(self.resolve_path(id)).and_then(|m| m.modified()) {
            Ok(current) => current != loaded,
            // Gone or unreadable: let the reload report it
            Err(_) => true,
        }
    }
}

/// In-memory loader for tests, embedded data and procedurally generated content.
#[derive(Default)]
pub struct MemoryLoader {
    /// Stored bytes keyed by identifier.
    files: RwLock<HashMap<ResourceId, Arc<[u8]>>>,
}

impl MemoryLoader {
    /// Create a new empty memory loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the bytes for an identifier.
    pub fn insert(&self, id: impl Into<ResourceId>, bytes: impl Into<Arc<[u8]>>) {
        self.files.write().insert(id.into(), bytes.into());
    }

    /// Remove the bytes for an identifier.
    pub fn remove(&self, id: impl Into<ResourceId>) -> Option<Arc<[u8]>> {
        self.files.write().remove(&id.into())
    }

    /// Check if bytes exist for an identifier.
    pub fn contains(&self, id: impl Into<ResourceId>) -> bool {
        self.files.read().contains_key(&id.into())
    }
}

impl ResourceTypeLoader for MemoryLoader {
    fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream> {
        self.files
            .read()
            .get(id)
            .map(|bytes| ResourceStream::from_bytes(bytes.to_vec()))
            .ok_or_else(|| ResourceError::not_found(id))
    }
}

/// Loader backed by a closure, handy for one-off custom loaders.
pub struct FnLoader<F> {
    f: F,
}

impl<F> FnLoader<F>
where
    F: Fn(&ResourceId) -> ResourceResult<ResourceStream> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ResourceTypeLoader for FnLoader<F>
where
    F: Fn(&ResourceId) -> ResourceResult<ResourceStream> + Send + Sync,
{
    fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream> {
        (self.f)(id)
    }
}

/// Predicate deciding whether a type override applies to an identifier.
pub type OverrideDecider = Arc<dyn Fn(&ResourceId) -> bool + Send + Sync>;

/// A candidate variant registered for a base type.
#[derive(Clone)]
struct TypeOverride {
    variant: &'static str,
    decider: OverrideDecider,
    loader: Arc<dyn ResourceTypeLoader>,
}

/// Where a resolved loader came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderOrigin {
    /// One-off loader attached to the resource instance.
    Custom,
    /// A registered type override variant.
    Override(&'static str),
    /// The loader registered for the resource type.
    Type,
    /// The default file-based loader.
    Default,
}

impl LoaderOrigin {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LoaderOrigin::Custom => "custom",
            LoaderOrigin::Override(variant) => *variant,
            LoaderOrigin::Type => "type",
            LoaderOrigin::Default => "default",
        }
    }
}

/// The loader picked for one request.
#[derive(Clone)]
pub struct ResolvedLoader {
    pub loader: Arc<dyn ResourceTypeLoader>,
    pub origin: LoaderOrigin,
}

impl fmt::Debug for ResolvedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedLoader")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Registry of loaders, keyed by resource type.
///
/// Resolution order for one resource:
/// 1. the custom loader attached to the instance,
/// 2. the first override variant of its type whose decider accepts the identifier,
///    in registration order,
/// 3. the loader registered for its type,
/// 4. the default loader.
pub struct LoaderRegistry {
    default_loader: Arc<dyn ResourceTypeLoader>,
    by_type: HashMap<ResourceType, Arc<dyn ResourceTypeLoader>>,
    overrides: HashMap<ResourceType, Vec<TypeOverride>>,
}

impl LoaderRegistry {
    /// Create a registry whose default loader reads files under `base_path`.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self::with_default(Arc::new(FileLoader::new(base_path)))
    }

    /// Create a registry with a custom default loader.
    pub fn with_default(default_loader: Arc<dyn ResourceTypeLoader>) -> Self {
        Self {
            default_loader,
            by_type: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Replace the default loader.
    pub fn set_default(&mut self, loader: Arc<dyn ResourceTypeLoader>) {
        self.default_loader = loader;
    }

    /// Set the loader for one type. Replaces any previous one.
    pub fn set_type_loader(&mut self, ty: ResourceType, loader: Arc<dyn ResourceTypeLoader>) {
        self.by_type.insert(ty, loader);
    }

    /// Remove the loader for one type, falling back to the default loader.
    pub fn clear_type_loader(&mut self, ty: ResourceType) -> bool {
        self.by_type.remove(&ty).is_some()
    }

    /// Register an override variant for a type. Re-registering a variant name replaces it
    /// in place.
    pub fn register_override(
        &mut self,
        ty: ResourceType,
        variant: &'static str,
        decider: OverrideDecider,
        loader: Arc<dyn ResourceTypeLoader>,
    ) {
        let list = self.overrides.entry(ty).or_default();
        let entry = TypeOverride {
            variant,
            decider,
            loader,
        };
        match list.iter_mut().find(|o| o.variant == variant) {
            Some(existing) => *existing = entry,
            None => list.push(entry),
        }
    }

    /// Remove an override variant. Returns whether it existed.
    pub fn unregister_override(&mut self, ty: ResourceType, variant: &str) -> bool {
        let Some(list) = self.overrides.get_mut(&ty) else {
            return false;
        };
        let before = list.len();
        list.retain(|o| o.variant != variant);
        let removed = list.len() != before;
        if list.is_empty() {
            self.overrides.remove(&ty);
        }
        removed
    }

    /// Check if a loader is registered specifically for a type.
    pub fn has_type_loader(&self, ty: ResourceType) -> bool {
        self.by_type.contains_key(&ty)
    }

    /// Pick the loader for one resource.
    pub fn resolve(
        &self,
        ty: ResourceType,
        id: &ResourceId,
        custom: Option<&Arc<dyn ResourceTypeLoader>>,
    ) -> ResolvedLoader {
        if let Some(loader) = custom {
            return ResolvedLoader {
                loader: Arc::clone(loader),
                origin: LoaderOrigin::Custom,
            };
        }

        if let Some(candidate) = self
            .overrides
            .get(&ty)
            .and_then(|list| list.iter().find(|o| (o.decider)(id)))
        {
            return ResolvedLoader {
                loader: Arc::clone(&candidate.loader),
                origin: LoaderOrigin::Override(candidate.variant),
            };
        }

        if let Some(loader) = self.by_type.get(&ty) {
            return ResolvedLoader {
                loader: Arc::clone(loader),
                origin: LoaderOrigin::Type,
            };
        }

        ResolvedLoader {
            loader: Arc::clone(&self.default_loader),
            origin: LoaderOrigin::Default,
        }
    }
}
