//! Error types for the resource system.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur during resource operations.
#[derive(Debug)]
pub enum ResourceError {
    /// The loader could not locate the backing data.
    NotFound {
        /// The identifier of the resource.
        id: String,
    },

    /// Reading the backing data failed for a reason other than it being absent.
    Io {
        /// The path that failed to load.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The backing data exists but could not be turned into a resource.
    MalformedPayload {
        /// The identifier of the resource.
        id: String,
        /// Description of the error.
        message: String,
    },

    /// A resource already exists under this identifier with a different type.
    TypeMismatch {
        /// The identifier of the resource.
        id: String,
        /// Type name the caller asked for.
        requested: &'static str,
        /// Type name of the existing resource.
        existing: &'static str,
    },

    /// The manager no longer accepts requests.
    ManagerShuttingDown,

    /// The resource is not loaded and the access policy forbids fallbacks.
    NotReady {
        /// The identifier of the resource.
        id: String,
    },

    /// The resource failed to load and no missing fallback is registered for its type.
    Missing {
        /// The identifier of the resource.
        id: String,
    },

    /// The handle refers to a resource that has already been destroyed.
    InvalidHandle {
        /// Description of why the handle is invalid.
        reason: String,
    },

    /// A main-thread-only operation was called from another thread.
    WrongThread {
        /// The operation that was called.
        operation: &'static str,
    },
}

/// Payload-free classification of a [`ResourceError`], cheap to copy into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceErrorKind {
    NotFound,
    Io,
    MalformedPayload,
    TypeMismatch,
    ManagerShuttingDown,
    NotReady,
    Missing,
    InvalidHandle,
    WrongThread,
}

impl ResourceError {
    /// Convenience constructor for loader and decoder failures.
    pub fn malformed(id: impl fmt::Display, message: impl Into<String>) -> Self {
        ResourceError::MalformedPayload {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for absent data.
    pub fn not_found(id: impl fmt::Display) -> Self {
        ResourceError::NotFound { id: id.to_string() }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ResourceErrorKind {
        match self {
            ResourceError::NotFound { .. } => ResourceErrorKind::NotFound,
            ResourceError::Io { .. } => ResourceErrorKind::Io,
            ResourceError::MalformedPayload { .. } => ResourceErrorKind::MalformedPayload,
            ResourceError::TypeMismatch { .. } => ResourceErrorKind::TypeMismatch,
            ResourceError::ManagerShuttingDown => ResourceErrorKind::ManagerShuttingDown,
            ResourceError::NotReady { .. } => ResourceErrorKind::NotReady,
            ResourceError::Missing { .. } => ResourceErrorKind::Missing,
            ResourceError::InvalidHandle { .. } => ResourceErrorKind::InvalidHandle,
            ResourceError::WrongThread { .. } => ResourceErrorKind::WrongThread,
        }
    }

    /// Whether this error comes from the load pipeline (and so ends in
    /// `LoadedResourceMissing`) rather than from a caller mistake.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self.kind(),
            ResourceErrorKind::NotFound | ResourceErrorKind::Io | ResourceErrorKind::MalformedPayload
        )
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NotFound { id } => {
                write!(f, "Resource not found: {}", id)
            }
            ResourceError::Io { path, source } => {
                write!(f, "IO error loading '{}': {}", path.display(), source)
            }
            ResourceError::MalformedPayload { id, message } => {
                write!(f, "Malformed data for '{}': {}", id, message)
            }
            ResourceError::TypeMismatch {
                id,
                requested,
                existing,
            } => {
                write!(
                    f,
                    "Resource '{}' was requested as {} but already exists as {}",
                    id, requested, existing
                )
            }
            ResourceError::ManagerShuttingDown => {
                write!(f, "Resource manager is shutting down")
            }
            ResourceError::NotReady { id } => {
                write!(f, "Resource not loaded and fallbacks are not allowed: {}", id)
            }
            ResourceError::Missing { id } => {
                write!(f, "Resource is missing and has no fallback: {}", id)
            }
            ResourceError::InvalidHandle { reason } => {
                write!(f, "Invalid resource handle: {}", reason)
            }
            ResourceError::WrongThread { operation } => {
                write!(f, "{} must be called on the main thread", operation)
            }
        }
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResourceError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ResourceError {
    fn from(err: std::io::Error) -> Self {
        ResourceError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
