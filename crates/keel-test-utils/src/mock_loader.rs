//! Scriptable in-memory loader for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use keel_core::alloc::HashMap;
use keel_resources::{ResourceError, ResourceId, ResourceResult, ResourceStream, ResourceTypeLoader};
use parking_lot::{Condvar, Mutex};

/// Records a loader call for verification in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    Open { id: String },
    Close { id: String, len: usize },
}

/// Stored data plus a version used as its modification time.
struct MockFile {
    bytes: Vec<u8>,
    version: u64,
}

/// In-memory loader that records every call.
///
/// Loads can be slowed down with [`set_delay`](Self::set_delay) or held entirely with
/// [`hold`](Self::hold) until [`release`](Self::release) is called. Each `insert` bumps
/// the entry's version, which the loader reports as its modification time, so
/// non-forced reloads see replaced data as outdated.
///
/// # Example
///
/// ```rust
/// use keel_resources::{ResourceId, ResourceTypeLoader};
/// use keel_test_utils::MockLoader;
///
/// let loader = MockLoader::new();
/// loader.insert("a.bin", vec![1, 2, 3]);
///
/// let stream = loader.open_data_stream(&ResourceId::new("a.bin")).unwrap();
/// assert_eq!(stream.bytes(), &[1, 2, 3]);
/// assert_eq!(loader.open_count(), 1);
/// ```
#[derive(Default)]
pub struct MockLoader {
    files: Mutex<HashMap<String, MockFile>>,
    calls: Mutex<Vec<LoaderCall>>,
    opens: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    held: Mutex<bool>,
    released: Condvar,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the data behind an identifier.
    pub fn insert(&self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let mut files = self.files.lock();
        let id = id.into();
        let version = files.get(&id).map_or(1, |f| f.version + 1);
        files.insert(
            id,
            MockFile {
                bytes: bytes.into(),
                version,
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        self.files.lock().remove(id).is_some()
    }

    /// Sleep this long inside every `open_data_stream`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Block every `open_data_stream` until [`release`](Self::release).
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    /// Get the number of `open_data_stream` calls so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `open_data_stream` calls for one identifier.
    pub fn open_count_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, LoaderCall::Open { id: opened } if opened == id))
            .count()
    }

    /// Highest number of `open_data_stream` calls that ran at the same time.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<LoaderCall> {
        self.calls.lock().clone()
    }

    /// Clear recorded calls and counters.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
        self.opens.store(0, Ordering::SeqCst);
        self.max_concurrent.store(0, Ordering::SeqCst);
    }

    fn version_time(version: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(version)
    }
}

impl ResourceTypeLoader for MockLoader {
    fn open_data_stream(&self, id: &ResourceId) -> ResourceResult<ResourceStream> {
        self.calls.lock().push(LoaderCall::Open {
            id: id.to_string(),
        });
        self.opens.fetch_add(1, Ordering::SeqCst);
        let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = self
            .files
            .lock()
            .get(id.as_str())
            .map(|file| {
                ResourceStream::from_bytes(file.bytes.clone())
                    .with_modified(Self::version_time(file.version))
            })
            .ok_or_else(|| ResourceError::not_found(id));

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!("MockLoader opened '{}': {}", id, result.is_ok());
        result
    }

    fn close_data_stream(&self, id: &ResourceId, stream: &ResourceStream) {
        self.calls.lock().push(LoaderCall::Close {
            id: id.to_string(),
            len: stream.len(),
        });
    }

    fn is_resource_outdated(&self, id: &ResourceId, loaded_modified: Option<SystemTime>) -> bool {
        let current = self
            .files
            .lock()
            .get(id.as_str())
            .map(|file| Self::version_time(file.version));
        current != loaded_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_missing_entry_is_not_found() {
        let loader = MockLoader::new();
        let err = loader
            .open_data_stream(&ResourceId::new("ghost.tex"))
            .unwrap_err();
        assert!(matches!(err, ResourceError::NotFound { .. }));
        assert_eq!(loader.open_count_for("ghost.tex"), 1);
    }

    #[test]
    fn test_versions_drive_outdated_checks() {
        let loader = MockLoader::new();
        let id = ResourceId::new("a.bin");
        loader.insert("a.bin", vec![1]);
        let stream = loader.open_data_stream(&id).unwrap();
        assert!(!loader.is_resource_outdated(&id, stream.modified()));

        loader.insert("a.bin", vec![2]);
        assert!(loader.is_resource_outdated(&id, stream.modified()));
    }

    #[test]
    fn test_hold_blocks_until_release() {
        let loader = Arc::new(MockLoader::new());
        loader.insert("a.bin", vec![1]);
        loader.hold();

        let worker = {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.open_data_stream(&ResourceId::new("a.bin")).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());

        loader.release();
        assert!(worker.join().unwrap());
    }
}
