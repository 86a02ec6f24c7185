//! Blocking work queues and the fixed-size worker pools that drain them.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::queue::{LoadingQueue, ResourcePriority};

struct QueueState<J> {
    queue: LoadingQueue<u64, J>,
    closed: bool,
}

/// A [`LoadingQueue`] shared between producers and blocking consumers.
///
/// Keys are resource id hashes, so one resource has at most one queued job.
pub struct WorkQueue<J> {
    state: Mutex<QueueState<J>>,
    available: Condvar,
}

impl<J> WorkQueue<J> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: LoadingQueue::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Queue a job.
    ///
    /// Returns the job back when the queue is closed. A duplicate key coalesces into the
    /// queued job and yields `Ok(false)`.
    pub fn push(&self, key: u64, priority: ResourcePriority, job: J) -> Result<bool, J> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(job);
        }
        let inserted = state.queue.push(key, priority, job);
        if inserted {
            self.available.notify_one();
        }
        Ok(inserted)
    }

    /// Block until a job is available. Returns `None` once the queue is closed.
    pub fn pop_blocking(&self) -> Option<J> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some((_, job)) = state.queue.pop() {
                return Some(job);
            }
            self.available.wait(&mut state);
        }
    }

    /// Pop a job if one is ready.
    pub fn try_pop(&self) -> Option<J> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.queue.pop().map(|(_, job)| job)
    }

    pub fn reprioritize(&self, key: u64, priority: ResourcePriority) -> bool {
        self.state.lock().queue.reprioritize(&key, priority)
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the queue, wake every consumer and hand back the jobs that never ran.
    pub fn close(&self) -> Vec<J> {
        let mut state = self.state.lock();
        state.closed = true;
        let discarded = state.queue.drain().into_iter().map(|(_, job)| job).collect();
        self.available.notify_all();
        discarded
    }
}

impl<J> Default for WorkQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed set of OS threads draining one [`WorkQueue`].
///
/// Threads exit when the queue is closed. The pool must be joined after closing its queue.
pub struct WorkerPool {
    role: &'static str,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers named `keel-{role}-{i}`.
    pub fn spawn<J, F>(
        role: &'static str,
        num_threads: usize,
        queue: Arc<WorkQueue<J>>,
        handler: F,
    ) -> std::io::Result<Self>
    where
        J: Send + 'static,
        F: Fn(J) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);

            let handle = thread::Builder::new()
                .name(format!("keel-{}-{}", role, i))
                .spawn(move || {
                    while let Some(job) = queue.pop_blocking() {
                        handler(job);
                    }
                })?;

            threads.push(handle);
        }

        tracing::debug!("WorkerPool '{}' created with {} threads", role, num_threads);

        Ok(Self { role, threads })
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Get the number of threads in this pool.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Wait for every worker to finish. The queue must already be closed.
    pub fn join(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        tracing::debug!(
            "Joining WorkerPool '{}' with {} threads",
            self.role,
            self.threads.len()
        );

        for handle in std::mem::take(&mut self.threads) {
            if let Err(e) = handle.join() {
                tracing::error!("Worker thread in pool '{}' panicked: {:?}", self.role, e);
            }
        }

        tracing::debug!("WorkerPool '{}' shutdown complete", self.role);
    }
}

/// Default content-update worker count: leave one core free for the main thread.
pub fn default_content_update_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Poll interval used when a thread must interleave waiting with other work.
pub(crate) const PUMP_INTERVAL: Duration = Duration::from_millis(1);
