//! Priority-ordered loading queue.
//!
//! Requests are ordered by priority first and insertion sequence second. Each key appears
//! at most once, so repeated requests for the same resource coalesce.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use keel_core::alloc::HashMap;

/// Scheduling priority of a resource. Ordered from most to least urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourcePriority {
    Critical,
    VeryHigh,
    High,
    #[default]
    Medium,
    Low,
    VeryLow,
}

impl ResourcePriority {
    /// All priorities, most urgent first.
    pub const ALL: [ResourcePriority; 6] = [
        ResourcePriority::Critical,
        ResourcePriority::VeryHigh,
        ResourcePriority::High,
        ResourcePriority::Medium,
        ResourcePriority::Low,
        ResourcePriority::VeryLow,
    ];

    /// Whether `self` should be serviced before `other`.
    pub fn is_more_urgent_than(self, other: ResourcePriority) -> bool {
        self < other
    }
}

impl fmt::Display for ResourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Position of a request in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: ResourcePriority,
    seq: u64,
}

/// A keyed priority queue with FIFO order inside each priority.
pub struct LoadingQueue<K, J> {
    ordered: BTreeMap<QueueKey, (K, J)>,
    positions: HashMap<K, QueueKey>,
    next_seq: u64,
}

impl<K, J> LoadingQueue<K, J>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            ordered: BTreeMap::new(),
            positions: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Queue a request.
    ///
    /// Returns `false` if `key` was already queued. The existing job is kept and is
    /// raised to `priority` when that is more urgent.
    pub fn push(&mut self, key: K, priority: ResourcePriority, job: J) -> bool {
        if let Some(existing) = self.positions.get(&key).copied() {
            if priority.is_more_urgent_than(existing.priority) {
                self.reprioritize(&key, priority);
            }
            return false;
        }

        let queue_key = QueueKey {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.positions.insert(key.clone(), queue_key);
        self.ordered.insert(queue_key, (key, job));
        true
    }

    /// Change the priority of a queued request, keeping its original sequence number.
    pub fn reprioritize(&mut self, key: &K, priority: ResourcePriority) -> bool {
        let Some(position) = self.positions.get_mut(key) else {
            return false;
        };
        if position.priority == priority {
            return true;
        }

        let old = *position;
        position.priority = priority;
        let new = *position;
        if let Some(entry) = self.ordered.remove(&old) {
            self.ordered.insert(new, entry);
        }
        true
    }

    /// Pop the most urgent, oldest request.
    pub fn pop(&mut self) -> Option<(K, J)> {
        let (_, (key, job)) = self.ordered.pop_first()?;
        self.positions.remove(&key);
        Some((key, job))
    }

    /// Priority of the next request to be popped.
    pub fn peek_priority(&self) -> Option<ResourcePriority> {
        self.ordered.first_key_value().map(|(k, _)| k.priority)
    }

    /// Remove a queued request.
    pub fn remove(&mut self, key: &K) -> Option<J> {
        let position = self.positions.remove(key)?;
        self.ordered.remove(&position).map(|(_, job)| job)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn priority_of(&self, key: &K) -> Option<ResourcePriority> {
        self.positions.get(key).map(|p| p.priority)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Remove every request, in service order.
    pub fn drain(&mut self) -> Vec<(K, J)> {
        self.positions.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }
}

impl<K, J> Default for LoadingQueue<K, J>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
