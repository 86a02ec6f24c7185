//! Event recorder for asserting on resource lifecycle events.

use std::time::{Duration, Instant};

use keel_resources::{
    ResourceErrorKind, ResourceEvent, ResourceId, ResourceManager, ResourceState, Subscription,
};
use parking_lot::Mutex;

/// Records every event a manager broadcasts after the log was created.
///
/// Events are pulled from the subscription lazily, so every query sees everything that
/// has been broadcast up to that point.
pub struct EventLog {
    subscription: Subscription,
    events: Mutex<Vec<ResourceEvent>>,
}

impl EventLog {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to `manager` and start recording.
    pub fn attach(manager: &ResourceManager) -> Self {
        Self::new(manager.subscribe())
    }

    /// Pull pending events and return everything recorded so far.
    pub fn collect(&self) -> Vec<ResourceEvent> {
        let mut events = self.events.lock();
        events.extend(self.subscription.drain());
        events.clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ResourceEvent) -> bool) -> usize {
        self.collect().iter().filter(|event| pred(event)).count()
    }

    /// Wait until an event matching `pred` has been recorded.
    pub fn wait_for(&self, pred: impl Fn(&ResourceEvent) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.events.lock().iter().any(&pred) {
            return true;
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.subscription.recv_timeout(remaining) {
                Some(event) => {
                    let matched = pred(&event);
                    self.events.lock().push(event);
                    if matched {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    /// The `(old, new)` pairs of every state change of `id`, in order.
    pub fn transitions_for(&self, id: &str) -> Vec<(ResourceState, ResourceState)> {
        let id = ResourceId::new(id);
        self.collect()
            .into_iter()
            .filter_map(|event| match event {
                ResourceEvent::StateChanged {
                    id: event_id,
                    old,
                    new,
                    ..
                } if event_id == id => Some((old, new)),
                _ => None,
            })
            .collect()
    }

    /// Every failed load as `(id, kind)`.
    pub fn failures(&self) -> Vec<(ResourceId, ResourceErrorKind)> {
        self.collect()
            .into_iter()
            .filter_map(|event| match event {
                ResourceEvent::LoadFailed { id, kind, .. } => Some((id, kind)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.subscription.drain();
        self.events.lock().clear();
    }
}
