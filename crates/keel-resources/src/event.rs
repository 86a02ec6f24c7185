//! Resource lifecycle events.
//!
//! Events are advisory. They are broadcast over `crossbeam-channel` to every live
//! [`Subscription`], and a subscriber that falls behind never slows the pipeline down.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::Duration;

use crate::error::ResourceErrorKind;
use crate::id::{ResourceId, ResourceType};
use crate::resource::Resource;
use crate::state::ResourceState;

/// Events emitted by the resource manager.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    /// A resource entry was created.
    Created {
        id: ResourceId,
        resource_type: ResourceType,
    },

    /// A resource moved from one state to another.
    StateChanged {
        id: ResourceId,
        resource_type: ResourceType,
        old: ResourceState,
        new: ResourceState,
    },

    /// A load ended in `LoadedResourceMissing`.
    LoadFailed {
        id: ResourceId,
        resource_type: ResourceType,
        /// Why the load failed.
        kind: ResourceErrorKind,
        /// Error message.
        message: String,
    },

    /// A resource entry was destroyed.
    Deleted {
        id: ResourceId,
        resource_type: ResourceType,
    },

    /// Sent for every live resource by `broadcast_exists`.
    Exists {
        id: ResourceId,
        resource_type: ResourceType,
        state: ResourceState,
    },
}

impl ResourceEvent {
    /// Get the identifier of the resource this event relates to.
    pub fn id(&self) -> &ResourceId {
        match self {
            ResourceEvent::Created { id, .. }
            | ResourceEvent::StateChanged { id, .. }
            | ResourceEvent::LoadFailed { id, .. }
            | ResourceEvent::Deleted { id, .. }
            | ResourceEvent::Exists { id, .. } => id,
        }
    }

    /// Get the type of the resource this event relates to.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceEvent::Created { resource_type, .. }
            | ResourceEvent::StateChanged { resource_type, .. }
            | ResourceEvent::LoadFailed { resource_type, .. }
            | ResourceEvent::Deleted { resource_type, .. }
            | ResourceEvent::Exists { resource_type, .. } => *resource_type,
        }
    }

    /// Check if this event relates to resource type `T`.
    pub fn is_for<T: Resource>(&self) -> bool {
        self.resource_type() == ResourceType::of::<T>()
    }

    /// Check if this is a creation event.
    pub fn is_created(&self) -> bool {
        matches!(self, ResourceEvent::Created { .. })
    }

    /// Check if this is a state change into `state`.
    pub fn is_transition_to(&self, state: ResourceState) -> bool {
        matches!(self, ResourceEvent::StateChanged { new, .. } if *new == state)
    }

    /// Check if this is a failure event.
    pub fn is_failed(&self) -> bool {
        matches!(self, ResourceEvent::LoadFailed { .. })
    }

    /// Check if this is a deletion event.
    pub fn is_deleted(&self) -> bool {
        matches!(self, ResourceEvent::Deleted { .. })
    }
}

/// Fan-out of events to every live subscription.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<ResourceEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        Subscription { receiver }
    }

    /// Send an event to every subscriber, dropping the ones that went away.
    pub(crate) fn broadcast(&self, event: ResourceEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        tracing::trace!("Broadcasting {:?}", event);
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// A live registration for resource events. Dropping it unsubscribes.
pub struct Subscription {
    receiver: Receiver<ResourceEvent>,
}

impl Subscription {
    /// Get the next event if one is pending.
    pub fn try_recv(&self) -> Option<ResourceEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ResourceEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Drain all pending events.
    pub fn drain(&self) -> Vec<ResourceEvent> {
        self.receiver.try_iter().collect()
    }

    /// Check if there are any pending events.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Get the number of pending events.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceResult;
    use crate::resource::{LoadContext, Loadable, Loaded, MemoryReportable};
    use crate::state::MemoryUsage;

    struct Note;

    impl Loadable for Note {
        type Descriptor = ();

        fn update_content(_previous: Option<&Self>, _ctx: LoadContext<'_>) -> ResourceResult<Loaded<Self>> {
            Ok(Loaded::complete(Note))
        }
    }

    impl MemoryReportable for Note {
        fn memory_usage(&self) -> MemoryUsage {
            MemoryUsage::default()
        }
    }

    impl Resource for Note {
        fn type_name() -> &'static str {
            "Note"
        }
    }

    fn created(id: &str) -> ResourceEvent {
        ResourceEvent::Created {
            id: ResourceId::new(id),
            resource_type: ResourceType::of::<Note>(),
        }
    }

    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.broadcast(created("a.note"));

        assert_eq!(a.len(), 1);
        assert_eq!(b.drain().len(), 1);
        let event = a.try_recv().unwrap();
        assert!(event.is_created());
        assert!(event.is_for::<Note>());
        assert_eq!(event.id().as_str(), "a.note");
    }

    #[test]
    fn test_dropped_subscription_unsubscribes() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(dropped);
        bus.broadcast(created("x.note"));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain().len(), 1);
    }

    #[test]
    fn test_transition_helper() {
        let event = ResourceEvent::StateChanged {
            id: ResourceId::new("a.note"),
            resource_type: ResourceType::of::<Note>(),
            old: ResourceState::Loading,
            new: ResourceState::Loaded,
        };
        assert!(event.is_transition_to(ResourceState::Loaded));
        assert!(!event.is_transition_to(ResourceState::Unloaded));
        assert!(!event.is_failed());
    }
}
