//! Datastore events and the priority-ordered listener bus
//!
//! Each [`Datastore`](crate::Datastore) owns one [`EventBus`]. The bus has a
//! single backend slot, notified before anything else, so the storage
//! backend finishes indexing before any consumer sees the event. Consumers
//! are then dispatched synchronously on the posting thread in ascending
//! priority order; equal priorities run in registration order.

use crate::coords::Coords;
use crate::image::Image;
use crate::metadata::SummaryMetadata;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Priority used when a consumer does not specify one
pub const DEFAULT_PRIORITY: i32 = 100;

/// Something that happened to a datastore
#[derive(Debug, Clone)]
pub enum DataEvent {
    NewSummaryMetadata(SummaryMetadata),
    NewImage(Image),
    /// A rewritable datastore replaced the image at a coordinate
    ImageOverwritten {
        new_image: Image,
        old_image: Image,
    },
    ImageDeleted(Image),
    Frozen,
    /// An annotation changed; `coords` is `None` for the general annotation
    AnnotationChanged {
        name: String,
        coords: Option<Coords>,
    },
    Closing,
}

/// Receiver of [`DataEvent`]s
pub trait DataListener: Send + Sync {
    fn on_event(&self, event: &DataEvent);
}

impl<F> DataListener for F
where
    F: Fn(&DataEvent) + Send + Sync,
{
    fn on_event(&self, event: &DataEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    priority: i32,
    listener: Arc<dyn DataListener>,
}

/// Backend slot plus an ordered list of consumers, with synchronous dispatch
#[derive(Default)]
pub struct EventBus {
    backend: RwLock<Option<Arc<dyn DataListener>>>,
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the backend listener, replacing any previous one
    pub fn set_backend<L: DataListener + 'static>(&self, listener: L) {
        *self.backend.write() = Some(Arc::new(listener));
    }

    pub fn has_backend(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Register a consumer; lower priorities are notified first, always
    /// after the backend
    pub fn register<L: DataListener + 'static>(&self, listener: L, priority: i32) -> ListenerId {
        self.register_arc(Arc::new(listener), priority)
    }

    pub fn register_arc(&self, listener: Arc<dyn DataListener>, priority: i32) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registrations = self.registrations.write();
        let slot = registrations.partition_point(|r| r.priority <= priority);
        registrations.insert(
            slot,
            Registration {
                id,
                priority,
                listener,
            },
        );
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Deliver `event` to the backend, then to every consumer
    pub fn post(&self, event: &DataEvent) {
        self.post_to_backend(event);
        self.post_to_consumers(event);
    }

    pub fn post_to_backend(&self, event: &DataEvent) {
        let backend = self.backend.read().clone();
        if let Some(backend) = backend {
            backend.on_event(event);
        }
    }

    /// Deliver `event` to consumers only, in priority order
    pub fn post_to_consumers(&self, event: &DataEvent) {
        // Listeners may register or unregister while being notified.
        let listeners: Vec<Arc<dyn DataListener>> = self
            .registrations
            .read()
            .iter()
            .map(|r| Arc::clone(&r.listener))
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Drop the backend and every consumer
    pub fn clear(&self) {
        *self.backend.write() = None;
        self.registrations.write().clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self.registrations.read();
        f.debug_struct("EventBus")
            .field("backend", &self.has_backend())
            .field(
                "priorities",
                &registrations.iter().map(|r| r.priority).collect::<Vec<_>>(),
            )
            .finish()
    }
}
