//! Committed-edit notifications and the emitter that delivers them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{AttributeChanges, FeatureId, Field, GeometryChanges};

/// One notification from a dataset's commit. A single local commit emits any
/// number of the change variants followed by exactly one `CommitFinished`.
#[derive(Debug, Clone, PartialEq)]
pub enum EditEvent {
    FieldsAdded(Vec<Field>),
    /// Ids as assigned by the store at commit time.
    FeaturesAdded(Vec<FeatureId>),
    FeaturesRemoved(Vec<FeatureId>),
    AttributeValuesChanged(AttributeChanges),
    GeometriesChanged(GeometryChanges),
    CommitFinished,
}

impl EditEvent {
    /// Whether the event belongs to the commit-numbered part of the log.
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            EditEvent::FieldsAdded(_)
                | EditEvent::AttributeValuesChanged(_)
                | EditEvent::GeometriesChanged(_)
        )
    }
}

/// Registration handle returned by [`EventEmitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Synchronous fan-out of dataset notifications.
///
/// Listeners run in registration order on the emitting thread. The registry
/// lock is released before any listener runs, so a listener may register or
/// remove listeners; such changes apply from the next `emit`.
pub struct EventEmitter<T> {
    listeners: Mutex<BTreeMap<ListenerId, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
