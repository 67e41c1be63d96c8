// packages/engine/src/utils/signals.rs
//! Observer channels
//!
//! A `Signal<T>` is a list of explicitly registered callbacks invoked
//! synchronously on the emitter's thread. Observers must not block: the
//! emitter may be a worker at a step boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies one connected observer, for later disconnection.
pub type SlotId = u64;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A synchronous multi-observer channel.
pub struct Signal<T> {
    slots: Mutex<Vec<(SlotId, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer and return its slot id.
    pub fn connect<F>(&self, f: F) -> SlotId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .expect("signal slots poisoned")
            .push((id, Arc::new(f)));
        id
    }

    /// Remove a previously registered observer. Returns false if the slot
    /// id was never connected or already disconnected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.lock().expect("signal slots poisoned");
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        slots.len() != before
    }

    /// Deliver a payload to every observer, in connection order.
    ///
    /// The slot list is snapshotted first so observers may connect or
    /// disconnect from inside a callback.
    pub fn emit(&self, payload: &T) {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .expect("signal slots poisoned")
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in snapshot {
            slot(payload);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connect_emit() {
        let signal: Signal<u32> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        signal.connect(move |v| {
            assert_eq!(*v, 7);
            h.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&7);
        signal.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let id = signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(&());
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_disconnect_does_not_deadlock() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let clone = Arc::clone(&signal);
        let id = Arc::new(AtomicU64::new(0));
        let id_clone = Arc::clone(&id);
        let slot = signal.connect(move |_| {
            clone.disconnect(id_clone.load(Ordering::SeqCst));
        });
        id.store(slot, Ordering::SeqCst);
        signal.emit(&());
        signal.emit(&());
    }
}
