use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use ciphermed_ledger::{EventBus, LedgerEvent, ListenerId};

struct Listener {
    event_name: String,
    sender: flume::Sender<LedgerEvent>,
}

/// In-memory event bus.
///
/// Events are offered to each matching listener with `try_send`: a listener
/// whose buffer is full misses the event, and one whose receiver is gone is
/// dropped from the registry.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerId, Listener>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Offers `event` to every listener registered for its name, in
    /// registration order. Returns how many listeners accepted it.
    pub fn publish(&self, event: &LedgerEvent) -> usize {
        let mut listeners = self.lock();
        let mut delivered = 0;
        listeners.retain(|id, listener| {
            if listener.event_name != event.name {
                return true;
            }
            match listener.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(flume::TrySendError::Full(_)) => {
                    tracing::debug!(
                        target = "ciphermed-localnet-bus",
                        event = "listener_full",
                        listener = %id,
                        name = %event.name,
                        "Listener buffer full, event dropped"
                    );
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    tracing::debug!(
                        target = "ciphermed-localnet-bus",
                        event = "listener_disconnected",
                        listener = %id,
                        "Listener receiver dropped, removing"
                    );
                    false
                }
            }
        });
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ListenerId, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventBus for ListenerRegistry {
    fn add_listener(&self, event_name: &str, sender: flume::Sender<LedgerEvent>) -> ListenerId {
        let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(
            id,
            Listener {
                event_name: event_name.to_string(),
                sender,
            },
        );
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.lock().remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, byte: u8) -> LedgerEvent {
        LedgerEvent {
            name: name.to_string(),
            data: vec![byte],
        }
    }

    #[test]
    fn test_delivers_in_order_per_listener() {
        let registry = ListenerRegistry::new();
        let (sender, receiver) = flume::unbounded();
        registry.add_listener("A", sender);

        assert_eq!(registry.publish(&event("A", 1)), 1);
        assert_eq!(registry.publish(&event("B", 2)), 0);
        assert_eq!(registry.publish(&event("A", 3)), 1);

        let received: Vec<u8> = receiver.try_iter().map(|e| e.data[0]).collect();
        assert_eq!(received, vec![1, 3]);
    }

    #[test]
    fn test_full_listener_misses_events() {
        let registry = ListenerRegistry::new();
        let (sender, receiver) = flume::bounded(1);
        registry.add_listener("A", sender);
        assert_eq!(registry.publish(&event("A", 1)), 1);
        assert_eq!(registry.publish(&event("A", 2)), 0);
        assert_eq!(receiver.try_recv().unwrap().data, vec![1]);
        assert!(receiver.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removal_and_disconnect() {
        let registry = ListenerRegistry::new();
        let (sender, receiver) = flume::bounded(1);
        let id = registry.add_listener("A", sender);
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        assert_eq!(registry.publish(&event("A", 1)), 0);
        assert!(receiver.try_recv().is_err());

        let (sender, receiver) = flume::bounded(1);
        registry.add_listener("A", sender);
        drop(receiver);
        assert_eq!(registry.publish(&event("A", 1)), 0);
        assert!(registry.is_empty());
    }
}
