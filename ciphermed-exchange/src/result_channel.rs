//! Single-shot delivery of a computation result event.
//!
//! A [`PendingResult`] registers exactly one listener on the event bus and
//! hands out exactly one event. Result events carry no computation offset, so
//! the listener must be registered before the computation is queued and
//! only one lookup may be in flight per bus.

use std::{sync::Arc, time::Duration};

use ciphermed_ledger::{EventBus, LedgerEvent, LedgerEventIdentifier, ListenerId};
use thiserror::Error;

/// Lifecycle of a [`PendingResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, no listener registered
    Idle,
    /// Listener registered, waiting for the event
    Subscribed,
    /// The event was delivered and the listener removed
    Fired,
    /// The listener was removed without delivering an event
    Unsubscribed,
}

pub struct PendingResult {
    bus: Arc<dyn EventBus>,
    kind: LedgerEventIdentifier,
    listener: Option<ListenerId>,
    receiver: Option<flume::Receiver<LedgerEvent>>,
    state: ChannelState,
}

impl PendingResult {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, kind: LedgerEventIdentifier) -> Self {
        Self {
            bus,
            kind,
            listener: None,
            receiver: None,
            state: ChannelState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub const fn kind(&self) -> LedgerEventIdentifier {
        self.kind
    }

    /// Registers the listener.
    ///
    /// # Errors
    ///
    /// Returns `ResultChannelError::AlreadySubscribed` unless the channel is idle.
    pub fn subscribe(&mut self) -> Result<ListenerId, ResultChannelError> {
        if self.state != ChannelState::Idle {
            return Err(ResultChannelError::AlreadySubscribed);
        }
        // one slot: any event after the first is dropped by the bus
        let (sender, receiver) = flume::bounded(1);
        let id = self.bus.add_listener(self.kind.as_str(), sender);
        tracing::debug!(
            target = "ciphermed-exchange-result-channel",
            event = "listener_added",
            listener = %id,
            kind = %self.kind,
            "Subscribed to result event"
        );
        self.listener = Some(id);
        self.receiver = Some(receiver);
        self.state = ChannelState::Subscribed;
        Ok(id)
    }

    /// Waits for the first event and removes the listener.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConsumed` if the event was already delivered,
    /// `NotSubscribed` on an idle channel and `Closed` if the bus dropped the
    /// listener before any event arrived.
    pub async fn recv(&mut self) -> Result<LedgerEvent, ResultChannelError> {
        let receiver = match self.state {
            ChannelState::Subscribed => self
                .receiver
                .as_ref()
                .ok_or(ResultChannelError::Closed)?,
            ChannelState::Fired => return Err(ResultChannelError::AlreadyConsumed),
            ChannelState::Idle => return Err(ResultChannelError::NotSubscribed),
            ChannelState::Unsubscribed => return Err(ResultChannelError::Closed),
        };
        let received = receiver.recv_async().await;
        match received {
            Ok(event) => {
                self.remove_listener(ChannelState::Fired);
                Ok(event)
            }
            Err(_) => {
                self.remove_listener(ChannelState::Unsubscribed);
                Err(ResultChannelError::Closed)
            }
        }
    }

    /// [`Self::recv`] bounded by `timeout`; the listener is removed when the
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns `ResultChannelError::Timeout` if no event arrived in time, or any
    /// error of [`Self::recv`].
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<LedgerEvent, ResultChannelError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target = "ciphermed-exchange-result-channel",
                    event = "result_timeout",
                    kind = %self.kind,
                    timeout_ms = timeout.as_millis(),
                    "No result event received in time"
                );
                self.remove_listener(ChannelState::Unsubscribed);
                Err(ResultChannelError::Timeout(timeout))
            }
        }
    }

    /// Removes the listener without waiting for an event.
    pub fn cancel(&mut self) {
        if self.state == ChannelState::Subscribed {
            self.remove_listener(ChannelState::Unsubscribed);
        }
    }

    fn remove_listener(&mut self, next: ChannelState) {
        if let Some(id) = self.listener.take() {
            let removed = self.bus.remove_listener(id);
            tracing::debug!(
                target = "ciphermed-exchange-result-channel",
                event = "listener_removed",
                listener = %id,
                removed = removed,
                "Unsubscribed from result event"
            );
        }
        self.receiver = None;
        self.state = next;
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResultChannelError {
    #[error("Result channel is not subscribed")]
    NotSubscribed,
    #[error("Result channel is already subscribed")]
    AlreadySubscribed,
    #[error("Result was already consumed")]
    AlreadyConsumed,
    #[error("Result channel closed")]
    Closed,
    #[error("No result within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
    };

    /// Fan-out bus that delivers with `try_send`, like a ledger event stream.
    #[derive(Default)]
    struct TestBus {
        next_id: AtomicU64,
        listeners: Mutex<HashMap<ListenerId, (String, flume::Sender<LedgerEvent>)>>,
    }

    impl TestBus {
        fn emit(&self, name: &str, data: Vec<u8>) -> usize {
            let listeners = self.listeners.lock().unwrap();
            listeners
                .values()
                .filter(|(listened, _)| listened == name)
                .filter(|(_, sender)| {
                    sender
                        .try_send(LedgerEvent {
                            name: name.to_string(),
                            data: data.clone(),
                        })
                        .is_ok()
                })
                .count()
        }

        fn listener_count(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }
    }

    impl EventBus for TestBus {
        fn add_listener(&self, event_name: &str, sender: flume::Sender<LedgerEvent>) -> ListenerId {
            let id = ListenerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.listeners
                .lock()
                .unwrap()
                .insert(id, (event_name.to_string(), sender));
            id
        }

        fn remove_listener(&self, id: ListenerId) -> bool {
            self.listeners.lock().unwrap().remove(&id).is_some()
        }
    }

    const KIND: LedgerEventIdentifier = LedgerEventIdentifier::ReceivedPrivateRecordLookupEvent;

    #[tokio::test]
    async fn test_single_fire() {
        let bus = Arc::new(TestBus::default());
        let mut pending = PendingResult::new(bus.clone(), KIND);
        assert_eq!(pending.state(), ChannelState::Idle);
        pending.subscribe().unwrap();
        assert_eq!(pending.state(), ChannelState::Subscribed);

        assert_eq!(bus.emit(KIND.as_str(), vec![1]), 1);
        // the one-slot buffer is full, the second event is dropped
        assert_eq!(bus.emit(KIND.as_str(), vec![2]), 0);

        let event = pending.recv().await.unwrap();
        assert_eq!(event.data, vec![1]);
        assert_eq!(pending.state(), ChannelState::Fired);
        assert_eq!(bus.listener_count(), 0);

        assert_eq!(bus.emit(KIND.as_str(), vec![3]), 0);
        assert_eq!(
            pending.recv().await.unwrap_err(),
            ResultChannelError::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn test_ignores_other_event_kinds() {
        let bus = Arc::new(TestBus::default());
        let mut pending = PendingResult::new(bus.clone(), KIND);
        pending.subscribe().unwrap();
        assert_eq!(bus.emit("ComputationQueuedEvent", vec![0]), 0);
        assert_eq!(bus.emit(KIND.as_str(), vec![7]), 1);
        assert_eq!(pending.recv().await.unwrap().data, vec![7]);
    }

    #[tokio::test]
    async fn test_recv_requires_subscription() {
        let bus = Arc::new(TestBus::default());
        let mut pending = PendingResult::new(bus, KIND);
        assert_eq!(
            pending.recv().await.unwrap_err(),
            ResultChannelError::NotSubscribed
        );
        pending.subscribe().unwrap();
        assert_eq!(
            pending.subscribe().unwrap_err(),
            ResultChannelError::AlreadySubscribed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_listener() {
        let bus = Arc::new(TestBus::default());
        let mut pending = PendingResult::new(bus.clone(), KIND);
        pending.subscribe().unwrap();

        let result = pending.recv_timeout(Duration::from_secs(5)).await;
        assert_eq!(
            result.unwrap_err(),
            ResultChannelError::Timeout(Duration::from_secs(5))
        );
        assert_eq!(pending.state(), ChannelState::Unsubscribed);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(
            pending.recv().await.unwrap_err(),
            ResultChannelError::Closed
        );
    }

    #[tokio::test]
    async fn test_drop_cancels_listener() {
        let bus = Arc::new(TestBus::default());
        {
            let mut pending = PendingResult::new(bus.clone(), KIND);
            pending.subscribe().unwrap();
            assert_eq!(bus.listener_count(), 1);
        }
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_bus() {
        let bus = Arc::new(TestBus::default());
        let mut pending = PendingResult::new(bus.clone(), KIND);
        pending.subscribe().unwrap();
        bus.listeners.lock().unwrap().clear();
        assert_eq!(
            pending.recv().await.unwrap_err(),
            ResultChannelError::Closed
        );
        assert_eq!(pending.state(), ChannelState::Unsubscribed);
    }
}
