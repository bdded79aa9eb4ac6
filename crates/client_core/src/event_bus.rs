//! In-process fan-out between the transport and every downstream cache.
//!
//! Delivery is synchronous and follows registration order. Observers run on
//! the emitting task, so they must return quickly; async consumers should
//! use [`EventBus::channel`].

use std::sync::{Arc, PoisonError, RwLock};

use shared::{
    domain::PendingMessage,
    protocol::{ConversationSummary, Message, TopicPayload},
};
use tokio::sync::mpsc;

use crate::connection::ConnectionStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Topic(TopicPayload),
    ConnectionStatusChanged(ConnectionStatus),
    /// The session token was rejected locally; a fresh one is needed before reconnecting.
    AuthenticationRequired,
    OutboxMessageQueued(PendingMessage),
    OutboxMessageDelivered {
        client_id: String,
        message: Message,
    },
    OutboxMessageFailed {
        client_id: String,
        error: String,
    },
    ConversationListInvalidated,
    ConversationListRefreshed(Vec<ConversationSummary>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Observer)>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = ObserverId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registry.observers.len();
        registry.observers.retain(|(candidate, _)| *candidate != id);
        registry.observers.len() != before
    }

    /// Forwards every event into an unbounded queue, preserving order.
    pub fn channel(&self) -> (ObserverId, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn emit(&self, event: BusEvent) {
        // Snapshot first so observers may (un)subscribe while being notified.
        let observers: Vec<Observer> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(&event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .len()
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;
