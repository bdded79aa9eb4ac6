use super::*;
use std::sync::Mutex;

#[test]
fn delivers_in_registration_order() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for name in ["messages", "presence", "conversations"] {
        let seen = Arc::clone(&seen);
        bus.subscribe(move |_| seen.lock().expect("lock").push(name));
    }

    bus.emit(BusEvent::ConversationListInvalidated);
    assert_eq!(
        *seen.lock().expect("lock"),
        vec!["messages", "presence", "conversations"]
    );
}

#[test]
fn unsubscribed_observer_stops_receiving() {
    let bus = EventBus::new();
    let count = Arc::new(Mutex::new(0));
    let id = {
        let count = Arc::clone(&count);
        bus.subscribe(move |_| *count.lock().expect("lock") += 1)
    };

    bus.emit(BusEvent::AuthenticationRequired);
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    bus.emit(BusEvent::AuthenticationRequired);

    assert_eq!(*count.lock().expect("lock"), 1);
    assert_eq!(bus.observer_count(), 0);
}

#[test]
fn observer_may_subscribe_during_emit_without_deadlock() {
    let bus = EventBus::new();
    let inner_bus = bus.clone();
    bus.subscribe(move |_| {
        inner_bus.subscribe(|_| {});
    });

    bus.emit(BusEvent::ConversationListInvalidated);
    assert_eq!(bus.observer_count(), 2);
}

#[tokio::test]
async fn channel_preserves_emission_order() {
    let bus = EventBus::new();
    let (_id, mut rx) = bus.channel();

    bus.emit(BusEvent::AuthenticationRequired);
    bus.emit(BusEvent::ConversationListInvalidated);

    assert_eq!(rx.recv().await, Some(BusEvent::AuthenticationRequired));
    assert_eq!(rx.recv().await, Some(BusEvent::ConversationListInvalidated));
}
