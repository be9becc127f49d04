use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, RwLock};

use super::events::{Event, EventKind};

/// In-process typed publish/subscribe bus.
///
/// Each subscriber gets an unbounded channel; publishing enqueues to a
/// snapshot of the current subscribers, so delivery per topic is FIFO and
/// `publish` never blocks on slow consumers. Events published after
/// `stop()` are dropped; already-queued deliveries stay readable.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>>,
    stopped: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a subscriber for one event kind.
    pub async fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.entry(kind).or_default().push(tx);
        rx
    }

    /// Enqueue an event to every live subscriber of its kind.
    pub async fn publish(&self, event: Event) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let kind = event.kind();
        let snapshot: Vec<mpsc::UnboundedSender<Event>> = {
            let guard = self.subscribers.read().await;
            guard.get(&kind).cloned().unwrap_or_default()
        };
        let mut dropped = false;
        for sender in &snapshot {
            if sender.send(event.clone()).is_err() {
                dropped = true;
            }
        }
        if dropped {
            self.subscribers
                .write()
                .await
                .entry(kind)
                .or_default()
                .retain(|sender| !sender.is_closed());
        }
    }

    /// Stop the bus. Later publishes are dropped; losing an in-flight event
    /// during shutdown is acceptable by contract.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.subscribers.write().await.clear();
    }

    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .await
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::KillSwitchEvent;
    use chrono::Utc;

    fn kill_event(reason: &str) -> Event {
        Event::KillSwitch(KillSwitchEvent {
            source: "test".into(),
            run_id: "r1".into(),
            reason: reason.into(),
            triggered_by: "test".into(),
            ts: Utc::now(),
        })
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::KillSwitch).await;
        for i in 0..5 {
            bus.publish(kill_event(&format!("reason-{i}"))).await;
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                Event::KillSwitch(ev) => assert_eq!(ev.reason, format!("reason-{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_only_reaches_matching_kind() {
        let bus = EventBus::new();
        let mut kill_rx = bus.subscribe(EventKind::KillSwitch).await;
        let mut signal_rx = bus.subscribe(EventKind::Signal).await;
        bus.publish(kill_event("x")).await;
        assert!(kill_rx.try_recv().is_ok());
        assert!(signal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_drops_later_publishes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::KillSwitch).await;
        bus.publish(kill_event("before")).await;
        bus.stop().await;
        bus.publish(kill_event("after")).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe(EventKind::KillSwitch).await;
        }
        bus.publish(kill_event("x")).await;
        assert_eq!(bus.subscriber_count(EventKind::KillSwitch).await, 0);
    }
}
