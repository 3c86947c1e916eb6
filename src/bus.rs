//! Broadcast bus for daemon events
//!
//! Every state change, alert, scene lifecycle event, and telemetry snapshot
//! flows through one [`EventBus`]. Subscribers get a bounded lock-free queue;
//! when a slow subscriber falls behind, the oldest entry is dropped so the
//! latest event always fits. Hardware threads never block on publish.

use crate::safety::SystemState;
use crate::telemetry::TelemetrySnapshot;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Queue depth per subscriber; enough for a burst of scene events plus
/// several telemetry ticks.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Alert codes carried in telemetry and `alert` broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCode {
    LowVoltage,
    HighCurrent,
    SensorDegraded,
    TransportDown,
    LimitUnexpected,
    HomingTimeout,
}

/// Messages broadcast to every connected adapter
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Telemetry(TelemetrySnapshot),
    SceneStarted { scene: String },
    SceneCompleted { scene: String },
    SceneCancelled { scene: String, reason: String },
    SceneError { scene: String, reason: String },
    StateChanged { state: SystemState },
    Alert { code: AlertCode, message: String },
}

/// Lossy broadcast bus
///
/// Cheap to clone; all clones publish to the same subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<ArrayQueue<Event>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(ArrayQueue::new(SUBSCRIBER_QUEUE_DEPTH));
        self.subscribers.lock().push(Arc::clone(&queue));
        Subscription { queue }
    }

    /// Publish an event to all subscribers, dropping the oldest entry of any
    /// subscriber whose queue is full.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock();
        for queue in subscribers.iter() {
            let mut item = event.clone();
            while let Err(rejected) = queue.push(item) {
                // Full: evict the oldest so the newest always lands.
                let _ = queue.pop();
                item = rejected;
            }
        }
    }

    /// Drop subscriptions whose receiving side has gone away
    pub fn prune(&self) {
        self.subscribers
            .lock()
            .retain(|queue| Arc::strong_count(queue) > 1);
    }
}

/// Set of currently active alerts, shared by the components that raise them
/// and snapshotted into telemetry.
///
/// Raising an already-active alert is a no-op, so callers can raise from a
/// periodic loop without flooding subscribers.
#[derive(Clone, Default)]
pub struct AlertSet {
    active: Arc<Mutex<std::collections::BTreeSet<AlertCode>>>,
    bus: EventBus,
}

impl AlertSet {
    pub fn new(bus: EventBus) -> Self {
        Self {
            active: Arc::new(Mutex::new(std::collections::BTreeSet::new())),
            bus,
        }
    }

    /// Raise an alert; broadcasts only on the inactive -> active edge
    pub fn raise(&self, code: AlertCode, message: &str) {
        if self.active.lock().insert(code) {
            log::warn!("Alert raised: {:?} ({})", code, message);
            self.bus.publish(Event::Alert {
                code,
                message: message.to_string(),
            });
        }
    }

    /// Clear an alert if it is active
    pub fn clear(&self, code: AlertCode) {
        if self.active.lock().remove(&code) {
            log::info!("Alert cleared: {:?}", code);
        }
    }

    pub fn is_active(&self, code: AlertCode) -> bool {
        self.active.lock().contains(&code)
    }

    /// Sorted list of active alerts for telemetry snapshots
    pub fn active(&self) -> Vec<AlertCode> {
        self.active.lock().iter().copied().collect()
    }
}

/// Receiving side of an [`EventBus`] subscription
pub struct Subscription {
    queue: Arc<ArrayQueue<Event>>,
}

impl Subscription {
    /// Pop the next pending event, if any
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(Event::SceneStarted { scene: "wave".into() });
        assert!(matches!(a.try_recv(), Some(Event::SceneStarted { .. })));
        assert!(matches!(b.try_recv(), Some(Event::SceneStarted { .. })));
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_keeps_latest() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            bus.publish(Event::SceneStarted { scene: format!("s{}", i) });
        }
        let events = sub.drain();
        assert_eq!(events.len(), SUBSCRIBER_QUEUE_DEPTH);
        match events.last() {
            Some(Event::SceneStarted { scene }) => {
                assert_eq!(scene, &format!("s{}", SUBSCRIBER_QUEUE_DEPTH + 9));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
