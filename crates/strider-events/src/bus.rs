//! The event bus — fan-out with per-subscriber bounded buffers.
//!
//! Publishing walks the subscriber list and pushes into each buffer
//! without awaiting. A buffer at capacity drops its oldest event to make
//! room, so a stalled subscriber can never back-pressure the tracker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::Event;

const DEFAULT_BUFFER: usize = 256;

struct SubscriberSlot {
    buffer: Arc<Mutex<VecDeque<Event>>>,
    capacity: usize,
    notify: Arc<Notify>,
    dropped: Arc<Mutex<u64>>,
}

/// Fan-out publisher. Cheap to clone; all clones share the subscriber
/// list.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<SubscriberSlot>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber with the default buffer capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_BUFFER)
    }

    /// Register a subscriber with an explicit buffer capacity.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let notify = Arc::new(Notify::new());
        let dropped = Arc::new(Mutex::new(0u64));
        let slot = SubscriberSlot {
            buffer: buffer.clone(),
            capacity: capacity.max(1),
            notify: notify.clone(),
            dropped: dropped.clone(),
        };
        self.subscribers.lock().expect("bus lock").push(slot);
        Subscription {
            buffer,
            notify,
            dropped,
        }
    }

    /// Publish to every subscriber. Never blocks; full buffers drop their
    /// oldest event.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().expect("bus lock");
        if subscribers.is_empty() {
            debug!(event = event.name(), "event published with no subscribers");
            return;
        }
        for slot in subscribers.iter() {
            let mut buffer = slot.buffer.lock().expect("subscriber lock");
            if buffer.len() >= slot.capacity {
                buffer.pop_front();
                let mut dropped = slot.dropped.lock().expect("dropped lock");
                *dropped += 1;
                if *dropped % 100 == 1 {
                    warn!(
                        event = event.name(),
                        total_dropped = *dropped,
                        "slow subscriber, dropping oldest events"
                    );
                }
            }
            buffer.push_back(event.clone());
            slot.notify.notify_one();
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock").len()
    }
}

/// A subscriber's handle: drain events, await new ones.
pub struct Subscription {
    buffer: Arc<Mutex<VecDeque<Event>>>,
    notify: Arc<Notify>,
    dropped: Arc<Mutex<u64>>,
}

impl Subscription {
    /// Pop the next buffered event, if any.
    pub fn try_next(&self) -> Option<Event> {
        self.buffer.lock().expect("subscriber lock").pop_front()
    }

    /// Await the next event.
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.try_next() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<Event> {
        let mut buffer = self.buffer.lock().expect("subscriber lock");
        buffer.drain(..).collect()
    }

    /// How many events this subscriber has lost to overflow.
    pub fn dropped(&self) -> u64 {
        *self.dropped.lock().expect("dropped lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_info(step: usize) -> Event {
        Event::DeploymentInfo {
            plan_id: "plan-1".to_string(),
            step,
        }
    }

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(deployment_info(0));

        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(deployment_info(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(2);

        bus.publish(deployment_info(0));
        bus.publish(deployment_info(1));
        bus.publish(deployment_info(2));

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        // Oldest (step 0) was dropped.
        assert_eq!(events[0], deployment_info(1));
        assert_eq!(events[1], deployment_info(2));
        assert_eq!(sub.dropped(), 1);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(deployment_info(0));
        let sub = bus.subscribe();
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn next_wakes_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe();

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(deployment_info(7));
        });

        let event = sub.next().await;
        assert_eq!(event, deployment_info(7));
    }
}
