//! In-process event bus.
//!
//! A tiny named-channel publish/subscribe used to decouple leader election
//! from the stream engine. Publishing fans out synchronously to unbounded
//! per-subscriber queues; each subscriber drains its queue serially, so
//! consumers like the rebalance loop never observe overlapping events.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::membership::Membership;

/// Channel carrying [`BusEvent::MembershipChanged`].
pub const MEMBERSHIP_CHANGED: &str = "membership.changed";

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The membership assignment of this member changed.
    MembershipChanged(Membership),
}

/// Synchronous single-publisher multiple-subscriber bus.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<&'static str, Vec<mpsc::UnboundedSender<BusEvent>>>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber on `channel` and returns its queue.
    pub fn subscribe(&self, channel: &'static str) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(channel).or_default().push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber of `channel`, pruning
    /// subscribers whose receiver was dropped.
    pub fn publish(&self, channel: &str, event: &BusEvent) {
        let mut subscribers = self.subscribers.lock();
        if let Some(queue) = subscribers.get_mut(channel) {
            queue.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .get(channel)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe(MEMBERSHIP_CHANGED);
        let mut rx2 = bus.subscribe(MEMBERSHIP_CHANGED);

        let membership = Membership { member_number: 1, total_members: 2 };
        bus.publish(MEMBERSHIP_CHANGED, &BusEvent::MembershipChanged(membership));

        assert_eq!(
            rx1.try_recv().unwrap(),
            BusEvent::MembershipChanged(membership)
        );
        assert_eq!(
            rx2.try_recv().unwrap(),
            BusEvent::MembershipChanged(membership)
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(
            MEMBERSHIP_CHANGED,
            &BusEvent::MembershipChanged(Membership::SINGLE),
        );
        assert_eq!(bus.subscriber_count(MEMBERSHIP_CHANGED), 0);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(MEMBERSHIP_CHANGED);
        drop(rx);
        assert_eq!(bus.subscriber_count(MEMBERSHIP_CHANGED), 1);

        bus.publish(
            MEMBERSHIP_CHANGED,
            &BusEvent::MembershipChanged(Membership::SINGLE),
        );
        assert_eq!(bus.subscriber_count(MEMBERSHIP_CHANGED), 0);
    }

    #[test]
    fn test_events_queue_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(MEMBERSHIP_CHANGED);
        for n in 1..=3 {
            bus.publish(
                MEMBERSHIP_CHANGED,
                &BusEvent::MembershipChanged(Membership {
                    member_number: 1,
                    total_members: n,
                }),
            );
        }
        for n in 1..=3 {
            let BusEvent::MembershipChanged(m) = rx.try_recv().unwrap();
            assert_eq!(m.total_members, n);
        }
    }
}
