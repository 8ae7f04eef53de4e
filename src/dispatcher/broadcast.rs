//! Broadcast dispatcher (§9): every subscriber sees every event.
//!
//! Throughput is bounded by the slowest subscriber — an event is only
//! dispatched once *all* subscribers have demand for it, so `E` must be
//! `Clone` (each subscriber gets its own copy).

use super::{Dispatcher, Routed};
use crate::runtime::SubscriptionRef;
use crate::types::SubscriptionOptions;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct BroadcastDispatcher {
    demand: HashMap<SubscriptionRef, usize>,
}

impl BroadcastDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: Clone> Dispatcher<E> for BroadcastDispatcher {
    fn subscribe(&mut self, subscription: SubscriptionRef, _opts: &SubscriptionOptions) -> usize {
        self.demand.insert(subscription, 0);
        0
    }

    fn cancel(&mut self, subscription: SubscriptionRef) -> usize {
        self.demand.remove(&subscription);
        0
    }

    fn ask(&mut self, subscription: SubscriptionRef, count: usize) -> usize {
        if let Some(d) = self.demand.get_mut(&subscription) {
            *d += count;
        }
        count
    }

    fn dispatch(&mut self, events: Vec<E>) -> (Vec<Routed<E>>, Vec<E>) {
        if self.demand.is_empty() {
            return (Vec::new(), events);
        }
        let floor = self.demand.values().copied().min().unwrap_or(0);
        let take = floor.min(events.len());

        let mut remaining = events;
        let batch: Vec<E> = remaining.drain(..take).collect();

        if batch.is_empty() {
            return (Vec::new(), remaining);
        }

        for d in self.demand.values_mut() {
            *d -= take;
        }
        let routed = self
            .demand
            .keys()
            .map(|subscription| Routed { subscription: *subscription, events: batch.clone() })
            .collect();
        (routed, remaining)
    }

    fn notify_targets(&self) -> Vec<SubscriptionRef> {
        self.demand.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionOptions;

    fn opts() -> SubscriptionOptions {
        SubscriptionOptions::default()
    }

    #[test]
    fn every_subscriber_receives_the_same_events() {
        let mut d = BroadcastDispatcher::new();
        let a = SubscriptionRef::new();
        let b = SubscriptionRef::new();
        d.subscribe(a, &opts());
        d.subscribe(b, &opts());
        d.ask(a, 5);
        d.ask(b, 5);

        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2, 3]);
        assert!(leftover.is_empty());
        assert_eq!(routed.len(), 2);
        for r in &routed {
            assert_eq!(r.events, vec![1, 2, 3]);
        }
    }

    #[test]
    fn throughput_is_bounded_by_slowest_subscriber() {
        let mut d = BroadcastDispatcher::new();
        let slow = SubscriptionRef::new();
        let fast = SubscriptionRef::new();
        d.subscribe(slow, &opts());
        d.subscribe(fast, &opts());
        d.ask(slow, 1);
        d.ask(fast, 10);

        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2, 3]);
        assert_eq!(leftover, vec![2, 3]);
        for r in &routed {
            assert_eq!(r.events, vec![1]);
        }
    }

    #[test]
    fn no_subscribers_returns_events_unplaced() {
        let mut d = BroadcastDispatcher::new();
        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2]);
        assert!(routed.is_empty());
        assert_eq!(leftover, vec![1, 2]);
    }
}
