//! Partition dispatcher (§9): events are routed to a fixed subscriber
//! by a caller-supplied key function, rather than round-robin or
//! broadcast — useful when downstream consumers must each see a
//! consistent slice of the event space (e.g. one consumer per shard).
//!
//! A subscriber claims a partition by carrying `{"partition": N}` in its
//! `SubscriptionOptions::extra` (§6's opaque extra-keys channel); an
//! unclaimed partition's events are left undispatched rather than
//! guessed at, since sending them to the wrong consumer would violate
//! the partitioning contract.

use super::{Dispatcher, Routed};
use crate::runtime::SubscriptionRef;
use crate::types::SubscriptionOptions;
use std::collections::HashMap;

pub struct PartitionDispatcher<E> {
    partitions: usize,
    key_fn: Box<dyn Fn(&E) -> usize + Send>,
    assignment: HashMap<usize, SubscriptionRef>,
    demand: HashMap<SubscriptionRef, usize>,
}

impl<E> PartitionDispatcher<E> {
    pub fn new(partitions: usize, key_fn: impl Fn(&E) -> usize + Send + 'static) -> Self {
        Self { partitions, key_fn: Box::new(key_fn), assignment: HashMap::new(), demand: HashMap::new() }
    }

    fn claimed_partition(opts: &SubscriptionOptions) -> Option<usize> {
        opts.extra.get("partition")?.as_u64().map(|n| n as usize)
    }
}

impl<E> Dispatcher<E> for PartitionDispatcher<E> {
    fn subscribe(&mut self, subscription: SubscriptionRef, opts: &SubscriptionOptions) -> usize {
        self.demand.insert(subscription, 0);
        if let Some(partition) = Self::claimed_partition(opts) {
            if partition < self.partitions {
                self.assignment.insert(partition, subscription);
            }
        }
        0
    }

    fn cancel(&mut self, subscription: SubscriptionRef) -> usize {
        self.demand.remove(&subscription);
        self.assignment.retain(|_, s| *s != subscription);
        0
    }

    fn ask(&mut self, subscription: SubscriptionRef, count: usize) -> usize {
        if let Some(d) = self.demand.get_mut(&subscription) {
            *d += count;
        }
        count
    }

    fn dispatch(&mut self, events: Vec<E>) -> (Vec<Routed<E>>, Vec<E>) {
        let mut by_partition: Vec<Vec<E>> = (0..self.partitions).map(|_| Vec::new()).collect();
        let mut unassigned = Vec::new();

        for event in events {
            let partition = (self.key_fn)(&event) % self.partitions.max(1);
            match by_partition.get_mut(partition) {
                Some(bucket) => bucket.push(event),
                None => unassigned.push(event),
            }
        }

        let mut routed = Vec::new();
        let mut leftover = unassigned;
        for (partition, mut bucket) in by_partition.into_iter().enumerate() {
            let Some(subscription) = self.assignment.get(&partition).copied() else {
                leftover.append(&mut bucket);
                continue;
            };
            let demand = self.demand.get(&subscription).copied().unwrap_or(0);
            let take = demand.min(bucket.len());
            let sent: Vec<E> = bucket.drain(..take).collect();
            leftover.append(&mut bucket);
            if !sent.is_empty() {
                *self.demand.get_mut(&subscription).expect("subscription tracked") -= take;
                routed.push(Routed { subscription, events: sent });
            }
        }

        (routed, leftover)
    }

    fn notify_targets(&self) -> Vec<SubscriptionRef> {
        self.assignment.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionOptions;

    fn opts_for_partition(partition: u64) -> SubscriptionOptions {
        SubscriptionOptions::default().with_extra(serde_json::json!({ "partition": partition }))
    }

    #[test]
    fn events_route_to_the_subscriber_that_claimed_their_partition() {
        let mut d = PartitionDispatcher::new(2, |n: &i32| (*n % 2) as usize);
        let even = SubscriptionRef::new();
        let odd = SubscriptionRef::new();
        d.subscribe(even, &opts_for_partition(0));
        d.subscribe(odd, &opts_for_partition(1));
        d.ask(even, 10);
        d.ask(odd, 10);

        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2, 3, 4]);
        assert!(leftover.is_empty());
        let even_batch = routed.iter().find(|r| r.subscription == even).unwrap();
        let odd_batch = routed.iter().find(|r| r.subscription == odd).unwrap();
        assert_eq!(even_batch.events, vec![2, 4]);
        assert_eq!(odd_batch.events, vec![1, 3]);
    }

    #[test]
    fn unclaimed_partition_events_are_left_undispatched() {
        let mut d = PartitionDispatcher::new(2, |n: &i32| (*n % 2) as usize);
        let even = SubscriptionRef::new();
        d.subscribe(even, &opts_for_partition(0));
        d.ask(even, 10);

        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2, 3, 4]);
        assert_eq!(leftover, vec![1, 3]);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].events, vec![2, 4]);
    }

    #[test]
    fn demand_caps_how_many_events_a_partition_can_send() {
        let mut d = PartitionDispatcher::new(1, |_: &i32| 0);
        let sub = SubscriptionRef::new();
        d.subscribe(sub, &opts_for_partition(0));
        d.ask(sub, 1);

        let (routed, leftover) = Dispatcher::<i32>::dispatch(&mut d, vec![1, 2, 3]);
        assert_eq!(routed[0].events, vec![1]);
        assert_eq!(leftover, vec![2, 3]);
    }
}
