//! The default dispatcher (§4.2, §6 default): demand-fair distribution.
//!
//! Events are routed to exactly one subscriber each. Subscribers are
//! served in a rotation, each getting a batch sized to its own
//! outstanding demand before the rotation moves on, so no single fast
//! subscriber can starve the others as long as it keeps asking.

use super::{Dispatcher, Routed};
use crate::runtime::SubscriptionRef;
use crate::types::SubscriptionOptions;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct DemandDispatcher {
    /// Subscription order, used as the rotation; the subscriber served
    /// least recently is always at the front.
    order: VecDeque<SubscriptionRef>,
    demand: HashMap<SubscriptionRef, usize>,
}

impl DemandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E> Dispatcher<E> for DemandDispatcher {
    fn subscribe(&mut self, subscription: SubscriptionRef, _opts: &SubscriptionOptions) -> usize {
        self.order.push_back(subscription);
        self.demand.entry(subscription).or_insert(0);
        0
    }

    fn cancel(&mut self, subscription: SubscriptionRef) -> usize {
        self.order.retain(|s| *s != subscription);
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
        let mut remaining: VecDeque<E> = events.into();
        let mut batches: HashMap<SubscriptionRef, Vec<E>> = HashMap::new();
        let rotation_len = self.order.len();

        if rotation_len == 0 {
            return (Vec::new(), remaining.into_iter().collect());
        }

        let mut served_in_a_row_without_progress = 0;
        while !remaining.is_empty() && served_in_a_row_without_progress < rotation_len {
            let subscription = match self.order.pop_front() {
                Some(s) => s,
                None => break,
            };
            self.order.push_back(subscription);

            let demand = self.demand.get(&subscription).copied().unwrap_or(0);
            if demand == 0 {
                served_in_a_row_without_progress += 1;
                continue;
            }
            served_in_a_row_without_progress = 0;

            let take = demand.min(remaining.len());
            let batch: Vec<E> = remaining.drain(..take).collect();
            *self.demand.get_mut(&subscription).expect("subscription tracked") -= take;
            batches.entry(subscription).or_default().extend(batch);
        }

        let routed = batches.into_iter().map(|(subscription, events)| Routed { subscription, events }).collect();
        (routed, remaining.into_iter().collect())
    }

    fn notify_targets(&self) -> Vec<SubscriptionRef> {
        self.order.iter().copied().collect()
    }
}
