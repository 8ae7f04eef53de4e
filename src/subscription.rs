//! Subscription lifecycle bookkeeping, both sides (§4.1, §6).
//!
//! A producer tracks one [`ProducerSubscription`] per consumer it has
//! accepted; a consumer tracks one [`ConsumerSubscription`] per
//! producer it is subscribed to. Both sides key off the same
//! [`SubscriptionRef`] minted by the consumer at `subscribe` time (§6:
//! "the consumer mints the ref; the producer only ever echoes it back").

use crate::runtime::{ActorRef, MonitorHandle, SubscriptionRef};
use crate::types::{CancelMode, SubscriptionOptions};
use std::collections::HashMap;

/// Producer-side record of one accepted consumer.
pub struct ProducerSubscription<C> {
    pub consumer: C,
    pub opts: SubscriptionOptions,
    /// The producer's monitor on this consumer; demonitored on cancel/DOWN
    /// so a dead peer is never watched twice (§4.2 cancellation causes).
    pub monitor: MonitorHandle,
}

/// Tracks every subscription a producer (or producer-consumer acting as
/// a producer) has accepted, keyed by ref. `C` is whatever the producer
/// needs to address its consumer with — typically `PeerRef<...>`.
pub struct ProducerSubscriptions<C> {
    table: HashMap<SubscriptionRef, ProducerSubscription<C>>,
}

impl<C> Default for ProducerSubscriptions<C> {
    fn default() -> Self {
        Self { table: HashMap::new() }
    }
}

/// Why a `SUBSCRIBE` was refused outright (§6: "duplicated / unknown ref
/// handling").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    Duplicated,
}

impl<C> ProducerSubscriptions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly-accepted subscription, rejecting a ref that is
    /// already on file (§6 duplicated-ref handling — the producer must
    /// not silently clobber an existing consumer's state).
    pub fn accept(
        &mut self,
        reference: SubscriptionRef,
        consumer: C,
        opts: SubscriptionOptions,
        monitor: MonitorHandle,
    ) -> Result<(), SubscribeError> {
        if self.table.contains_key(&reference) {
            return Err(SubscribeError::Duplicated);
        }
        self.table.insert(reference, ProducerSubscription { consumer, opts, monitor });
        Ok(())
    }

    pub fn remove(&mut self, reference: SubscriptionRef) -> Option<ProducerSubscription<C>> {
        self.table.remove(&reference)
    }

    pub fn get(&self, reference: SubscriptionRef) -> Option<&ProducerSubscription<C>> {
        self.table.get(&reference)
    }

    pub fn contains(&self, reference: SubscriptionRef) -> bool {
        self.table.contains_key(&reference)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn refs(&self) -> impl Iterator<Item = SubscriptionRef> + '_ {
        self.table.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionRef, &ProducerSubscription<C>)> {
        self.table.iter().map(|(r, s)| (*r, s))
    }
}

/// Consumer-side record of one subscription to a producer.
pub struct ConsumerSubscription<P> {
    pub producer: ActorRef<P>,
    pub cancel: CancelMode,
    /// Demand already sent upstream but not yet satisfied with events.
    pub pending: usize,
    pub min_demand: usize,
    pub max_demand: usize,
    /// Set once the producer has acknowledged the `SUBSCRIBE`; until
    /// then the consumer must not send `ASK` (§6 handshake ordering).
    pub acked: bool,
    /// MANUAL consumers (§4.3) never auto-top-up; `handle_subscribe`'s
    /// caller is responsible for calling `ask` explicitly.
    pub manual: bool,
    /// The consumer's monitor on this producer, held for the
    /// subscription's lifetime and demonitored on cancel/DOWN.
    pub monitor: MonitorHandle,
}

impl<P> ConsumerSubscription<P> {
    pub fn new(producer: ActorRef<P>, opts: &SubscriptionOptions, manual: bool, monitor: MonitorHandle) -> Self {
        Self {
            producer,
            cancel: opts.cancel,
            pending: 0,
            min_demand: opts.min_demand,
            max_demand: opts.max_demand,
            acked: false,
            manual,
            monitor,
        }
    }
}

/// Tracks every producer a consumer (or producer-consumer acting as a
/// consumer) is subscribed to, keyed by the same ref the producer uses.
pub struct ConsumerSubscriptions<P> {
    table: HashMap<SubscriptionRef, ConsumerSubscription<P>>,
}

impl<P> Default for ConsumerSubscriptions<P> {
    fn default() -> Self {
        Self { table: HashMap::new() }
    }
}

impl<P> ConsumerSubscriptions<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: SubscriptionRef, sub: ConsumerSubscription<P>) {
        self.table.insert(reference, sub);
    }

    pub fn remove(&mut self, reference: SubscriptionRef) -> Option<ConsumerSubscription<P>> {
        self.table.remove(&reference)
    }

    pub fn get(&self, reference: SubscriptionRef) -> Option<&ConsumerSubscription<P>> {
        self.table.get(&reference)
    }

    pub fn get_mut(&mut self, reference: SubscriptionRef) -> Option<&mut ConsumerSubscription<P>> {
        self.table.get_mut(&reference)
    }

    pub fn contains(&self, reference: SubscriptionRef) -> bool {
        self.table.contains_key(&reference)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SubscriptionRef, &mut ConsumerSubscription<P>)> {
        self.table.iter_mut().map(|(r, s)| (*r, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_rejects_duplicated_reference() {
        let mut table: ProducerSubscriptions<&'static str> = ProducerSubscriptions::new();
        let reference = SubscriptionRef::new();
        let opts = SubscriptionOptions::default();
        assert!(table.accept(reference, "consumer-a", opts.clone(), MonitorHandle::inert()).is_ok());
        assert_eq!(
            table.accept(reference, "consumer-b", opts, MonitorHandle::inert()).unwrap_err(),
            SubscribeError::Duplicated
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_unknown_reference_is_none() {
        let mut table: ProducerSubscriptions<&'static str> = ProducerSubscriptions::new();
        assert!(table.remove(SubscriptionRef::new()).is_none());
    }

    #[test]
    fn producer_subscriptions_round_trip() {
        let mut table: ProducerSubscriptions<&'static str> = ProducerSubscriptions::new();
        let reference = SubscriptionRef::new();
        table.accept(reference, "consumer-a", SubscriptionOptions::default(), MonitorHandle::inert()).unwrap();
        assert!(table.contains(reference));
        let removed = table.remove(reference).unwrap();
        assert_eq!(removed.consumer, "consumer-a");
        assert!(!table.contains(reference));
    }
}
