//! Pluggable dispatch strategy (§4.2, §9): how a producer's drained
//! events are split across its subscribed consumers.
//!
//! Mirrors the provider-trait shape used for event backends — one
//! trait, one directory, one file per built-in implementation — except
//! a dispatcher is pure state transition logic invoked synchronously
//! from a stage's own run loop, so it carries no `async_trait`: there is
//! no I/O here, only bookkeeping over demand counters.

use crate::runtime::SubscriptionRef;
use crate::types::SubscriptionOptions;

pub mod broadcast;
pub mod demand;
pub mod partition;

pub use broadcast::BroadcastDispatcher;
pub use demand::DemandDispatcher;
pub use partition::PartitionDispatcher;

/// A batch of events routed to one subscriber, paired with however much
/// of that subscriber's demand it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed<E> {
    pub subscription: SubscriptionRef,
    pub events: Vec<E>,
}

/// The dispatcher plug-in point (§4.2). `E` is the producer's event
/// type. Every method is called with the producer's own subscription
/// table already updated — a dispatcher only ever tracks what it needs
/// for routing, never subscription lifecycle itself.
pub trait Dispatcher<E>: Send {
    /// A new consumer subscribed with `opts`. Returns freshly-granted
    /// demand (§4.4 dispatcher callout contract) — always 0 for the
    /// built-ins, since a subscriber only gains demand once it actually
    /// asks.
    fn subscribe(&mut self, subscription: SubscriptionRef, opts: &SubscriptionOptions) -> usize;

    /// A consumer's subscription ended; forget it. Returns
    /// freshly-granted demand (always 0 for the built-ins).
    fn cancel(&mut self, subscription: SubscriptionRef) -> usize;

    /// A consumer asked for `count` more events. Returns the demand
    /// newly available to satisfy — `count` itself, for every built-in
    /// dispatcher — which the kernel uses to drain the buffer and, if
    /// exhausted, calls `handle_demand`/feeds the bridge with any
    /// residual (§4.4).
    fn ask(&mut self, subscription: SubscriptionRef, count: usize) -> usize;

    /// Route as many of `events` as current demand allows. Returns the
    /// per-subscriber batches to send, plus whatever events this
    /// dispatcher could not place (handed back to the caller, which puts
    /// them back at the head of the buffer).
    fn dispatch(&mut self, events: Vec<E>) -> (Vec<Routed<E>>, Vec<E>);

    /// Which subscribers should receive a notification right now (§4.6:
    /// notifications are delivered in-band, but are never gated by
    /// demand the way events are). All three built-ins answer with
    /// every currently-subscribed consumer.
    fn notify_targets(&self) -> Vec<SubscriptionRef>;
}
