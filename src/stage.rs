//! The stage kernel (§4.1): the callback contract user modules implement,
//! and the run loop that ties the subscription manager (§4.2), consumer
//! demand engine (§4.3), dispatch pipeline (§4.4), and producer-consumer
//! bridge (§4.5) together behind one mailbox per stage.
//!
//! Grounded on spec §4.1 directly, with the surrounding task/loop shape
//! borrowed from `cyntrisec-confidential-ml-pipeline`'s role-tagged stage
//! struct (see DESIGN.md) and the span-per-operation convention from the
//! teacher's `EventBus`.

use crate::bridge::Bridge;
use crate::buffer::EventBuffer;
use crate::dispatcher::{BroadcastDispatcher, DemandDispatcher, Dispatcher, PartitionDispatcher};
use crate::notify::Entry;
use crate::protocol::{PeerRef, StageMessage};
use crate::runtime::{self, ActorRef, Mailbox, MonitorRef, ReplyPort, SubscriptionRef};
use crate::subscription::{ConsumerSubscription, ConsumerSubscriptions, ProducerSubscriptions};
use crate::types::{BufferConfig, CancelMode, CancelReason, DispatcherKind, ExitReason, StageKind, SubscriptionOptions};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Message type alias for a concrete `Stage` implementation.
pub type Msg<S> = StageMessage<<S as Stage>::Event, <S as Stage>::Message, <S as Stage>::Reply>;
/// Address alias for a concrete `Stage` implementation.
pub type Addr<S> = ActorRef<Msg<S>>;
/// `from=(peer_addr, subscription_ref)` alias for a concrete `Stage`.
pub type Peer<S> = PeerRef<<S as Stage>::Event, <S as Stage>::Message, <S as Stage>::Reply>;

/// Which role the *peer* just adopted relative to the stage receiving the
/// `handle_subscribe` call (§4.1): a producer is told `Consumer` (a
/// consumer just subscribed to it); a consumer is told `Producer` (it
/// just subscribed to a producer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Producer,
    Consumer,
}

/// Whether a freshly-acked subscription's demand is kernel-managed or
/// fully user-driven (§4.3 `:manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeDecision {
    Automatic,
    Manual,
}

/// The result of `handle_subscribe`: which demand mode to use, and
/// (rarely) a request to stop the stage outright.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub decision: SubscribeDecision,
    pub stop: Option<ExitReason>,
}

impl SubscribeOutcome {
    pub fn automatic() -> Self {
        Self { decision: SubscribeDecision::Automatic, stop: None }
    }

    pub fn manual() -> Self {
        Self { decision: SubscribeDecision::Manual, stop: None }
    }

    pub fn stop(reason: ExitReason) -> Self {
        Self { decision: SubscribeDecision::Automatic, stop: Some(reason) }
    }
}

impl Default for SubscribeOutcome {
    fn default() -> Self {
        Self::automatic()
    }
}

/// What a callback hands back to the kernel: events to run through
/// `dispatch_events`, and optionally a request to stop the stage (§4.1:
/// "any callback may additionally ... return STOP with a reason").
#[derive(Debug, Clone)]
pub struct Emit<E> {
    pub events: Vec<E>,
    pub stop: Option<ExitReason>,
}

impl<E> Emit<E> {
    pub fn none() -> Self {
        Self { events: Vec::new(), stop: None }
    }

    pub fn events(events: Vec<E>) -> Self {
        Self { events, stop: None }
    }

    pub fn stop(reason: ExitReason) -> Self {
        Self { events: Vec::new(), stop: Some(reason) }
    }

    pub fn events_and_stop(events: Vec<E>, reason: ExitReason) -> Self {
        Self { events, stop: Some(reason) }
    }
}

impl<E> Default for Emit<E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<E> From<Vec<E>> for Emit<E> {
    fn from(events: Vec<E>) -> Self {
        Self::events(events)
    }
}

/// The callback contract every stage implementation fulfills (§4.1).
/// `KIND` is fixed per implementing type — a Rust type is always exactly
/// one of the three roles, which is simpler and just as expressive as
/// deciding the role at `init` time from a dynamic return value.
pub trait Stage: Send + 'static {
    /// The events this stage produces and/or consumes. `Clone` is
    /// required because the broadcast dispatcher (§9) must hand every
    /// subscriber its own copy; a producer using only the demand or
    /// partition dispatcher pays nothing extra for this bound.
    type Event: Clone + Send + 'static;
    /// Custom fire-and-forget message type for `handle_cast`.
    type Message: Send + 'static;
    /// Reply type for `handle_call`.
    type Reply: Send + 'static;

    const KIND: StageKind;

    /// Producer only: asked for `demand` more events.
    fn handle_demand(&mut self, _demand: usize) -> Emit<Self::Event> {
        Emit::none()
    }

    /// Consumer/producer-consumer: a batch of events arrived from `from`.
    fn handle_events(&mut self, _events: Vec<Self::Event>, _from: SubscriptionRef) -> Emit<Self::Event> {
        Emit::none()
    }

    /// All roles: a subscription handshake step completed on `from`.
    fn handle_subscribe(
        &mut self,
        _peer_role: PeerRole,
        _opts: &SubscriptionOptions,
        _from: SubscriptionRef,
    ) -> SubscribeOutcome {
        SubscribeOutcome::default()
    }

    /// All roles: subscription `from` ended (§4.2's four causes, uniform
    /// entry point).
    fn handle_cancel(&mut self, _reason: &CancelReason, _from: SubscriptionRef) -> Emit<Self::Event> {
        Emit::none()
    }

    /// Fire-and-forget custom message.
    fn handle_cast(&mut self, _msg: Self::Message) -> Emit<Self::Event> {
        Emit::none()
    }

    /// Request/reply custom message; the callback is responsible for
    /// calling `reply.reply(..)` itself (it may also choose not to, e.g.
    /// to answer asynchronously through other means — the caller's own
    /// timeout is what protects it either way, per §5).
    fn handle_call(&mut self, _msg: Self::Message, _reply: ReplyPort<Self::Reply>) -> Emit<Self::Event> {
        Emit::none()
    }

    /// A notification rode in alongside buffered events, or arrived via
    /// `sync_notify` (§4.6). Purely informational — it carries no demand
    /// and cannot emit events.
    fn handle_notification(&mut self, _payload: serde_json::Value) {}

    /// Used only when `DispatcherKind::Partition` is selected; maps an
    /// event to a partition index. The default sends everything to
    /// partition 0, which is almost certainly not what a partitioned
    /// producer wants — override it.
    fn partition_key(_event: &Self::Event) -> usize {
        0
    }

    fn terminate(&mut self, _reason: &ExitReason) {}
}

/// Init-time configuration (§6 "Init options"). Defaults match the
/// documented per-role defaults; construct with the role-specific
/// constructor so the right defaults apply (`StageOptions::producer()`
/// etc.) rather than `Default::default()`.
pub struct StageOptions<S: Stage> {
    pub buffer: BufferConfig,
    pub dispatcher: DispatcherKind,
    pub subscribe_to: Vec<(Addr<S>, SubscriptionOptions)>,
    pub mailbox_capacity: usize,
}

impl<S: Stage> StageOptions<S> {
    pub fn producer() -> Self {
        Self { buffer: BufferConfig::default(), dispatcher: DispatcherKind::Demand, subscribe_to: Vec::new(), mailbox_capacity: 1024 }
    }

    pub fn consumer() -> Self {
        Self { buffer: BufferConfig::unbounded(), dispatcher: DispatcherKind::Demand, subscribe_to: Vec::new(), mailbox_capacity: 1024 }
    }

    pub fn producer_consumer() -> Self {
        Self { buffer: BufferConfig::unbounded(), dispatcher: DispatcherKind::Demand, subscribe_to: Vec::new(), mailbox_capacity: 1024 }
    }

    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherKind) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_subscribe_to(mut self, producer: Addr<S>, opts: SubscriptionOptions) -> Self {
        self.subscribe_to.push((producer, opts));
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }
}

/// A producer subscription not yet acked (§3 `monitors`, consumer side,
/// pre-ack), keyed by the ref the consumer minted for it. Carries the
/// monitor created at SUBSCRIBE time so it can travel into the
/// [`ConsumerSubscription`] once ACK arrives, rather than being recreated.
struct PendingSub<S: Stage> {
    producer: Addr<S>,
    opts: SubscriptionOptions,
    monitor: runtime::MonitorHandle,
}

/// What `drain_buffer_and_dispatch` / `dispatch_events` queued up to send
/// to one subscriber, before the actual (async) send happens.
enum Outbound<E> {
    Events(Vec<E>),
    Notification(serde_json::Value),
}

/// All kernel-owned state for one running stage. Never exposed directly
/// — callers only ever hold an [`crate::handle::StageHandle`] (an
/// `ActorRef` wrapper).
struct Kernel<S: Stage> {
    user: S,
    self_addr: Addr<S>,

    // Producer side (§3 `consumers`, `buffer`, `buffer_config`).
    buffer: Option<EventBuffer<S::Event>>,
    dispatcher: Option<Box<dyn Dispatcher<S::Event>>>,
    consumers: ProducerSubscriptions<Peer<S>>,
    consumer_monitors: HashMap<MonitorRef, SubscriptionRef>,

    // Consumer side (§3 `producers`, `monitors` pre-ack).
    producers: ConsumerSubscriptions<Msg<S>>,
    pending: HashMap<SubscriptionRef, PendingSub<S>>,
    producer_monitors: HashMap<MonitorRef, SubscriptionRef>,

    // Producer-consumer only (§3 `events`).
    bridge: Option<Bridge<S::Event, Peer<S>>>,
}

impl<S: Stage> Kernel<S> {
    fn new(user: S, buffer_config: BufferConfig, dispatcher_kind: DispatcherKind, self_addr: Addr<S>) -> Self {
        let (buffer, dispatcher) = if S::KIND.is_producer() {
            (Some(EventBuffer::new(buffer_config)), Some(build_dispatcher::<S>(dispatcher_kind)))
        } else {
            (None, None)
        };
        let bridge = if S::KIND == StageKind::ProducerConsumer { Some(Bridge::new()) } else { None };
        Self {
            user,
            self_addr,
            buffer,
            dispatcher,
            consumers: ProducerSubscriptions::new(),
            consumer_monitors: HashMap::new(),
            producers: ConsumerSubscriptions::new(),
            pending: HashMap::new(),
            producer_monitors: HashMap::new(),
            bridge,
        }
    }

    fn self_peer(&self, reference: SubscriptionRef) -> Peer<S> {
        PeerRef { addr: self.self_addr.clone(), subscription: reference }
    }

    // ---- subscription manager (§4.2) ----------------------------------

    async fn tell_unknown_to_consumer(&self, to: &Peer<S>) {
        let msg = StageMessage::CancelDown { from: self.self_peer(to.subscription), reason: CancelReason::UnknownSubscription };
        let _ = to.addr.send(msg).await;
    }

    async fn tell_unknown_to_producer(&self, to: &Peer<S>) {
        let msg = StageMessage::CancelUp { from: self.self_peer(to.subscription), reason: CancelReason::UnknownSubscription };
        let _ = to.addr.send(msg).await;
    }

    /// Consumer side: perform the `SUBSCRIBE` procedure against `producer`
    /// (§4.2 "Consumer sending SUBSCRIBE"), used both at startup for
    /// `subscribe_to` entries and for runtime `SubscribeTo` requests.
    async fn subscribe_to_producer(&mut self, producer: Addr<S>, opts: SubscriptionOptions) -> Result<SubscriptionRef, crate::error::StageError> {
        opts.validate()?;
        let reference = SubscriptionRef::new();
        let monitor = producer.monitor(self.self_addr.clone(), |monitor_ref, reason| StageMessage::Down { monitor: monitor_ref, reason });
        self.producer_monitors.insert(monitor.monitor_ref, reference);

        let from = self.self_peer(reference);
        match producer.send(StageMessage::Subscribe { from, opts: opts.clone() }).await {
            Ok(()) => {
                self.pending.insert(reference, PendingSub { producer, opts, monitor });
                Ok(reference)
            }
            Err(e) => {
                // Producer address unreachable: the closest analogue to
                // "could not be resolved" in a system without a named
                // registry (§4.2).
                self.producer_monitors.remove(&monitor.monitor_ref);
                monitor.demonitor();
                match opts.cancel {
                    CancelMode::Permanent => Err(e),
                    CancelMode::Temporary => Ok(reference),
                }
            }
        }
    }

    async fn bootstrap(&mut self, subscribe_to: Vec<(Addr<S>, SubscriptionOptions)>) -> Option<ExitReason> {
        for (producer, opts) in subscribe_to {
            if let Err(e) = self.subscribe_to_producer(producer, opts).await {
                return Some(ExitReason::Error(e.to_string()));
            }
        }
        None
    }

    /// Producer side receiving `SUBSCRIBE`.
    async fn on_subscribe(&mut self, from: Peer<S>, opts: SubscriptionOptions) -> Option<ExitReason> {
        if !S::KIND.is_producer() {
            error!("received SUBSCRIBE on a non-producer stage");
            self.tell_unknown_to_consumer(&from).await;
            return None;
        }
        if self.consumers.contains(from.subscription) {
            warn!(subscription = %from.subscription, "duplicated subscription");
            let msg = StageMessage::CancelDown { from: self.self_peer(from.subscription), reason: CancelReason::DuplicatedSubscription };
            let _ = from.addr.send(msg).await;
            return None;
        }

        let monitor = from.addr.monitor(self.self_addr.clone(), |monitor_ref, reason| StageMessage::Down { monitor: monitor_ref, reason });
        self.consumer_monitors.insert(monitor.monitor_ref, from.subscription);
        self.consumers
            .accept(from.subscription, from.clone(), opts.clone(), monitor)
            .expect("duplicated subscription already checked above");

        let ack = StageMessage::Ack { from: self.self_peer(from.subscription) };
        let _ = from.addr.send(ack).await;

        let outcome = self.user.handle_subscribe(PeerRole::Consumer, &opts, from.subscription);
        // The dispatcher always learns about the new consumer so future
        // ASKs route correctly; only the *consumer's* own ACK handling
        // honors automatic-vs-manual (see DESIGN.md).
        let granted = self.dispatcher.as_mut().expect("producer has a dispatcher").subscribe(from.subscription, &opts);
        if let Some(reason) = outcome.stop {
            return Some(reason);
        }
        self.grant_demand(granted).await
    }

    /// Consumer side receiving `ACK`.
    async fn on_ack(&mut self, from: Peer<S>) -> Option<ExitReason> {
        let Some(pending) = self.pending.remove(&from.subscription) else {
            debug!(subscription = %from.subscription, "ACK for unknown/already-settled subscription, ignoring");
            return None;
        };

        let outcome = self.user.handle_subscribe(PeerRole::Producer, &pending.opts, from.subscription);
        if let Some(reason) = outcome.stop {
            self.producer_monitors.remove(&pending.monitor.monitor_ref);
            pending.monitor.demonitor();
            return Some(reason);
        }

        let manual = matches!(outcome.decision, SubscribeDecision::Manual);
        let mut sub = ConsumerSubscription::new(pending.producer.clone(), &pending.opts, manual, pending.monitor);
        sub.acked = true;
        if !manual {
            sub.pending = sub.max_demand;
            let ask = StageMessage::Ask { from: self.self_peer(from.subscription), count: sub.max_demand };
            let _ = pending.producer.send(ask).await;
        }
        self.producers.insert(from.subscription, sub);
        None
    }

    /// Producer side receiving `ASK`.
    async fn on_ask(&mut self, from: Peer<S>, count: usize) -> Option<ExitReason> {
        if !self.consumers.contains(from.subscription) {
            self.tell_unknown_to_consumer(&from).await;
            return None;
        }
        let granted = self.dispatcher.as_mut().expect("producer has a dispatcher").ask(from.subscription, count);
        self.grant_demand(granted).await
    }

    /// Either side tearing down one subscription locally (`cancel/2`) or
    /// reacting to a peer's `CANCEL`/DOWN. `from_peer` addresses whoever
    /// sent the inbound cancel (for peer-initiated causes); `None` for a
    /// purely local cancel, in which case we still notify the peer.
    async fn cancel_as_producer(&mut self, reference: SubscriptionRef, reason: CancelReason, notify_peer: bool) -> Option<ExitReason> {
        let Some(sub) = self.consumers.remove(reference) else { return None };
        sub.monitor.demonitor();
        self.dispatcher.as_mut().expect("producer has a dispatcher").cancel(reference);
        if notify_peer {
            let msg = StageMessage::CancelDown { from: self.self_peer(reference), reason: reason.clone() };
            let _ = sub.consumer.addr.send(msg).await;
        }
        let emit = self.user.handle_cancel(&reason, reference);
        self.apply_emit(emit).await
    }

    async fn cancel_as_consumer(&mut self, reference: SubscriptionRef, reason: CancelReason, notify_peer: bool) -> Option<ExitReason> {
        let Some(sub) = self.producers.remove(reference) else { return None };
        sub.monitor.demonitor();
        if notify_peer {
            let msg = StageMessage::CancelUp { from: self.self_peer(reference), reason: reason.clone() };
            let _ = sub.producer.send(msg).await;
        }
        let emit = self.user.handle_cancel(&reason, reference);
        if let Some(stop) = self.apply_emit(emit).await {
            return Some(stop);
        }
        // §4.2: "if PERMANENT, the consumer then STOPs with the same
        // reason; if TEMPORARY, it continues." Applies to every
        // cancellation cause, not only DOWN.
        if sub.cancel == CancelMode::Permanent {
            return Some(match reason {
                CancelReason::Down(exit) => exit,
                other => ExitReason::ShutdownWith(other.to_string()),
            });
        }
        None
    }

    async fn on_cancel_up(&mut self, from: Peer<S>, reason: CancelReason) -> Option<ExitReason> {
        if !self.consumers.contains(from.subscription) {
            self.tell_unknown_to_consumer(&from).await;
            return None;
        }
        self.cancel_as_producer(from.subscription, CancelReason::Cancel(reason.to_string()), false).await
    }

    async fn on_cancel_down(&mut self, from: Peer<S>, reason: CancelReason) -> Option<ExitReason> {
        if !self.producers.contains(from.subscription) {
            self.tell_unknown_to_producer(&from).await;
            return None;
        }
        self.cancel_as_consumer(from.subscription, CancelReason::Cancel(reason.to_string()), false).await
    }

    async fn on_cancel_local(&mut self, reference: SubscriptionRef, reason: String) -> Option<ExitReason> {
        if self.consumers.contains(reference) {
            return self.cancel_as_producer(reference, CancelReason::Cancel(reason), true).await;
        }
        if self.producers.contains(reference) {
            return self.cancel_as_consumer(reference, CancelReason::Cancel(reason), true).await;
        }
        debug!(subscription = %reference, "local cancel of unknown subscription, ignoring");
        None
    }

    async fn on_down(&mut self, monitor: MonitorRef, reason: ExitReason) -> Option<ExitReason> {
        if let Some(reference) = self.consumer_monitors.remove(&monitor) {
            return self.cancel_as_producer(reference, CancelReason::Down(reason), false).await;
        }
        if let Some(reference) = self.producer_monitors.remove(&monitor) {
            if let Some(pending) = self.pending.remove(&reference) {
                // Pre-ack DOWN (§4.2): the subscription never
                // materialised, so `handle_cancel` is not called.
                return match pending.opts.cancel {
                    CancelMode::Permanent => Some(reason),
                    CancelMode::Temporary => None,
                };
            }
            return self.cancel_as_consumer(reference, CancelReason::Down(reason), false).await;
        }
        None
    }

    // ---- consumer demand engine (§4.3) ---------------------------------

    async fn on_events(&mut self, from: Peer<S>, events: Vec<S::Event>) -> Option<ExitReason> {
        if !S::KIND.is_consumer() {
            error!("received EVENTS on a non-consumer stage");
            self.tell_unknown_to_producer(&from).await;
            return None;
        }
        let Some(sub) = self.producers.get_mut(from.subscription) else {
            // §5: already-in-flight events after a local cancel are
            // discarded silently, not answered with another CANCEL.
            debug!(subscription = %from.subscription, count = events.len(), "events for unknown/cancelled subscription, discarding");
            return None;
        };

        if sub.manual {
            crate::consumer::absorb_delivery(sub, events.len());
            let emit = self.user.handle_events(events, from.subscription);
            return self.apply_emit(emit).await;
        }

        let max_minus_min = sub.max_demand - sub.min_demand;
        let chunks = crate::consumer::split_events(events, max_minus_min);
        for chunk in chunks {
            let Some(sub) = self.producers.get_mut(from.subscription) else {
                // Subscription was cancelled by a prior chunk's callback.
                break;
            };
            crate::consumer::absorb_delivery(sub, chunk.len());
            let emit = self.user.handle_events(chunk, from.subscription);
            if let Some(reason) = self.apply_emit(emit).await {
                return Some(reason);
            }
            let Some(sub) = self.producers.get_mut(from.subscription) else { break };
            if let Some(ask) = crate::consumer::schedule_top_up(sub) {
                let producer = sub.producer.clone();
                let msg = StageMessage::Ask { from: self.self_peer(from.subscription), count: ask };
                let _ = producer.send(msg).await;
            }
        }
        None
    }

    async fn on_ask_manual(&mut self, reference: SubscriptionRef, count: usize) -> Option<ExitReason> {
        let Some(sub) = self.producers.get_mut(reference) else {
            debug!(subscription = %reference, "manual ask on unknown subscription, ignoring");
            return None;
        };
        sub.pending += count;
        let producer = sub.producer.clone();
        let msg = StageMessage::Ask { from: self.self_peer(reference), count };
        let _ = producer.send(msg).await;
        None
    }

    // ---- notifications (§4.6) -----------------------------------------

    async fn on_notification(&mut self, _from: Peer<S>, payload: serde_json::Value) -> Option<ExitReason> {
        self.user.handle_notification(payload);
        None
    }

    async fn on_sync_notify(&mut self, payload: serde_json::Value, reply: ReplyPort<crate::error::Result<()>>) {
        if !S::KIND.is_producer() {
            reply.reply(Err(crate::error::StageError::NotAProducer("sync_notify".into())));
            return;
        }
        let buffer = self.buffer.as_ref().expect("producer has a buffer");
        if buffer.is_empty() {
            let targets = self.dispatcher.as_ref().expect("producer has a dispatcher").notify_targets();
            let mut outgoing = Vec::new();
            for t in targets {
                outgoing.push((t, Outbound::Notification(payload.clone())));
            }
            self.send_outgoing(outgoing).await;
        } else {
            self.buffer.as_mut().expect("producer has a buffer").push_notification(payload);
        }
        reply.reply(Ok(()));
    }

    // ---- dispatch pipeline (§4.4) ---------------------------------------

    async fn send_outgoing(&mut self, outgoing: Vec<(SubscriptionRef, Outbound<S::Event>)>) {
        for (reference, outbound) in outgoing {
            let Some(sub) = self.consumers.get(reference) else { continue };
            let msg = match outbound {
                Outbound::Events(events) => StageMessage::Events { from: self.self_peer(reference), events },
                Outbound::Notification(payload) => StageMessage::Notification { from: self.self_peer(reference), payload },
            };
            let _ = sub.consumer.addr.send(msg).await;
        }
    }

    fn flush_run(&mut self, run: &mut Vec<S::Event>, outgoing: &mut Vec<(SubscriptionRef, Outbound<S::Event>)>) {
        if run.is_empty() {
            return;
        }
        let events = std::mem::take(run);
        let (routed, undispatched) = self.dispatcher.as_mut().expect("producer has a dispatcher").dispatch(events);
        for r in routed {
            outgoing.push((r.subscription, Outbound::Events(r.events)));
        }
        if !undispatched.is_empty() {
            self.buffer.as_mut().expect("producer has a buffer").unshift(undispatched);
        }
    }

    /// New events from a user callback (§4.4 `dispatch_events`).
    async fn dispatch_events(&mut self, events: Vec<S::Event>) {
        if events.is_empty() {
            return;
        }
        if self.consumers.is_empty() {
            self.buffer_events(events).await;
            return;
        }
        let (routed, undispatched) = self.dispatcher.as_mut().expect("producer has a dispatcher").dispatch(events);
        let outgoing = routed.into_iter().map(|r| (r.subscription, Outbound::Events(r.events))).collect();
        self.send_outgoing(outgoing).await;
        if !undispatched.is_empty() {
            self.buffer_events(undispatched).await;
        }
    }

    async fn buffer_events(&mut self, events: Vec<S::Event>) {
        let n = events.len();
        let (outcome, flushed) = self.buffer.as_mut().expect("producer has a buffer").push_events(events);
        if outcome.dropped > 0 {
            warn!(dropped = outcome.dropped, total = n, "buffer overflow: events discarded per keep policy");
        }
        if !flushed.is_empty() {
            let targets = self.dispatcher.as_ref().expect("producer has a dispatcher").notify_targets();
            let outgoing = flushed.into_iter().flat_map(|p| targets.iter().map(move |t| (*t, Outbound::Notification(p.clone())))).collect();
            self.send_outgoing(outgoing).await;
        }
    }

    /// Drain up to `n` events from the buffer and dispatch them in order,
    /// delivering any interleaved notifications at their anchored
    /// position (§4.4, §4.6). Returns how many events were actually
    /// available — the caller routes any shortfall to `handle_demand` or
    /// the bridge.
    async fn drain_buffer_and_dispatch(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let entries = self.buffer.as_mut().expect("producer has a buffer").drain(n);
        let mut satisfied = 0;
        let mut run = Vec::new();
        let mut outgoing = Vec::new();
        for entry in entries {
            match entry {
                Entry::Event(event) => {
                    run.push(event);
                    satisfied += 1;
                }
                Entry::Notification(payload) => {
                    self.flush_run(&mut run, &mut outgoing);
                    let targets = self.dispatcher.as_ref().expect("producer has a dispatcher").notify_targets();
                    for t in targets {
                        outgoing.push((t, Outbound::Notification(payload.clone())));
                    }
                }
            }
        }
        self.flush_run(&mut run, &mut outgoing);
        self.send_outgoing(outgoing).await;
        satisfied
    }

    async fn apply_emit(&mut self, emit: Emit<S::Event>) -> Option<ExitReason> {
        if !emit.events.is_empty() {
            if S::KIND == StageKind::Consumer {
                error!(count = emit.events.len(), "pure consumer callback emitted events; discarding");
            } else {
                self.dispatch_events(emit.events).await;
            }
        }
        emit.stop
    }

    /// Demand freshly granted by a dispatcher callout (§4.4 "Dispatcher
    /// callouts"): drain what the buffer can satisfy, then route any
    /// residual to `handle_demand` (producer) or the bridge (§4.5, PC).
    async fn grant_demand(&mut self, granted: usize) -> Option<ExitReason> {
        if granted == 0 {
            return None;
        }
        let satisfied = self.drain_buffer_and_dispatch(granted).await;
        let residual = granted - satisfied;
        if residual == 0 {
            return None;
        }
        match S::KIND {
            StageKind::Producer => {
                let emit = self.user.handle_demand(residual);
                self.apply_emit(emit).await
            }
            StageKind::ProducerConsumer => {
                let released = self.bridge.as_mut().expect("PC has a bridge").on_downstream_demand(residual);
                for batch in released {
                    let emit = self.user.handle_events(batch.events, batch.producer.subscription);
                    if let Some(reason) = self.apply_emit(emit).await {
                        return Some(reason);
                    }
                }
                None
            }
            StageKind::Consumer => None,
        }
    }

    // ---- producer-consumer bridge (§4.5) -------------------------------

    async fn on_upstream_events(&mut self, from: Peer<S>, events: Vec<S::Event>) -> Option<ExitReason> {
        // Upstream delivery to a PC stage flows through the same demand
        // accounting as a pure consumer (§4.3) before reaching the
        // bridge, which only concerns itself with *downstream* demand.
        if !S::KIND.is_consumer() {
            return None;
        }
        let Some(sub) = self.producers.get_mut(from.subscription) else {
            debug!(subscription = %from.subscription, "events for unknown/cancelled subscription, discarding");
            return None;
        };
        crate::consumer::absorb_delivery(sub, events.len());
        if let Some(ask) = crate::consumer::schedule_top_up(sub) {
            let producer = sub.producer.clone();
            let msg = StageMessage::Ask { from: self.self_peer(from.subscription), count: ask };
            let _ = producer.send(msg).await;
        }

        let bridge = self.bridge.as_mut().expect("PC has a bridge");
        let Some(batch) = bridge.on_upstream_events(events, from.clone()) else { return None };
        let emit = self.user.handle_events(batch.events, from.subscription);
        self.apply_emit(emit).await
    }
}

fn build_dispatcher<S: Stage>(kind: DispatcherKind) -> Box<dyn Dispatcher<S::Event>> {
    match kind {
        DispatcherKind::Demand => Box::new(DemandDispatcher::new()),
        DispatcherKind::Broadcast => Box::new(BroadcastDispatcher::new()),
        DispatcherKind::Partition(n) => Box::new(PartitionDispatcher::new(n, S::partition_key)),
    }
}

/// Route one inbound message through the kernel. Returns `Some(reason)`
/// when the stage must stop.
async fn handle_message<S: Stage>(kernel: &mut Kernel<S>, msg: Msg<S>) -> Option<ExitReason> {
    match msg {
        StageMessage::Subscribe { from, opts } => kernel.on_subscribe(from, opts).await,
        StageMessage::Ask { from, count } => kernel.on_ask(from, count).await,
        StageMessage::CancelUp { from, reason } => kernel.on_cancel_up(from, reason).await,
        StageMessage::Ack { from } => kernel.on_ack(from).await,
        StageMessage::CancelDown { from, reason } => kernel.on_cancel_down(from, reason).await,
        StageMessage::Events { from, events } => {
            if S::KIND == StageKind::ProducerConsumer {
                kernel.on_upstream_events(from, events).await
            } else {
                kernel.on_events(from, events).await
            }
        }
        StageMessage::Notification { from, payload } => kernel.on_notification(from, payload).await,
        StageMessage::Down { monitor, reason } => kernel.on_down(monitor, reason).await,
        StageMessage::Cast(msg) => {
            let emit = kernel.user.handle_cast(msg);
            kernel.apply_emit(emit).await
        }
        StageMessage::Call(msg, reply) => {
            let emit = kernel.user.handle_call(msg, reply);
            kernel.apply_emit(emit).await
        }
        StageMessage::SyncNotify { payload, reply } => {
            kernel.on_sync_notify(payload, reply).await;
            None
        }
        StageMessage::SubscribeTo { producer, opts, reply } => {
            let result = kernel.subscribe_to_producer(producer, opts).await;
            reply.reply(result);
            None
        }
        StageMessage::CancelLocal { reference, reason } => kernel.on_cancel_local(reference, reason).await,
        StageMessage::AskManual { reference, count } => kernel.on_ask_manual(reference, count).await,
        StageMessage::Stop(reason) => Some(reason),
    }
}

/// Spawn a stage's run loop. Used by the `handle` module's
/// `spawn_producer`/`spawn_consumer`/`spawn_producer_consumer`; not
/// exposed directly since it requires constructing `StageMessage`s by
/// hand.
pub(crate) fn spawn<S: Stage>(mut options: StageOptions<S>, user: S) -> (Addr<S>, JoinHandle<ExitReason>) {
    let capacity = options.mailbox_capacity;
    let subscribe_to = std::mem::take(&mut options.subscribe_to);
    let buffer = options.buffer;
    let dispatcher = options.dispatcher;
    runtime::spawn_actor::<Msg<S>, _, _>(capacity, move |self_addr, mut mailbox| async move {
        run(user, buffer, dispatcher, subscribe_to, self_addr, &mut mailbox).await
    })
}

#[tracing::instrument(name = "stage.run", skip_all, fields(kind = %S::KIND))]
async fn run<S: Stage>(
    user: S,
    buffer: BufferConfig,
    dispatcher: DispatcherKind,
    subscribe_to: Vec<(Addr<S>, SubscriptionOptions)>,
    self_addr: Addr<S>,
    mailbox: &mut Mailbox<Msg<S>>,
) -> ExitReason {
    let mut kernel = Kernel::new(user, buffer, dispatcher, self_addr);

    if let Some(reason) = kernel.bootstrap(subscribe_to).await {
        kernel.user.terminate(&reason);
        return reason;
    }

    let exit = loop {
        match mailbox.recv().await {
            None => break ExitReason::Shutdown,
            Some(msg) => {
                if let Some(reason) = handle_message(&mut kernel, msg).await {
                    break reason;
                }
            }
        }
    };

    info!(kind = %S::KIND, reason = %exit, "stage terminating");
    kernel.user.terminate(&exit);
    exit
}
