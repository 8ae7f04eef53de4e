//! Consumer demand engine (§4.3): tracks outstanding demand per
//! subscription and decides when to top it back up.
//!
//! There is no close analogue for this split/refill algorithm elsewhere
//! in the crate's ancestry, so the shape here follows §4.3's own
//! vocabulary (`pending`, `min_demand`, `max_demand`) directly.

use crate::subscription::ConsumerSubscription;
use tracing::warn;

/// What a consumer should do after receiving a batch of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopUp {
    /// How many more to ask the producer for, right now. Zero means "not
    /// yet — still above `min_demand`".
    pub ask: usize,
}

/// Decide whether a freshly-updated `pending` count needs topping up.
/// Called after `pending` has already been decremented by the delivered
/// batch's length and (for AUTO consumers) after `handle_events` runs.
///
/// Per §4.3: once `pending` drops to or below `min_demand`, ask for
/// enough to bring it back to `max_demand`.
pub fn top_up(pending: usize, min_demand: usize, max_demand: usize) -> TopUp {
    if pending <= min_demand {
        TopUp { ask: max_demand - pending }
    } else {
        TopUp { ask: 0 }
    }
}

/// Record that `count` events were just delivered against this
/// subscription, clamping to the amount actually outstanding rather
/// than letting `pending` underflow — a misbehaving or adversarial
/// producer sending more than it was asked for must not panic the
/// consumer (§11 open-question resolution: clamp and log, don't stop).
pub fn absorb_delivery<P>(sub: &mut ConsumerSubscription<P>, count: usize) {
    let absorbed = count.min(sub.pending);
    if absorbed < count {
        warn!(
            excess = count - absorbed,
            pending = sub.pending,
            "producer delivered more events than were outstanding; clamping"
        );
    }
    sub.pending -= absorbed;
}

/// Apply an auto top-up to `sub.pending` and return how much to `ASK`
/// for, or `None` for MANUAL subscriptions (§4.3: manual consumers never
/// self-schedule demand).
pub fn schedule_top_up<P>(sub: &mut ConsumerSubscription<P>) -> Option<usize> {
    if sub.manual {
        return None;
    }
    let decision = top_up(sub.pending, sub.min_demand, sub.max_demand);
    if decision.ask > 0 {
        sub.pending += decision.ask;
        Some(decision.ask)
    } else {
        None
    }
}

/// Split an inbound event batch into sub-batches of at most `max − min`
/// (§4.3 step 1), so the user callback never sees a batch larger than
/// one refill window. A batch of exactly that size or smaller passes
/// through untouched.
pub fn split_events<E>(events: Vec<E>, max_minus_min: usize) -> Vec<Vec<E>> {
    if max_minus_min == 0 || events.len() <= max_minus_min {
        return vec![events];
    }
    let mut out = Vec::new();
    let mut rest = events;
    while rest.len() > max_minus_min {
        let tail = rest.split_off(max_minus_min);
        out.push(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Split a desired ask of `total` into at-most-`max_demand`-sized
/// batches the way a producer's own outbound `ASK` batching would (§4.3:
/// "a consumer never issues a single ask larger than its own
/// max_demand"). Only used by the bridge / producer-consumer path,
/// which may accumulate asks above `max_demand` before flushing.
pub fn split_ask(total: usize, max_demand: usize) -> Vec<usize> {
    if max_demand == 0 || total == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut remaining = total;
    while remaining > 0 {
        let batch = remaining.min(max_demand);
        out.push(batch);
        remaining -= batch;
    }
    out
}
