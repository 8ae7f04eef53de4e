//! The notification buffer / wheel (§4.6) — the one true leaf module:
//! everything else in the dispatch path depends on it, it depends on
//! nothing else in this crate.
//!
//! Two storage strategies, chosen by whether the owning buffer is
//! bounded:
//!
//! - **Unbounded buffer**: a notification is just another queue entry,
//!   tagged so it can be told apart from an event — ordering is
//!   intrinsic to the queue, no bookkeeping needed (see [`Entry`]).
//! - **Bounded buffer**: a notification is anchored to the logical
//!   position it was enqueued at (the number of events enqueued so far)
//!   and held in [`Wheel`] until the dequeue cursor reaches that
//!   position, at which point it is emitted *before* the next event.
//!
//! `Wheel` keys its map by the absolute monotonic position rather than
//! `position % max_size`; since an anchor can only ever be reached while
//! its event is still buffered (eviction flushes it immediately, see
//! [`Wheel::evict_up_to`]), the live key set is never wider than
//! `max_size` entries — the same bound a literal circular array would
//! give, without the wraparound-collision bookkeeping.

use std::collections::HashMap;

/// An out-of-band message carried in-order with events.
pub type Notification = serde_json::Value;

/// An unbounded buffer's queue entries: events and notifications
/// interleaved in arrival order.
#[derive(Debug, Clone)]
pub enum Entry<E> {
    Event(E),
    Notification(Notification),
}

/// The bounded-buffer notification wheel.
#[derive(Debug, Default)]
pub struct Wheel {
    pending: HashMap<u64, Vec<Notification>>,
}

impl Wheel {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    /// Anchor a notification at `position` (the number of events enqueued
    /// so far, i.e. "right after the last currently-buffered event").
    pub fn anchor(&mut self, position: u64, payload: Notification) {
        self.pending.entry(position).or_default().push(payload);
    }

    /// Called by the buffer right before it dequeues the event at
    /// `position`. Returns any notifications anchored there, in order,
    /// to be emitted first.
    pub fn take_at(&mut self, position: u64) -> Vec<Notification> {
        self.pending.remove(&position).unwrap_or_default()
    }

    /// Called when LAST-keep eviction drops the events occupying
    /// `[from, to)`. Any notification anchored in that range did not get
    /// a chance to be reached by `take_at` — it must be surfaced now,
    /// in position order, rather than silently lost.
    pub fn evict_up_to(&mut self, from: u64, to: u64) -> Vec<Notification> {
        let mut positions: Vec<u64> = self.pending.keys().copied().filter(|p| *p >= from && *p < to).collect();
        positions.sort_unstable();
        let mut out = Vec::new();
        for pos in positions {
            if let Some(mut batch) = self.pending.remove(&pos) {
                out.append(&mut batch);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_notification_is_returned_at_its_position() {
        let mut wheel = Wheel::new();
        wheel.anchor(3, serde_json::json!("hello"));
        assert!(wheel.take_at(0).is_empty());
        assert!(wheel.take_at(2).is_empty());
        assert_eq!(wheel.take_at(3), vec![serde_json::json!("hello")]);
        // Consumed once.
        assert!(wheel.take_at(3).is_empty());
    }

    #[test]
    fn multiple_notifications_can_share_a_position() {
        let mut wheel = Wheel::new();
        wheel.anchor(1, serde_json::json!("a"));
        wheel.anchor(1, serde_json::json!("b"));
        assert_eq!(wheel.take_at(1), vec![serde_json::json!("a"), serde_json::json!("b")]);
    }

    #[test]
    fn eviction_surfaces_notifications_in_the_dropped_range() {
        let mut wheel = Wheel::new();
        wheel.anchor(0, serde_json::json!("evicted-1"));
        wheel.anchor(1, serde_json::json!("evicted-2"));
        wheel.anchor(5, serde_json::json!("survives"));

        let flushed = wheel.evict_up_to(0, 2);
        assert_eq!(flushed, vec![serde_json::json!("evicted-1"), serde_json::json!("evicted-2")]);

        // The surviving one is untouched and still reachable normally.
        assert_eq!(wheel.take_at(5), vec![serde_json::json!("survives")]);
    }

    #[test]
    fn eviction_of_empty_range_is_a_no_op() {
        let mut wheel = Wheel::new();
        wheel.anchor(10, serde_json::json!("x"));
        assert!(wheel.evict_up_to(0, 5).is_empty());
        assert_eq!(wheel.take_at(10), vec![serde_json::json!("x")]);
    }
}
