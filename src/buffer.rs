//! The producer-local event buffer (§3, §4.4): a bounded or unbounded
//! FIFO with a keep policy on overflow, carrying the notification wheel
//! (§4.6) for the bounded case.
//!
//! Grounded on the FIFO-with-O(1)-drop-from-head shape used by
//! `ringmpsc-rs`'s channel implementation (see DESIGN.md), adapted from
//! a lock-free SPSC ring to a plain `VecDeque` — a producer's buffer is
//! only ever touched by its own single-threaded task, so there is no
//! concurrency to buy with atomics here.

use crate::notify::{Entry, Notification, Wheel};
use crate::types::{BufferConfig, BufferKeep};
use std::collections::VecDeque;

/// What happened as a result of pushing events into the buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// How many of the pushed events were dropped outright (keep=FIRST
    /// overflow). Logged by the caller at `warn`.
    pub dropped: usize,
}

enum Storage<E> {
    /// `max_size = None`: notifications ride inline, tagged (§4.6).
    Unbounded { queue: VecDeque<Entry<E>> },
    /// `max_size = Some(n)`: plain event queue plus a side wheel.
    Bounded { queue: VecDeque<E>, wheel: Wheel, head_seq: u64, tail_seq: u64 },
}

/// The producer-local buffer. `E` is the stage's event type.
pub struct EventBuffer<E> {
    storage: Storage<E>,
    config: BufferConfig,
}

impl<E> EventBuffer<E> {
    pub fn new(config: BufferConfig) -> Self {
        let storage = match config.max_size {
            None => Storage::Unbounded { queue: VecDeque::new() },
            Some(_) => Storage::Bounded { queue: VecDeque::new(), wheel: Wheel::new(), head_seq: 0, tail_seq: 0 },
        };
        Self { storage, config }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Number of events currently buffered (`count` in §3; does not
    /// include pending notifications).
    pub fn count(&self) -> usize {
        match &self.storage {
            Storage::Unbounded { queue } => queue.iter().filter(|e| matches!(e, Entry::Event(_))).count(),
            Storage::Bounded { queue, .. } => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Append events per the keep policy (§4.4). Returns how many were
    /// dropped outright, plus (bounded case) any notifications that were
    /// anchored to now-evicted positions and must be surfaced immediately.
    pub fn push_events(&mut self, events: Vec<E>) -> (PushOutcome, Vec<Notification>) {
        match &mut self.storage {
            Storage::Unbounded { queue } => {
                queue.extend(events.into_iter().map(Entry::Event));
                (PushOutcome::default(), Vec::new())
            }
            Storage::Bounded { queue, wheel, head_seq, tail_seq } => {
                let max = self.config.max_size.expect("bounded storage implies max_size");
                match self.config.keep {
                    BufferKeep::First => {
                        let have = queue.len();
                        let room = max.saturating_sub(have);
                        let k = events.len();
                        let accept = room.min(k);
                        let dropped = k - accept;
                        queue.extend(events.into_iter().take(accept));
                        *tail_seq += accept as u64;
                        (PushOutcome { dropped }, Vec::new())
                    }
                    BufferKeep::Last => {
                        let k = events.len();
                        queue.extend(events);
                        *tail_seq += k as u64;
                        let overflow = queue.len().saturating_sub(max);
                        let mut flushed = Vec::new();
                        if overflow > 0 {
                            flushed = wheel.evict_up_to(*head_seq, *head_seq + overflow as u64);
                            for _ in 0..overflow {
                                queue.pop_front();
                            }
                            *head_seq += overflow as u64;
                        }
                        (PushOutcome { dropped: overflow }, flushed)
                    }
                }
            }
        }
    }

    /// Put events back at the head of the queue, preserving their
    /// relative order. Used when a dispatcher callout drained more from
    /// the buffer than it could actually place with a subscriber (§4.4):
    /// the events were already dequeued, so this re-inserts them ahead of
    /// anything enqueued since, rather than losing them. Any wheel
    /// anchors at these positions already fired as part of the same
    /// drain, so only the events themselves need restoring.
    pub fn unshift(&mut self, events: Vec<E>) {
        if events.is_empty() {
            return;
        }
        match &mut self.storage {
            Storage::Unbounded { queue } => {
                for event in events.into_iter().rev() {
                    queue.push_front(Entry::Event(event));
                }
            }
            Storage::Bounded { queue, head_seq, .. } => {
                *head_seq -= events.len() as u64;
                for event in events.into_iter().rev() {
                    queue.push_front(event);
                }
            }
        }
    }

    /// Anchor a notification after everything currently buffered
    /// (unbounded: pushed straight onto the queue; bounded: recorded in
    /// the wheel at the current tail position).
    pub fn push_notification(&mut self, payload: Notification) {
        match &mut self.storage {
            Storage::Unbounded { queue } => queue.push_back(Entry::Notification(payload)),
            Storage::Bounded { wheel, tail_seq, .. } => wheel.anchor(*tail_seq, payload),
        }
    }

    /// Drain up to `n` entries in FIFO order, for dispatch. Each item is
    /// either an event or a notification that must be delivered in this
    /// exact position (§4.6 invariant). Does not count against `n` for
    /// notifications drained from the bounded wheel — a notification
    /// found at a dequeued event's position is emitted alongside it, not
    /// instead of it, so a caller asking for `n` events always gets `n`
    /// events (plus whatever notifications rode along).
    pub fn drain(&mut self, n: usize) -> Vec<Entry<E>> {
        match &mut self.storage {
            Storage::Unbounded { queue } => {
                let mut out = Vec::new();
                let mut taken_events = 0;
                while taken_events < n {
                    match queue.pop_front() {
                        Some(entry @ Entry::Event(_)) => {
                            taken_events += 1;
                            out.push(entry);
                        }
                        Some(entry @ Entry::Notification(_)) => out.push(entry),
                        None => break,
                    }
                }
                out
            }
            Storage::Bounded { queue, wheel, head_seq, .. } => {
                let mut out = Vec::new();
                let take = n.min(queue.len());
                for _ in 0..take {
                    for note in wheel.take_at(*head_seq) {
                        out.push(Entry::Notification(note));
                    }
                    let event = queue.pop_front().expect("take <= queue.len()");
                    out.push(Entry::Event(event));
                    *head_seq += 1;
                }
                // A notification anchored at the current tail (nothing
                // buffered after it yet) would otherwise never be
                // reached by the per-event loop above, since it only
                // fires `take_at` right before popping an event at that
                // position. Once the queue is fully drained, `head_seq`
                // equals the tail it was anchored at, so flush it now.
                if queue.is_empty() {
                    for note in wheel.take_at(*head_seq) {
                        out.push(Entry::Notification(note));
                    }
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferConfig;

    fn events_only(entries: Vec<Entry<i32>>) -> Vec<i32> {
        entries
            .into_iter()
            .filter_map(|e| match e {
                Entry::Event(v) => Some(v),
                Entry::Notification(_) => None,
            })
            .collect()
    }

    #[test]
    fn unbounded_accepts_everything() {
        let mut buf = EventBuffer::new(BufferConfig::unbounded());
        let (outcome, flushed) = buf.push_events(vec![1, 2, 3]);
        assert_eq!(outcome.dropped, 0);
        assert!(flushed.is_empty());
        assert_eq!(buf.count(), 3);
    }

    #[test]
    fn keep_last_evicts_oldest_and_reports_drop_count() {
        // Scenario 2 (§8): buffer_size=3, keep=LAST, dispatch [1,2,3,4,5].
        let mut buf = EventBuffer::new(BufferConfig::bounded(3, BufferKeep::Last));
        let (outcome, flushed) = buf.push_events(vec![1, 2, 3, 4, 5]);
        assert_eq!(outcome.dropped, 2);
        assert!(flushed.is_empty());
        assert_eq!(buf.count(), 3);

        let drained = buf.drain(10);
        assert_eq!(events_only(drained), vec![3, 4, 5]);
    }

    #[test]
    fn keep_first_drops_new_and_preserves_prefix() {
        // Scenario 3 (§8): same inputs, keep=FIRST -> buffer holds [1,2,3].
        let mut buf = EventBuffer::new(BufferConfig::bounded(3, BufferKeep::First));
        let (outcome, _) = buf.push_events(vec![1, 2, 3, 4, 5]);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(buf.count(), 3);

        let drained = buf.drain(10);
        assert_eq!(events_only(drained), vec![1, 2, 3]);
    }

    #[test]
    fn keep_first_accumulates_across_multiple_pushes() {
        let mut buf = EventBuffer::new(BufferConfig::bounded(3, BufferKeep::First));
        assert_eq!(buf.push_events(vec![1, 2]).0.dropped, 0);
        assert_eq!(buf.push_events(vec![3, 4, 5]).0.dropped, 2);
        assert_eq!(events_only(buf.drain(10)), vec![1, 2, 3]);
    }

    #[test]
    fn bounded_buffer_never_exceeds_max_size() {
        let mut buf = EventBuffer::new(BufferConfig::bounded(3, BufferKeep::Last));
        for batch in [vec![1, 2], vec![3, 4], vec![5]] {
            buf.push_events(batch);
            assert!(buf.count() <= 3);
        }
    }

    #[test]
    fn drain_returns_events_in_fifo_order() {
        let mut buf = EventBuffer::new(BufferConfig::unbounded());
        buf.push_events(vec![1, 2, 3]);
        assert_eq!(events_only(buf.drain(2)), vec![1, 2]);
        assert_eq!(events_only(buf.drain(10)), vec![3]);
    }

    #[test]
    fn drain_stops_at_available_count() {
        let mut buf = EventBuffer::new(BufferConfig::bounded(10, BufferKeep::Last));
        buf.push_events(vec![1, 2]);
        let drained = buf.drain(10);
        assert_eq!(events_only(drained), vec![1, 2]);
        assert_eq!(buf.count(), 0);
    }

    #[test]
    fn bounded_notification_interleaves_between_events() {
        // Invariant 6 (§8): notification enqueued after k=2 events, before
        // the 3rd, is observed strictly between those events by dequeue.
        let mut buf = EventBuffer::new(BufferConfig::bounded(10, BufferKeep::Last));
        buf.push_events(vec![10, 20]);
        buf.push_notification(serde_json::json!("marker"));
        buf.push_events(vec![30]);

        let drained = buf.drain(10);
        assert_eq!(drained.len(), 4);
        match &drained[0] {
            Entry::Event(v) => assert_eq!(*v, 10),
            _ => panic!("expected event"),
        }
        match &drained[1] {
            Entry::Event(v) => assert_eq!(*v, 20),
            _ => panic!("expected event"),
        }
        match &drained[2] {
            Entry::Notification(payload) => assert_eq!(payload, &serde_json::json!("marker")),
            _ => panic!("expected notification strictly between event 2 and 3"),
        }
        match &drained[3] {
            Entry::Event(v) => assert_eq!(*v, 30),
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn unbounded_notification_interleaves_between_events() {
        let mut buf = EventBuffer::new(BufferConfig::unbounded());
        buf.push_events(vec!["a", "b"]);
        buf.push_notification(serde_json::json!("x"));
        buf.push_events(vec!["c"]);

        let drained = buf.drain(10);
        let positions: Vec<&str> = drained
            .iter()
            .map(|e| match e {
                Entry::Event(_) => "event",
                Entry::Notification(_) => "notification",
            })
            .collect();
        assert_eq!(positions, vec!["event", "event", "notification", "event"]);
    }

    #[test]
    fn last_keep_eviction_surfaces_anchored_notifications_immediately() {
        // An anchor on a position that gets evicted before it is ever
        // reached by drain() must still be delivered, not lost.
        let mut buf = EventBuffer::new(BufferConfig::bounded(2, BufferKeep::Last));
        buf.push_events(vec![1, 2]);
        buf.push_notification(serde_json::json!("will-be-evicted"));
        // This push evicts position 0 (value 1) to make room -- but the
        // notification was anchored at position 2 (after both events),
        // so push a third value past it to force eviction of the
        // anchor position itself: evict position range covers [0,1).
        let (outcome, flushed) = buf.push_events(vec![3]);
        assert_eq!(outcome.dropped, 1);
        // Anchor at position 2 survives (still ahead of eviction range).
        assert!(flushed.is_empty());

        // Now evict past position 2 as well.
        let (_, flushed2) = buf.push_events(vec![4, 5]);
        assert_eq!(flushed2, vec![serde_json::json!("will-be-evicted")]);
    }

    #[test]
    fn bounded_trailing_notification_is_delivered_after_last_event() {
        // Scenario 4 (§8): a notification anchored right after the last
        // currently-buffered event, with no further event ever pushed
        // behind it, must still surface once drain() empties the queue --
        // not get stranded in the wheel forever.
        let mut buf = EventBuffer::new(BufferConfig::bounded(10, BufferKeep::Last));
        buf.push_events(vec![1, 2, 3]);
        buf.push_notification(serde_json::json!("marker-x"));

        let drained = buf.drain(10);
        assert_eq!(drained.len(), 4);
        assert_eq!(events_only(vec![drained[0].clone(), drained[1].clone(), drained[2].clone()]), vec![1, 2, 3]);
        match &drained[3] {
            Entry::Notification(payload) => assert_eq!(payload, &serde_json::json!("marker-x")),
            _ => panic!("expected trailing notification after last event"),
        }
    }

    #[test]
    fn bounded_trailing_notification_not_flushed_while_events_remain() {
        // The flip side: if the drain call doesn't reach the end of the
        // queue, a tail-anchored notification must not fire early.
        let mut buf = EventBuffer::new(BufferConfig::bounded(10, BufferKeep::Last));
        buf.push_events(vec![1, 2, 3]);
        buf.push_notification(serde_json::json!("marker-x"));

        let drained = buf.drain(2);
        assert_eq!(events_only(drained), vec![1, 2]);

        let rest = buf.drain(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(events_only(vec![rest[0].clone()]), vec![3]);
        match &rest[1] {
            Entry::Notification(payload) => assert_eq!(payload, &serde_json::json!("marker-x")),
            _ => panic!("expected trailing notification after last event"),
        }
    }
}
