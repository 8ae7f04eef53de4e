//! The producer-consumer bridge (§4.5): reconciles downstream demand
//! against upstream batches for a stage acting as both roles at once.
//!
//! Mirrors the spec's own two-shape `events` field exactly: either an
//! outstanding-downstream-demand integer (no upstream events queued) or
//! a FIFO of upstream batches awaiting demand. A producer-consumer never
//! synthesizes unasked-for demand toward upstream, yet absorbs
//! arbitrarily large upstream batches by queueing what it can't place.

use std::collections::VecDeque;

/// One batch of events received from an upstream producer, not yet run
/// through this stage's `handle_events`.
#[derive(Debug, Clone)]
pub struct UpstreamBatch<E, P> {
    pub events: Vec<E>,
    pub producer: P,
}

impl<E, P> UpstreamBatch<E, P> {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

enum EventsField<E, P> {
    /// Downstream demand not yet matched to any upstream batch.
    Demand(usize),
    /// Upstream batches waiting for downstream demand, oldest first.
    Queue(VecDeque<UpstreamBatch<E, P>>),
}

/// The bridge state for one producer-consumer stage.
pub struct Bridge<E, P> {
    events: EventsField<E, P>,
}

impl<E, P> Default for Bridge<E, P> {
    fn default() -> Self {
        Self { events: EventsField::Demand(0) }
    }
}

impl<E, P: Clone> Bridge<E, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_demand(&self) -> usize {
        match &self.events {
            EventsField::Demand(d) => *d,
            EventsField::Queue(_) => 0,
        }
    }

    pub fn pending_batches(&self) -> usize {
        match &self.events {
            EventsField::Demand(_) => 0,
            EventsField::Queue(q) => q.len(),
        }
    }

    pub fn pending_upstream_events(&self) -> usize {
        match &self.events {
            EventsField::Demand(_) => 0,
            EventsField::Queue(q) => q.iter().map(UpstreamBatch::len).sum(),
        }
    }

    /// Downstream asked for `count` more events (§4.4's dispatcher
    /// callout, routed here for a PC stage instead of `handle_demand`).
    /// Returns the upstream batches now released to run through
    /// `handle_events`, in order.
    pub fn on_downstream_demand(&mut self, count: usize) -> Vec<UpstreamBatch<E, P>> {
        if count == 0 {
            return Vec::new();
        }
        match &mut self.events {
            EventsField::Demand(d) => {
                *d += count;
                Vec::new()
            }
            EventsField::Queue(queue) => {
                let mut remaining = count;
                let mut released = Vec::new();
                while remaining > 0 {
                    let Some(mut batch) = queue.pop_front() else { break };
                    if batch.len() <= remaining {
                        remaining -= batch.len();
                        released.push(batch);
                    } else {
                        let tail_events = batch.events.split_off(remaining);
                        released.push(UpstreamBatch { events: batch.events, producer: batch.producer.clone() });
                        queue.push_front(UpstreamBatch { events: tail_events, producer: batch.producer });
                        remaining = 0;
                    }
                }
                if queue.is_empty() {
                    self.events = EventsField::Demand(remaining);
                }
                released
            }
        }
    }

    /// An upstream producer delivered `events`. Returns the batch (or
    /// part of it) to run through `handle_events` immediately; any
    /// remainder is queued for the next `on_downstream_demand` call.
    pub fn on_upstream_events(&mut self, events: Vec<E>, producer: P) -> Option<UpstreamBatch<E, P>> {
        if events.is_empty() {
            return None;
        }
        match &mut self.events {
            EventsField::Demand(d) if *d > 0 => {
                let take = (*d).min(events.len());
                let mut events = events;
                let rest = events.split_off(take);
                *d -= take;
                let head = UpstreamBatch { events, producer: producer.clone() };
                if !rest.is_empty() {
                    let mut queue = VecDeque::new();
                    queue.push_back(UpstreamBatch { events: rest, producer });
                    self.events = EventsField::Queue(queue);
                }
                Some(head)
            }
            EventsField::Demand(_) => {
                let mut queue = VecDeque::new();
                queue.push_back(UpstreamBatch { events, producer });
                self.events = EventsField::Queue(queue);
                None
            }
            EventsField::Queue(queue) => {
                queue.push_back(UpstreamBatch { events, producer });
                None
            }
        }
    }
}
