//! Core data model: stage roles, cancellation policy, and the option
//! structs validated at `init`/`subscribe` time.
//!
//! Mirrors the shape of a provider-agnostic options surface: plain
//! structs with `Default` impls matching the documented defaults,
//! validated once at the call site rather than threaded through as
//! loose parameters.

use crate::error::{Result, StageError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three roles a stage can play. Chosen once by `init` and immutable
/// for the lifetime of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Producer,
    Consumer,
    ProducerConsumer,
}

impl StageKind {
    pub fn is_producer(self) -> bool {
        matches!(self, StageKind::Producer | StageKind::ProducerConsumer)
    }

    pub fn is_consumer(self) -> bool {
        matches!(self, StageKind::Consumer | StageKind::ProducerConsumer)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Producer => "producer",
            StageKind::Consumer => "consumer",
            StageKind::ProducerConsumer => "producer_consumer",
        };
        f.write_str(s)
    }
}

/// Whether losing a producer terminates the subscribed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancelMode {
    /// Losing the producer (CANCEL or DOWN) terminates the consumer with
    /// the same reason.
    #[default]
    Permanent,
    /// Losing the producer calls `handle_cancel` but the consumer
    /// continues running.
    Temporary,
}

/// Why a subscription ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CancelReason {
    /// The peer (or the stage itself) cancelled deliberately.
    Cancel(String),
    /// The peer's process ended; carries its exit reason.
    Down(ExitReason),
    /// The `ref` in an inbound protocol message was never known, or was
    /// already cancelled.
    UnknownSubscription,
    /// A `SUBSCRIBE` arrived on a `ref` the producer already has on file.
    DuplicatedSubscription,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancel(r) => write!(f, "cancel: {r}"),
            CancelReason::Down(r) => write!(f, "down: {r}"),
            CancelReason::UnknownSubscription => f.write_str("unknown_subscription"),
            CancelReason::DuplicatedSubscription => f.write_str("duplicated_subscription"),
        }
    }
}

/// How a stage task's run loop ended. Broadcast to monitors as a DOWN
/// message, and propagated to a PERMANENT consumer's own exit reason
/// when its producer dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Normal,
    Shutdown,
    ShutdownWith(String),
    Error(String),
}

impl ExitReason {
    /// "Clean" exits (§7) are not escalated by a supervising layer; this
    /// crate has no supervisor, but callers use this to decide whether to
    /// log at `info` or `error`.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitReason::Normal | ExitReason::Shutdown | ExitReason::ShutdownWith(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Shutdown => f.write_str("shutdown"),
            ExitReason::ShutdownWith(r) => write!(f, "shutdown({r})"),
            ExitReason::Error(r) => write!(f, "error({r})"),
        }
    }
}

/// Buffer overflow policy (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferKeep {
    /// Drop newly-arriving events once the buffer is full; the surviving
    /// events are the earliest-enqueued ("keep the first ones in").
    First,
    /// Evict the oldest buffered events to make room; the surviving
    /// events are the most-recent ("keep the last ones in").
    #[default]
    Last,
}

/// Producer-side buffer sizing. `None` means unbounded (the
/// producer-consumer default).
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_size: Option<usize>,
    pub keep: BufferKeep,
}

impl BufferConfig {
    pub fn bounded(max_size: usize, keep: BufferKeep) -> Self {
        Self { max_size: Some(max_size), keep }
    }

    pub fn unbounded() -> Self {
        Self { max_size: None, keep: BufferKeep::Last }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_size.is_none()
    }
}

impl Default for BufferConfig {
    /// Producer default: `max=10000, keep=Last` (§6).
    fn default() -> Self {
        Self::bounded(10_000, BufferKeep::Last)
    }
}

/// Options negotiated on `SUBSCRIBE` (§6). Validated once, on the
/// consumer side, before the message is even sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub cancel: CancelMode,
    pub min_demand: usize,
    pub max_demand: usize,
    /// Opaque extra keys forwarded to `handle_subscribe`/the dispatcher,
    /// untouched by the kernel.
    pub extra: serde_json::Value,
}

impl SubscriptionOptions {
    pub fn new(min_demand: usize, max_demand: usize) -> Result<Self> {
        let opts = Self {
            cancel: CancelMode::default(),
            min_demand,
            max_demand,
            extra: serde_json::Value::Null,
        };
        opts.validate()?;
        Ok(opts)
    }

    pub fn with_cancel(mut self, cancel: CancelMode) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    /// `min_demand ∈ [0, max_demand − 1]`, `max_demand ∈ [1, ∞]` (§6).
    pub fn validate(&self) -> Result<()> {
        if self.max_demand == 0 {
            return Err(StageError::BadOpts("max_demand must be >= 1".into()));
        }
        if self.min_demand >= self.max_demand {
            return Err(StageError::BadOpts(format!(
                "min_demand ({}) must be < max_demand ({})",
                self.min_demand, self.max_demand
            )));
        }
        Ok(())
    }
}

impl Default for SubscriptionOptions {
    /// `max_demand=1000`, `min_demand=max_demand/2`, `cancel=Permanent` (§6).
    fn default() -> Self {
        Self {
            cancel: CancelMode::Permanent,
            min_demand: 500,
            max_demand: 1000,
            extra: serde_json::Value::Null,
        }
    }
}

/// Init-time options for a producer.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub buffer: BufferConfig,
    /// `None` selects the built-in demand-fair dispatcher.
    pub dispatcher: DispatcherKind,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self { buffer: BufferConfig::default(), dispatcher: DispatcherKind::Demand }
    }
}

/// Init-time options for a producer-consumer. Same buffer knobs as a
/// producer, but the default buffer is unbounded (§3).
#[derive(Debug, Clone)]
pub struct ProducerConsumerOptions {
    pub buffer: BufferConfig,
    pub dispatcher: DispatcherKind,
}

impl Default for ProducerConsumerOptions {
    fn default() -> Self {
        Self { buffer: BufferConfig::unbounded(), dispatcher: DispatcherKind::Demand }
    }
}

/// Which built-in dispatcher a producer/producer-consumer uses. This
/// rewrite ships the three the spec's design notes (§9) call for; a
/// fully pluggable registry of third-party dispatchers is out of scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatcherKind {
    #[default]
    Demand,
    Broadcast,
    /// Partition dispatcher with a fixed number of partitions; events are
    /// routed by a caller-supplied hash/key, see `dispatcher::partition`.
    Partition(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_options_defaults() {
        let opts = SubscriptionOptions::default();
        assert_eq!(opts.max_demand, 1000);
        assert_eq!(opts.min_demand, 500);
        assert_eq!(opts.cancel, CancelMode::Permanent);
    }

    #[test]
    fn subscription_options_rejects_bad_range() {
        assert!(SubscriptionOptions::new(10, 10).is_err());
        assert!(SubscriptionOptions::new(11, 10).is_err());
        assert!(SubscriptionOptions::new(0, 0).is_err());
    }

    #[test]
    fn subscription_options_accepts_min_zero() {
        assert!(SubscriptionOptions::new(0, 1).is_ok());
    }

    #[test]
    fn buffer_config_defaults_bounded_last() {
        let cfg = BufferConfig::default();
        assert_eq!(cfg.max_size, Some(10_000));
        assert_eq!(cfg.keep, BufferKeep::Last);
        assert!(!cfg.is_unbounded());
    }

    #[test]
    fn producer_consumer_options_default_unbounded() {
        let opts = ProducerConsumerOptions::default();
        assert!(opts.buffer.is_unbounded());
    }

    #[test]
    fn exit_reason_clean_classification() {
        assert!(ExitReason::Normal.is_clean());
        assert!(ExitReason::Shutdown.is_clean());
        assert!(ExitReason::ShutdownWith("restart".into()).is_clean());
        assert!(!ExitReason::Error("boom".into()).is_clean());
    }

    #[test]
    fn stage_kind_role_predicates() {
        assert!(StageKind::Producer.is_producer());
        assert!(!StageKind::Producer.is_consumer());
        assert!(StageKind::Consumer.is_consumer());
        assert!(!StageKind::Consumer.is_producer());
        assert!(StageKind::ProducerConsumer.is_producer());
        assert!(StageKind::ProducerConsumer.is_consumer());
    }
}
