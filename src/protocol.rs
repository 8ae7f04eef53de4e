//! The wire protocol (§6): every message a stage's mailbox can receive,
//! producer-directed or consumer-directed, plus the control messages
//! (`Down`, `Cast`/`Call`, `Stop`) needed to drive the kernel in §10's
//! actor substrate.
//!
//! Kept as a plain, trait-free enum (parameterized directly over the
//! event type `E`, the custom-message type `M`, and its reply type `R`)
//! so it stays a leaf module: the subscription manager, consumer engine,
//! and stage kernel all build on top of it, never the other way around.

use crate::runtime::{ActorRef, MonitorRef, ReplyPort, SubscriptionRef};
use crate::types::{CancelReason, ExitReason, SubscriptionOptions};

/// The `from=(peer_addr, subscription_ref)` half of every protocol
/// message (§6). Cloned freely — it is just an address and a ref.
pub struct PeerRef<E, M, R> {
    pub addr: ActorRef<StageMessage<E, M, R>>,
    pub subscription: SubscriptionRef,
}

impl<E, M, R> Clone for PeerRef<E, M, R> {
    fn clone(&self) -> Self {
        Self { addr: self.addr.clone(), subscription: self.subscription }
    }
}

impl<E, M, R> std::fmt::Debug for PeerRef<E, M, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerRef({}, sub={})", self.addr.id(), self.subscription)
    }
}

/// Everything a stage's mailbox can receive.
pub enum StageMessage<E, M, R> {
    // --- Producer-directed (GEN_PRODUCER, §6) ---
    /// consumer → producer. Consumer MUST have monitored the producer
    /// before sending this.
    Subscribe { from: PeerRef<E, M, R>, opts: SubscriptionOptions },
    /// consumer → producer. `count > 0`.
    Ask { from: PeerRef<E, M, R>, count: usize },
    /// consumer → producer.
    CancelUp { from: PeerRef<E, M, R>, reason: CancelReason },

    // --- Consumer-directed (GEN_CONSUMER, §6) ---
    /// producer → consumer.
    Ack { from: PeerRef<E, M, R> },
    /// producer → consumer.
    CancelDown { from: PeerRef<E, M, R>, reason: CancelReason },
    /// producer → consumer. `events.len() >= 1`.
    Events { from: PeerRef<E, M, R>, events: Vec<E> },
    /// producer → consumer, delivered in-band with events (§4.6).
    Notification { from: PeerRef<E, M, R>, payload: serde_json::Value },

    // --- Control (§10, this crate's ambient actor substrate) ---
    /// Delivered by a monitor forwarding task when a watched peer exits.
    Down { monitor: MonitorRef, reason: ExitReason },
    /// Fire-and-forget custom message (`handle_cast`).
    Cast(M),
    /// Request/reply custom message (`handle_call`).
    Call(M, ReplyPort<R>),
    /// `sync_notify`: deliver a notification directly, bypassing a
    /// subscription (producer only; §4.6).
    SyncNotify { payload: serde_json::Value, reply: ReplyPort<crate::error::Result<()>> },
    /// Dynamic `subscribe/3`: a consumer asks its own kernel to perform
    /// the SUBSCRIBE handshake against `producer` at runtime, rather than
    /// only at init via `subscribe_to` options (§4.2, §6).
    SubscribeTo {
        producer: ActorRef<StageMessage<E, M, R>>,
        opts: SubscriptionOptions,
        reply: ReplyPort<crate::error::Result<SubscriptionRef>>,
    },
    /// `cancel/2`: tear down one subscription this stage holds, on either
    /// side, notifying the peer.
    CancelLocal { reference: SubscriptionRef, reason: String },
    /// `ask/3` on a MANUAL subscription: the user callback explicitly
    /// asking for more (§4.3).
    AskManual { reference: SubscriptionRef, count: usize },
    /// Ask the stage to stop with a given reason.
    Stop(ExitReason),
}

impl<E, M, R> std::fmt::Debug for StageMessage<E, M, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageMessage::Subscribe { from, .. } => write!(f, "Subscribe({from:?})"),
            StageMessage::Ask { from, count } => write!(f, "Ask({from:?}, {count})"),
            StageMessage::CancelUp { from, reason } => write!(f, "CancelUp({from:?}, {reason})"),
            StageMessage::Ack { from } => write!(f, "Ack({from:?})"),
            StageMessage::CancelDown { from, reason } => write!(f, "CancelDown({from:?}, {reason})"),
            StageMessage::Events { from, events } => write!(f, "Events({from:?}, n={})", events.len()),
            StageMessage::Notification { from, .. } => write!(f, "Notification({from:?})"),
            StageMessage::Down { monitor, reason } => write!(f, "Down({monitor}, {reason})"),
            StageMessage::Cast(_) => f.write_str("Cast(..)"),
            StageMessage::Call(..) => f.write_str("Call(..)"),
            StageMessage::SyncNotify { .. } => f.write_str("SyncNotify(..)"),
            StageMessage::SubscribeTo { .. } => f.write_str("SubscribeTo(..)"),
            StageMessage::CancelLocal { reference, reason } => write!(f, "CancelLocal({reference}, {reason})"),
            StageMessage::AskManual { reference, count } => write!(f, "AskManual({reference}, {count})"),
            StageMessage::Stop(reason) => write!(f, "Stop({reason})"),
        }
    }
}
