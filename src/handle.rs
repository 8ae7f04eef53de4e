//! The public facade (§5, §6): spawning a [`Stage`] and driving it from
//! outside its own task. Grounded on the teacher's `EventBus::publish`
//! span-per-call convention — every public operation here opens its own
//! `tracing` span rather than relying on the kernel's internal one.

use crate::error::Result;
use crate::protocol::StageMessage;
use crate::runtime;
use crate::runtime::SubscriptionRef;
use crate::stage::{self, Addr, Stage, StageOptions};
use crate::types::{ExitReason, SubscriptionOptions};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Default timeout for a synchronous [`StageHandle::call`] or
/// [`StageHandle::sync_notify`] (§5: "the caller picks a timeout; 5s if
/// unspecified").
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to a running stage. Cloning it is cheap (it is just a mailbox
/// address plus the task's join handle is held separately) and every
/// clone can drive the stage independently — exactly the "weak
/// reference" relationship the spec's design notes call for (§9).
pub struct StageHandle<S: Stage> {
    addr: Addr<S>,
}

impl<S: Stage> Clone for StageHandle<S> {
    fn clone(&self) -> Self {
        Self { addr: self.addr.clone() }
    }
}

impl<S: Stage> StageHandle<S> {
    fn new(addr: Addr<S>) -> Self {
        Self { addr }
    }

    /// The raw address, for embedding in another stage's state (e.g. to
    /// list as a `subscribe_to` target, or to pass to another stage's
    /// `init`).
    pub fn addr(&self) -> Addr<S> {
        self.addr.clone()
    }

    /// `subscribe/3`: ask this (consumer) stage to subscribe to
    /// `producer` at runtime, beyond whatever it already subscribed to at
    /// init via `StageOptions::with_subscribe_to` (§4.2).
    #[instrument(skip_all)]
    pub async fn subscribe(&self, producer: &StageHandle<S>, opts: SubscriptionOptions) -> Result<SubscriptionRef> {
        runtime::call(
            &self.addr,
            |reply| StageMessage::SubscribeTo { producer: producer.addr.clone(), opts, reply },
            DEFAULT_CALL_TIMEOUT,
        )
        .await?
    }

    /// `cancel/2`: tear down one subscription this stage holds, on
    /// either side (§4.2).
    pub async fn cancel(&self, reference: SubscriptionRef, reason: impl Into<String>) -> Result<()> {
        self.addr.send(StageMessage::CancelLocal { reference, reason: reason.into() }).await
    }

    /// `ask/3`: explicitly request more events on a MANUAL subscription
    /// (§4.3). A no-op (silently ignored by the kernel) on an AUTOMATIC
    /// one or an unknown ref.
    pub async fn ask(&self, reference: SubscriptionRef, count: usize) -> Result<()> {
        self.addr.send(StageMessage::AskManual { reference, count }).await
    }

    /// Fire-and-forget custom message (§4.1 `handle_cast`).
    pub async fn cast(&self, msg: S::Message) -> Result<()> {
        self.addr.send(StageMessage::Cast(msg)).await
    }

    /// Synchronous request/reply (§5 `call/3`), with an explicit timeout.
    #[instrument(skip_all)]
    pub async fn call_timeout(&self, msg: S::Message, timeout: Duration) -> Result<S::Reply> {
        runtime::call(&self.addr, |reply| StageMessage::Call(msg, reply), timeout).await
    }

    /// [`Self::call_timeout`] with [`DEFAULT_CALL_TIMEOUT`].
    pub async fn call(&self, msg: S::Message) -> Result<S::Reply> {
        self.call_timeout(msg, DEFAULT_CALL_TIMEOUT).await
    }

    /// `sync_notify/3` (§4.6): deliver a notification directly, bypassing
    /// any subscription — producer stages only.
    #[instrument(skip_all)]
    pub async fn sync_notify(&self, payload: serde_json::Value) -> Result<()> {
        runtime::call(&self.addr, |reply| StageMessage::SyncNotify { payload, reply }, DEFAULT_CALL_TIMEOUT).await?
    }

    /// Ask the stage to stop with a clean reason. Does not wait for the
    /// task to actually finish — join the handle returned by the spawn
    /// function for that.
    pub async fn stop(&self) -> Result<()> {
        self.addr.send(StageMessage::Stop(ExitReason::Shutdown)).await
    }

    /// Watch this stage's exit the way any other peer would (§10's
    /// ambient monitor subsystem), wrapping the eventual DOWN into a
    /// message of the watcher's own choosing.
    pub fn monitor<W: Send + 'static>(
        &self,
        watcher: runtime::ActorRef<W>,
        wrap: impl Fn(runtime::MonitorRef, ExitReason) -> W + Send + 'static,
    ) -> runtime::MonitorHandle {
        self.addr.monitor(watcher, wrap)
    }
}

/// Spawn a producer stage (§3).
pub fn spawn_producer<S: Stage>(user: S, options: StageOptions<S>) -> (StageHandle<S>, JoinHandle<ExitReason>) {
    assert_producer_kind::<S>();
    let (addr, task) = stage::spawn(options, user);
    (StageHandle::new(addr), task)
}

/// Spawn a consumer stage (§3).
pub fn spawn_consumer<S: Stage>(user: S, options: StageOptions<S>) -> (StageHandle<S>, JoinHandle<ExitReason>) {
    assert_consumer_kind::<S>();
    let (addr, task) = stage::spawn(options, user);
    (StageHandle::new(addr), task)
}

/// Spawn a producer-consumer stage (§3).
pub fn spawn_producer_consumer<S: Stage>(user: S, options: StageOptions<S>) -> (StageHandle<S>, JoinHandle<ExitReason>) {
    assert_producer_consumer_kind::<S>();
    let (addr, task) = stage::spawn(options, user);
    (StageHandle::new(addr), task)
}

fn assert_producer_kind<S: Stage>() {
    assert_eq!(S::KIND, crate::types::StageKind::Producer, "spawn_producer used with a non-producer Stage impl");
}

fn assert_consumer_kind<S: Stage>() {
    assert_eq!(S::KIND, crate::types::StageKind::Consumer, "spawn_consumer used with a non-consumer Stage impl");
}

fn assert_producer_consumer_kind<S: Stage>() {
    assert_eq!(
        S::KIND,
        crate::types::StageKind::ProducerConsumer,
        "spawn_producer_consumer used with a non-producer-consumer Stage impl"
    );
}
