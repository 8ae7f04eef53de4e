//! Minimal ambient actor substrate.
//!
//! Rust has no BEAM-style process model, so this module provides exactly
//! the pieces the rest of the crate needs to stand in for "the host
//! process/mailbox runtime": a mailbox address (`ActorRef<M>`), a spawn
//! helper that runs a stage's loop as a `tokio::task`, a monitor
//! subsystem that delivers an asynchronous DOWN on peer termination, and
//! a synchronous call/reply helper built on a `oneshot` channel plus a
//! caller-side timeout. It is deliberately not a general actor framework
//! — no supervision trees, no named registry, no remote transport.
//!
//! Grounded on the `ActorRef<M>` / `spawn_actor` shape used by
//! `stanstork-stratum`'s actor runtime (see DESIGN.md).

use crate::error::{Result, StageError};
use crate::types::ExitReason;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier. Used for peer ids, subscription refs, and
/// monitor refs — the spec calls these all "globally unique" within the
/// scope they're compared in, which a monotonic counter satisfies without
/// pulling in a UUID for every tiny handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    pub fn new() -> Self {
        Id(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type SubscriptionRef = Id;
pub type MonitorRef = Id;

/// A send-only, cloneable handle to a stage's mailbox. Peers only ever
/// hold this — never a reference into the other stage's state — which is
/// what makes the producer/consumer graph a graph of weak references
/// (§9 design notes).
pub struct ActorRef<M> {
    id: Id,
    tx: mpsc::Sender<M>,
    exit_tx: broadcast::Sender<ExitReason>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self { id: self.id, tx: self.tx.clone(), exit_tx: self.exit_tx.clone() }
    }
}

impl<M> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({})", self.id)
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Deliver a message, waiting if the mailbox is full.
    pub async fn send(&self, msg: M) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| StageError::Closed(self.id.to_string()))
    }

    /// Deliver a message without waiting; fails only if the mailbox is
    /// gone or instantaneously full. Used from contexts that must not
    /// `.await` (e.g. a monitor forwarding task reacting to a DOWN).
    pub fn try_send(&self, msg: M) -> Result<()> {
        self.tx.try_send(msg).map_err(|_| StageError::Closed(self.id.to_string()))
    }

    /// Watch this actor's exit. `wrap` turns the eventual `ExitReason`
    /// (plus the fresh `MonitorRef`) into a message the watcher's own
    /// mailbox understands, then it is delivered there — exactly
    /// mirroring BEAM's asynchronous DOWN delivery.
    pub fn monitor<W: Send + 'static>(
        &self,
        watcher: ActorRef<W>,
        wrap: impl Fn(MonitorRef, ExitReason) -> W + Send + 'static,
    ) -> MonitorHandle {
        let monitor_ref = Id::new();
        let mut rx = self.exit_tx.subscribe();
        let task = tokio::spawn(async move {
            if let Ok(reason) = rx.recv().await {
                let _ = watcher.try_send(wrap(monitor_ref, reason));
            }
        });
        MonitorHandle { monitor_ref, task: Some(task) }
    }
}

/// A live `monitor` registration. Dropping or calling `demonitor` stops
/// watching; it never affects the monitored peer.
pub struct MonitorHandle {
    pub monitor_ref: MonitorRef,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn demonitor(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }

    /// A handle that watches nothing. Used for subscriptions fabricated
    /// without monitoring a real peer (e.g. `cancel=Temporary` subscribe
    /// to an unresolved address, §4.2) and in unit tests that only need
    /// a `MonitorHandle`-shaped placeholder.
    pub fn inert() -> Self {
        Self { monitor_ref: Id::new(), task: None }
    }
}

/// The receiving half of a stage's mailbox.
pub struct Mailbox<M> {
    rx: mpsc::Receiver<M>,
    exit_tx: broadcast::Sender<ExitReason>,
}

impl<M: Send + 'static> Mailbox<M> {
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// Create a fresh mailbox and its address, without spawning anything.
/// Exposed mainly for tests that want to drive a stage's loop directly.
pub fn channel<M: Send + 'static>(capacity: usize) -> (ActorRef<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    // Exit is a one-shot-per-stage event; a handful of monitors at once
    // is the realistic ceiling, and `broadcast` drops this to a no-op
    // allocation if nobody ever subscribes.
    let (exit_tx, _) = broadcast::channel(16);
    let id = Id::new();
    (ActorRef { id, tx, exit_tx: exit_tx.clone() }, Mailbox { rx, exit_tx })
}

/// Spawn a stage's run loop as its own task. `body` owns the mailbox for
/// the lifetime of the stage and returns the `ExitReason` once its loop
/// ends (after `terminate` has run) — that reason is then broadcast to
/// every monitor exactly once.
pub fn spawn_actor<M, F, Fut>(capacity: usize, body: F) -> (ActorRef<M>, JoinHandle<ExitReason>)
where
    M: Send + 'static,
    F: FnOnce(ActorRef<M>, Mailbox<M>) -> Fut,
    Fut: Future<Output = ExitReason> + Send + 'static,
{
    let (addr, mailbox) = channel(capacity);
    let exit_tx = mailbox.exit_tx.clone();
    let self_addr = addr.clone();
    let handle = tokio::spawn(async move {
        let reason = body(self_addr, mailbox).await;
        let _ = exit_tx.send(reason.clone());
        reason
    });
    (addr, handle)
}

/// A one-shot reply slot embedded in a request message. The callee holds
/// it, the caller waits on the other half via [`call`].
pub struct ReplyPort<R>(oneshot::Sender<R>);

impl<R> ReplyPort<R> {
    pub fn reply(self, value: R) {
        // The caller may have already timed out and dropped its receiver;
        // that is not this stage's problem (§5: "expiry causes the
        // *caller* to fail — the stage itself is unaffected").
        let _ = self.0.send(value);
    }
}

/// Perform a synchronous call: build a request carrying a fresh
/// [`ReplyPort`], send it, and wait up to `timeout` for the reply.
pub async fn call<M, R>(
    addr: &ActorRef<M>,
    make_msg: impl FnOnce(ReplyPort<R>) -> M,
    timeout: Duration,
) -> Result<R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let msg = make_msg(ReplyPort(tx));
    addr.send(msg).await?;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(StageError::Closed(addr.id().to_string())),
        Err(_) => Err(StageError::Timeout(format!("no reply from {} within {:?}", addr.id(), timeout))),
    }
}
