//! Cancellation and crash-propagation scenarios (§8 scenario 5, §8
//! invariant 7, §8 invariant 8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stagepipe::types::{CancelMode, CancelReason, ExitReason, StageKind};
use stagepipe::{spawn_consumer, spawn_producer, Emit, PeerRole, Stage, StageOptions, SubscribeOutcome, SubscriptionOptions, SubscriptionRef};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct Crasher;
impl Stage for Crasher {
    type Event = i32;
    type Message = String;
    type Reply = ();
    const KIND: StageKind = StageKind::Producer;

    fn handle_cast(&mut self, reason: String) -> Emit<i32> {
        Emit::stop(ExitReason::Error(reason))
    }
}

struct Watcher {
    cancels: mpsc::UnboundedSender<String>,
}
impl Stage for Watcher {
    type Event = i32;
    type Message = String;
    type Reply = ();
    const KIND: StageKind = StageKind::Consumer;

    fn handle_cancel(&mut self, reason: &CancelReason, _from: SubscriptionRef) -> Emit<i32> {
        let _ = self.cancels.send(reason.to_string());
        Emit::none()
    }

    fn handle_subscribe(&mut self, _role: PeerRole, _opts: &SubscriptionOptions, _from: SubscriptionRef) -> SubscribeOutcome {
        SubscribeOutcome::automatic()
    }

    fn handle_call(&mut self, _msg: String, reply: stagepipe::runtime::ReplyPort<()>) -> Emit<i32> {
        reply.reply(());
        Emit::none()
    }
}

/// Scenario 5 (§8), PERMANENT branch: a `cancel=Permanent` consumer
/// subscribes to a producer that later crashes with reason `boom`; the
/// consumer terminates with that same reason.
#[tokio::test]
async fn permanent_consumer_terminates_with_producers_crash_reason() {
    let (producer, _p_task) = spawn_producer(Crasher, StageOptions::producer());

    let (tx, _rx) = mpsc::unbounded_channel();
    let opts = StageOptions::<Watcher>::consumer()
        .with_subscribe_to(producer.addr(), SubscriptionOptions::new(1, 10).unwrap().with_cancel(CancelMode::Permanent));
    let (_consumer, c_task) = spawn_consumer(Watcher { cancels: tx }, opts);

    // Give the subscription handshake time to complete before crashing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.cast("boom".to_string()).await.unwrap();

    let exit = timeout(RECV_TIMEOUT, c_task).await.expect("consumer did not exit in time").expect("task panicked");
    assert_eq!(exit, ExitReason::Error("boom".to_string()));
}

/// Scenario 5 (§8), TEMPORARY branch: the same crash instead calls
/// `handle_cancel({Down, boom})` and the consumer keeps running.
#[tokio::test]
async fn temporary_consumer_survives_producers_crash() {
    let (producer, _p_task) = spawn_producer(Crasher, StageOptions::producer());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = StageOptions::<Watcher>::consumer()
        .with_subscribe_to(producer.addr(), SubscriptionOptions::new(1, 10).unwrap().with_cancel(CancelMode::Temporary));
    let (consumer, _c_task) = spawn_consumer(Watcher { cancels: tx }, opts);

    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.cast("boom".to_string()).await.unwrap();

    let reason = timeout(RECV_TIMEOUT, rx.recv()).await.expect("handle_cancel not invoked in time").expect("channel closed");
    assert_eq!(reason, "down: error(boom)");

    // Still alive: a call placed after the crash still gets answered.
    consumer.call("ping".to_string()).await.unwrap();
}

/// Invariant 7 (§8): cancelling the same subscription twice invokes
/// `handle_cancel` at most once -- the second `cancel` targets a `ref`
/// the producer no longer has on file and is a silent no-op.
#[tokio::test]
async fn cancelling_twice_invokes_handle_cancel_once() {
    struct CountingProducer;
    impl Stage for CountingProducer {
        type Event = i32;
        type Message = ();
        type Reply = ();
        const KIND: StageKind = StageKind::Producer;
    }

    struct CountingConsumer {
        cancels: Arc<AtomicUsize>,
        acked: mpsc::UnboundedSender<SubscriptionRef>,
    }
    impl Stage for CountingConsumer {
        type Event = i32;
        type Message = ();
        type Reply = ();
        const KIND: StageKind = StageKind::Consumer;

        fn handle_cancel(&mut self, _reason: &CancelReason, _from: SubscriptionRef) -> Emit<i32> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Emit::none()
        }

        fn handle_subscribe(&mut self, _role: PeerRole, _opts: &SubscriptionOptions, from: SubscriptionRef) -> SubscribeOutcome {
            let _ = self.acked.send(from);
            SubscribeOutcome::automatic()
        }
    }

    let (producer, _p_task) = spawn_producer(CountingProducer, StageOptions::producer());
    let cancels = Arc::new(AtomicUsize::new(0));
    let (acked_tx, mut acked_rx) = mpsc::unbounded_channel();

    let opts = StageOptions::<CountingConsumer>::consumer()
        .with_subscribe_to(producer.addr(), SubscriptionOptions::new(1, 10).unwrap().with_cancel(CancelMode::Temporary));
    let (consumer, _c_task) = spawn_consumer(CountingConsumer { cancels: cancels.clone(), acked: acked_tx }, opts);

    let reference = timeout(RECV_TIMEOUT, acked_rx.recv()).await.expect("subscribe handshake timed out").expect("channel closed");

    consumer.cancel(reference, "done").await.unwrap();
    consumer.cancel(reference, "done again").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cancels.load(Ordering::SeqCst), 1, "handle_cancel must fire exactly once per subscription");
}
