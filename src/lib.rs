//! # stagepipe
//!
//! A demand-driven staged pipeline runtime: producers, consumers, and
//! producer-consumers exchange event batches under explicit back-pressure,
//! so a slow consumer throttles the producer feeding it rather than
//! being flooded.
//!
//! ## Overview
//!
//! Every stage is one of three roles (producer, consumer, or both at
//! once), implemented by filling in the [`Stage`] trait. A consumer only
//! ever receives as many events as it has asked for; a producer only
//! ever sends events once asked. Subscriptions are the unit of
//! back-pressure: each one tracks outstanding demand independently, so a
//! single producer fans out to many consumers at their own individual
//! pace (see [`dispatcher`] for the built-in fan-out strategies).
//!
//! ## Quick Start
//!
//! ```rust
//! use stagepipe::{spawn_consumer, spawn_producer, Emit, PeerRole, Stage, StageOptions, SubscribeOutcome, SubscriptionOptions, SubscriptionRef};
//! use stagepipe::types::StageKind;
//!
//! struct Counter { next: i32 }
//!
//! impl Stage for Counter {
//!     type Event = i32;
//!     type Message = ();
//!     type Reply = ();
//!     const KIND: StageKind = StageKind::Producer;
//!
//!     fn handle_demand(&mut self, demand: usize) -> Emit<i32> {
//!         let events: Vec<i32> = (0..demand as i32).map(|i| self.next + i).collect();
//!         self.next += demand as i32;
//!         Emit::events(events)
//!     }
//! }
//!
//! struct Printer;
//!
//! impl Stage for Printer {
//!     type Event = i32;
//!     type Message = ();
//!     type Reply = ();
//!     const KIND: StageKind = StageKind::Consumer;
//!
//!     fn handle_events(&mut self, events: Vec<i32>, _from: SubscriptionRef) -> Emit<i32> {
//!         for e in events {
//!             println!("{e}");
//!         }
//!         Emit::none()
//!     }
//!
//!     fn handle_subscribe(&mut self, _role: PeerRole, _opts: &SubscriptionOptions, _from: SubscriptionRef) -> SubscribeOutcome {
//!         SubscribeOutcome::automatic()
//!     }
//! }
//!
//! # async fn example() {
//! let (producer, _producer_task) = spawn_producer(Counter { next: 0 }, StageOptions::producer());
//! let consumer_opts = StageOptions::<Printer>::consumer()
//!     .with_subscribe_to(producer.addr(), SubscriptionOptions::new(50, 100).unwrap());
//! let (_consumer, _consumer_task) = spawn_consumer(Printer, consumer_opts);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Stage`] — the callback contract every producer/consumer/
//!   producer-consumer implements
//! - [`StageHandle`] — the public handle returned by `spawn_*`; every
//!   runtime operation (`subscribe`, `ask`, `cancel`, `call`, `cast`,
//!   `sync_notify`, `stop`) goes through it
//! - [`dispatcher`] — pluggable fan-out strategy for a producer's
//!   subscribers (demand-fair, broadcast, partition)
//! - [`buffer`] — the producer-local event queue and its overflow policy
//! - [`runtime`] — the ambient actor substrate (mailboxes, monitors,
//!   synchronous call/reply) everything else is built on

pub mod bridge;
pub mod buffer;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod notify;
pub mod protocol;
pub mod runtime;
pub mod stage;
pub mod subscription;
pub mod types;

pub use error::{Result, StageError};
pub use handle::{spawn_consumer, spawn_producer, spawn_producer_consumer, StageHandle, DEFAULT_CALL_TIMEOUT};
pub use runtime::{ActorRef, Id, MonitorHandle, MonitorRef, SubscriptionRef};
pub use stage::{Emit, PeerRole, Stage, StageOptions, SubscribeDecision, SubscribeOutcome};
pub use types::{
    BufferConfig, BufferKeep, CancelMode, CancelReason, DispatcherKind, ExitReason, ProducerConsumerOptions,
    ProducerOptions, StageKind, SubscriptionOptions,
};
