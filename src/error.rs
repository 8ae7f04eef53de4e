//! Error types for the stage runtime

use thiserror::Error;

/// Errors that can occur while driving a stage or a subscription
#[derive(Debug, Error)]
pub enum StageError {
    /// `init` rejected its options, or a running stage was given an invalid
    /// subscribe option (e.g. `min_demand >= max_demand`)
    #[error("bad options: {0}")]
    BadOpts(String),

    /// A consumer with `cancel = Permanent` tried to subscribe to a producer
    /// address that could not be resolved
    #[error("no such process: {0}")]
    NoProc(String),

    /// A synchronous call (`call`, `sync_notify`, `sync_subscribe`) did not
    /// get a reply before its timeout elapsed. The callee is unaffected.
    #[error("timed out waiting for a reply: {0}")]
    Timeout(String),

    /// A callback requested a shutdown with a reason outside the "clean"
    /// set (`Normal`/`Shutdown`), or produced a value the kernel does not
    /// know how to route
    #[error("bad return from {callback}: {detail}")]
    BadReturn { callback: &'static str, detail: String },

    /// The target stage's mailbox is gone (it already stopped)
    #[error("stage is no longer running: {0}")]
    Closed(String),

    /// `sync_notify` was called on a stage that is not a producer
    #[error("not a producer: {0}")]
    NotAProducer(String),
}

/// Result type alias for stage operations
pub type Result<T> = std::result::Result<T, StageError>;
