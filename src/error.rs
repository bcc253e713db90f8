/*
 * Thread Core Errors
 *
 * Every fallible lifecycle and TLS operation returns one of these kinds.
 * `exit` and the sleep paths are excluded: a failure there leaves the
 * caller without a stack to return on, so it is treated as fatal.
 */

use thiserror::Error;

/// Errors surfaced by the thread and synchronization core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// A required argument was malformed: bad CPU index, bad stack size,
    /// out-of-range TLS key.
    #[error("invalid argument")]
    InvalidArgument,

    /// An allocation failed or a fixed table (TLS keys, scheduler hooks)
    /// is full.
    #[error("out of resources")]
    ResourceExhausted,

    /// The operation is not legal in the target's current state:
    /// destroying a live thread, joining a non-child, touching a freed
    /// TLS key.
    #[error("invalid state for operation")]
    InvalidState,

    /// The scheduler refused to accept the thread.
    #[error("scheduler rejected thread")]
    SchedulerRejected,

    /// Reserved for timed variants layered above the core; the core
    /// itself never returns this.
    #[error("timed out")]
    TimedOut,
}

/// Shorthand used throughout the crate.
pub type Result<T> = core::result::Result<T, ThreadError>;
