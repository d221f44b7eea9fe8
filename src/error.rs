//! Error types for Outpost.

use thiserror::Error;

/// Result type alias using Outpost's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Outpost operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared segment creation, mapping or validation failed.
    #[error("shared segment error: {0}")]
    Segment(String),

    /// The worker binary could not be spawned, or died during startup.
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    /// A request was issued before `initialize()` or after teardown.
    #[error("host not initialized")]
    NotInitialized,

    /// Host-side request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The worker process exited while a request was in flight.
    #[error("worker exited: {0}")]
    WorkerExited(String),

    /// No response arrived within the per-request deadline.
    #[error("no worker response within {0:?}")]
    ResponseTimeout(std::time::Duration),

    /// The worker reported a runtime failure while evaluating.
    #[error("evaluation failed: {0}")]
    Runtime(String),

    /// The worker reported a system-level failure.
    #[error("worker error: {0}")]
    Worker(String),

    /// Interpreter backend failure inside the worker.
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
