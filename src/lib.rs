//! # Outpost
//!
//! An out-of-process interpreter bridge: the host process drives an
//! embedded interpreter living in a separate worker process, over a
//! fixed-layout shared-memory mailbox.
//!
//! The interpreter is too stateful and too failure-prone to trust inside
//! the host's address space; a crash, heap corruption or leak stays inside
//! the worker, and the host recovers by tearing the worker down and
//! re-initializing.
//!
//! ## Architecture
//!
//! - [`mailbox::Mailbox`]: the single-slot rendezvous record shared by the
//!   two processes (request/response flags, typed payload slots, bounded
//!   byte buffers)
//! - [`host::HostController`]: creates the segment, spawns and supervises
//!   the worker, serializes requests with a per-request deadline
//! - [`worker::Worker`]: attaches the segment, owns the interpreter, polls
//!   for requests and publishes responses
//! - [`interpreter::Interpreter`]: the façade seam an embedded interpreter
//!   implements
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use outpost::prelude::*;
//!
//! let mut host = HostController::new(HostConfig::default());
//! host.initialize()?;
//!
//! let outcome = host.process_code("int x = 40;")?;
//! assert!(outcome.compiled);
//!
//! let answer = host.evaluate("x + 2")?;
//! assert_eq!(answer, 42);
//!
//! host.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod host;
pub mod interpreter;
pub mod mailbox;
pub mod segment;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::host::{HostConfig, HostController, ProcessOutcome};
    pub use crate::interpreter::{CaptureStream, Interpreter};
    pub use crate::mailbox::{Mailbox, RequestKind, ResponseStatus};
    pub use crate::worker::{Worker, WorkerConfig};
}

pub use error::{Error, Result};
