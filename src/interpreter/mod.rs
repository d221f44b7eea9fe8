//! Interpreter façade.
//!
//! The worker loop is generic over [`Interpreter`], the minimum surface an
//! embedded interpreter must expose: create, process, complete, evaluate,
//! and paired stream captures. The worker process is the only place a
//! backend is ever constructed; nothing else in the crate holds interpreter
//! state.

mod embedded;

pub use embedded::EmbeddedInterpreter;

use crate::error::Result;

/// Which standard stream a capture applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// The embedded-interpreter surface consumed by the worker loop.
///
/// Captures are stacked: `begin_capture` pushes, `end_capture` pops the most
/// recent capture and returns everything the interpreter emitted on that
/// stream while it was open.
pub trait Interpreter: Send {
    /// Compile and run a code fragment. Returns whether compilation
    /// succeeded; diagnostics go to the captured stderr.
    ///
    /// Interpreter state is cumulative across calls.
    fn process(&mut self, code: &str) -> Result<bool>;

    /// Complete the identifier at a 1-based line and column.
    fn code_complete(&mut self, code: &str, line: u32, col: u32) -> Result<Vec<String>>;

    /// Evaluate an expression to a 64-bit integer.
    fn evaluate(&mut self, code: &str) -> Result<i64>;

    /// Start capturing one stream.
    fn begin_capture(&mut self, stream: CaptureStream);

    /// Stop the most recent capture and return its contents.
    fn end_capture(&mut self) -> String;
}
