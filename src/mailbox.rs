//! Fixed-layout shared-memory mailbox connecting the host and the worker.
//!
//! The mailbox is a single `#[repr(C)]` record living inside a shared
//! segment. It is a one-slot rendezvous: the host publishes a request by
//! flipping [`request_ready`], the worker publishes the response by flipping
//! [`response_ready`]. Each direction has exactly one producer, so no locks
//! are needed; all cross-process visibility is carried by the two flags
//! (release stores, acquire loads).
//!
//! Buffer lengths are authoritative; the trailing NUL kept by every setter
//! is cosmetic.
//!
//! [`request_ready`]: Mailbox::post_request
//! [`response_ready`]: Mailbox::publish_response

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};

/// Capacity of the request code buffer.
pub const MAX_CODE_SIZE: usize = 16 * 1024;
/// Capacity of the response output buffer.
pub const MAX_OUTPUT_SIZE: usize = 16 * 1024;
/// Capacity of the response error buffer.
pub const MAX_ERROR_SIZE: usize = 8 * 1024;
/// Capacity of the newline-joined completions buffer.
pub const MAX_COMPLETION_SIZE: usize = 8 * 1024;

/// Kind of request submitted by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// No request pending.
    None = 0,
    /// Compile and run a code fragment.
    ProcessCode = 1,
    /// Code completion at a cursor position.
    CodeComplete = 2,
    /// Evaluate an expression to a 64-bit integer.
    Evaluate = 3,
    /// Ask the worker to exit its loop.
    Shutdown = 4,
}

impl RequestKind {
    /// Decode a raw value read from shared memory.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::ProcessCode),
            2 => Some(Self::CodeComplete),
            3 => Some(Self::Evaluate),
            4 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Outcome status published by the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseStatus {
    /// No response published.
    None = 0,
    /// The request completed successfully.
    Success = 1,
    /// The fragment failed to compile; stderr carries the diagnostics.
    CompilationError = 2,
    /// Evaluation failed at runtime; the error buffer carries the message.
    RuntimeError = 3,
    /// The worker itself failed; the error buffer carries the message.
    SystemError = 4,
}

impl ResponseStatus {
    /// Decode a raw value read from shared memory.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Success),
            2 => Some(Self::CompilationError),
            3 => Some(Self::RuntimeError),
            4 => Some(Self::SystemError),
            _ => None,
        }
    }
}

/// A length-tracked byte area inside the mailbox.
///
/// The bytes live in an `UnsafeCell` because both processes map the record
/// writable; exclusive access per phase is guaranteed by the flag protocol,
/// not by the type system.
#[repr(C)]
struct ByteArea<const N: usize> {
    len: AtomicU32,
    bytes: UnsafeCell<[u8; N]>,
}

impl<const N: usize> ByteArea<N> {
    /// Copy `data` in, truncated to `N - 1` bytes, and store the length.
    ///
    /// The byte after the payload is always zero.
    fn write(&self, data: &[u8]) {
        let n = data.len().min(N - 1);
        // SAFETY: the caller owns the current phase of the flag protocol, so
        // no other process reads or writes this area concurrently.
        unsafe {
            let bytes = &mut *self.bytes.get();
            bytes[..n].copy_from_slice(&data[..n]);
            bytes[n] = 0;
        }
        self.len.store(n as u32, Ordering::Relaxed);
    }

    /// Copy out exactly `len` bytes.
    fn read(&self) -> Vec<u8> {
        let n = (self.len.load(Ordering::Relaxed) as usize).min(N - 1);
        // SAFETY: see `write`; the publishing flag's release/acquire pair
        // makes the payload visible before the reader gets here.
        unsafe { (&(*self.bytes.get()))[..n].to_vec() }
    }

    fn clear(&self) {
        self.len.store(0, Ordering::Relaxed);
        // SAFETY: reset is only called while the caller holds the phase.
        unsafe {
            (*self.bytes.get()).fill(0);
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }
}

/// The shared mailbox record.
///
/// One per host/worker pair, placed at offset 0 of the shared segment.
/// Payload fields deliberately avoid external types so the layout stays a
/// plain `#[repr(C)]` contract between the two binaries.
#[repr(C)]
pub struct Mailbox {
    request_ready: AtomicBool,
    response_ready: AtomicBool,
    request_kind: AtomicU32,
    response_status: AtomicU32,
    cursor_pos: AtomicI32,
    compilation_result: AtomicBool,
    evaluation_result: AtomicI64,
    code: ByteArea<MAX_CODE_SIZE>,
    output: ByteArea<MAX_OUTPUT_SIZE>,
    error: ByteArea<MAX_ERROR_SIZE>,
    completions: ByteArea<MAX_COMPLETION_SIZE>,
}

// The record must fit one conservative shared-memory segment.
const _: () = assert!(std::mem::size_of::<Mailbox>() <= 64 * 1024);

// SAFETY: interior bytes are only touched by the process that owns the
// current phase of the flag protocol; flags and lengths are atomics.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Total size of the record in bytes.
    pub const SIZE: usize = std::mem::size_of::<Mailbox>();

    /// Whether a mapping of `available` bytes can hold the record.
    pub fn fits(available: usize) -> bool {
        available >= Self::SIZE
    }

    /// Zero every length, buffer, flag, enum and result field.
    ///
    /// The host calls this immediately before each request write; the worker
    /// calls it exactly once, right after mapping the segment.
    pub fn reset(&self) {
        self.request_ready.store(false, Ordering::Relaxed);
        self.response_ready.store(false, Ordering::Relaxed);
        self.request_kind
            .store(RequestKind::None as u32, Ordering::Relaxed);
        self.response_status
            .store(ResponseStatus::None as u32, Ordering::Relaxed);
        self.cursor_pos.store(0, Ordering::Relaxed);
        self.compilation_result.store(false, Ordering::Relaxed);
        self.evaluation_result.store(0, Ordering::Relaxed);
        self.code.clear();
        self.output.clear();
        self.error.clear();
        self.completions.clear();
    }

    /// Store the request kind and flip `request_ready` with release order.
    ///
    /// Every payload write must happen before this call.
    pub fn post_request(&self, kind: RequestKind) {
        self.request_kind.store(kind as u32, Ordering::Relaxed);
        self.request_ready.store(true, Ordering::Release);
    }

    /// Acquire-load of the request flag (worker side).
    pub fn request_pending(&self) -> bool {
        self.request_ready.load(Ordering::Acquire)
    }

    /// Store the status, clear the request flag, then flip `response_ready`.
    ///
    /// The request flag must drop before the response flag rises, otherwise
    /// the host's next cycle can observe a stale request.
    pub fn publish_response(&self, status: ResponseStatus) {
        self.response_status.store(status as u32, Ordering::Relaxed);
        self.request_ready.store(false, Ordering::Relaxed);
        self.response_ready.store(true, Ordering::Release);
    }

    /// Acquire-load of the response flag (host side).
    pub fn response_pending(&self) -> bool {
        self.response_ready.load(Ordering::Acquire)
    }

    /// The pending request kind, if the raw value is in range.
    pub fn request_kind(&self) -> Option<RequestKind> {
        RequestKind::from_raw(self.request_kind.load(Ordering::Relaxed))
    }

    /// The published response status, if the raw value is in range.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        ResponseStatus::from_raw(self.response_status.load(Ordering::Relaxed))
    }

    /// Store the source fragment, truncated to the buffer capacity.
    pub fn set_code(&self, code: &str) {
        self.code.write(code.as_bytes());
    }

    /// Copy of the source fragment.
    pub fn code(&self) -> String {
        String::from_utf8_lossy(&self.code.read()).into_owned()
    }

    /// Length of the stored source fragment.
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Store the completion cursor (0-based byte index into the code).
    pub fn set_cursor(&self, cursor: i32) {
        self.cursor_pos.store(cursor, Ordering::Relaxed);
    }

    /// The completion cursor.
    pub fn cursor(&self) -> i32 {
        self.cursor_pos.load(Ordering::Relaxed)
    }

    /// Store the captured stdout blob.
    pub fn set_output(&self, output: &str) {
        self.output.write(output.as_bytes());
    }

    /// Copy of the captured stdout blob.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.read()).into_owned()
    }

    /// Store the captured stderr / error message blob.
    pub fn set_error(&self, error: &str) {
        self.error.write(error.as_bytes());
    }

    /// Copy of the error blob.
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.error.read()).into_owned()
    }

    /// Store the compile outcome of a `ProcessCode` request.
    pub fn set_compilation_result(&self, compiled: bool) {
        self.compilation_result.store(compiled, Ordering::Relaxed);
    }

    /// Compile outcome of the last `ProcessCode` request.
    pub fn compilation_result(&self) -> bool {
        self.compilation_result.load(Ordering::Relaxed)
    }

    /// Store the integer outcome of an `Evaluate` request.
    pub fn set_evaluation_result(&self, value: i64) {
        self.evaluation_result.store(value, Ordering::Relaxed);
    }

    /// Integer outcome of the last `Evaluate` request.
    pub fn evaluation_result(&self) -> i64 {
        self.evaluation_result.load(Ordering::Relaxed)
    }

    /// Serialize a completion list as newline-joined entries.
    ///
    /// Only whole entries are stored: the first entry that would not fit is
    /// dropped together with everything after it, so the reader never sees a
    /// torn candidate. Empty entries are preserved, except that a list of
    /// one empty string is indistinguishable from an empty list on the wire.
    pub fn set_completions(&self, items: &[String]) {
        let mut kept: Vec<&str> = Vec::with_capacity(items.len());
        let mut joined_len = 0;
        for item in items {
            let needed = item.len() + usize::from(!kept.is_empty());
            if joined_len + needed > MAX_COMPLETION_SIZE - 1 {
                break;
            }
            joined_len += needed;
            kept.push(item);
        }
        self.completions.write(kept.join("\n").as_bytes());
    }

    /// Decode the completion list. An empty buffer decodes to an empty list.
    pub fn completions(&self) -> Vec<String> {
        let data = self.completions.read();
        if data.is_empty() {
            return Vec::new();
        }
        String::from_utf8_lossy(&data)
            .split('\n')
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_mailbox() -> Box<Mailbox> {
        // SAFETY: every field of Mailbox is valid when zero-initialized.
        let mailbox: Box<Mailbox> = unsafe { Box::new_zeroed().assume_init() };
        mailbox
    }

    #[test]
    fn record_fits_conservative_segment_limit() {
        assert!(Mailbox::SIZE <= 64 * 1024);
        assert!(Mailbox::fits(Mailbox::SIZE));
        assert!(!Mailbox::fits(Mailbox::SIZE - 1));
    }

    #[test]
    fn reset_clears_everything() {
        let mailbox = boxed_mailbox();
        mailbox.set_code("int x = 1;");
        mailbox.set_cursor(5);
        mailbox.set_output("out");
        mailbox.set_error("err");
        mailbox.set_completions(&["a".into(), "b".into()]);
        mailbox.set_compilation_result(true);
        mailbox.set_evaluation_result(42);
        mailbox.post_request(RequestKind::Evaluate);
        mailbox.publish_response(ResponseStatus::Success);

        mailbox.reset();

        assert!(!mailbox.request_pending());
        assert!(!mailbox.response_pending());
        assert_eq!(mailbox.request_kind(), Some(RequestKind::None));
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::None));
        assert_eq!(mailbox.code(), "");
        assert_eq!(mailbox.code_len(), 0);
        assert_eq!(mailbox.cursor(), 0);
        assert_eq!(mailbox.output(), "");
        assert_eq!(mailbox.error_text(), "");
        assert!(mailbox.completions().is_empty());
        assert!(!mailbox.compilation_result());
        assert_eq!(mailbox.evaluation_result(), 0);
    }

    #[test]
    fn code_roundtrip_preserves_bytes() {
        let mailbox = boxed_mailbox();
        let code = "auto v = 40 + 2; // \u{00e9}";
        mailbox.set_code(code);
        assert_eq!(mailbox.code(), code);
        assert_eq!(mailbox.code_len(), code.len());
    }

    #[test]
    fn oversize_code_truncates_to_capacity_minus_one() {
        let mailbox = boxed_mailbox();
        let code = "x".repeat(MAX_CODE_SIZE + 100);
        mailbox.set_code(&code);
        assert_eq!(mailbox.code_len(), MAX_CODE_SIZE - 1);
        assert_eq!(mailbox.code().len(), MAX_CODE_SIZE - 1);
    }

    #[test]
    fn completions_roundtrip() {
        let mailbox = boxed_mailbox();
        let items = vec!["vector".to_string(), "vec".to_string(), "valarray".to_string()];
        mailbox.set_completions(&items);
        assert_eq!(mailbox.completions(), items);
    }

    #[test]
    fn completions_preserve_a_leading_empty_entry() {
        let mailbox = boxed_mailbox();
        let items = vec![String::new(), "foo".to_string()];
        mailbox.set_completions(&items);
        assert_eq!(mailbox.completions(), items);
    }

    #[test]
    fn completions_preserve_all_empty_entries() {
        let mailbox = boxed_mailbox();
        let items = vec![String::new(), String::new()];
        mailbox.set_completions(&items);
        assert_eq!(mailbox.completions(), items);
    }

    #[test]
    fn empty_completion_list_roundtrips_empty() {
        let mailbox = boxed_mailbox();
        mailbox.set_completions(&[]);
        assert!(mailbox.completions().is_empty());
    }

    #[test]
    fn oversize_completions_drop_whole_trailing_entries() {
        let mailbox = boxed_mailbox();
        let big = "y".repeat(MAX_COMPLETION_SIZE);
        let items = vec!["first".to_string(), big, "last".to_string()];
        mailbox.set_completions(&items);
        // The oversize entry and everything after it are gone; the prefix
        // survives intact.
        assert_eq!(mailbox.completions(), vec!["first".to_string()]);
    }

    #[test]
    fn request_publication_carries_kind() {
        let mailbox = boxed_mailbox();
        mailbox.reset();
        mailbox.set_code("40 + 2");
        mailbox.post_request(RequestKind::Evaluate);

        assert!(mailbox.request_pending());
        assert_eq!(mailbox.request_kind(), Some(RequestKind::Evaluate));
        assert!(!mailbox.response_pending());
    }

    #[test]
    fn response_publication_clears_request_flag_first() {
        let mailbox = boxed_mailbox();
        mailbox.reset();
        mailbox.post_request(RequestKind::ProcessCode);

        mailbox.set_output("hello");
        mailbox.set_compilation_result(true);
        mailbox.publish_response(ResponseStatus::Success);

        assert!(!mailbox.request_pending());
        assert!(mailbox.response_pending());
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::Success));
        assert_eq!(mailbox.output(), "hello");
        assert!(mailbox.compilation_result());
    }

    #[test]
    fn enums_decode_only_in_range_values() {
        assert_eq!(RequestKind::from_raw(4), Some(RequestKind::Shutdown));
        assert_eq!(RequestKind::from_raw(5), None);
        assert_eq!(ResponseStatus::from_raw(4), Some(ResponseStatus::SystemError));
        assert_eq!(ResponseStatus::from_raw(99), None);
    }
}
