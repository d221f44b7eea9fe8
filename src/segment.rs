//! Named POSIX shared-memory segment backing the mailbox.
//!
//! The host creates the segment exclusively and is the only side that
//! unlinks it; the worker opens the existing name read-write, retrying to
//! cover the race with the host's `shm_open`. Both sides unmap on drop.

use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

/// Delay between worker attempts to open a segment the host may not have
/// created yet.
pub const OPEN_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Number of open attempts before the worker gives up (5 s total).
pub const OPEN_RETRY_ATTEMPTS: u32 = 50;

/// Segment name for a host identified by its pid.
pub fn default_segment_name() -> String {
    format!("/xcpp_shm_{}", std::process::id())
}

/// Clamp a requested mapping size to `[Mailbox::SIZE, system max]`.
pub fn clamp_segment_size(requested: usize) -> usize {
    requested.clamp(Mailbox::SIZE, max_segment_size().max(Mailbox::SIZE))
}

/// Largest segment the system advertises, with a conservative fallback.
fn max_segment_size() -> usize {
    std::fs::read_to_string("/proc/sys/kernel/shmmax")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|v| usize::try_from(v).unwrap_or(usize::MAX))
        .unwrap_or(1024 * 1024)
}

/// A mapped named shared-memory segment holding the mailbox record.
pub struct SharedSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    name: String,
    owner: bool,
}

impl SharedSegment {
    /// Create the segment exclusively, size it and map it (host side).
    ///
    /// A stale segment left by a crashed predecessor under the same name is
    /// unlinked first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if !Mailbox::fits(size) {
            return Err(Error::Segment(format!(
                "segment size {size} below the {} byte record",
                Mailbox::SIZE
            )));
        }

        let _ = rustix::shm::unlink(name);
        let fd = rustix::shm::open(
            name,
            rustix::shm::OFlags::CREATE | rustix::shm::OFlags::EXCL | rustix::shm::OFlags::RDWR,
            Mode::from_raw_mode(0o666),
        )
        .map_err(|e| Error::Segment(format!("shm_open({name}) failed: {e}")))?;

        rustix::fs::ftruncate(&fd, size as u64)?;

        Self::map(fd, size, name, true)
    }

    /// Open an existing segment read-write and map it (worker side).
    pub fn open(name: &str, size: usize) -> Result<Self> {
        if !Mailbox::fits(size) {
            return Err(Error::Segment(format!(
                "segment size {size} below the {} byte record",
                Mailbox::SIZE
            )));
        }

        let fd = rustix::shm::open(name, rustix::shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| Error::Segment(format!("shm_open({name}) failed: {e}")))?;

        Self::map(fd, size, name, false)
    }

    /// Open with retry, covering the window before the host has created the
    /// segment.
    pub fn open_with_retry(
        name: &str,
        size: usize,
        backoff: Duration,
        attempts: u32,
    ) -> Result<Self> {
        let mut last = None;
        for attempt in 0..attempts.max(1) {
            match Self::open(name, size) {
                Ok(segment) => return Ok(segment),
                Err(e) => {
                    tracing::debug!(name, attempt, "segment not available yet: {e}");
                    last = Some(e);
                    thread::sleep(backoff);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Segment(format!("segment {name} never appeared"))))
    }

    fn map(fd: OwnedFd, size: usize, name: &str, owner: bool) -> Result<Self> {
        // SAFETY: fresh shared mapping over a descriptor we own; the kernel
        // picks the address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Segment("mmap returned null".into()))?;
        debug_assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<Mailbox>(), 0);

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: name.to_string(),
            owner,
        })
    }

    /// The mailbox record at the start of the mapping.
    pub fn mailbox(&self) -> &Mailbox {
        // SAFETY: constructors validate `len >= Mailbox::SIZE` and mmap
        // returns page-aligned memory; all interior mutability is routed
        // through atomics / the flag protocol.
        unsafe { &*self.ptr.as_ptr().cast::<Mailbox>() }
    }

    /// Name of the segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid segment).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: the pointer and length come from a successful mmap.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        if self.owner {
            let _ = rustix::shm::unlink(&self.name);
        }
        // fd closes when OwnedFd drops
    }
}

// SAFETY: the mapping is process-wide and the mailbox mediates all shared
// mutation through atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}
