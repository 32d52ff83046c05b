//! IO backend abstraction
//!
//! A backend turns `IoOp` descriptors into kernel IO and reports finished
//! operations as `IoEvent`s. The worker loop is agnostic to the mechanism:
//! synchronous pread/pwrite, an io_uring completion queue, or memcpy against
//! a shared mapping all sit behind the same trait.
//!
//! Backends with no real asynchrony (sync, mapped) complete operations
//! inline during `submit` and hand the events back from the next `poll`.
//! `poll` never blocks; the worker decides when to sleep.

use crate::Result;
use std::os::unix::io::RawFd;

pub mod mapped;
pub mod sync;

#[cfg(feature = "io_uring")]
pub mod uring;

/// Kind of IO to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    /// Force written data down to the device
    Flush,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Read => write!(f, "read"),
            OpKind::Write => write!(f, "write"),
            OpKind::Flush => write!(f, "flush"),
        }
    }
}

/// One IO to submit
///
/// `token` round-trips through the backend untouched and comes back in the
/// matching `IoEvent`; the worker uses it as an index into its request arena.
#[derive(Debug)]
pub struct IoOp {
    pub kind: OpKind,
    pub fd: RawFd,
    pub offset: u64,
    /// Read destination or write source. Must stay valid and keep its
    /// alignment until the matching event is polled. Ignored for Flush.
    pub buf: *mut u8,
    pub len: usize,
    pub token: u64,
}

// The raw pointer's lifetime is managed by the request arena that owns the
// buffer; ops never cross threads after submission.
unsafe impl Send for IoOp {}

/// A finished IO
#[derive(Debug)]
pub struct IoEvent {
    pub token: u64,
    pub kind: OpKind,
    /// Bytes transferred on success; transfers shorter than requested are
    /// reported as-is, not retried
    pub result: Result<usize>,
}

/// Uniform interface over the IO mechanisms
///
/// One instance per worker thread; backends are `Send` but never shared.
pub trait IoBackend: Send {
    /// Allocate kernel resources for up to `depth` concurrent operations
    fn prepare(&mut self, depth: usize) -> Result<()>;

    /// Make a target available to the backend before any IO against it.
    /// Only the mapped backend does real work here.
    fn register(&mut self, _fd: RawFd, _size: u64) -> Result<()> {
        Ok(())
    }

    /// Queue one operation. Inline backends complete it here; async
    /// backends hand it to the kernel.
    fn submit(&mut self, op: IoOp) -> Result<()>;

    /// Collect finished operations without blocking. May return an empty
    /// vector when nothing has completed yet.
    fn poll(&mut self) -> Result<Vec<IoEvent>>;

    /// Number of submitted operations not yet returned by `poll`
    fn in_flight(&self) -> usize;

    /// Release kernel resources. The backend is unusable afterwards.
    fn shutdown(&mut self) -> Result<()>;

    /// True when submitted operations overlap in the kernel
    fn is_async(&self) -> bool;
}

/// Pick the backend for a worker based on its target configuration
///
/// Memory-mapped targets always use the mapped backend. Otherwise the
/// completion-queue and callback strategies take io_uring when it is
/// compiled in, and everything else falls back to synchronous syscalls.
pub fn create_backend(memory_mapped: bool, overlapped: bool) -> Box<dyn IoBackend> {
    if memory_mapped {
        return Box::new(mapped::MappedBackend::new());
    }
    #[cfg(feature = "io_uring")]
    if overlapped {
        return Box::new(uring::UringBackend::new());
    }
    let _ = overlapped;
    Box::new(sync::SyncBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        assert!(!create_backend(true, true).is_async());
        assert!(!create_backend(false, false).is_async());
        #[cfg(feature = "io_uring")]
        assert!(create_backend(false, true).is_async());
    }

    #[test]
    fn test_op_kind_display() {
        assert_eq!(OpKind::Read.to_string(), "read");
        assert_eq!(OpKind::Write.to_string(), "write");
        assert_eq!(OpKind::Flush.to_string(), "flush");
    }
}
