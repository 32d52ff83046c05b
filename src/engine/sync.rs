//! Synchronous backend using positioned syscalls
//!
//! The baseline mechanism, always available. `submit` performs the syscall
//! inline and parks the event for the next `poll`, so the effective queue
//! depth is whatever the caller submits between polls, with no overlap.
//!
//! Transfers are single-shot: a pread that comes back short (EOF, or a
//! device boundary) is reported with the actual byte count rather than
//! retried, so the statistics reflect what the kernel really did.

use super::{IoBackend, IoEvent, IoOp, OpKind};
use crate::Result;
use anyhow::Context;
use std::collections::VecDeque;

/// Blocking pread/pwrite backend
pub struct SyncBackend {
    completed: VecDeque<IoEvent>,
}

impl SyncBackend {
    pub fn new() -> Self {
        Self {
            completed: VecDeque::new(),
        }
    }

    #[inline(always)]
    fn do_read(&self, fd: i32, buf: *mut u8, len: usize, offset: u64) -> Result<usize> {
        // SAFETY: the caller guarantees buf is valid for len bytes until the
        // event is polled.
        let n = unsafe { libc::pread(fd, buf as *mut libc::c_void, len, offset as i64) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err)
                .with_context(|| format!("pread failed: fd={}, offset={}, length={}", fd, offset, len));
        }
        Ok(n as usize)
    }

    #[inline(always)]
    fn do_write(&self, fd: i32, buf: *const u8, len: usize, offset: u64) -> Result<usize> {
        // SAFETY: as above.
        let n = unsafe { libc::pwrite(fd, buf as *const libc::c_void, len, offset as i64) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err)
                .with_context(|| format!("pwrite failed: fd={}, offset={}, length={}", fd, offset, len));
        }
        Ok(n as usize)
    }

    fn do_flush(&self, fd: i32) -> Result<usize> {
        let rc = unsafe { libc::fdatasync(fd) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).with_context(|| format!("fdatasync failed: fd={}", fd));
        }
        Ok(0)
    }
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for SyncBackend {
    fn prepare(&mut self, _depth: usize) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, op: IoOp) -> Result<()> {
        let result = match op.kind {
            OpKind::Read => self.do_read(op.fd, op.buf, op.len, op.offset),
            OpKind::Write => self.do_write(op.fd, op.buf as *const u8, op.len, op.offset),
            OpKind::Flush => self.do_flush(op.fd),
        };
        self.completed.push_back(IoEvent {
            token: op.token,
            kind: op.kind,
            result,
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<IoEvent>> {
        Ok(self.completed.drain(..).collect())
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.completed.clear();
        Ok(())
    }

    fn is_async(&self) -> bool {
        false
    }
}
