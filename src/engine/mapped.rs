//! Memory-mapped backend
//!
//! Targets are mapped shared into the worker's address space during setup
//! and IO becomes memcpy against the mapping. Completions are inline, like
//! the synchronous backend.
//!
//! Write-through for mapped targets means an msync of the written range
//! after each write. Whether the platform supports ranged msync from our
//! page-unaligned offsets is probed on the first flush; when the probe
//! fails the capability is latched off and later flushes fall back to
//! syncing the whole mapping.

use super::{IoBackend, IoEvent, IoOp, OpKind};
use crate::Result;
use anyhow::Context;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::ptr;

struct Mapping {
    addr: *mut u8,
    size: usize,
}

// The mapping is owned by this backend and never leaves the worker thread.
unsafe impl Send for Mapping {}

/// Whether ranged msync works here; probed once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangedFlush {
    Unprobed,
    Supported,
    Unsupported,
}

/// memcpy-against-mmap backend
pub struct MappedBackend {
    mappings: HashMap<RawFd, Mapping>,
    completed: VecDeque<IoEvent>,
    ranged_flush: RangedFlush,
}

impl MappedBackend {
    pub fn new() -> Self {
        Self {
            mappings: HashMap::new(),
            completed: VecDeque::new(),
            ranged_flush: RangedFlush::Unprobed,
        }
    }

    fn mapping(&self, fd: RawFd) -> Result<&Mapping> {
        self.mappings
            .get(&fd)
            .ok_or_else(|| anyhow::anyhow!("target not mapped: fd={}", fd))
    }

    fn do_read(&self, fd: RawFd, buf: *mut u8, len: usize, offset: u64) -> Result<usize> {
        let mapping = self.mapping(fd)?;
        let offset = offset as usize;
        if offset >= mapping.size {
            return Ok(0);
        }
        let n = len.min(mapping.size - offset);
        // SAFETY: offset+n is within the mapping; buf is valid for len bytes.
        unsafe {
            ptr::copy_nonoverlapping(mapping.addr.add(offset), buf, n);
        }
        Ok(n)
    }

    fn do_write(&self, fd: RawFd, buf: *const u8, len: usize, offset: u64) -> Result<usize> {
        let mapping = self.mapping(fd)?;
        let offset = offset as usize;
        if offset >= mapping.size {
            anyhow::bail!(
                "write offset {} beyond mapped size {} (fd={})",
                offset,
                mapping.size,
                fd
            );
        }
        let n = len.min(mapping.size - offset);
        // SAFETY: as in do_read.
        unsafe {
            ptr::copy_nonoverlapping(buf, mapping.addr.add(offset), n);
        }
        Ok(n)
    }

    /// Sync the written range down to the device. `offset`/`len` of zero
    /// syncs the whole mapping.
    fn do_flush(&mut self, fd: RawFd, offset: u64, len: usize) -> Result<usize> {
        let (addr, size) = {
            let mapping = self.mapping(fd)?;
            (mapping.addr as usize, mapping.size)
        };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        if len > 0 && self.ranged_flush != RangedFlush::Unsupported {
            // msync requires a page-aligned start address.
            let start = (offset as usize / page) * page;
            let span = (offset as usize + len).min(size) - start;
            let rc = unsafe {
                libc::msync((addr + start) as *mut libc::c_void, span, libc::MS_SYNC)
            };
            if rc == 0 {
                self.ranged_flush = RangedFlush::Supported;
                return Ok(0);
            }
            if self.ranged_flush == RangedFlush::Unprobed {
                tracing::debug!(
                    errno = std::io::Error::last_os_error().raw_os_error(),
                    "ranged msync unavailable, falling back to full-mapping sync"
                );
                self.ranged_flush = RangedFlush::Unsupported;
            } else {
                let err = std::io::Error::last_os_error();
                return Err(err).with_context(|| format!("msync failed: fd={}", fd));
            }
        }

        let rc = unsafe { libc::msync(addr as *mut libc::c_void, size, libc::MS_SYNC) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).with_context(|| format!("msync failed: fd={}", fd));
        }
        Ok(0)
    }
}

impl Default for MappedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MappedBackend {
    fn drop(&mut self) {
        for mapping in self.mappings.values() {
            unsafe {
                libc::munmap(mapping.addr as *mut libc::c_void, mapping.size);
            }
        }
    }
}

impl IoBackend for MappedBackend {
    fn prepare(&mut self, _depth: usize) -> Result<()> {
        Ok(())
    }

    fn register(&mut self, fd: RawFd, size: u64) -> Result<()> {
        if self.mappings.contains_key(&fd) {
            return Ok(());
        }
        if size == 0 {
            anyhow::bail!("cannot map a zero-sized target (fd={})", fd);
        }
        // Read+write always: a read-only mapping would fault on a mixed
        // workload's first write.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(err).with_context(|| format!("mmap failed: fd={}, size={}", fd, size));
        }
        self.mappings.insert(
            fd,
            Mapping {
                addr: addr as *mut u8,
                size: size as usize,
            },
        );
        Ok(())
    }

    fn submit(&mut self, op: IoOp) -> Result<()> {
        let result = match op.kind {
            OpKind::Read => self.do_read(op.fd, op.buf, op.len, op.offset),
            OpKind::Write => self.do_write(op.fd, op.buf as *const u8, op.len, op.offset),
            OpKind::Flush => self.do_flush(op.fd, op.offset, op.len),
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
        for (fd, mapping) in self.mappings.drain() {
            let rc = unsafe { libc::munmap(mapping.addr as *mut libc::c_void, mapping.size) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                return Err(err).with_context(|| format!("munmap failed: fd={}", fd));
            }
        }
        self.completed.clear();
        Ok(())
    }

    fn is_async(&self) -> bool {
        false
    }
}
