//! io_uring backend
//!
//! Real kernel-side asynchrony for the completion-queue and callback
//! dispatch strategies. Submissions go straight onto the ring; `poll`
//! drains the completion queue without waiting, which keeps the worker
//! loop in control of pacing.

use super::{IoBackend, IoEvent, IoOp, OpKind};
use crate::Result;
use anyhow::Context;
use io_uring::{opcode, types, IoUring};
use std::collections::HashMap;

/// io_uring-backed overlapped IO
pub struct UringBackend {
    ring: Option<IoUring>,
    /// token -> kind of the in-flight op, for event construction
    pending: HashMap<u64, OpKind>,
}

impl UringBackend {
    pub fn new() -> Self {
        Self {
            ring: None,
            pending: HashMap::new(),
        }
    }

    fn ring_mut(&mut self) -> Result<&mut IoUring> {
        self.ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("io_uring backend used before prepare()"))
    }
}

impl Default for UringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for UringBackend {
    fn prepare(&mut self, depth: usize) -> Result<()> {
        let entries = (depth.max(1) as u32).next_power_of_two();
        let ring = IoUring::new(entries).context("failed to create io_uring instance")?;
        self.ring = Some(ring);
        Ok(())
    }

    fn submit(&mut self, op: IoOp) -> Result<()> {
        let entry = match op.kind {
            OpKind::Read => opcode::Read::new(types::Fd(op.fd), op.buf, op.len as u32)
                .offset(op.offset)
                .build()
                .user_data(op.token),
            OpKind::Write => {
                opcode::Write::new(types::Fd(op.fd), op.buf as *const u8, op.len as u32)
                    .offset(op.offset)
                    .build()
                    .user_data(op.token)
            }
            OpKind::Flush => opcode::Fsync::new(types::Fd(op.fd))
                .flags(types::FsyncFlags::DATASYNC)
                .build()
                .user_data(op.token),
        };

        let ring = self.ring_mut()?;
        // SAFETY: the buffer behind the entry stays valid until the matching
        // completion is drained; the request arena guarantees that.
        unsafe {
            ring.submission()
                .push(&entry)
                .map_err(|_| anyhow::anyhow!("io_uring submission queue full"))?;
        }
        ring.submit().context("io_uring submit failed")?;
        self.pending.insert(op.token, op.kind);
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<IoEvent>> {
        let pending = &mut self.pending;
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("io_uring backend used before prepare()"))?;

        let mut events = Vec::new();
        for cqe in ring.completion() {
            let token = cqe.user_data();
            let rc = cqe.result();
            let kind = pending.remove(&token).unwrap_or(OpKind::Read);
            let result = if rc >= 0 {
                Ok(rc as usize)
            } else {
                let errno = -rc;
                Err(std::io::Error::from_raw_os_error(errno))
                    .with_context(|| format!("{} failed: errno={}", kind, errno))
            };
            events.push(IoEvent {
                token,
                kind,
                result,
            });
        }
        Ok(events)
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(ref mut ring) = self.ring {
            // Reap everything still outstanding so buffers are safe to free.
            while !self.pending.is_empty() {
                ring.submit_and_wait(1)
                    .context("io_uring drain during shutdown failed")?;
                for cqe in ring.completion() {
                    self.pending.remove(&cqe.user_data());
                }
            }
        }
        self.ring = None;
        Ok(())
    }

    fn is_async(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn wait_events(backend: &mut UringBackend, want: usize) -> Vec<IoEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < want && Instant::now() < deadline {
            events.extend(backend.poll().unwrap());
            if events.len() < want {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        events
    }

    #[test]
    fn test_overlapped_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uring.dat");
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.write_all(&vec![7u8; 16 * 1024]).unwrap();

        let mut backend = UringBackend::new();
        backend.prepare(8).unwrap();
        assert!(backend.is_async());

        let mut bufs: Vec<Vec<u8>> = (0..4).map(|_| vec![0u8; 4096]).collect();
        for (i, buf) in bufs.iter_mut().enumerate() {
            backend
                .submit(IoOp {
                    kind: OpKind::Read,
                    fd: f.as_raw_fd(),
                    offset: (i * 4096) as u64,
                    buf: buf.as_mut_ptr(),
                    len: 4096,
                    token: i as u64,
                })
                .unwrap();
        }
        assert_eq!(backend.in_flight(), 4);

        let events = wait_events(&mut backend, 4);
        assert_eq!(events.len(), 4);
        for ev in &events {
            assert_eq!(*ev.result.as_ref().unwrap(), 4096);
        }
        assert_eq!(backend.in_flight(), 0);
        assert!(bufs.iter().all(|b| b.iter().all(|&x| x == 7)));

        backend.shutdown().unwrap();
    }

    #[test]
    fn test_write_completes_with_byte_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.dat");
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.set_len(8192).unwrap();

        let mut backend = UringBackend::new();
        backend.prepare(4).unwrap();
        let mut data = vec![0xabu8; 4096];
        backend
            .submit(IoOp {
                kind: OpKind::Write,
                fd: f.as_raw_fd(),
                offset: 4096,
                buf: data.as_mut_ptr(),
                len: 4096,
                token: 0,
            })
            .unwrap();
        let events = wait_events(&mut backend, 1);
        assert_eq!(*events[0].result.as_ref().unwrap(), 4096);
        assert_eq!(events[0].kind, OpKind::Write);
        backend.shutdown().unwrap();
    }

    #[test]
    fn test_submit_before_prepare_errors() {
        let mut backend = UringBackend::new();
        let err = backend.submit(IoOp {
            kind: OpKind::Flush,
            fd: 0,
            offset: 0,
            buf: std::ptr::null_mut(),
            len: 0,
            token: 0,
        });
        assert!(err.is_err());
    }
}
