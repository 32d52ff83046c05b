//! Target handles
//!
//! A target is a regular file, a partition or a raw disk. This module opens
//! targets with the flags the cache mode demands, resolves their usable
//! size (via fstat for files, BLKGETSIZE64 for block devices) and hands out
//! shared handles so every worker thread issuing IO against the same path
//! with the same access flags reuses one descriptor.

pub mod precreate;

use crate::config::TargetSpec;
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// ioctl request code for the block device size in bytes
const BLKGETSIZE64: libc::c_ulong = 0x80081272;

/// An open target with its resolved size
///
/// The descriptor closes when the last worker drops its `Arc`.
pub struct TargetHandle {
    path: PathBuf,
    file: File,
    size: u64,
    is_block_device: bool,
}

impl TargetHandle {
    /// Open `spec.path` with the access flags its cache mode requires
    pub fn open(spec: &TargetSpec) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        let mut custom_flags = 0;
        if spec.cache_mode.is_unbuffered() {
            custom_flags |= libc::O_DIRECT;
        }
        if spec.cache_mode.is_write_through() && !spec.memory_mapped {
            custom_flags |= libc::O_SYNC;
        }
        if custom_flags != 0 {
            options.custom_flags(custom_flags);
        }

        let file = options
            .open(&spec.path)
            .with_context(|| format!("failed to open target: {}", spec.path.display()))?;

        let metadata = file
            .metadata()
            .with_context(|| format!("fstat failed: {}", spec.path.display()))?;
        let is_block_device = metadata.file_type().is_block_device();

        let size = if is_block_device {
            let mut bytes: u64 = 0;
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut bytes) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                return Err(err).with_context(|| {
                    format!("ioctl(BLKGETSIZE64) failed: {}", spec.path.display())
                });
            }
            bytes
        } else {
            metadata.len()
        };

        Ok(Self {
            path: spec.path.clone(),
            file,
            size,
            is_block_device,
        })
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Resolved size in bytes: file length or device capacity
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_block_device(&self) -> bool {
        self.is_block_device
    }
}

/// Key identifying a shareable open: same path and same access flags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    path: PathBuf,
    direct: bool,
    sync: bool,
}

impl HandleKey {
    fn for_spec(spec: &TargetSpec) -> Self {
        Self {
            path: spec.path.clone(),
            direct: spec.cache_mode.is_unbuffered(),
            sync: spec.cache_mode.is_write_through() && !spec.memory_mapped,
        }
    }
}

/// Deduplicating cache of open target handles
///
/// Two targets that name the same path with the same flags share one
/// descriptor; differing flags (say buffered and O_DIRECT) get separate
/// opens, since the kernel treats them differently.
#[derive(Default)]
pub struct HandleCache {
    handles: Mutex<HashMap<HandleKey, Arc<TargetHandle>>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_open(&self, spec: &TargetSpec) -> Result<Arc<TargetHandle>> {
        let key = HandleKey::for_spec(spec);
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| anyhow::anyhow!("handle cache lock poisoned"))?;
        if let Some(handle) = handles.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(TargetHandle::open(spec)?);
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }
}

/// The byte extent a target spec actually exercises: `[base_offset, end)`
/// where `end` is the resolved size, capped by `max_size` when set.
/// Shared by the sequencer and the startup extent check so both agree on
/// the boundary.
pub fn usable_extent(spec: &TargetSpec, resolved_size: u64) -> (u64, u64) {
    let end = if spec.max_size > 0 {
        spec.base_offset.saturating_add(spec.max_size).min(resolved_size)
    } else {
        resolved_size
    };
    (spec.base_offset, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn spec_for(dir: &TempDir, name: &str, len: usize) -> TargetSpec {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        TargetSpec {
            path,
            block_size: 512,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_resolves_file_size() {
        let dir = TempDir::new().unwrap();
        let spec = spec_for(&dir, "t.dat", 4096);
        let handle = TargetHandle::open(&spec).unwrap();
        assert_eq!(handle.size(), 4096);
        assert!(!handle.is_block_device());
        assert!(handle.fd() >= 0);
    }

    #[test]
    fn test_cache_shares_same_flags() {
        let dir = TempDir::new().unwrap();
        let spec = spec_for(&dir, "t.dat", 1024);
        let cache = HandleCache::new();
        let a = cache.get_or_open(&spec).unwrap();
        let b = cache.get_or_open(&spec).unwrap();
        assert_eq!(a.fd(), b.fd());
    }

    #[test]
    fn test_cache_separates_differing_flags() {
        let dir = TempDir::new().unwrap();
        let spec = spec_for(&dir, "t.dat", 1024);
        let mut synced = spec.clone();
        synced.cache_mode = crate::config::CacheMode::WriteThrough;

        let cache = HandleCache::new();
        let a = cache.get_or_open(&spec).unwrap();
        let b = cache.get_or_open(&synced).unwrap();
        assert_ne!(a.fd(), b.fd());
    }

    #[test]
    fn test_usable_extent() {
        let mut spec = TargetSpec {
            block_size: 512,
            ..Default::default()
        };
        assert_eq!(usable_extent(&spec, 10_000), (0, 10_000));

        spec.base_offset = 1000;
        spec.max_size = 4000;
        assert_eq!(usable_extent(&spec, 10_000), (1000, 5000));

        // max_size reaching past the real end is capped
        spec.max_size = 20_000;
        assert_eq!(usable_extent(&spec, 10_000), (1000, 10_000));
    }
}
