//! Pre-run file creation
//!
//! Several targets across the timespans of a run can name the same path
//! with different requested sizes. The planner collapses them into at most
//! one creation per path so the setup phase never creates, shrinks and
//! re-grows the same file.

use crate::config::{TargetSpec, WorkloadSpec};
use crate::Result;
use anyhow::Context;
use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

/// How conflicting size requests for one path are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    /// Create each path at the largest size any target requests for it
    UseMaxSize,
    /// Only create paths whose targets all agree on the size; disagreeing
    /// paths are skipped and left to whatever is on disk
    ConstantSizeOnly,
}

/// One file to create before worker threads start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationRequest {
    pub path: PathBuf,
    pub size: u64,
}

/// Collapse every precreate-enabled target in the run into at most one
/// creation request per path. Targets with a zero `file_size` contribute
/// nothing; a path whose only requests are zero is dropped.
pub fn plan(spec: &WorkloadSpec, policy: SizePolicy) -> Vec<CreationRequest> {
    let mut by_path: BTreeMap<PathBuf, Vec<u64>> = BTreeMap::new();
    for timespan in &spec.timespans {
        for target in &timespan.targets {
            if target.precreate {
                by_path
                    .entry(target.path.clone())
                    .or_default()
                    .push(target.file_size);
            }
        }
    }

    let mut requests = Vec::new();
    for (path, sizes) in by_path {
        let nonzero: Vec<u64> = sizes.into_iter().filter(|&s| s > 0).collect();
        let Some(&first) = nonzero.first() else {
            continue;
        };
        match policy {
            SizePolicy::UseMaxSize => {
                // Safe: nonzero is non-empty here.
                let size = nonzero.iter().copied().max().unwrap_or(first);
                requests.push(CreationRequest { path, size });
            }
            SizePolicy::ConstantSizeOnly => {
                if nonzero.iter().all(|&s| s == first) {
                    requests.push(CreationRequest { path, size: first });
                } else {
                    tracing::debug!(
                        path = %path.display(),
                        "skipping precreate, targets disagree on file size"
                    );
                }
            }
        }
    }
    requests
}

/// Create and fill the planned files
///
/// Existing files already at least as large as requested are left alone.
/// New or short files are extended and filled with pseudo-random content so
/// read workloads hit real blocks rather than holes.
pub fn execute(requests: &[CreationRequest]) -> Result<()> {
    for request in requests {
        let existing = std::fs::metadata(&request.path).map(|m| m.len()).unwrap_or(0);
        if existing >= request.size {
            tracing::debug!(
                path = %request.path.display(),
                size = existing,
                "target already large enough, skipping precreate"
            );
            continue;
        }

        tracing::info!(
            path = %request.path.display(),
            size = request.size,
            "creating target file"
        );
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&request.path)
            .with_context(|| format!("failed to create target: {}", request.path.display()))?;
        file.set_len(request.size)
            .with_context(|| format!("failed to size target: {}", request.path.display()))?;
        fill_random(&mut file, existing, request.size)
            .with_context(|| format!("failed to fill target: {}", request.path.display()))?;
    }
    Ok(())
}

/// Write pseudo-random bytes over `[from, to)` in 1 MiB chunks
fn fill_random(file: &mut std::fs::File, from: u64, to: u64) -> Result<()> {
    const CHUNK: usize = 1024 * 1024;
    let mut chunk = vec![0u8; CHUNK];
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    for byte in chunk.iter_mut() {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        *byte = (state >> 16) as u8;
    }

    file.seek(SeekFrom::Start(from))?;
    let mut written = from;
    while written < to {
        let n = ((to - written) as usize).min(CHUNK);
        file.write_all(&chunk[..n])?;
        written += n as u64;
    }
    file.flush()?;
    Ok(())
}

/// Convenience for single-target call sites
pub fn plan_for_targets(targets: &[TargetSpec], policy: SizePolicy) -> Vec<CreationRequest> {
    let spec = WorkloadSpec {
        timespans: vec![crate::config::TimeSpan {
            duration_secs: 0,
            warmup_secs: 0,
            cooldown_secs: 0,
            thread_count: 0,
            random_seed: 0,
            completion_callbacks: false,
            disable_affinity: false,
            measure_latency: false,
            measure_iops_stddev: false,
            io_bucket_duration_ms: 1000,
            affinity_assignment: Vec::new(),
            targets: targets.to_vec(),
        }],
    };
    plan(&spec, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target(path: &str, file_size: u64) -> TargetSpec {
        TargetSpec {
            path: PathBuf::from(path),
            block_size: 4096,
            file_size,
            precreate: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_max_size_collapses_to_single_request() {
        let targets = vec![
            target("/tmp/a.dat", 100),
            target("/tmp/a.dat", 150),
            target("/tmp/a.dat", 0),
        ];
        let plan = plan_for_targets(&targets, SizePolicy::UseMaxSize);
        assert_eq!(
            plan,
            vec![CreationRequest {
                path: PathBuf::from("/tmp/a.dat"),
                size: 150,
            }]
        );
    }

    #[test]
    fn test_constant_size_only_excludes_disagreement() {
        let targets = vec![
            target("/tmp/a.dat", 100),
            target("/tmp/a.dat", 150),
            target("/tmp/b.dat", 200),
            target("/tmp/b.dat", 200),
        ];
        let plan = plan_for_targets(&targets, SizePolicy::ConstantSizeOnly);
        assert_eq!(
            plan,
            vec![CreationRequest {
                path: PathBuf::from("/tmp/b.dat"),
                size: 200,
            }]
        );
    }

    #[test]
    fn test_zero_sizes_are_ignored() {
        let targets = vec![target("/tmp/a.dat", 0), target("/tmp/a.dat", 0)];
        assert!(plan_for_targets(&targets, SizePolicy::UseMaxSize).is_empty());

        let mixed = vec![target("/tmp/a.dat", 0), target("/tmp/a.dat", 64)];
        let plan = plan_for_targets(&mixed, SizePolicy::ConstantSizeOnly);
        assert_eq!(plan[0].size, 64);
    }

    #[test]
    fn test_non_precreate_targets_never_planned() {
        let mut t = target("/tmp/a.dat", 100);
        t.precreate = false;
        assert!(plan_for_targets(&[t], SizePolicy::UseMaxSize).is_empty());
    }

    #[test]
    fn test_execute_creates_and_fills() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pre.dat");
        let requests = vec![CreationRequest {
            path: path.clone(),
            size: 3 * 1024 * 1024 + 17,
        }];
        execute(&requests).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3 * 1024 * 1024 + 17);
        assert!(content.iter().any(|&b| b != 0));

        // Re-running against an already sized file is a no-op.
        execute(&requests).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 1024 * 1024 + 17);
    }
}
