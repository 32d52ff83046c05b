//! Workload specification validation
//!
//! Structural checks run once after parsing, before any thread is spawned.
//! The execution core assumes a validated spec and fails fast instead of
//! re-validating: every conflict caught here would otherwise surface as an
//! assertion deep inside a worker thread.

use super::{TargetSpec, TimeSpan, WorkloadSpec};
use thiserror::Error;

/// Configuration errors, all fatal to the run before any IO is issued
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workload has no timespans")]
    NoTimeSpans,

    #[error("timespan {0} has no targets")]
    NoTargets(usize),

    #[error("target {path}: block size must be non-zero", path = .0)]
    ZeroBlockSize(String),

    #[error("target {path}: request count must be non-zero", path = .0)]
    ZeroRequestCount(String),

    #[error("target {path}: random ratio {ratio} exceeds 100", path = .0, ratio = .1)]
    BadRandomRatio(String, u8),

    #[error("target {path}: write ratio {ratio} exceeds 100", path = .0, ratio = .1)]
    BadWriteRatio(String, u8),

    #[error("target {path}: thread stride is incompatible with interlocked-sequential access", path = .0)]
    InterlockedWithStride(String),

    #[error("target {path}: parallel-async is incompatible with explicit thread-to-target weights", path = .0)]
    ParallelAsyncWithWeights(String),

    #[error("target {path}: think time configured without a burst size (or vice versa)", path = .0)]
    PartialThinkTime(String),

    #[error("target {path}: memory mapping cannot be combined with unbuffered (O_DIRECT) cache mode", path = .0)]
    MappedUnbuffered(String),

    #[error(
        "target {path}: usable extent is smaller than one block \
         (size {size}, base {base}, stride {stride}, block {block})",
        path = .0, size = .1, base = .2, stride = .3, block = .4
    )]
    ExtentTooSmall(String, u64, u64, u64, u64),

    #[error("timespan {0}: derived thread count is zero")]
    ZeroThreads(usize),

    #[error("timespan {0}: affinity assignment references no processors")]
    EmptyAffinity(usize),

    #[error(
        "timespan {0}: fixed thread count cannot mix memory-mapped and \
         unmapped targets (a thread drives one IO mechanism)"
    )]
    MixedMemoryMapping(usize),
}

/// Validate the whole specification. Returns the first error found.
pub fn validate(spec: &WorkloadSpec) -> Result<(), ConfigError> {
    if spec.timespans.is_empty() {
        return Err(ConfigError::NoTimeSpans);
    }
    for (i, ts) in spec.timespans.iter().enumerate() {
        validate_timespan(i, ts)?;
    }
    Ok(())
}

fn validate_timespan(index: usize, ts: &TimeSpan) -> Result<(), ConfigError> {
    if ts.targets.is_empty() {
        return Err(ConfigError::NoTargets(index));
    }
    if ts.effective_thread_count() == 0 {
        return Err(ConfigError::ZeroThreads(index));
    }
    if ts.thread_count > 0 {
        let mapped = ts.targets.iter().filter(|t| t.memory_mapped).count();
        if mapped != 0 && mapped != ts.targets.len() {
            return Err(ConfigError::MixedMemoryMapping(index));
        }
    }
    for target in &ts.targets {
        validate_target(target)?;
    }
    Ok(())
}

fn validate_target(t: &TargetSpec) -> Result<(), ConfigError> {
    let path = t.path.display().to_string();
    if t.block_size == 0 {
        return Err(ConfigError::ZeroBlockSize(path));
    }
    if t.request_count == 0 {
        return Err(ConfigError::ZeroRequestCount(path));
    }
    if t.random_ratio > 100 {
        return Err(ConfigError::BadRandomRatio(path, t.random_ratio));
    }
    if t.write_ratio > 100 {
        return Err(ConfigError::BadWriteRatio(path, t.write_ratio));
    }
    if t.interlocked_sequential && t.thread_stride > 0 {
        return Err(ConfigError::InterlockedWithStride(path));
    }
    if t.parallel_async && !t.thread_weights.is_empty() {
        return Err(ConfigError::ParallelAsyncWithWeights(path));
    }
    if (t.burst_size > 0) != (t.think_time_ms > 0) {
        return Err(ConfigError::PartialThinkTime(path));
    }
    if t.memory_mapped && t.cache_mode.is_unbuffered() {
        return Err(ConfigError::MappedUnbuffered(path));
    }
    Ok(())
}

/// The startup extent check: a target with resolved size `size` can only be
/// exercised by relative thread `relative_index` if its base offset, thread
/// stride slot and one full block all fit. Violations are configuration
/// errors caught before the start barrier, never runtime faults.
pub fn can_start(t: &TargetSpec, size: u64, relative_index: usize) -> Result<(), ConfigError> {
    let stride = if t.interlocked_sequential {
        0
    } else {
        t.thread_stride.saturating_mul(relative_index as u64)
    };
    let (_, end) = crate::target::usable_extent(t, size);
    let needed = t.base_offset.saturating_add(stride).saturating_add(t.block_size);
    if needed > end {
        return Err(ConfigError::ExtentTooSmall(
            t.path.display().to_string(),
            size,
            t.base_offset,
            stride,
            t.block_size,
        ));
    }
    Ok(())
}
