//! Workload specification
//!
//! The `WorkloadSpec` is the declarative description of a benchmark run: an
//! ordered list of `TimeSpan`s, each carrying phase durations, thread and
//! affinity configuration, and an ordered list of `TargetSpec`s describing
//! the files or devices to exercise and how to access them.
//!
//! The spec is immutable once validated. Worker threads and the coordinator
//! only ever read it; all mutable runtime state (cursors, meters, results)
//! lives elsewhere.

pub mod cli;
pub mod profile;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use validator::{validate, ConfigError};

/// Complete benchmark specification: one or more phased runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub timespans: Vec<TimeSpan>,
}

/// One phased workload run (warmup + measurement + cooldown) against a set
/// of targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSpan {
    /// Measurement window duration in seconds
    pub duration_secs: u64,

    /// Warmup duration in seconds (no statistics recorded)
    #[serde(default)]
    pub warmup_secs: u64,

    /// Cooldown duration in seconds (no statistics recorded)
    #[serde(default)]
    pub cooldown_secs: u64,

    /// Worker thread count; 0 derives it from per-target thread counts
    #[serde(default)]
    pub thread_count: usize,

    /// Seed for all per-thread random generators
    #[serde(default)]
    pub random_seed: u64,

    /// Use the callback dispatch strategy instead of the completion queue
    #[serde(default)]
    pub completion_callbacks: bool,

    /// Skip binding worker threads to processors
    #[serde(default)]
    pub disable_affinity: bool,

    /// Timestamp every IO and record completion latency
    #[serde(default)]
    pub measure_latency: bool,

    /// Bucketize completions over time to compute IOPS standard deviation
    #[serde(default)]
    pub measure_iops_stddev: bool,

    /// Bucket width for the IOPS bucketizer, in milliseconds
    #[serde(default = "default_bucket_ms")]
    pub io_bucket_duration_ms: u64,

    /// Explicit processor list for round-robin affinity; empty means all
    /// active processors
    #[serde(default)]
    pub affinity_assignment: Vec<usize>,

    pub targets: Vec<TargetSpec>,
}

fn default_bucket_ms() -> u64 {
    1000
}

impl TimeSpan {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::from_millis(self.io_bucket_duration_ms.max(1))
    }

    /// Total worker threads for this timespan: the explicit count, or the
    /// sum of per-target thread counts when the explicit count is zero
    pub fn effective_thread_count(&self) -> usize {
        if self.thread_count > 0 {
            self.thread_count
        } else {
            self.targets.iter().map(|t| t.per_target_threads).sum()
        }
    }
}

/// How the OS cache sits between the workload and the target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheMode {
    /// Regular buffered IO through the page cache
    Buffered,
    /// O_DIRECT: bypass the page cache
    Unbuffered,
    /// O_SYNC: write-through, every write durable before completion
    WriteThrough,
    /// O_DIRECT + O_SYNC
    UnbufferedWriteThrough,
}

impl Default for CacheMode {
    fn default() -> Self {
        Self::Buffered
    }
}

impl CacheMode {
    pub fn is_unbuffered(&self) -> bool {
        matches!(self, Self::Unbuffered | Self::UnbufferedWriteThrough)
    }

    pub fn is_write_through(&self) -> bool {
        matches!(self, Self::WriteThrough | Self::UnbufferedWriteThrough)
    }
}

/// Best-effort IO scheduling priority hint for worker threads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IoPriority {
    VeryLow,
    Low,
    Normal,
    High,
}

impl Default for IoPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Explicit thread-to-target weight override used by the fixed-thread-count
/// assignment mode. A weight of zero removes the target from that thread's
/// rotation entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadTargetWeight {
    pub thread_index: usize,
    pub weight: u32,
}

/// A single file, partition or raw disk exercised by the workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub path: PathBuf,

    /// IO size in bytes
    pub block_size: u64,

    /// Overlapped requests per thread against this target
    #[serde(default = "default_request_count")]
    pub request_count: usize,

    /// Percentage of dispatches that use a random offset (0..=100).
    /// 100 means pure random access and overrides every sequential mode.
    #[serde(default)]
    pub random_ratio: u8,

    /// Share one sequential cursor across all threads touching this target
    #[serde(default)]
    pub interlocked_sequential: bool,

    /// Sequential variant where the offset cursor lives in the request and
    /// fans out across the per-thread request rotation
    #[serde(default)]
    pub parallel_async: bool,

    /// First usable byte offset
    #[serde(default)]
    pub base_offset: u64,

    /// Usable extent in bytes past the base offset; 0 uses the whole target
    #[serde(default)]
    pub max_size: u64,

    /// Stride between consecutive sequential offsets and the alignment of
    /// random offsets; 0 defaults to the block size
    #[serde(default)]
    pub alignment: u64,

    /// Offset distance between the starting positions of consecutive
    /// threads (plain sequential and parallel-async only)
    #[serde(default)]
    pub thread_stride: u64,

    /// Percentage of IOs that are writes (0..=100)
    #[serde(default)]
    pub write_ratio: u8,

    /// Pause dispatch for `think_time` after every `burst_size` IOs;
    /// 0 disables think-time pacing
    #[serde(default)]
    pub burst_size: u32,

    /// Think-time pause in milliseconds
    #[serde(default)]
    pub think_time_ms: u64,

    /// Dispatch rate cap in bytes per millisecond; 0 means uncapped
    #[serde(default)]
    pub throughput_bytes_per_ms: u64,

    #[serde(default)]
    pub cache_mode: CacheMode,

    /// Access the target through a shared memory mapping (memcpy IO)
    #[serde(default)]
    pub memory_mapped: bool,

    /// Flush the mapped range after every write when the cache mode is
    /// write-through (memory-mapped targets only)
    #[serde(default)]
    pub flush_mapped_writes: bool,

    #[serde(default)]
    pub io_priority: IoPriority,

    /// Threads dedicated to this target when the timespan thread count is 0
    #[serde(default)]
    pub per_target_threads: usize,

    /// Explicit thread-to-target weighting for the fixed-thread-count mode
    #[serde(default)]
    pub thread_weights: Vec<ThreadTargetWeight>,

    /// Size to create the file with before the run; 0 leaves creation to
    /// whatever already exists on disk
    #[serde(default)]
    pub file_size: u64,

    /// Create and size the file before spawning threads
    #[serde(default)]
    pub precreate: bool,
}

fn default_request_count() -> usize {
    1
}

impl TargetSpec {
    /// Stride advance / alignment with the block-size default applied
    pub fn effective_alignment(&self) -> u64 {
        if self.alignment > 0 {
            self.alignment
        } else {
            self.block_size
        }
    }

    pub fn think_time(&self) -> Duration {
        Duration::from_millis(self.think_time_ms)
    }

    /// True when either pacing mechanism is configured
    pub fn is_paced(&self) -> bool {
        self.throughput_bytes_per_ms > 0 || (self.burst_size > 0 && self.think_time_ms > 0)
    }

    /// Weight of `thread_index` against this target in fixed-thread-count
    /// mode: the explicit override if present, otherwise 1
    pub fn weight_for_thread(&self, thread_index: usize) -> u32 {
        self.thread_weights
            .iter()
            .find(|w| w.thread_index == thread_index)
            .map(|w| w.weight)
            .unwrap_or(1)
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            block_size: 64 * 1024,
            request_count: 1,
            random_ratio: 0,
            interlocked_sequential: false,
            parallel_async: false,
            base_offset: 0,
            max_size: 0,
            alignment: 0,
            thread_stride: 0,
            write_ratio: 0,
            burst_size: 0,
            think_time_ms: 0,
            throughput_bytes_per_ms: 0,
            cache_mode: CacheMode::Buffered,
            memory_mapped: false,
            flush_mapped_writes: false,
            io_priority: IoPriority::Normal,
            per_target_threads: 1,
            thread_weights: Vec::new(),
            file_size: 0,
            precreate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetSpec {
        TargetSpec {
            path: PathBuf::from("/tmp/t.dat"),
            block_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_effective_alignment_defaults_to_block() {
        let mut t = target();
        assert_eq!(t.effective_alignment(), 4096);
        t.alignment = 512;
        assert_eq!(t.effective_alignment(), 512);
    }

    #[test]
    fn test_effective_thread_count() {
        let ts = TimeSpan {
            duration_secs: 1,
            warmup_secs: 0,
            cooldown_secs: 0,
            thread_count: 4,
            random_seed: 0,
            completion_callbacks: false,
            disable_affinity: false,
            measure_latency: false,
            measure_iops_stddev: false,
            io_bucket_duration_ms: 1000,
            affinity_assignment: Vec::new(),
            targets: vec![target(), target()],
        };
        assert_eq!(ts.effective_thread_count(), 4);

        let mut derived = ts.clone();
        derived.thread_count = 0;
        derived.targets[0].per_target_threads = 2;
        derived.targets[1].per_target_threads = 3;
        assert_eq!(derived.effective_thread_count(), 5);
    }

    #[test]
    fn test_weight_override() {
        let mut t = target();
        t.thread_weights = vec![ThreadTargetWeight {
            thread_index: 1,
            weight: 3,
        }];
        assert_eq!(t.weight_for_thread(0), 1);
        assert_eq!(t.weight_for_thread(1), 3);
    }
}
