//! Command-line interface
//!
//! The CLI covers the common single-timespan case; multi-timespan runs are
//! described in a TOML profile (see [`super::profile`]). Arguments map
//! one-to-one onto `TargetSpec`/`TimeSpan` fields.

use super::{CacheMode, TargetSpec, TimeSpan, WorkloadSpec};
use crate::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ioforge",
    version,
    about = "Storage micro-benchmark driving phased, paced IO workloads"
)]
pub struct Cli {
    /// Target file or block device (omit when using --profile)
    pub target: Option<PathBuf>,

    /// TOML workload profile describing one or more timespans
    #[arg(long, conflicts_with = "target")]
    pub profile: Option<PathBuf>,

    /// IO block size (accepts K/M/G suffixes)
    #[arg(short = 'b', long, default_value = "64K", value_parser = parse_size)]
    pub block_size: u64,

    /// Measurement duration in seconds
    #[arg(short = 'd', long, default_value_t = 10)]
    pub duration: u64,

    /// Warmup seconds before measurement
    #[arg(short = 'W', long, default_value_t = 5)]
    pub warmup: u64,

    /// Cooldown seconds after measurement
    #[arg(short = 'C', long, default_value_t = 0)]
    pub cooldown: u64,

    /// Worker thread count
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,

    /// Overlapped requests per thread
    #[arg(short = 'o', long, default_value_t = 1)]
    pub requests: usize,

    /// Percentage of IOs that are writes
    #[arg(short = 'w', long, default_value_t = 0)]
    pub write_ratio: u8,

    /// Percentage of dispatches using random offsets (100 = pure random)
    #[arg(short = 'r', long, default_value_t = 0)]
    pub random_ratio: u8,

    /// Share one sequential cursor across all threads
    #[arg(long)]
    pub interlocked: bool,

    /// Keep the sequential cursor in each request (parallel-async)
    #[arg(long)]
    pub parallel_async: bool,

    /// Base offset into the target (accepts K/M/G suffixes)
    #[arg(long, default_value = "0", value_parser = parse_size)]
    pub base: u64,

    /// Usable extent past the base offset; 0 uses the whole target
    #[arg(long, default_value = "0", value_parser = parse_size)]
    pub max_size: u64,

    /// Stride between sequential offsets; defaults to the block size
    #[arg(long, default_value = "0", value_parser = parse_size)]
    pub stride: u64,

    /// Offset distance between consecutive threads' starting positions
    #[arg(long, default_value = "0", value_parser = parse_size)]
    pub thread_stride: u64,

    /// Dispatch rate cap in MiB/s per target; 0 means uncapped
    #[arg(long, default_value_t = 0)]
    pub rate_mbps: u64,

    /// Think time in milliseconds after every burst
    #[arg(long, default_value_t = 0)]
    pub think_time: u64,

    /// IOs per burst before a think-time pause
    #[arg(long, default_value_t = 0)]
    pub burst: u32,

    /// Bypass the page cache (O_DIRECT)
    #[arg(long)]
    pub direct: bool,

    /// Write-through (O_SYNC)
    #[arg(long)]
    pub write_through: bool,

    /// Access the target through a shared memory mapping
    #[arg(long)]
    pub mmap: bool,

    /// Random seed
    #[arg(short = 'S', long, default_value_t = 0)]
    pub seed: u64,

    /// Record per-IO completion latency
    #[arg(short = 'L', long)]
    pub latency: bool,

    /// Bucketize completions to compute IOPS standard deviation
    #[arg(long)]
    pub iops_stddev: bool,

    /// Bucket width in milliseconds for --iops-stddev
    #[arg(long, default_value_t = 1000)]
    pub bucket_duration: u64,

    /// Use the callback dispatch strategy for overlapped IO
    #[arg(long)]
    pub callbacks: bool,

    /// Do not pin worker threads to processors
    #[arg(long)]
    pub no_affinity: bool,

    /// Create the target file at this size before the run
    #[arg(long, default_value = "0", value_parser = parse_size)]
    pub file_size: u64,

    /// Emit results as JSON instead of text
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Build a single-timespan workload spec from the flags
    pub fn to_spec(&self) -> Result<WorkloadSpec> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| anyhow::anyhow!("a target path or --profile is required"))?;

        let cache_mode = match (self.direct, self.write_through) {
            (true, true) => CacheMode::UnbufferedWriteThrough,
            (true, false) => CacheMode::Unbuffered,
            (false, true) => CacheMode::WriteThrough,
            (false, false) => CacheMode::Buffered,
        };

        let spec = TargetSpec {
            path: target,
            block_size: self.block_size,
            request_count: self.requests,
            random_ratio: self.random_ratio,
            interlocked_sequential: self.interlocked,
            parallel_async: self.parallel_async,
            base_offset: self.base,
            max_size: self.max_size,
            alignment: self.stride,
            thread_stride: self.thread_stride,
            write_ratio: self.write_ratio,
            burst_size: self.burst,
            think_time_ms: self.think_time,
            // MiB/s -> bytes/ms
            throughput_bytes_per_ms: self.rate_mbps * 1024 * 1024 / 1000,
            cache_mode,
            memory_mapped: self.mmap,
            flush_mapped_writes: self.mmap && self.write_through,
            io_priority: Default::default(),
            per_target_threads: self.threads.max(1),
            thread_weights: Vec::new(),
            file_size: self.file_size,
            precreate: self.file_size > 0,
        };

        Ok(WorkloadSpec {
            timespans: vec![TimeSpan {
                duration_secs: self.duration,
                warmup_secs: self.warmup,
                cooldown_secs: self.cooldown,
                thread_count: self.threads,
                random_seed: self.seed,
                completion_callbacks: self.callbacks,
                disable_affinity: self.no_affinity,
                measure_latency: self.latency,
                measure_iops_stddev: self.iops_stddev,
                io_bucket_duration_ms: self.bucket_duration,
                affinity_assignment: Vec::new(),
                targets: vec![spec],
            }],
        })
    }
}

/// Parse a byte size with an optional K/M/G/T suffix (powers of 1024)
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, multiplier) = match s.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 1024u64),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        'T' => (&s[..s.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (s, 1),
        c => return Err(format!("unknown size suffix '{}'", c)),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows", s))
}
