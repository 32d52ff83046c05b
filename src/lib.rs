//! ioforge - storage micro-benchmark engine
//!
//! ioforge drives configurable, high-intensity IO workloads against files,
//! partitions and raw disks, measures throughput/latency/IOPS with high
//! precision, and hands back aggregated statistics for rendering.
//!
//! # Architecture
//!
//! - **Offset sequencer**: sequential, interlocked-sequential, random and
//!   parallel-async offset generation per (thread, target, request) tuple
//! - **Throughput meter**: per-target rate caps and think-time/burst pacing
//! - **Worker loop**: per-thread driver with synchronous, completion-queue
//!   and callback dispatch strategies
//! - **Run coordinator**: start/stop barriers, warmup/measurement/cooldown
//!   phases, per-thread result aggregation and CPU utilization deltas

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod output;
pub mod pacing;
pub mod request;
pub mod sequencer;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::WorkloadSpec;
pub use coordinator::RunCoordinator;

/// Result type used throughout ioforge
pub type Result<T> = anyhow::Result<T>;
