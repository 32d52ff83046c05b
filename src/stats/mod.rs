//! Result accumulation and aggregation
//!
//! Each worker thread owns one `ThreadResults` with a `TargetResults` slot
//! per target it touches. Workers append to their own slot only while the
//! coordinator has accounting enabled (the measurement window); nothing
//! else touches a thread's results until the thread has exited, after which
//! the coordinator merges everything into a `TimeSpanResults`.

pub mod bucketizer;
pub mod histogram;

pub use bucketizer::IopsBucketizer;
pub use histogram::LatencyHistogram;

use crate::util::cpu::CpuUtilization;
use crate::Result;
use std::time::Duration;

/// Kind of a completed IO, for statistics routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Per-thread, per-target counters and accumulators
#[derive(Debug, Clone)]
pub struct TargetResults {
    pub read_count: u64,
    pub bytes_read: u64,
    pub write_count: u64,
    pub bytes_written: u64,
    pub read_latency: LatencyHistogram,
    pub write_latency: LatencyHistogram,
    pub read_buckets: IopsBucketizer,
    pub write_buckets: IopsBucketizer,
    /// Offset range this thread distributed IOs over, for reporting
    pub offset_span: (u64, u64),
}

impl TargetResults {
    pub fn new(bucket_duration: Duration) -> Self {
        Self {
            read_count: 0,
            bytes_read: 0,
            write_count: 0,
            bytes_written: 0,
            read_latency: LatencyHistogram::new(),
            write_latency: LatencyHistogram::new(),
            read_buckets: IopsBucketizer::new(bucket_duration),
            write_buckets: IopsBucketizer::new(bucket_duration),
            offset_span: (0, 0),
        }
    }

    /// Append one completed IO. `latency` is present only when latency
    /// measurement is enabled; `since_start` only when IOPS bucketizing is.
    pub fn record(
        &mut self,
        kind: IoKind,
        bytes: u64,
        latency: Option<Duration>,
        since_start: Option<Duration>,
    ) {
        match kind {
            IoKind::Read => {
                self.read_count += 1;
                self.bytes_read += bytes;
                if let Some(lat) = latency {
                    self.read_latency.record(lat);
                }
                if let Some(t) = since_start {
                    self.read_buckets.record(t);
                }
            }
            IoKind::Write => {
                self.write_count += 1;
                self.bytes_written += bytes;
                if let Some(lat) = latency {
                    self.write_latency.record(lat);
                }
                if let Some(t) = since_start {
                    self.write_buckets.record(t);
                }
            }
        }
    }

    pub fn io_count(&self) -> u64 {
        self.read_count + self.write_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }

    /// Combined read+write latency distribution
    pub fn io_latency(&self) -> LatencyHistogram {
        let mut combined = self.read_latency.clone();
        // Merge of identically-bounded histograms cannot fail.
        let _ = combined.merge(&self.write_latency);
        combined
    }

    pub fn merge(&mut self, other: &TargetResults) -> Result<()> {
        // Span first: a slot that saw no IO contributes nothing to it.
        if other.io_count() > 0 {
            self.offset_span = if self.io_count() == 0 {
                other.offset_span
            } else {
                (
                    self.offset_span.0.min(other.offset_span.0),
                    self.offset_span.1.max(other.offset_span.1),
                )
            };
        }
        self.read_count += other.read_count;
        self.bytes_read += other.bytes_read;
        self.write_count += other.write_count;
        self.bytes_written += other.bytes_written;
        self.read_latency.merge(&other.read_latency)?;
        self.write_latency.merge(&other.write_latency)?;
        self.read_buckets.merge(&other.read_buckets);
        self.write_buckets.merge(&other.write_buckets);
        Ok(())
    }
}

/// Everything one worker thread produced for one timespan
#[derive(Debug, Clone)]
pub struct ThreadResults {
    pub thread_index: usize,
    /// One slot per target in the timespan's target list; threads that do
    /// not touch a target leave its slot at zero
    pub targets: Vec<TargetResults>,
}

impl ThreadResults {
    pub fn new(thread_index: usize, target_count: usize, bucket_duration: Duration) -> Self {
        Self {
            thread_index,
            targets: (0..target_count)
                .map(|_| TargetResults::new(bucket_duration))
                .collect(),
        }
    }

    pub fn io_count(&self) -> u64 {
        self.targets.iter().map(|t| t.io_count()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.targets.iter().map(|t| t.total_bytes()).sum()
    }
}

/// Aggregate of one timespan: every thread's results plus the CPU deltas
/// snapshotted around the measurement window
#[derive(Debug)]
pub struct TimeSpanResults {
    pub thread_count: usize,
    /// Actual measured duration; zero when the run was interrupted before
    /// measurement began
    pub actual_duration: Duration,
    /// External stop arrived before the measurement window opened
    pub interrupted: bool,
    pub threads: Vec<ThreadResults>,
    pub cpu: CpuUtilization,
}

impl TimeSpanResults {
    pub fn io_count(&self) -> u64 {
        self.threads.iter().map(|t| t.io_count()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.threads.iter().map(|t| t.total_bytes()).sum()
    }

    /// Merge every thread's slot for each target into one `TargetResults`
    /// per target
    pub fn per_target_totals(&self, bucket_duration: Duration) -> Result<Vec<TargetResults>> {
        let target_count = self
            .threads
            .first()
            .map(|t| t.targets.len())
            .unwrap_or(0);
        let mut totals: Vec<TargetResults> = (0..target_count)
            .map(|_| TargetResults::new(bucket_duration))
            .collect();
        for thread in &self.threads {
            for (total, slot) in totals.iter_mut().zip(thread.targets.iter()) {
                total.merge(slot)?;
            }
        }
        Ok(totals)
    }
}

/// Final output of a run: one aggregate per requested timespan
#[derive(Debug)]
pub struct Results {
    pub timespans: Vec<TimeSpanResults>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> Duration {
        Duration::from_millis(100)
    }

    #[test]
    fn test_record_routes_by_kind() {
        let mut r = TargetResults::new(bucket());
        r.record(IoKind::Read, 4096, Some(Duration::from_micros(50)), None);
        r.record(IoKind::Write, 8192, Some(Duration::from_micros(70)), None);
        r.record(IoKind::Read, 4096, None, None);
        assert_eq!(r.read_count, 2);
        assert_eq!(r.bytes_read, 8192);
        assert_eq!(r.write_count, 1);
        assert_eq!(r.bytes_written, 8192);
        assert_eq!(r.io_count(), 3);
        assert_eq!(r.read_latency.sample_count(), 1);
        assert_eq!(r.write_latency.sample_count(), 1);
        assert_eq!(r.io_latency().sample_count(), 2);
    }

    #[test]
    fn test_merge_associativity() {
        let mut a = TargetResults::new(bucket());
        let mut b = TargetResults::new(bucket());
        let mut c = TargetResults::new(bucket());
        for i in 0..10u64 {
            a.record(
                IoKind::Read,
                4096,
                Some(Duration::from_micros(10 + i)),
                Some(Duration::from_millis(i * 20)),
            );
            b.record(
                IoKind::Write,
                4096,
                Some(Duration::from_micros(100 + i)),
                Some(Duration::from_millis(i * 30)),
            );
            c.record(
                IoKind::Read,
                4096,
                Some(Duration::from_micros(1000 + i)),
                Some(Duration::from_millis(i * 40)),
            );
        }

        // (a+b)+c vs a+(b+c)
        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();
        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left.io_count(), right.io_count());
        assert_eq!(left.total_bytes(), right.total_bytes());
        assert_eq!(
            left.io_latency().percentile(50.0),
            right.io_latency().percentile(50.0)
        );
        assert_eq!(left.io_latency().mean(), right.io_latency().mean());
        assert_eq!(left.read_buckets.buckets(), right.read_buckets.buckets());
        assert_eq!(left.write_buckets.buckets(), right.write_buckets.buckets());
    }

    #[test]
    fn test_per_target_totals() {
        let mut t0 = ThreadResults::new(0, 2, bucket());
        let mut t1 = ThreadResults::new(1, 2, bucket());
        t0.targets[0].record(IoKind::Read, 4096, None, None);
        t0.targets[1].record(IoKind::Write, 4096, None, None);
        t1.targets[0].record(IoKind::Read, 4096, None, None);

        let span = TimeSpanResults {
            thread_count: 2,
            actual_duration: Duration::from_secs(1),
            interrupted: false,
            threads: vec![t0, t1],
            cpu: CpuUtilization::default(),
        };
        let totals = span.per_target_totals(bucket()).unwrap();
        assert_eq!(totals[0].read_count, 2);
        assert_eq!(totals[1].write_count, 1);
        assert_eq!(span.io_count(), 3);
    }
}
