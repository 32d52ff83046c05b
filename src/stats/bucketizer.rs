//! IOPS bucketizer
//!
//! Counts completions into fixed-width time buckets relative to the start
//! of the measurement window. The per-bucket counts yield the IOPS
//! standard deviation over a run. Thread-local instances merge elementwise
//! (associative and commutative).

use std::time::Duration;

/// Fixed-width time-bucketed completion counter
#[derive(Debug, Clone)]
pub struct IopsBucketizer {
    bucket_duration: Duration,
    buckets: Vec<u64>,
    total: u64,
}

impl IopsBucketizer {
    pub fn new(bucket_duration: Duration) -> Self {
        Self {
            bucket_duration: bucket_duration.max(Duration::from_millis(1)),
            buckets: Vec::new(),
            total: 0,
        }
    }

    pub fn bucket_duration(&self) -> Duration {
        self.bucket_duration
    }

    /// Count one completion at `since_start` past the measurement start
    #[inline]
    pub fn record(&mut self, since_start: Duration) {
        let idx = (since_start.as_nanos() / self.bucket_duration.as_nanos()) as usize;
        if idx >= self.buckets.len() {
            self.buckets.resize(idx + 1, 0);
        }
        self.buckets[idx] += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Completion counts per bucket
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Mean completions per bucket over the populated range
    pub fn mean(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        self.total as f64 / self.buckets.len() as f64
    }

    /// Population standard deviation of completions per bucket
    pub fn stddev(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .buckets
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.buckets.len() as f64;
        variance.sqrt()
    }

    /// Elementwise merge of another thread's buckets. Both sides must use
    /// the same bucket duration.
    pub fn merge(&mut self, other: &IopsBucketizer) {
        debug_assert_eq!(self.bucket_duration, other.bucket_duration);
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self.total += other.total;
    }
}
