//! JSON output formatting
//!
//! Serializes aggregated run results for machine consumption. Durations
//! carry both a microsecond count and a human-readable string so that
//! consumers never have to re-derive units.

use crate::config::WorkloadSpec;
use crate::stats::{IopsBucketizer, LatencyHistogram, Results, TargetResults, TimeSpanResults};
use crate::util::time::{calculate_iops, calculate_throughput, format_duration, format_throughput};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;

/// Duration with both microseconds and a human-readable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonDuration {
    pub micros: u64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_duration(d: Duration) -> Self {
        Self {
            micros: d.as_micros() as u64,
            human: format_duration(d),
        }
    }
}

/// Throughput with bytes/sec and a human-readable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonThroughput {
    pub bytes_per_sec: u64,
    pub human: String,
}

impl JsonThroughput {
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec as u64,
            human: format_throughput(bytes_per_sec),
        }
    }
}

/// One operation class (reads, writes or both combined)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOpClass {
    pub ops: u64,
    pub bytes: u64,
    pub iops: f64,
    pub throughput: JsonThroughput,
}

impl JsonOpClass {
    fn new(ops: u64, bytes: u64, duration: Duration) -> Self {
        Self {
            ops,
            bytes,
            iops: calculate_iops(ops, duration),
            throughput: JsonThroughput::new(calculate_throughput(bytes, duration)),
        }
    }
}

/// Latency statistics with percentiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLatency {
    pub samples: u64,
    pub min: JsonDuration,
    pub mean: JsonDuration,
    pub max: JsonDuration,
    pub stddev: JsonDuration,
    pub p50: JsonDuration,
    pub p90: JsonDuration,
    pub p95: JsonDuration,
    pub p99: JsonDuration,
    pub p99_9: JsonDuration,
}

impl JsonLatency {
    fn from_histogram(hist: &LatencyHistogram) -> Option<Self> {
        // Every accessor is Some once the histogram has a sample.
        Some(Self {
            samples: hist.sample_count(),
            min: JsonDuration::from_duration(hist.min()?),
            mean: JsonDuration::from_duration(hist.mean()?),
            max: JsonDuration::from_duration(hist.max()?),
            stddev: JsonDuration::from_duration(hist.stddev()?),
            p50: JsonDuration::from_duration(hist.percentile(50.0)?),
            p90: JsonDuration::from_duration(hist.percentile(90.0)?),
            p95: JsonDuration::from_duration(hist.percentile(95.0)?),
            p99: JsonDuration::from_duration(hist.percentile(99.0)?),
            p99_9: JsonDuration::from_duration(hist.percentile(99.9)?),
        })
    }
}

/// IOPS bucketizer summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonIopsStability {
    pub bucket_duration_ms: u64,
    pub bucket_count: usize,
    pub mean_per_bucket: f64,
    pub stddev: f64,
}

/// Per-target aggregate over all threads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTarget {
    pub path: String,
    pub read: JsonOpClass,
    pub write: JsonOpClass,
    pub offset_min: u64,
    pub offset_max: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<JsonLatency>,
}

/// CPU utilization over the measurement window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonCpu {
    pub average_percent: f64,
    pub kernel_percent: f64,
    pub per_processor: Vec<f64>,
}

/// One timespan's aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTimeSpan {
    pub duration_secs: f64,
    pub interrupted: bool,
    pub thread_count: usize,
    pub read: JsonOpClass,
    pub write: JsonOpClass,
    pub total: JsonOpClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<JsonLatency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iops_stability: Option<JsonIopsStability>,
    pub targets: Vec<JsonTarget>,
    pub cpu: JsonCpu,
}

/// Top-level report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub version: String,
    pub timespans: Vec<JsonTimeSpan>,
}

/// Build the serializable report from aggregated results
pub fn build_report(results: &Results, spec: &WorkloadSpec) -> Result<JsonReport> {
    let timespans = results
        .timespans
        .iter()
        .zip(spec.timespans.iter())
        .map(|(span, ts)| build_timespan(span, ts))
        .collect::<Result<Vec<_>>>()?;
    Ok(JsonReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        timespans,
    })
}

/// Serialize the report as pretty-printed JSON
pub fn write_report<W: Write>(w: &mut W, results: &Results, spec: &WorkloadSpec) -> Result<()> {
    let report = build_report(results, spec)?;
    serde_json::to_writer_pretty(&mut *w, &report)?;
    writeln!(w)?;
    Ok(())
}

fn build_timespan(span: &TimeSpanResults, ts: &crate::config::TimeSpan) -> Result<JsonTimeSpan> {
    let duration = span.actual_duration;
    let totals = span.per_target_totals(ts.bucket_duration())?;

    let read_ops: u64 = totals.iter().map(|t| t.read_count).sum();
    let write_ops: u64 = totals.iter().map(|t| t.write_count).sum();
    let read_bytes: u64 = totals.iter().map(|t| t.bytes_read).sum();
    let write_bytes: u64 = totals.iter().map(|t| t.bytes_written).sum();

    let mut latency = LatencyHistogram::new();
    for t in &totals {
        latency.merge(&t.io_latency())?;
    }

    let mut buckets = IopsBucketizer::new(ts.bucket_duration());
    for t in &totals {
        buckets.merge(&t.read_buckets);
        buckets.merge(&t.write_buckets);
    }
    let iops_stability = if buckets.total() > 0 {
        Some(JsonIopsStability {
            bucket_duration_ms: buckets.bucket_duration().as_millis() as u64,
            bucket_count: buckets.bucket_count(),
            mean_per_bucket: buckets.mean(),
            stddev: buckets.stddev(),
        })
    } else {
        None
    };

    let targets = totals
        .iter()
        .zip(ts.targets.iter())
        .map(|(t, target_spec)| build_target(t, &target_spec.path.display().to_string(), duration))
        .collect();

    Ok(JsonTimeSpan {
        duration_secs: duration.as_secs_f64(),
        interrupted: span.interrupted,
        thread_count: span.thread_count,
        read: JsonOpClass::new(read_ops, read_bytes, duration),
        write: JsonOpClass::new(write_ops, write_bytes, duration),
        total: JsonOpClass::new(read_ops + write_ops, read_bytes + write_bytes, duration),
        latency: JsonLatency::from_histogram(&latency),
        iops_stability,
        targets,
        cpu: JsonCpu {
            average_percent: span.cpu.average,
            kernel_percent: span.cpu.average_kernel,
            per_processor: span.cpu.per_processor.clone(),
        },
    })
}

fn build_target(t: &TargetResults, path: &str, duration: Duration) -> JsonTarget {
    JsonTarget {
        path: path.to_string(),
        read: JsonOpClass::new(t.read_count, t.bytes_read, duration),
        write: JsonOpClass::new(t.write_count, t.bytes_written, duration),
        offset_min: t.offset_span.0,
        offset_max: t.offset_span.1,
        latency: JsonLatency::from_histogram(&t.io_latency()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetSpec, TimeSpan, WorkloadSpec};
    use crate::stats::{IoKind, ThreadResults};
    use crate::util::cpu::CpuUtilization;
    use std::path::PathBuf;

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            timespans: vec![TimeSpan {
                duration_secs: 2,
                warmup_secs: 0,
                cooldown_secs: 0,
                thread_count: 1,
                random_seed: 0,
                completion_callbacks: false,
                disable_affinity: false,
                measure_latency: true,
                measure_iops_stddev: true,
                io_bucket_duration_ms: 500,
                affinity_assignment: Vec::new(),
                targets: vec![TargetSpec {
                    path: PathBuf::from("/tmp/j.dat"),
                    block_size: 4096,
                    ..Default::default()
                }],
            }],
        }
    }

    fn results() -> Results {
        let mut thread = ThreadResults::new(0, 1, Duration::from_millis(500));
        for i in 0..50u64 {
            thread.targets[0].record(
                IoKind::Read,
                4096,
                Some(Duration::from_micros(100 + i)),
                Some(Duration::from_millis(i * 40)),
            );
        }
        thread.targets[0].offset_span = (4096, 204800);
        Results {
            timespans: vec![TimeSpanResults {
                thread_count: 1,
                actual_duration: Duration::from_secs(2),
                interrupted: false,
                threads: vec![thread],
                cpu: CpuUtilization::default(),
            }],
        }
    }

    #[test]
    fn test_report_shape() {
        let report = build_report(&results(), &spec()).unwrap();
        assert_eq!(report.timespans.len(), 1);
        let ts = &report.timespans[0];
        assert_eq!(ts.read.ops, 50);
        assert_eq!(ts.read.bytes, 50 * 4096);
        assert_eq!(ts.total.iops, 25.0);
        assert!(ts.latency.is_some());
        assert_eq!(ts.targets.len(), 1);
        assert_eq!(ts.targets[0].offset_min, 4096);
        assert_eq!(ts.targets[0].offset_max, 204800);

        let stability = ts.iops_stability.as_ref().unwrap();
        assert_eq!(stability.bucket_duration_ms, 500);
        assert!(stability.bucket_count >= 4);
    }

    #[test]
    fn test_serializes_to_valid_json() {
        let mut out = Vec::new();
        write_report(&mut out, &results(), &spec()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["timespans"][0]["read"]["ops"], 50);
        assert_eq!(value["timespans"][0]["targets"][0]["path"], "/tmp/j.dat");
        assert!(value["timespans"][0]["latency"]["p50"]["micros"].is_u64());
    }

    #[test]
    fn test_empty_latency_omitted() {
        let thread = ThreadResults::new(0, 1, Duration::from_millis(500));
        let empty = Results {
            timespans: vec![TimeSpanResults {
                thread_count: 1,
                actual_duration: Duration::from_secs(1),
                interrupted: false,
                threads: vec![thread],
                cpu: CpuUtilization::default(),
            }],
        };
        let mut out = Vec::new();
        write_report(&mut out, &empty, &spec()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value["timespans"][0].get("latency").is_none());
        assert!(value["timespans"][0].get("iops_stability").is_none());
    }
}
