//! Human-readable text output

use crate::config::WorkloadSpec;
use crate::stats::{IopsBucketizer, LatencyHistogram, Results, TimeSpanResults};
use crate::util::time::{calculate_iops, calculate_throughput, format_duration, format_throughput};
use crate::Result;
use std::io::Write;

/// Print run results to stdout
pub fn print_results(results: &Results, spec: &WorkloadSpec) -> Result<()> {
    let stdout = std::io::stdout();
    write_report(&mut stdout.lock(), results, spec)
}

/// Render the full report for every completed timespan
///
/// Displays per timespan:
/// - Operation counts, bytes and IOPS, split by read/write
/// - Throughput
/// - Latency distribution (when latency measurement was enabled)
/// - IOPS stability over time buckets (when bucketizing was enabled)
/// - Per-target totals and the offset span each target saw
/// - CPU utilization over the measurement window
pub fn write_report<W: Write>(w: &mut W, results: &Results, spec: &WorkloadSpec) -> Result<()> {
    for (index, (span, ts)) in results
        .timespans
        .iter()
        .zip(spec.timespans.iter())
        .enumerate()
    {
        writeln!(w, "═══════════════════════════════════════════════════════")?;
        writeln!(
            w,
            "  TIMESPAN {} / {}",
            index + 1,
            results.timespans.len()
        )?;
        writeln!(w, "═══════════════════════════════════════════════════════")?;
        write_timespan(w, span, ts.bucket_duration(), &target_paths(ts))?;
    }
    Ok(())
}

fn target_paths(ts: &crate::config::TimeSpan) -> Vec<String> {
    ts.targets
        .iter()
        .map(|t| t.path.display().to_string())
        .collect()
}

fn write_timespan<W: Write>(
    w: &mut W,
    span: &TimeSpanResults,
    bucket_duration: std::time::Duration,
    paths: &[String],
) -> Result<()> {
    if span.interrupted {
        writeln!(w)?;
        writeln!(w, "  Interrupted before the measurement window opened.")?;
        writeln!(w)?;
        return Ok(());
    }

    let duration = span.actual_duration;
    writeln!(w)?;
    writeln!(
        w,
        "Elapsed: {:.3}s   Threads: {}",
        duration.as_secs_f64(),
        span.thread_count
    )?;
    writeln!(w)?;

    let totals = span.per_target_totals(bucket_duration)?;
    let read_ops: u64 = totals.iter().map(|t| t.read_count).sum();
    let write_ops: u64 = totals.iter().map(|t| t.write_count).sum();
    let read_bytes: u64 = totals.iter().map(|t| t.bytes_read).sum();
    let write_bytes: u64 = totals.iter().map(|t| t.bytes_written).sum();

    writeln!(w, "Operations:")?;
    writeln!(
        w,
        "  Read:  {} ops ({}) - {:.0} IOPS",
        format_count(read_ops),
        format_bytes(read_bytes),
        calculate_iops(read_ops, duration)
    )?;
    writeln!(
        w,
        "  Write: {} ops ({}) - {:.0} IOPS",
        format_count(write_ops),
        format_bytes(write_bytes),
        calculate_iops(write_ops, duration)
    )?;
    writeln!(
        w,
        "  Total: {} ops ({}) - {:.0} IOPS",
        format_count(read_ops + write_ops),
        format_bytes(read_bytes + write_bytes),
        calculate_iops(read_ops + write_ops, duration)
    )?;
    writeln!(w)?;

    writeln!(w, "Throughput:")?;
    writeln!(
        w,
        "  Read:  {}",
        format_throughput(calculate_throughput(read_bytes, duration))
    )?;
    writeln!(
        w,
        "  Write: {}",
        format_throughput(calculate_throughput(write_bytes, duration))
    )?;
    writeln!(
        w,
        "  Total: {}",
        format_throughput(calculate_throughput(read_bytes + write_bytes, duration))
    )?;
    writeln!(w)?;

    let mut latency = LatencyHistogram::new();
    for t in &totals {
        latency.merge(&t.io_latency())?;
    }
    if !latency.is_empty() {
        writeln!(w, "Latency:")?;
        write_latency(w, &latency)?;
        writeln!(w)?;
    }

    let buckets = combined_buckets(&totals, bucket_duration);
    if buckets.total() > 0 {
        writeln!(w, "IOPS stability:")?;
        writeln!(
            w,
            "  {} buckets of {} - mean {:.1} IOs/bucket, stddev {:.1}",
            buckets.bucket_count(),
            format_duration(buckets.bucket_duration()),
            buckets.mean(),
            buckets.stddev()
        )?;
        writeln!(w)?;
    }

    if paths.len() > 1 || totals.len() > 1 {
        writeln!(w, "Per target:")?;
        for (i, t) in totals.iter().enumerate() {
            let name = paths.get(i).map(String::as_str).unwrap_or("?");
            writeln!(
                w,
                "  {}: {} reads, {} writes, {} - offsets [{}, {}]",
                name,
                format_count(t.read_count),
                format_count(t.write_count),
                format_bytes(t.total_bytes()),
                t.offset_span.0,
                t.offset_span.1
            )?;
        }
        writeln!(w)?;
    }

    writeln!(
        w,
        "CPU: {:.1}% average ({:.1}% kernel) over {} processors",
        span.cpu.average,
        span.cpu.average_kernel,
        span.cpu.per_processor.len()
    )?;
    writeln!(w)?;
    Ok(())
}

fn write_latency<W: Write>(w: &mut W, hist: &LatencyHistogram) -> Result<()> {
    // All accessors return Some on a non-empty histogram.
    if let (Some(min), Some(mean), Some(max)) = (hist.min(), hist.mean(), hist.max()) {
        writeln!(w, "  Min:  {}", format_duration(min))?;
        writeln!(w, "  Mean: {}", format_duration(mean))?;
        writeln!(w, "  Max:  {}", format_duration(max))?;
    }
    if let Some(stddev) = hist.stddev() {
        writeln!(w, "  Stddev: {}", format_duration(stddev))?;
    }
    writeln!(w, "  Percentiles:")?;
    for &p in &[50.0, 90.0, 95.0, 99.0, 99.9] {
        if let Some(val) = hist.percentile(p) {
            writeln!(w, "    p{:<5}: {}", p, format_duration(val))?;
        }
    }
    Ok(())
}

/// Read and write buckets of every target folded into one bucketizer
fn combined_buckets(
    totals: &[crate::stats::TargetResults],
    bucket_duration: std::time::Duration,
) -> IopsBucketizer {
    let mut combined = IopsBucketizer::new(bucket_duration);
    for t in totals {
        combined.merge(&t.read_buckets);
        combined.merge(&t.write_buckets);
    }
    combined
}

fn format_count(n: u64) -> String {
    // Thousands separators, right-to-left.
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let b = bytes as f64;
    if b >= TB {
        format!("{:.2} TiB", b / TB)
    } else if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TargetSpec, TimeSpan};
    use crate::stats::{IoKind, ThreadResults};
    use crate::util::cpu::CpuUtilization;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec(paths: &[&str]) -> WorkloadSpec {
        WorkloadSpec {
            timespans: vec![TimeSpan {
                duration_secs: 1,
                warmup_secs: 0,
                cooldown_secs: 0,
                thread_count: 1,
                random_seed: 0,
                completion_callbacks: false,
                disable_affinity: false,
                measure_latency: true,
                measure_iops_stddev: false,
                io_bucket_duration_ms: 1000,
                affinity_assignment: Vec::new(),
                targets: paths
                    .iter()
                    .map(|p| TargetSpec {
                        path: PathBuf::from(p),
                        block_size: 4096,
                        ..Default::default()
                    })
                    .collect(),
            }],
        }
    }

    fn one_span(target_count: usize) -> Results {
        let mut thread = ThreadResults::new(0, target_count, Duration::from_secs(1));
        for t in 0..target_count {
            for i in 0..100u64 {
                thread.targets[t].record(
                    IoKind::Read,
                    4096,
                    Some(Duration::from_micros(100 + i)),
                    None,
                );
            }
            thread.targets[t].record(IoKind::Write, 4096, Some(Duration::from_micros(300)), None);
            thread.targets[t].offset_span = (0, 4096 * 100);
        }
        Results {
            timespans: vec![crate::stats::TimeSpanResults {
                thread_count: 1,
                actual_duration: Duration::from_secs(2),
                interrupted: false,
                threads: vec![thread],
                cpu: CpuUtilization::default(),
            }],
        }
    }

    #[test]
    fn test_report_contains_totals() {
        let mut out = Vec::new();
        write_report(&mut out, &one_span(1), &spec(&["/tmp/a.dat"])).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("TIMESPAN 1 / 1"));
        assert!(text.contains("Total: 101 ops"));
        assert!(text.contains("Latency:"));
        assert!(text.contains("p50"));
    }

    #[test]
    fn test_multi_target_section() {
        let mut out = Vec::new();
        write_report(&mut out, &one_span(2), &spec(&["/tmp/a.dat", "/tmp/b.dat"])).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Per target:"));
        assert!(text.contains("/tmp/b.dat"));
        assert!(text.contains("offsets [0, 409600]"));
    }

    #[test]
    fn test_interrupted_span() {
        let mut results = one_span(1);
        results.timespans[0].interrupted = true;
        results.timespans[0].actual_duration = Duration::ZERO;
        let mut out = Vec::new();
        write_report(&mut out, &results, &spec(&["/tmp/a.dat"])).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Interrupted"));
        assert!(!text.contains("Operations:"));
    }

    #[test]
    fn test_format_count_groups_thousands() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(64 * 1024), "64.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50 GiB");
    }
}
