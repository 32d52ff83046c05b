//! System-wide CPU utilization accounting
//!
//! The coordinator snapshots per-processor counters from `/proc/stat`
//! immediately around the measurement window; the delta between the two
//! snapshots yields per-processor and average utilization for the report.

use std::fs;

/// Per-processor jiffy counters at one point in time
#[derive(Debug, Clone, Default)]
pub struct CpuSnapshot {
    /// (user+nice, system, idle+iowait, total) per processor, in jiffies
    processors: Vec<ProcessorTimes>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProcessorTimes {
    user: u64,
    system: u64,
    idle: u64,
    total: u64,
}

/// Utilization percentages computed from two snapshots
#[derive(Debug, Clone, Default)]
pub struct CpuUtilization {
    /// Busy percentage per processor, indexed by processor id
    pub per_processor: Vec<f64>,
    /// Average busy percentage across all processors
    pub average: f64,
    /// Average kernel-time percentage across all processors
    pub average_kernel: f64,
}

impl CpuSnapshot {
    /// Snapshot per-processor counters. Returns an empty snapshot on
    /// systems without `/proc/stat`; the delta then reports zeros rather
    /// than failing the run.
    pub fn take() -> Self {
        let Ok(stat) = fs::read_to_string("/proc/stat") else {
            return Self::default();
        };
        let mut processors = Vec::new();
        for line in stat.lines() {
            // Per-cpu lines are "cpuN user nice system idle iowait irq softirq ..."
            if !line.starts_with("cpu") || line.starts_with("cpu ") {
                continue;
            }
            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|f| f.parse().ok())
                .collect();
            if fields.len() < 5 {
                continue;
            }
            let user = fields[0] + fields[1];
            let system = fields[2] + fields.get(5).copied().unwrap_or(0) + fields.get(6).copied().unwrap_or(0);
            let idle = fields[3] + fields[4];
            let total: u64 = fields.iter().sum();
            processors.push(ProcessorTimes {
                user,
                system,
                idle,
                total,
            });
        }
        Self { processors }
    }

    /// Number of processors observed in the snapshot
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Utilization between `earlier` and this snapshot
    pub fn utilization_since(&self, earlier: &CpuSnapshot) -> CpuUtilization {
        let count = self.processors.len().min(earlier.processors.len());
        if count == 0 {
            return CpuUtilization::default();
        }

        let mut per_processor = Vec::with_capacity(count);
        let mut busy_sum = 0.0;
        let mut kernel_sum = 0.0;
        for i in 0..count {
            let now = self.processors[i];
            let was = earlier.processors[i];
            let total = now.total.saturating_sub(was.total);
            if total == 0 {
                per_processor.push(0.0);
                continue;
            }
            let idle = now.idle.saturating_sub(was.idle);
            let system = now.system.saturating_sub(was.system);
            let busy = 100.0 * (total - idle.min(total)) as f64 / total as f64;
            per_processor.push(busy);
            busy_sum += busy;
            kernel_sum += 100.0 * system as f64 / total as f64;
        }

        CpuUtilization {
            average: busy_sum / count as f64,
            average_kernel: kernel_sum / count as f64,
            per_processor,
        }
    }
}
