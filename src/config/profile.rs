//! TOML workload profiles
//!
//! Profiles describe full multi-timespan workloads that the CLI flags
//! cannot express, e.g. several phased runs against weighted target lists.
//!
//! ```toml
//! [[timespans]]
//! duration_secs = 30
//! warmup_secs = 5
//! thread_count = 4
//! measure_latency = true
//!
//! [[timespans.targets]]
//! path = "/data/test.dat"
//! block_size = 65536
//! request_count = 8
//! random_ratio = 100
//! write_ratio = 30
//! ```

use super::WorkloadSpec;
use crate::Result;
use anyhow::Context;
use std::path::Path;

/// Load and parse a workload profile from a TOML file
pub fn load(path: &Path) -> Result<WorkloadSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile: {}", path.display()))?;
    parse(&text).with_context(|| format!("Failed to parse profile: {}", path.display()))
}

/// Parse a workload profile from TOML text
pub fn parse(text: &str) -> Result<WorkloadSpec> {
    let spec: WorkloadSpec = toml::from_str(text).context("Invalid workload profile")?;
    Ok(spec)
}
