//! Processor binding for worker threads

use crate::Result;
use anyhow::Context;

/// Bind the current thread to one processor
///
/// Workers are pinned round-robin so a thread's cache and its IO completions
/// stay on one core for the whole run.
#[cfg(target_os = "linux")]
pub fn bind_current_thread(processor: usize) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if processor >= 1024 {
        anyhow::bail!("processor id {} is too large (max 1023)", processor);
    }

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);
        CPU_SET(processor, &mut cpu_set);

        // 0 binds the calling thread
        let rc = sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &cpu_set);
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).with_context(|| format!("failed to bind thread to processor {}", processor));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn bind_current_thread(_processor: usize) -> Result<()> {
    anyhow::bail!("processor affinity is only supported on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_bind_to_first_processor() {
        assert!(bind_current_thread(0).is_ok());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_out_of_range_processor_rejected() {
        assert!(bind_current_thread(4096).is_err());
    }
}
