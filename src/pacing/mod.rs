//! Throughput pacing
//!
//! Per-target rate limiting with two independent mechanisms usable
//! together:
//!
//! - **Throttling**: a cap in bytes/ms. The meter answers "sleep this long
//!   before issuing the next IO" so that completed bytes never run ahead of
//!   `elapsed * rate` by more than one block.
//! - **Think time / burst**: after every `burst_size` IOs, delay until
//!   `now + think_time`.
//!
//! `adjust()` must be called exactly once per IO with the byte count fed to
//! the meter (the worker feeds the requested block size at dispatch so that
//! pacing reacts to issue rate, not completion rate). When both mechanisms
//! are configured, an active think-time window wins; once it passes, the
//! throttle floor applies.

use std::time::{Duration, Instant};

/// Per-target pacing state
#[derive(Debug)]
pub struct ThroughputMeter {
    running: bool,
    start: Instant,
    /// Rate cap in bytes per millisecond; 0 disables throttling
    bytes_per_ms: u64,
    block_size: u64,
    /// Pause after every `burst_size` IOs; 0 disables think time
    burst_size: u32,
    think_time: Duration,
    bytes_counted: u64,
    ios_in_burst: u32,
    delay_until: Option<Instant>,
}

impl ThroughputMeter {
    /// Build an idle meter; it imposes no delay until [`start`](Self::start)
    /// is called.
    pub fn new(bytes_per_ms: u64, block_size: u64, think_time: Duration, burst_size: u32) -> Self {
        Self {
            running: false,
            start: Instant::now(),
            bytes_per_ms,
            block_size,
            burst_size,
            think_time,
            bytes_counted: 0,
            ios_in_burst: 0,
            delay_until: None,
        }
    }

    /// Begin metering from now. Resets all counters.
    pub fn start(&mut self) {
        self.running = true;
        self.start = Instant::now();
        self.bytes_counted = 0;
        self.ios_in_burst = 0;
        self.delay_until = None;
    }

    /// A meter that is not running imposes no delay; callers skip it
    /// entirely for zero-cost dispatch.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// How long the caller must wait before issuing the next IO.
    /// Zero means "issue now".
    pub fn sleep_time(&self) -> Duration {
        if !self.running {
            return Duration::ZERO;
        }
        let now = Instant::now();

        // An active think-time window takes precedence over the throttle.
        if let Some(until) = self.delay_until {
            if now < until {
                return until - now;
            }
        }

        self.throttle_time(now)
    }

    /// Record one IO worth `bytes` toward both pacing mechanisms
    pub fn adjust(&mut self, bytes: u64) {
        if !self.running {
            return;
        }
        self.bytes_counted += bytes;

        if self.burst_size > 0 {
            self.ios_in_burst += 1;
            if self.ios_in_burst >= self.burst_size {
                self.ios_in_burst = 0;
                self.delay_until = Some(Instant::now() + self.think_time);
            }
        }
    }

    fn throttle_time(&self, now: Instant) -> Duration {
        if self.bytes_per_ms == 0 {
            return Duration::ZERO;
        }
        let elapsed_ms = now.duration_since(self.start).as_millis() as u64;
        let budget = elapsed_ms.saturating_mul(self.bytes_per_ms);
        if budget >= self.bytes_counted + self.block_size {
            return Duration::ZERO;
        }
        // Sleep until the budget catches up with one more block.
        let wanted = self.bytes_counted + self.block_size;
        let needed_ms = (wanted + self.bytes_per_ms - 1) / self.bytes_per_ms;
        Duration::from_millis((needed_ms - elapsed_ms).max(1))
    }
}
