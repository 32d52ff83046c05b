//! Worker threads
//!
//! One worker per configured thread. A worker owns its IO backend, its
//! request slots, a sequencer and meter per assigned target, and its own
//! results; nothing mutable is shared with other workers except the
//! interlocked-sequential cursors and the run context flags.
//!
//! Three dispatch strategies cover the spectrum from strict one-at-a-time
//! IO to fully overlapped queues:
//!
//! - **Synchronous**: issue, complete, repeat. No overlap.
//! - **Completion queue**: keep every free slot issued (subject to pacing),
//!   then drain whatever the backend has finished.
//! - **Callback**: prime every slot once, then re-issue each slot from its
//!   own completion.
//!
//! All strategies share one dispatch routine and one completion routine, so
//! pacing, offset sequencing, latency stamping and statistics behave
//! identically regardless of how IOs are driven.

pub mod affinity;

use crate::config::{IoPriority, TargetSpec};
use crate::coordinator::RunContext;
use crate::engine::{create_backend, IoBackend, IoEvent, IoOp, OpKind};
use crate::pacing::ThroughputMeter;
use crate::request::IoRequest;
use crate::sequencer::{OffsetSequencer, SharedCursor, NO_PREVIOUS_OFFSET};
use crate::stats::{IoKind, ThreadResults};
use crate::target::TargetHandle;
use crate::util::buffer::RandomContent;
use crate::Result;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nap between polls when nothing is ready; short enough to notice a stop
/// request promptly
const IDLE_POLL: Duration = Duration::from_micros(100);

/// How IOs are driven through the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    Synchronous,
    CompletionQueue,
    Callback,
}

/// One target as assigned to one worker
pub struct WorkerTarget {
    /// Index into the timespan's target list, for result slots
    pub spec_idx: usize,
    pub spec: TargetSpec,
    pub handle: Arc<TargetHandle>,
    /// Present exactly when the target is interlocked-sequential
    pub shared_cursor: Option<Arc<SharedCursor>>,
    /// This thread's position among the threads on this target
    pub relative_index: usize,
    /// Rotation weight; the coordinator filters out zero weights
    pub weight: u32,
}

/// Everything the coordinator hands a worker thread
pub struct WorkerParams {
    pub thread_index: usize,
    pub strategy: DispatchStrategy,
    pub targets: Vec<WorkerTarget>,
    /// Total targets in the timespan (result slots span all of them)
    pub total_target_count: usize,
    pub random_seed: u64,
    pub measure_latency: bool,
    pub measure_iops_stddev: bool,
    pub bucket_duration: Duration,
    /// Processor to pin to; `None` leaves scheduling to the kernel
    pub processor: Option<usize>,
}

struct TargetState {
    spec_idx: usize,
    spec: TargetSpec,
    handle: Arc<TargetHandle>,
    sequencer: OffsetSequencer,
    /// Thread-level sequential cursor; parallel-async keeps its cursors in
    /// the request slots instead
    prev_offset: u64,
    meter: ThroughputMeter,
}

/// A worker thread's execution state
pub struct Worker {
    params: WorkerParams,
    ctx: Arc<RunContext>,
    backend: Box<dyn IoBackend>,
    targets: Vec<TargetState>,
    requests: Vec<IoRequest>,
    /// Backing storage for the slots' write-source windows
    _content: RandomContent,
    rng: Xoshiro256PlusPlus,
    results: ThreadResults,
    /// Set when the measurement window opens, for IOPS bucketizing
    measure_start: Option<Instant>,
}

impl Worker {
    pub fn new(params: WorkerParams, ctx: Arc<RunContext>) -> Result<Self> {
        debug_assert!(!params.targets.is_empty());

        let seed = params
            .random_seed
            .wrapping_add(params.thread_index as u64 * 0x9e37_79b9_7f4a_7c15);

        let slots: usize = params.targets.iter().map(|t| t.spec.request_count).sum();
        let max_block = params
            .targets
            .iter()
            .map(|t| t.spec.block_size)
            .max()
            .unwrap_or(4096) as usize;
        let any_direct = params.targets.iter().any(|t| t.spec.cache_mode.is_unbuffered());
        let alignment = if any_direct { 4096 } else { 512 };

        let content = RandomContent::new(max_block, slots, alignment, seed);

        let rotation: Vec<(usize, u32)> = params
            .targets
            .iter()
            .enumerate()
            .map(|(local, t)| (local, t.weight))
            .collect();
        let requests: Vec<IoRequest> = (0..slots)
            .map(|slot| {
                IoRequest::new(
                    slot,
                    rotation.clone(),
                    max_block,
                    alignment,
                    content.slot_ptr(slot, max_block),
                )
            })
            .collect();

        let any_mapped = params.targets.iter().any(|t| t.spec.memory_mapped);
        let overlapped = params.strategy != DispatchStrategy::Synchronous;
        let mut backend = create_backend(any_mapped, overlapped);
        backend.prepare(slots)?;

        let mut targets = Vec::with_capacity(params.targets.len());
        for target in &params.targets {
            backend.register(target.handle.fd(), target.handle.size())?;
            let sequencer = OffsetSequencer::new(
                &target.spec,
                target.handle.size(),
                target.relative_index,
                seed.wrapping_add(target.spec_idx as u64),
                target.shared_cursor.clone(),
            );
            let meter = ThroughputMeter::new(
                target.spec.throughput_bytes_per_ms,
                target.spec.block_size,
                target.spec.think_time(),
                target.spec.burst_size,
            );
            targets.push(TargetState {
                spec_idx: target.spec_idx,
                spec: target.spec.clone(),
                handle: Arc::clone(&target.handle),
                sequencer,
                prev_offset: NO_PREVIOUS_OFFSET,
                meter,
            });
        }

        let results = ThreadResults::new(
            params.thread_index,
            params.total_target_count,
            params.bucket_duration,
        );

        Ok(Self {
            params,
            ctx,
            backend,
            targets,
            requests,
            _content: content,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            results,
            measure_start: None,
        })
    }

    /// Run until the coordinator requests a stop. Signals `ready` once
    /// setup is complete, then blocks on the start gate.
    pub fn run(mut self, ready: crossbeam::channel::Sender<usize>) -> Result<ThreadResults> {
        let setup = self
            .params
            .processor
            .map_or(Ok(()), affinity::bind_current_thread);
        self.apply_io_priority();

        // Ready is always signalled, even on a failed bind, so the
        // coordinator never waits on a thread that already gave up.
        let _ = ready.send(self.params.thread_index);
        if let Err(e) = setup {
            self.ctx.flag_error();
            return Err(e);
        }
        if !self.ctx.wait_for_start() {
            // Stopped before the run began; nothing to do.
            self.backend.shutdown()?;
            return Ok(self.results);
        }

        for state in &mut self.targets {
            if state.spec.is_paced() {
                state.meter.start();
            }
        }

        tracing::debug!(thread = self.params.thread_index, "worker running");
        let outcome = match self.params.strategy {
            DispatchStrategy::Synchronous => self.run_synchronous(),
            DispatchStrategy::CompletionQueue => self.run_completion_queue(),
            DispatchStrategy::Callback => self.run_callback(),
        };
        if let Err(e) = outcome {
            tracing::error!(thread = self.params.thread_index, "worker failed: {:#}", e);
            self.ctx.flag_error();
        }

        self.drain()?;
        self.backend.shutdown()?;
        Ok(self.results)
    }

    fn run_synchronous(&mut self) -> Result<()> {
        while !self.ctx.should_stop() {
            self.observe_measurement_start();

            // One pass over the slots: paced-out slots are skipped, and only
            // when every slot was skipped does the thread sleep toward the
            // nearest pacing deadline.
            let mut issued = 0usize;
            let mut min_delay: Option<Duration> = None;
            for slot in 0..self.requests.len() {
                if self.ctx.should_stop() {
                    break;
                }
                let local = self.requests[slot].peek_target();
                let delay = self.targets[local].meter.sleep_time();
                if !delay.is_zero() {
                    min_delay = Some(min_delay.map_or(delay, |d| d.min(delay)));
                    continue;
                }
                self.dispatch(slot)?;
                issued += 1;
                let events = self.backend.poll()?;
                for event in events {
                    self.complete(event);
                }
            }
            if issued == 0 {
                // Capped so stop requests are noticed quickly.
                let nap = min_delay
                    .unwrap_or(IDLE_POLL)
                    .min(Duration::from_millis(1))
                    .max(IDLE_POLL);
                std::thread::sleep(nap);
            }
        }
        Ok(())
    }

    fn run_completion_queue(&mut self) -> Result<()> {
        while !self.ctx.should_stop() {
            self.observe_measurement_start();

            // Issue phase: fill every free slot whose meter allows it,
            // remembering the shortest pacing delay among the blocked ones.
            let mut dispatched = 0usize;
            let mut min_delay: Option<Duration> = None;
            for slot in 0..self.requests.len() {
                if self.requests[slot].in_flight {
                    continue;
                }
                let local = self.requests[slot].peek_target();
                let delay = self.targets[local].meter.sleep_time();
                if delay.is_zero() {
                    self.dispatch(slot)?;
                    dispatched += 1;
                } else {
                    min_delay = Some(min_delay.map_or(delay, |d| d.min(delay)));
                }
            }

            let events = self.backend.poll()?;
            let completed = events.len();
            for event in events {
                self.complete(event);
            }

            if dispatched == 0 && completed == 0 {
                // Sleep toward the nearest pacing deadline, capped so stop
                // requests are noticed quickly.
                let nap = min_delay
                    .unwrap_or(IDLE_POLL)
                    .min(Duration::from_millis(1))
                    .max(IDLE_POLL);
                std::thread::sleep(nap);
            }
        }
        Ok(())
    }

    fn run_callback(&mut self) -> Result<()> {
        // Prime every slot; pacing takes over from the first completion.
        for slot in 0..self.requests.len() {
            self.dispatch(slot)?;
        }
        while !self.ctx.should_stop() {
            self.observe_measurement_start();
            let events = self.backend.poll()?;
            if events.is_empty() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            for event in events {
                let slot = event.token as usize;
                let was_flush = event.kind == OpKind::Flush;
                self.complete(event);
                if was_flush || self.ctx.should_stop() || self.requests[slot].in_flight {
                    continue;
                }
                let local = self.requests[slot].peek_target();
                let delay = self.targets[local].meter.sleep_time();
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                self.dispatch(slot)?;
            }
        }
        Ok(())
    }

    /// Reap everything still in the kernel so buffers can be freed
    fn drain(&mut self) -> Result<()> {
        while self.backend.in_flight() > 0 {
            let events = self.backend.poll()?;
            if events.is_empty() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            for event in events {
                self.complete(event);
            }
        }
        Ok(())
    }

    /// Issue the next IO from `slot` against the rotation's current target
    fn dispatch(&mut self, slot: usize) -> Result<()> {
        let entry_idx = self.requests[slot].peek_entry();
        let local = self.requests[slot].peek_target();
        let parallel = self.targets[local].spec.parallel_async;

        let prev = if parallel {
            self.requests[slot].entry(entry_idx).prev_offset
        } else {
            self.targets[local].prev_offset
        };

        let state = &mut self.targets[local];
        let offset = if parallel && prev == NO_PREVIOUS_OFFSET {
            state.sequencer.parallel_start_offset(slot)
        } else {
            state.sequencer.next_offset(prev)
        };
        let fd = state.handle.fd();
        let block = state.spec.block_size as usize;
        let write_ratio = state.spec.write_ratio;
        let flush_writes = state.spec.memory_mapped
            && state.spec.flush_mapped_writes
            && state.spec.cache_mode.is_write_through();
        if !parallel {
            state.prev_offset = offset;
        }
        // Pacing reacts to issue rate: feed the requested size at dispatch.
        state.meter.adjust(block as u64);

        let kind = if write_ratio > 0 && self.rng.gen_range(0..100u8) < write_ratio {
            OpKind::Write
        } else {
            OpKind::Read
        };

        let req = &mut self.requests[slot];
        if parallel {
            req.entry_mut(entry_idx).prev_offset = offset;
        }
        let buf = match kind {
            OpKind::Read => req.read_ptr(),
            _ => req.write_ptr() as *mut u8,
        };
        req.in_flight = true;
        req.start_stamp = self.params.measure_latency.then(Instant::now);
        req.issued_entry = entry_idx;
        req.issued_offset = offset;
        req.issued_len = block;
        req.advance_rotation();
        let token = req.token();

        tracing::trace!(slot, kind = %kind, offset, len = block, "dispatch");
        self.backend.submit(IoOp {
            kind,
            fd,
            offset,
            buf,
            len: block,
            token,
        })?;

        if kind == OpKind::Write && flush_writes {
            self.backend.submit(IoOp {
                kind: OpKind::Flush,
                fd,
                offset,
                buf: std::ptr::null_mut(),
                len: block,
                token,
            })?;
        }
        Ok(())
    }

    /// Account one finished IO; errors flag the run and request a stop
    fn complete(&mut self, event: IoEvent) {
        let slot = event.token as usize;
        let transferred = match event.result {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(slot, kind = %event.kind, "io failed: {:#}", e);
                self.requests[slot].in_flight = false;
                self.ctx.flag_error();
                return;
            }
        };

        // Trailing flush of a mapped write-through write; the write itself
        // was already accounted.
        if event.kind == OpKind::Flush {
            return;
        }

        let req = &mut self.requests[slot];
        req.in_flight = false;
        let latency = req.start_stamp.take().map(|t| t.elapsed());
        let issued_len = req.issued_len;
        let issued_offset = req.issued_offset;
        let entry_idx = req.issued_entry;
        let local = req.entry(entry_idx).target_idx;

        tracing::trace!(slot, kind = %event.kind, transferred, "complete");
        if transferred < issued_len {
            tracing::warn!(
                requested = issued_len,
                transferred,
                offset = issued_offset,
                "short transfer"
            );
        }

        if !self.ctx.accounting() {
            return;
        }
        let kind = match event.kind {
            OpKind::Read => IoKind::Read,
            _ => IoKind::Write,
        };
        let since_start = if self.params.measure_iops_stddev {
            self.measure_start.map(|t| t.elapsed())
        } else {
            None
        };
        let spec_idx = self.targets[local].spec_idx;
        let target_results = &mut self.results.targets[spec_idx];
        let end = issued_offset + transferred as u64;
        if target_results.io_count() == 0 {
            target_results.offset_span = (issued_offset, end);
        } else {
            target_results.offset_span = (
                target_results.offset_span.0.min(issued_offset),
                target_results.offset_span.1.max(end),
            );
        }
        target_results.record(kind, transferred as u64, latency, since_start);
    }

    #[inline]
    fn observe_measurement_start(&mut self) {
        if self.measure_start.is_none() && self.ctx.accounting() {
            self.measure_start = Some(Instant::now());
        }
    }

    #[cfg(target_os = "linux")]
    fn apply_io_priority(&self) {
        // Highest priority among assigned targets wins; the hint is
        // per-thread, not per-target.
        let rank = |p: IoPriority| match p {
            IoPriority::VeryLow => 0,
            IoPriority::Low => 1,
            IoPriority::Normal => 2,
            IoPriority::High => 3,
        };
        let priority = self
            .targets
            .iter()
            .map(|t| t.spec.io_priority)
            .max_by_key(|&p| rank(p))
            .unwrap_or(IoPriority::Normal);

        let (class, data): (libc::c_ulong, libc::c_ulong) = match priority {
            IoPriority::Normal => return,
            IoPriority::VeryLow => (3, 0), // idle class
            IoPriority::Low => (2, 7),
            IoPriority::High => (2, 0),
        };
        let ioprio = (class << 13) | data;
        // IOPRIO_WHO_PROCESS with who=0 targets the calling thread.
        let rc = unsafe { libc::syscall(libc::SYS_ioprio_set, 1, 0, ioprio) };
        if rc < 0 {
            // Best effort; the workload runs at default priority.
            tracing::debug!(
                "ioprio_set failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_io_priority(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0x11u8; len]).unwrap();
        path
    }

    fn worker_target(path: PathBuf, spec_idx: usize, weight: u32) -> WorkerTarget {
        let spec = TargetSpec {
            path,
            block_size: 4096,
            ..Default::default()
        };
        let handle = Arc::new(TargetHandle::open(&spec).unwrap());
        WorkerTarget {
            spec_idx,
            spec,
            handle,
            shared_cursor: None,
            relative_index: 0,
            weight,
        }
    }

    fn params(targets: Vec<WorkerTarget>, strategy: DispatchStrategy) -> WorkerParams {
        let total = targets.len();
        WorkerParams {
            thread_index: 0,
            strategy,
            targets,
            total_target_count: total,
            random_seed: 42,
            measure_latency: true,
            measure_iops_stddev: false,
            bucket_duration: Duration::from_millis(100),
            processor: None,
        }
    }

    fn drive(worker: Worker, ctx: Arc<RunContext>, run_for: Duration) -> ThreadResults {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let handle = std::thread::spawn(move || worker.run(tx));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        ctx.set_accounting(true);
        ctx.open_gate();
        std::thread::sleep(run_for);
        ctx.request_stop();
        handle.join().unwrap().unwrap()
    }

    #[test]
    fn test_synchronous_strategy_records_ios() {
        let dir = TempDir::new().unwrap();
        let path = make_file(&dir, "sync.dat", 256 * 1024);
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(vec![worker_target(path, 0, 1)], DispatchStrategy::Synchronous),
            Arc::clone(&ctx),
        )
        .unwrap();

        let results = drive(worker, ctx, Duration::from_millis(100));
        assert!(results.io_count() > 0);
        assert_eq!(results.targets[0].write_count, 0);
        assert!(results.targets[0].read_latency.sample_count() > 0);
        // Offsets stay inside the file
        assert!(results.targets[0].offset_span.1 <= 256 * 1024);
    }

    #[test]
    fn test_callback_strategy_records_ios() {
        let dir = TempDir::new().unwrap();
        let path = make_file(&dir, "cb.dat", 256 * 1024);
        let mut target = worker_target(path, 0, 1);
        target.spec.request_count = 4;
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(vec![target], DispatchStrategy::Callback),
            Arc::clone(&ctx),
        )
        .unwrap();

        let results = drive(worker, ctx, Duration::from_millis(100));
        assert!(results.io_count() > 0);
    }

    #[test]
    fn test_completion_queue_strategy_records_ios() {
        let dir = TempDir::new().unwrap();
        let path = make_file(&dir, "q.dat", 256 * 1024);
        let mut target = worker_target(path, 0, 1);
        target.spec.request_count = 8;
        target.spec.random_ratio = 100;
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(vec![target], DispatchStrategy::CompletionQueue),
            Arc::clone(&ctx),
        )
        .unwrap();

        let results = drive(worker, ctx, Duration::from_millis(100));
        assert!(results.io_count() > 0);
    }

    #[test]
    fn test_write_ratio_produces_writes() {
        let dir = TempDir::new().unwrap();
        let path = make_file(&dir, "w.dat", 256 * 1024);
        let mut target = worker_target(path.clone(), 0, 1);
        target.spec.write_ratio = 100;
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(vec![target], DispatchStrategy::Synchronous),
            Arc::clone(&ctx),
        )
        .unwrap();

        let results = drive(worker, ctx, Duration::from_millis(100));
        assert!(results.targets[0].write_count > 0);
        assert_eq!(results.targets[0].read_count, 0);
        // The write source is random content, so the file must change.
        let content = std::fs::read(&path).unwrap();
        assert!(content.iter().any(|&b| b != 0x11));
    }

    #[test]
    fn test_stop_before_start_produces_empty_results() {
        let dir = TempDir::new().unwrap();
        let path = make_file(&dir, "idle.dat", 64 * 1024);
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(vec![worker_target(path, 0, 1)], DispatchStrategy::Synchronous),
            Arc::clone(&ctx),
        )
        .unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let handle = std::thread::spawn(move || worker.run(tx));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        ctx.request_stop();
        let results = handle.join().unwrap().unwrap();
        assert_eq!(results.io_count(), 0);
    }

    #[test]
    fn test_weighted_rotation_spreads_across_targets() {
        let dir = TempDir::new().unwrap();
        let a = make_file(&dir, "a.dat", 128 * 1024);
        let b = make_file(&dir, "b.dat", 128 * 1024);
        let ctx = Arc::new(RunContext::new());
        let worker = Worker::new(
            params(
                vec![worker_target(a, 0, 3), worker_target(b, 1, 1)],
                DispatchStrategy::Synchronous,
            ),
            Arc::clone(&ctx),
        )
        .unwrap();

        let results = drive(worker, ctx, Duration::from_millis(150));
        let first = results.targets[0].io_count();
        let second = results.targets[1].io_count();
        assert!(first > 0);
        assert!(second > 0);
        // 3:1 weighting; allow slack for the accounting window edges.
        assert!(first > second);
    }
}
