//! Run coordination
//!
//! The coordinator owns the lifecycle of a run: pre-create target files,
//! open handles, assign targets to threads, spawn workers, gate their
//! start, walk each timespan through warmup / measurement / cooldown, and
//! aggregate what the threads produced.
//!
//! Phase waits are sliced so an external stop signal or a worker error is
//! noticed within milliseconds. A stop that lands during warmup yields a
//! zero-duration "interrupted" timespan rather than an error; a stop
//! during the measurement window simply closes the window early with the
//! actual elapsed time.

pub mod topology;

use crate::config::{TimeSpan, WorkloadSpec};
use crate::sequencer::SharedCursor;
use crate::stats::{Results, ThreadResults, TimeSpanResults};
use crate::target::precreate::{self, SizePolicy};
use crate::target::HandleCache;
use crate::util::cpu::CpuSnapshot;
use crate::worker::{DispatchStrategy, Worker, WorkerParams, WorkerTarget};
use crate::Result;
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use topology::Topology;

/// Granularity of interruptible phase waits
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Shared run-control state between the coordinator and its workers
///
/// Workers only ever read the flags (and raise `failed`); the coordinator
/// drives the transitions.
pub struct RunContext {
    stop: AtomicBool,
    accounting: AtomicBool,
    failed: AtomicBool,
    gate_open: Mutex<bool>,
    gate_cv: Condvar,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            accounting: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            gate_open: Mutex::new(false),
            gate_cv: Condvar::new(),
        }
    }

    /// Release every thread blocked in [`wait_for_start`](Self::wait_for_start)
    pub fn open_gate(&self) {
        if let Ok(mut open) = self.gate_open.lock() {
            *open = true;
        }
        self.gate_cv.notify_all();
    }

    /// Block until the gate opens. Returns false when the run was stopped
    /// before it started.
    pub fn wait_for_start(&self) -> bool {
        let Ok(mut open) = self.gate_open.lock() else {
            return false;
        };
        while !*open {
            if self.should_stop() {
                return false;
            }
            let Ok((guard, _)) = self.gate_cv.wait_timeout(open, WAIT_SLICE) else {
                return false;
            };
            open = guard;
        }
        !self.should_stop()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.gate_cv.notify_all();
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn set_accounting(&self, enabled: bool) {
        self.accounting.store(enabled, Ordering::SeqCst);
    }

    #[inline]
    pub fn accounting(&self) -> bool {
        self.accounting.load(Ordering::Relaxed)
    }

    /// Raised by a worker on a fatal IO failure; also requests a stop so
    /// peers wind down at their next poll
    pub fn flag_error(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    pub fn has_error(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Hooks for embedding a run in a larger harness
pub struct ExternalControls {
    /// When set, the run blocks after setup until the flag flips true
    pub start_signal: Option<Arc<AtomicBool>>,
    /// When set, flipping the flag true interrupts the run
    pub stop_signal: Option<Arc<AtomicBool>>,
    /// Invoked right before the first timespan's warmup begins
    pub on_run_started: Option<Box<dyn Fn() + Send>>,
    /// Invoked after the last timespan completes, before results return
    pub on_run_finished: Option<Box<dyn Fn() + Send>>,
}

impl Default for ExternalControls {
    fn default() -> Self {
        Self {
            start_signal: None,
            stop_signal: None,
            on_run_started: None,
            on_run_finished: None,
        }
    }
}

impl ExternalControls {
    fn externally_stopped(&self) -> bool {
        self.stop_signal
            .as_ref()
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Drives complete benchmark runs
///
/// One coordinator handles one run at a time; a second `run` call while a
/// run is in progress fails immediately.
pub struct RunCoordinator {
    running: AtomicBool,
}

impl RunCoordinator {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    pub fn run(&self, spec: &WorkloadSpec, topology: &Topology) -> Result<Results> {
        self.run_with_controls(spec, topology, ExternalControls::default())
    }

    pub fn run_with_controls(
        &self,
        spec: &WorkloadSpec,
        topology: &Topology,
        controls: ExternalControls,
    ) -> Result<Results> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("a run is already in progress");
        }
        let outcome = self.run_inner(spec, topology, &controls);
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    fn run_inner(
        &self,
        spec: &WorkloadSpec,
        topology: &Topology,
        controls: &ExternalControls,
    ) -> Result<Results> {
        crate::config::validate(spec)?;

        let creations = precreate::plan(spec, SizePolicy::UseMaxSize);
        precreate::execute(&creations).context("target pre-creation failed")?;

        // Optional external start gate.
        if let Some(start) = &controls.start_signal {
            while !start.load(Ordering::Relaxed) {
                if controls.externally_stopped() {
                    return Ok(Results { timespans: Vec::new() });
                }
                std::thread::sleep(WAIT_SLICE);
            }
        }
        if let Some(hook) = &controls.on_run_started {
            hook();
        }

        // Every configured timespan reports, even after an interruption;
        // once the external stop is raised the remaining timespans each
        // come back as a zero-duration interrupted entry.
        let mut timespans = Vec::with_capacity(spec.timespans.len());
        for (index, timespan) in spec.timespans.iter().enumerate() {
            tracing::info!(timespan = index, "starting timespan");
            let result = self.run_timespan(timespan, topology, controls)?;
            if result.interrupted {
                tracing::info!(timespan = index, "timespan interrupted before measurement");
            }
            timespans.push(result);
        }

        if let Some(hook) = &controls.on_run_finished {
            hook();
        }
        Ok(Results { timespans })
    }

    fn run_timespan(
        &self,
        timespan: &TimeSpan,
        topology: &Topology,
        controls: &ExternalControls,
    ) -> Result<TimeSpanResults> {
        let ctx = Arc::new(RunContext::new());
        let cache = HandleCache::new();

        // One shared cursor per interlocked target, shared by every thread
        // the assignment puts on it.
        let cursors: Vec<Option<Arc<SharedCursor>>> = timespan
            .targets
            .iter()
            .map(|t| t.interlocked_sequential.then(|| Arc::new(SharedCursor::new())))
            .collect();

        let assignments = assign_threads(timespan, &cache, &cursors)?;
        let thread_count = assignments.len();

        let mut workers = Vec::with_capacity(thread_count);
        for (thread_index, targets) in assignments.into_iter().enumerate() {
            let strategy = select_strategy(timespan, &targets);
            let processor = if timespan.disable_affinity {
                None
            } else {
                Some(topology.processor_for(thread_index, &timespan.affinity_assignment))
            };
            let params = WorkerParams {
                thread_index,
                strategy,
                targets,
                total_target_count: timespan.targets.len(),
                random_seed: timespan.random_seed,
                measure_latency: timespan.measure_latency,
                measure_iops_stddev: timespan.measure_iops_stddev,
                bucket_duration: timespan.bucket_duration(),
                processor,
            };
            workers.push(Worker::new(params, Arc::clone(&ctx))?);
        }

        // Spawn, then wait for every thread to finish setup before the
        // warmup clock starts.
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(thread_count);
        let mut handles = Vec::with_capacity(thread_count);
        for (thread_index, worker) in workers.into_iter().enumerate() {
            let tx = ready_tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("ioforge-worker-{}", thread_index))
                .spawn(move || worker.run(tx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    ctx.request_stop();
                    ctx.open_gate();
                    join_all(handles);
                    return Err(e).context("failed to spawn worker thread");
                }
            }
        }
        drop(ready_tx);
        for _ in 0..thread_count {
            if ready_rx.recv().is_err() {
                break;
            }
        }
        if ctx.has_error() {
            ctx.request_stop();
            ctx.open_gate();
            let _ = join_all(handles);
            anyhow::bail!("worker setup failed");
        }

        // Warmup: gate opens, accounting stays off.
        ctx.set_accounting(false);
        ctx.open_gate();
        if !self.interruptible_wait(timespan.warmup(), &ctx, controls) {
            ctx.request_stop();
            let threads = join_all(handles).into_iter().collect::<Result<Vec<_>>>()?;
            if ctx.has_error() {
                anyhow::bail!("a worker thread reported an IO failure during warmup");
            }
            return Ok(TimeSpanResults {
                thread_count,
                actual_duration: Duration::ZERO,
                interrupted: true,
                threads,
                cpu: Default::default(),
            });
        }

        // Measurement window: accounting toggles immediately around it,
        // CPU counters snapshotted just inside the toggles.
        let cpu_before = CpuSnapshot::take();
        ctx.set_accounting(true);
        let window_start = Instant::now();
        self.interruptible_wait(timespan.duration(), &ctx, controls);
        ctx.set_accounting(false);
        let actual_duration = window_start.elapsed();
        let cpu_after = CpuSnapshot::take();

        // Cooldown keeps IO flowing unaccounted; an external stop just
        // shortens it.
        self.interruptible_wait(timespan.cooldown(), &ctx, controls);

        ctx.request_stop();
        let threads = join_all(handles).into_iter().collect::<Result<Vec<_>>>()?;
        if ctx.has_error() {
            anyhow::bail!("a worker thread reported an IO failure");
        }

        Ok(TimeSpanResults {
            thread_count,
            actual_duration,
            interrupted: false,
            threads,
            cpu: cpu_after.utilization_since(&cpu_before),
        })
    }

    /// Sleep for `total` in slices; false when interrupted by an external
    /// stop or a worker error
    fn interruptible_wait(
        &self,
        total: Duration,
        ctx: &RunContext,
        controls: &ExternalControls,
    ) -> bool {
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if controls.externally_stopped() || ctx.has_error() {
                return false;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

impl Default for RunCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Build each thread's target list with weights and relative indices
///
/// Fixed-thread-count mode spreads every thread over all targets, honoring
/// explicit per-thread weight overrides (weight zero drops the target from
/// that thread). Per-target mode dedicates contiguous thread blocks to
/// single targets.
fn assign_threads(
    timespan: &TimeSpan,
    cache: &HandleCache,
    cursors: &[Option<Arc<SharedCursor>>],
) -> Result<Vec<Vec<WorkerTarget>>> {
    let mut assignments = Vec::new();

    if timespan.thread_count > 0 {
        let mut touched = vec![0usize; timespan.targets.len()];
        for thread_index in 0..timespan.thread_count {
            let mut targets = Vec::new();
            for (spec_idx, spec) in timespan.targets.iter().enumerate() {
                let weight = spec.weight_for_thread(thread_index);
                if weight == 0 {
                    continue;
                }
                let relative_index = touched[spec_idx];
                touched[spec_idx] += 1;
                let handle = cache.get_or_open(spec)?;
                crate::config::validator::can_start(spec, handle.size(), relative_index)?;
                targets.push(WorkerTarget {
                    spec_idx,
                    spec: spec.clone(),
                    handle,
                    shared_cursor: cursors[spec_idx].clone(),
                    relative_index,
                    weight,
                });
            }
            if targets.is_empty() {
                anyhow::bail!(
                    "thread {} has zero weight against every target",
                    thread_index
                );
            }
            assignments.push(targets);
        }
    } else {
        for (spec_idx, spec) in timespan.targets.iter().enumerate() {
            for relative_index in 0..spec.per_target_threads {
                let handle = cache.get_or_open(spec)?;
                crate::config::validator::can_start(spec, handle.size(), relative_index)?;
                assignments.push(vec![WorkerTarget {
                    spec_idx,
                    spec: spec.clone(),
                    handle,
                    shared_cursor: cursors[spec_idx].clone(),
                    relative_index,
                    weight: 1,
                }]);
            }
        }
    }

    Ok(assignments)
}

/// Strategy per thread: synchronous for a single request slot or a fully
/// memory-mapped target set, callback when requested and nothing is
/// mapped, completion queue otherwise
fn select_strategy(timespan: &TimeSpan, targets: &[WorkerTarget]) -> DispatchStrategy {
    let slots: usize = targets.iter().map(|t| t.spec.request_count).sum();
    let all_mapped = targets.iter().all(|t| t.spec.memory_mapped);
    let any_mapped = targets.iter().any(|t| t.spec.memory_mapped);

    if slots <= 1 || all_mapped {
        DispatchStrategy::Synchronous
    } else if timespan.completion_callbacks && !any_mapped {
        DispatchStrategy::Callback
    } else {
        DispatchStrategy::CompletionQueue
    }
}

fn join_all(handles: Vec<std::thread::JoinHandle<Result<ThreadResults>>>) -> Vec<Result<ThreadResults>> {
    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("worker thread panicked")),
        })
        .collect()
}
