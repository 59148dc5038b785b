//! The hash scheduler: one worker thread time-slicing admitted jobs.
//!
//! Lock order: `state` before `speed`. Callbacks run with no lock held.

use attest_core::config::SchedulerConfig;
use attest_hash::{HashResult, TreeHasher};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{JobError, RejectReason, SchedError, SchedResult};
use crate::metrics::SchedulerMetrics;
use crate::queue::{HashCallback, HashOutcome, HashQueue, HashTask, JobId, JobState, JobSummary};
use crate::speed::HashSpeed;

/// A hashing job waiting to be admitted.
pub struct HashRequest {
    engine: Box<dyn TreeHasher>,
    deadline: Instant,
    estimate: Option<Duration>,
    callback: HashCallback,
}

impl HashRequest {
    /// Callers carry their own context (the "cookie") in the callback's captures.
    pub fn new(
        engine: Box<dyn TreeHasher>,
        deadline: Instant,
        callback: impl FnOnce(HashOutcome) + Send + 'static,
    ) -> Self {
        HashRequest {
            engine,
            deadline,
            estimate: None,
            callback: Box::new(callback),
        }
    }

    /// Use this duration instead of estimating from the engine's payload size.
    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn tree_id(&self) -> &str {
        self.engine.tree_id()
    }

    /// Give the engine back, e.g. to retry with a later deadline.
    pub fn into_engine(self) -> Box<dyn TreeHasher> {
        self.engine
    }
}

impl fmt::Debug for HashRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRequest")
            .field("tree_id", &self.engine.tree_id())
            .field("kind", &self.engine.kind())
            .field("deadline", &self.deadline)
            .field("estimate", &self.estimate)
            .finish_non_exhaustive()
    }
}

/// Admission refused; the request is handed back untouched.
#[derive(Debug, Error)]
#[error("hash of {} rejected: {reason}", .request.tree_id())]
pub struct Rejected {
    pub request: HashRequest,
    pub reason: RejectReason,
}

struct State {
    queue: HashQueue,
    history: VecDeque<JobSummary>,
    stopped: bool,
}

struct Shared {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    wake: Condvar,
    speed: Mutex<HashSpeed>,
    metrics: SchedulerMetrics,
}

type Completion = (Option<HashCallback>, HashOutcome);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_speed(&self) -> MutexGuard<'_, HashSpeed> {
        self.speed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record finished tasks in history and metrics; returns callbacks to run unlocked.
    fn retire(&self, state: &mut State, tasks: Vec<HashTask>) -> Vec<Completion> {
        let mut completions = Vec::with_capacity(tasks.len());
        for task in tasks {
            let summary = task.summary();
            let outcome = match summary.state {
                JobState::Finished => "finished",
                JobState::TimedOut => "timed_out",
                JobState::Cancelled => "cancelled",
                _ => "errored",
            };
            self.metrics.completed(outcome);
            match &summary.error {
                None => {
                    self.lock_speed().record(task.bytes_hashed, task.time_used);
                    info!(
                        job = %summary.id,
                        tree = %summary.tree_id,
                        kind = summary.kind,
                        bytes = summary.bytes_hashed,
                        time_used_ms = summary.time_used.as_millis() as u64,
                        "hash finished"
                    );
                }
                Some(err) => warn!(
                    job = %summary.id,
                    tree = %summary.tree_id,
                    kind = summary.kind,
                    "hash ended: {err}"
                ),
            }

            state.history.push_back(summary);
            while state.history.len() > self.config.completed_max {
                state.history.pop_front();
            }
            completions.push(task.into_outcome());
        }
        completions
    }
}

fn run_completions(completions: Vec<Completion>) {
    for (callback, outcome) in completions {
        let Some(callback) = callback else {
            continue;
        };
        let job = outcome.job_id;
        if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            error!(job = %job, "hash completion callback panicked");
        }
    }
}

pub struct HashScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HashScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let speed = HashSpeed::new(config.default_bytes_per_ms);
        HashScheduler {
            shared: Arc::new(Shared {
                config,
                clock,
                state: Mutex::new(State {
                    queue: HashQueue::default(),
                    history: VecDeque::new(),
                    stopped: false,
                }),
                wake: Condvar::new(),
                speed: Mutex::new(speed),
                metrics: SchedulerMetrics::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.shared.metrics
    }

    /// Spawn the worker. Calling it again while running is a no-op.
    pub fn start(&self) -> SchedResult<()> {
        if self.shared.lock().stopped {
            return Err(SchedError::Stopped);
        }
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("attest-hash-worker".into())
            .spawn(move || worker_loop(&shared))
            .map_err(SchedError::Spawn)?;
        *worker = Some(handle);
        info!(
            step_bytes = self.shared.config.step_bytes,
            steps_per_quantum = self.shared.config.steps_per_quantum,
            "hash scheduler started"
        );
        Ok(())
    }

    /// Stop the worker and fail every job still queued with `Shutdown`.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.wake.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("hash worker exited by panic");
            }
        }

        let completions = {
            let mut state = self.shared.lock();
            let mut tasks = state.queue.drain();
            for task in &mut tasks {
                if !task.finished && task.error.is_none() {
                    task.error = Some(JobError::Shutdown);
                }
            }
            self.shared.retire(&mut state, tasks)
        };
        if !completions.is_empty() {
            info!(jobs = completions.len(), "failing queued hashes on shutdown");
        }
        run_completions(completions);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.lock().stopped
            && self
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    /// `d` plus the configured percentage and constant.
    pub fn pad_estimate(&self, d: Duration) -> Duration {
        let cfg = &self.shared.config;
        let pct = u32::try_from(cfg.pad_percent).unwrap_or(u32::MAX);
        let extra = d.checked_mul(pct).map_or(Duration::MAX, |x| x / 100);
        d.saturating_add(extra)
            .saturating_add(Duration::from_millis(cfg.pad_constant_ms))
    }

    /// Padded time to hash `payload_bytes` at the measured speed.
    pub fn estimate_duration(&self, payload_bytes: u64) -> Duration {
        let raw = self.shared.lock_speed().duration_for(payload_bytes);
        self.pad_estimate(raw)
    }

    /// Admit a job, or hand the request back with the reason it does not fit.
    pub fn schedule_hash(&self, request: HashRequest) -> Result<JobId, Rejected> {
        let estimate = match request.estimate {
            Some(e) => e,
            None => self.estimate_duration(request.engine.estimated_payload_bytes()),
        };
        let now = self.shared.clock.now();

        let mut state = self.shared.lock();
        if state.stopped {
            drop(state);
            self.shared.metrics.rejected("stopped");
            return Err(Rejected {
                request,
                reason: RejectReason::Stopped,
            });
        }

        let pos = match state.queue.check(estimate, request.deadline, now) {
            Ok(pos) => pos,
            Err(reason) => {
                drop(state);
                self.shared.metrics.rejected(reject_label(&reason));
                info!(tree = %request.tree_id(), "hash rejected: {reason}");
                return Err(Rejected { request, reason });
            }
        };

        let task = HashTask::new(request.engine, request.deadline, estimate, request.callback);
        let (id, tree, kind) = (task.id, task.tree_id.clone(), task.kind);
        state.queue.insert(pos, task);
        let queued = state.queue.len();
        drop(state);

        self.shared.metrics.admitted();
        info!(
            job = %id,
            tree = %tree,
            kind,
            estimate_ms = estimate.as_millis() as u64,
            queued,
            "hash admitted"
        );
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Is there `duration` of free capacity before `deadline`? Does not change the queue.
    pub fn can_be_scheduled_before(&self, duration: Duration, deadline: Instant) -> bool {
        let now = self.shared.clock.now();
        let state = self.shared.lock();
        !state.stopped && state.queue.can_schedule(duration, deadline, now)
    }

    /// Cancel every job hashing `tree_id`. A job in the middle of a quantum
    /// finishes that quantum first. Returns the number of jobs affected.
    pub fn cancel_tree_hashes(&self, tree_id: &str) -> usize {
        let now = self.shared.clock.now();
        let (count, completions) = {
            let mut state = self.shared.lock();
            let mut count = 0;
            for task in state.queue.iter_mut().filter(|t| t.tree_id == tree_id) {
                task.cancel_requested = true;
                count += 1;
            }
            let reaped = state.queue.reap(now);
            let completions = self.shared.retire(&mut state, reaped);
            (count, completions)
        };
        if count > 0 {
            info!(tree = %tree_id, jobs = count, "cancelling hashes");
        }
        run_completions(completions);
        count
    }

    /// Queued jobs in execution order.
    pub fn pending(&self) -> Vec<JobSummary> {
        self.shared.lock().queue.iter().map(HashTask::summary).collect()
    }

    /// Recently retired jobs, oldest first.
    pub fn completed(&self) -> Vec<JobSummary> {
        self.shared.lock().history.iter().cloned().collect()
    }
}

impl Drop for HashScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reject_label(reason: &RejectReason) -> &'static str {
    match reason {
        RejectReason::DeadlinePassed => "deadline_passed",
        RejectReason::MissesOwnDeadline { .. } => "insufficient_time",
        RejectReason::DisplacesJob(_) => "displaces_job",
        RejectReason::Stopped => "stopped",
    }
}

/// Run up to `steps` steps; returns lane-weighted bytes.
fn run_quantum(engine: &mut dyn TreeHasher, steps: usize, step_bytes: usize) -> HashResult<u64> {
    let mut total = 0;
    for _ in 0..steps {
        if engine.finished() {
            break;
        }
        total += engine.step(step_bytes)?;
    }
    Ok(total)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_loop(shared: &Shared) {
    let idle_wait = Duration::from_millis(shared.config.idle_wait_ms.max(1));
    let steps = shared.config.steps_per_quantum.max(1);
    let step_bytes = shared.config.step_bytes.max(1);
    debug!("hash worker running");

    loop {
        let mut state = shared.lock();
        while !state.stopped && state.queue.is_empty() {
            state = shared
                .wake
                .wait_timeout(state, idle_wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if state.stopped {
            break;
        }

        let expired = state.queue.reap(shared.clock.now());
        if !expired.is_empty() {
            let completions = shared.retire(&mut state, expired);
            drop(state);
            run_completions(completions);
            continue;
        }

        let Some(head) = state.queue.head_mut() else {
            continue;
        };
        let id = head.id;
        let Some(mut engine) = head.engine.take() else {
            continue;
        };
        drop(state);

        let lanes = engine.lanes().max(1) as u64;
        let started = shared.clock.now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            run_quantum(engine.as_mut(), steps, step_bytes)
        }));
        let elapsed = shared.clock.now().saturating_duration_since(started);

        let mut state = shared.lock();
        let mut resort = false;
        match state.queue.get_mut(id) {
            Some(task) => {
                task.time_used += elapsed;
                match result {
                    Ok(Ok(weighted)) => {
                        let payload = weighted / lanes;
                        task.bytes_hashed += payload;
                        shared.metrics.hashed(payload);
                        if engine.finished() {
                            task.finished = true;
                            task.digests = engine.take_digests();
                        }
                        task.engine = Some(engine);
                    }
                    Ok(Err(e)) => {
                        engine.abort();
                        task.error = Some(JobError::Hasher(e.to_string()));
                        task.engine = Some(engine);
                    }
                    Err(payload) => {
                        // The engine's state is unknown after a panic; drop it.
                        task.error = Some(JobError::Panicked(panic_message(payload.as_ref())));
                    }
                }
                if !task.finished && !task.overrun && task.time_used > task.estimate {
                    task.overrun = true;
                    resort = true;
                    info!(
                        job = %id,
                        tree = %task.tree_id,
                        estimate_ms = task.estimate.as_millis() as u64,
                        "hash overran its estimate"
                    );
                }
            }
            None => {
                warn!(job = %id, "running hash vanished from the queue");
                engine.abort();
            }
        }
        if resort {
            state.queue.resort();
        }

        let reaped = state.queue.reap(shared.clock.now());
        let completions = shared.retire(&mut state, reaped);
        drop(state);
        run_completions(completions);
    }
    debug!("hash worker exiting");
}
