//! Pending hash jobs and deadline admission control.
//!
//! The queue is kept sorted: jobs that have overrun their estimate go last,
//! the rest by earliest deadline, ties by admission order. Admission walks the
//! queue in that order, accumulating the remaining estimate of every job ahead,
//! and only accepts a job if it can finish by its deadline without pushing a
//! job behind it past a deadline that job could otherwise meet. Overrun jobs
//! contribute no committed time and are never checked.

use attest_hash::TreeHasher;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{JobError, RejectReason};

pub type JobId = Uuid;

/// Invoked exactly once per admitted job, outside any scheduler lock.
pub type HashCallback = Box<dyn FnOnce(HashOutcome) + Send>;

/// What a job's callback receives
#[derive(Debug, Clone)]
pub struct HashOutcome {
    pub job_id: JobId,
    pub tree_id: String,
    pub kind: &'static str,
    /// Whole-run lane digests, for hashers that produce them
    pub digests: Vec<Vec<u8>>,
    pub time_used: Duration,
    /// Payload bytes (not lane-weighted)
    pub bytes_hashed: u64,
    pub error: Option<JobError>,
}

impl HashOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Errored,
    TimedOut,
    Cancelled,
}

/// Point-in-time view of a job, for introspection
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: JobId,
    pub tree_id: String,
    pub kind: &'static str,
    pub state: JobState,
    pub deadline: Instant,
    pub estimate: Duration,
    pub time_used: Duration,
    pub bytes_hashed: u64,
    pub overrun: bool,
    pub error: Option<JobError>,
}

pub(crate) struct HashTask {
    pub(crate) id: JobId,
    seq: u64,
    pub(crate) tree_id: String,
    pub(crate) kind: &'static str,
    /// Taken by the worker for the length of a quantum
    pub(crate) engine: Option<Box<dyn TreeHasher>>,
    pub(crate) deadline: Instant,
    pub(crate) estimate: Duration,
    pub(crate) time_used: Duration,
    pub(crate) bytes_hashed: u64,
    pub(crate) overrun: bool,
    pub(crate) finished: bool,
    pub(crate) digests: Vec<Vec<u8>>,
    pub(crate) error: Option<JobError>,
    pub(crate) cancel_requested: bool,
    pub(crate) callback: Option<HashCallback>,
}

impl fmt::Debug for HashTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTask")
            .field("id", &self.id)
            .field("tree_id", &self.tree_id)
            .field("deadline", &self.deadline)
            .field("estimate", &self.estimate)
            .field("overrun", &self.overrun)
            .finish_non_exhaustive()
    }
}

impl HashTask {
    pub(crate) fn new(
        engine: Box<dyn TreeHasher>,
        deadline: Instant,
        estimate: Duration,
        callback: HashCallback,
    ) -> Self {
        HashTask {
            id: Uuid::new_v4(),
            seq: 0,
            tree_id: engine.tree_id().to_string(),
            kind: engine.kind(),
            engine: Some(engine),
            deadline,
            estimate,
            time_used: Duration::ZERO,
            bytes_hashed: 0,
            overrun: false,
            finished: false,
            digests: Vec::new(),
            error: None,
            cancel_requested: false,
            callback: Some(callback),
        }
    }

    /// Committed time still owed to this job.
    fn remaining(&self) -> Duration {
        if self.overrun {
            Duration::ZERO
        } else {
            self.estimate.saturating_sub(self.time_used)
        }
    }

    fn queue_order(&self, other: &HashTask) -> Ordering {
        self.overrun
            .cmp(&other.overrun)
            .then(self.deadline.cmp(&other.deadline))
            .then(self.seq.cmp(&other.seq))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.engine.is_none() && !self.finished && self.error.is_none()
    }

    pub(crate) fn state(&self) -> JobState {
        match &self.error {
            Some(JobError::Timeout) => JobState::TimedOut,
            Some(JobError::Cancelled) => JobState::Cancelled,
            Some(_) => JobState::Errored,
            None if self.finished => JobState::Finished,
            None if self.engine.is_none() => JobState::Running,
            None => JobState::Pending,
        }
    }

    pub(crate) fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            tree_id: self.tree_id.clone(),
            kind: self.kind,
            state: self.state(),
            deadline: self.deadline,
            estimate: self.estimate,
            time_used: self.time_used,
            bytes_hashed: self.bytes_hashed,
            overrun: self.overrun,
            error: self.error.clone(),
        }
    }

    /// Split into the callback and what it should be told.
    pub(crate) fn into_outcome(mut self) -> (Option<HashCallback>, HashOutcome) {
        let outcome = HashOutcome {
            job_id: self.id,
            tree_id: std::mem::take(&mut self.tree_id),
            kind: self.kind,
            digests: std::mem::take(&mut self.digests),
            time_used: self.time_used,
            bytes_hashed: self.bytes_hashed,
            error: self.error.take(),
        };
        (self.callback.take(), outcome)
    }
}

#[derive(Default)]
pub(crate) struct HashQueue {
    tasks: Vec<HashTask>,
    next_seq: u64,
}

impl HashQueue {
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &HashTask> {
        self.tasks.iter()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut HashTask> {
        self.tasks.first_mut()
    }

    pub(crate) fn get_mut(&mut self, id: JobId) -> Option<&mut HashTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut HashTask> {
        self.tasks.iter_mut()
    }

    /// Restore queue order after a job's overrun flag changed.
    pub(crate) fn resort(&mut self) {
        self.tasks.sort_by(HashTask::queue_order);
    }

    /// Index where a fresh job with `deadline` belongs.
    fn position_for(&self, deadline: Instant) -> usize {
        self.tasks
            .partition_point(|t| !t.overrun && t.deadline <= deadline)
    }

    /// Would a job needing `estimate` fit before `deadline`? Returns its position.
    pub(crate) fn check(
        &self,
        estimate: Duration,
        deadline: Instant,
        now: Instant,
    ) -> Result<usize, RejectReason> {
        if deadline <= now {
            return Err(RejectReason::DeadlinePassed);
        }
        let pos = self.position_for(deadline);

        // Work in offsets from `now`; estimates may be as large as Duration::MAX.
        let ahead = self.tasks[..pos]
            .iter()
            .map(HashTask::remaining)
            .fold(Duration::ZERO, Duration::saturating_add);
        let needed = ahead.saturating_add(estimate);
        let available = deadline.saturating_duration_since(now);
        if needed > available {
            return Err(RejectReason::MissesOwnDeadline { needed, available });
        }

        let mut without = ahead;
        for task in self.tasks[pos..].iter().filter(|t| !t.overrun) {
            without = without.saturating_add(task.remaining());
            let with = without.saturating_add(estimate);
            // Only jobs that could still make it are protected.
            let Some(slack) = task.deadline.checked_duration_since(now) else {
                continue;
            };
            if with > slack && without <= slack {
                return Err(RejectReason::DisplacesJob(task.id));
            }
        }
        Ok(pos)
    }

    pub(crate) fn can_schedule(&self, estimate: Duration, deadline: Instant, now: Instant) -> bool {
        self.check(estimate, deadline, now).is_ok()
    }

    /// Insert at a position obtained from `check` under the same lock.
    pub(crate) fn insert(&mut self, pos: usize, mut task: HashTask) {
        task.seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(pos, task);
    }

    /// Admit `task` if it fits; on rejection the queue is unchanged.
    #[cfg(test)]
    pub(crate) fn admit(&mut self, task: HashTask, now: Instant) -> Result<(), (HashTask, RejectReason)> {
        match self.check(task.estimate, task.deadline, now) {
            Ok(pos) => {
                self.insert(pos, task);
                Ok(())
            }
            Err(reason) => Err((task, reason)),
        }
    }

    /// Remove every job that is finished, errored, cancelled or past its deadline.
    ///
    /// The job the worker is currently stepping is left in place unless it
    /// already carries a terminal state; the worker reaps it after its quantum.
    pub(crate) fn reap(&mut self, now: Instant) -> Vec<HashTask> {
        let mut done = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            let task = &mut self.tasks[i];
            if task.is_running() {
                i += 1;
                continue;
            }
            if !task.finished && task.error.is_none() {
                if task.cancel_requested {
                    task.error = Some(JobError::Cancelled);
                } else if now >= task.deadline {
                    task.error = Some(JobError::Timeout);
                }
            }
            if task.finished || task.error.is_some() {
                if !task.finished {
                    if let Some(engine) = task.engine.as_mut() {
                        engine.abort();
                    }
                }
                done.push(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }
        done
    }

    /// Remove everything, aborting unfinished engines.
    pub(crate) fn drain(&mut self) -> Vec<HashTask> {
        let mut tasks = std::mem::take(&mut self.tasks);
        for task in &mut tasks {
            if let Some(engine) = task.engine.as_mut() {
                engine.abort();
            }
        }
        tasks
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use attest_hash::HashResult;
    use proptest::prelude::*;

    /// Engine that never does any work; enough for queue bookkeeping.
    pub(crate) struct IdleHasher {
        pub(crate) tree: String,
        pub(crate) aborted: bool,
    }

    impl TreeHasher for IdleHasher {
        fn tree_id(&self) -> &str {
            &self.tree
        }
        fn kind(&self) -> &'static str {
            "idle"
        }
        fn step(&mut self, _max_bytes: usize) -> HashResult<u64> {
            Ok(0)
        }
        fn finished(&self) -> bool {
            self.aborted
        }
        fn abort(&mut self) {
            self.aborted = true;
        }
        fn lanes(&self) -> usize {
            1
        }
        fn estimated_payload_bytes(&self) -> u64 {
            0
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn task(now: Instant, estimate_ms: u64, deadline_ms: u64) -> HashTask {
        let engine = Box::new(IdleHasher {
            tree: "t".into(),
            aborted: false,
        });
        HashTask::new(engine, now + ms(deadline_ms), ms(estimate_ms), Box::new(|_| {}))
    }

    #[test]
    fn admission_scenario() {
        let now = Instant::now();
        let mut q = HashQueue::default();

        let expired = HashTask::new(
            Box::new(IdleHasher {
                tree: "t".into(),
                aborted: false,
            }),
            now.checked_sub(ms(1)).unwrap(),
            ms(100),
            Box::new(|_| {}),
        );
        let (_, reason) = q.admit(expired, now).err().unwrap();
        assert_eq!(reason, RejectReason::DeadlinePassed);

        assert!(q.admit(task(now, 1000, 2000), now).is_ok());

        let (_, reason) = q.admit(task(now, 1100, 2000), now).err().unwrap();
        assert!(matches!(reason, RejectReason::MissesOwnDeadline { .. }));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn rejects_job_that_would_displace_a_later_one() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 900, 1000), now).unwrap();
        let first = q.iter().next().unwrap().id;

        // Fits its own deadline at the head but pushes the existing job to 1100.
        let (_, reason) = q.admit(task(now, 200, 500), now).err().unwrap();
        assert_eq!(reason, RejectReason::DisplacesJob(first));

        assert!(q.admit(task(now, 100, 500), now).is_ok());
        assert!(!q.can_schedule(ms(1), now + ms(50), now));
    }

    #[test]
    fn oversized_estimate_is_rejected_not_overflowed() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 10, 1000), now).unwrap();

        let reason = q.check(Duration::MAX, now + ms(500), now).unwrap_err();
        assert_eq!(
            reason,
            RejectReason::MissesOwnDeadline {
                needed: Duration::MAX,
                available: ms(500),
            }
        );
        assert!(!q.can_schedule(Duration::MAX, now + ms(2000), now));

        let mut huge = task(now, 0, 1000);
        huge.estimate = Duration::MAX;
        let (_, reason) = q.admit(huge, now).err().unwrap();
        assert!(matches!(reason, RejectReason::MissesOwnDeadline { .. }));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn earlier_deadline_first_ties_in_admission_order() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 10, 5000), now).unwrap();
        q.admit(task(now, 10, 1000), now).unwrap();
        q.admit(task(now, 10, 5000), now).unwrap();
        let deadlines: Vec<_> = q.iter().map(|t| (t.deadline - now, t.seq)).collect();
        assert_eq!(deadlines, vec![(ms(1000), 1), (ms(5000), 0), (ms(5000), 2)]);
    }

    #[test]
    fn overrun_sorts_last_and_frees_capacity() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 500, 600), now).unwrap();
        q.admit(task(now, 100, 5000), now).unwrap();
        assert!(!q.can_schedule(ms(200), now + ms(650), now));

        let head = q.head_mut().unwrap();
        head.time_used = ms(501);
        head.overrun = true;
        q.resort();

        let order: Vec<_> = q.iter().map(|t| t.overrun).collect();
        assert_eq!(order, vec![false, true]);
        assert!(q.can_schedule(ms(200), now + ms(650), now));
    }

    #[test]
    fn reap_times_out_and_aborts() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 10, 100), now).unwrap();
        q.admit(task(now, 10, 1000), now).unwrap();

        let reaped = q.reap(now + ms(100));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].error, Some(JobError::Timeout));
        assert!(reaped[0].engine.as_ref().unwrap().finished());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn reap_leaves_running_job() {
        let now = Instant::now();
        let mut q = HashQueue::default();
        q.admit(task(now, 10, 100), now).unwrap();
        let engine = q.head_mut().unwrap().engine.take();
        q.head_mut().unwrap().cancel_requested = true;
        assert!(q.reap(now + ms(500)).is_empty());

        q.head_mut().unwrap().engine = engine;
        let reaped = q.reap(now + ms(500));
        assert_eq!(reaped[0].state(), JobState::Cancelled);
    }

    proptest! {
        /// Every admitted job can finish by its deadline given the jobs ahead of it.
        #[test]
        fn admission_is_sound(jobs in proptest::collection::vec((1u64..500, 1u64..3000), 1..30)) {
            let now = Instant::now();
            let mut q = HashQueue::default();
            for (estimate, deadline) in jobs {
                let _ = q.admit(task(now, estimate, deadline), now);
            }
            let mut t = now;
            for job in q.iter() {
                t += job.remaining();
                prop_assert!(t <= job.deadline);
            }
        }

        /// The capacity check agrees with admission and never mutates.
        #[test]
        fn capacity_check_matches_admit(existing in proptest::collection::vec((1u64..500, 1u64..3000), 0..10),
                               estimate in 1u64..800, deadline in 1u64..3000) {
            let now = Instant::now();
            let mut q = HashQueue::default();
            for (e, d) in existing {
                let _ = q.admit(task(now, e, d), now);
            }
            let before = q.len();
            let fits = q.can_schedule(ms(estimate), now + ms(deadline), now);
            prop_assert_eq!(q.len(), before);
            let admitted = q.admit(task(now, estimate, deadline), now).is_ok();
            prop_assert_eq!(fits, admitted);
        }
    }
}
