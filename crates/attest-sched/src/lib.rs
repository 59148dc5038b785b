//! attest-sched: deadline-driven scheduling of hashing jobs
//!
//! One worker thread owns the only hashing resource. Callers submit
//! [`HashRequest`]s with a deadline; admission control accepts a job only if
//! it and every job already queued can still finish in time. The worker runs
//! the head of the queue for one quantum at a time, re-checking deadlines,
//! cancellations and overruns between quanta, and reports every job exactly
//! once through its callback.

pub mod clock;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod speed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, RejectReason, SchedError, SchedResult};
pub use metrics::SchedulerMetrics;
pub use queue::{HashCallback, HashOutcome, JobId, JobState, JobSummary};
pub use scheduler::{HashRequest, HashScheduler, Rejected};
pub use speed::HashSpeed;
