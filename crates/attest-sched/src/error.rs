use attest_core::AttestError;
use std::time::Duration;
use thiserror::Error;

use crate::queue::JobId;

pub type SchedResult<T> = Result<T, SchedError>;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("failed to spawn hash worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("scheduler has been stopped")]
    Stopped,
}

impl From<SchedError> for AttestError {
    fn from(e: SchedError) -> Self {
        AttestError::Scheduler(e.to_string())
    }
}

/// Terminal error of a hashing job, delivered through its callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("deadline passed before hashing finished")]
    Timeout,

    #[error("hash cancelled")]
    Cancelled,

    #[error("hasher failed: {0}")]
    Hasher(String),

    #[error("hasher panicked: {0}")]
    Panicked(String),

    #[error("scheduler shut down before the hash finished")]
    Shutdown,
}

/// Why a job was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("deadline has already passed")]
    DeadlinePassed,

    #[error("cannot finish before its deadline: needs {needed:?}, {available:?} available")]
    MissesOwnDeadline { needed: Duration, available: Duration },

    #[error("would make job {0} miss its deadline")]
    DisplacesJob(JobId),

    #[error("scheduler has been stopped")]
    Stopped,
}
