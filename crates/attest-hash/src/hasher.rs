//! The stepwise hashing capability shared by every hasher variant.

use attest_core::ResourceId;

use crate::error::HashResult;

/// A resumable hashing job over one resource tree.
///
/// Only one thread drives a hasher at a time (the scheduler's worker, or a
/// synchronous caller), so implementations need no internal locking.
pub trait TreeHasher: Send {
    /// The resource tree this hasher covers.
    fn tree_id(&self) -> &str;

    /// Short name of the variant, for logs and job summaries.
    fn kind(&self) -> &'static str;

    /// Hash up to `max_bytes`, where a payload byte counts once per lane.
    ///
    /// Returns the lane-weighted bytes processed. Errors confined to a single
    /// version are recorded in its result and do not surface here.
    fn step(&mut self, max_bytes: usize) -> HashResult<u64>;

    /// True once there is no work left (including after `abort`).
    fn finished(&self) -> bool;

    /// Close every open stream and drop in-progress digest state.
    fn abort(&mut self);

    /// Number of digest lanes run in parallel.
    fn lanes(&self) -> usize;

    /// Payload bytes this hasher expects to read, not weighted by lanes.
    fn estimated_payload_bytes(&self) -> u64;

    /// Whole-run lane digests, for variants that produce them.
    fn take_digests(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Decides whether a resource takes part in a hashing run.
pub trait ResourceSelector: Send + Sync {
    fn select(&self, resource: &ResourceId) -> bool;
}

impl<F> ResourceSelector for F
where
    F: Fn(&ResourceId) -> bool + Send + Sync,
{
    fn select(&self, resource: &ResourceId) -> bool {
        self(resource)
    }
}

/// Drive a hasher synchronously until it finishes; returns lane-weighted bytes.
pub fn run_to_completion(hasher: &mut dyn TreeHasher, step_bytes: usize) -> HashResult<u64> {
    let mut total = 0;
    while !hasher.finished() {
        total += hasher.step(step_bytes)?;
    }
    Ok(total)
}

/// Payload budget for one step: `max_bytes` split across lanes, at least one byte.
pub(crate) fn payload_budget(max_bytes: usize, lanes: usize) -> usize {
    (max_bytes / lanes.max(1)).max(1)
}
