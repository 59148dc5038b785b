//! Prometheus counters for the hash scheduler.

use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;

type Labels = Vec<(String, String)>;

#[derive(Clone, Default)]
pub struct SchedulerMetrics {
    admitted: Counter,
    rejected: Family<Labels, Counter>,
    completed: Family<Labels, Counter>,
    bytes_hashed: Counter,
}

impl SchedulerMetrics {
    /// Expose the counters through `registry`. Counters are shared, so this can
    /// be called after jobs have already run.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "attest_hash_jobs_admitted",
            "Hash jobs admitted to the queue",
            self.admitted.clone(),
        );
        registry.register(
            "attest_hash_jobs_rejected",
            "Hash jobs refused by admission control",
            self.rejected.clone(),
        );
        registry.register(
            "attest_hash_jobs_completed",
            "Hash jobs removed from the queue, by outcome",
            self.completed.clone(),
        );
        registry.register(
            "attest_hash_payload_bytes",
            "Payload bytes hashed by the worker",
            self.bytes_hashed.clone(),
        );
    }

    pub(crate) fn admitted(&self) {
        self.admitted.inc();
    }

    pub(crate) fn rejected(&self, reason: &str) {
        self.rejected
            .get_or_create(&vec![("reason".to_string(), reason.to_string())])
            .inc();
    }

    pub(crate) fn completed(&self, outcome: &str) {
        self.completed
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    pub(crate) fn hashed(&self, bytes: u64) {
        self.bytes_hashed.inc_by(bytes);
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted.get()
    }

    pub fn completed_total(&self, outcome: &str) -> u64 {
        self.completed
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .get()
    }

    pub fn bytes_hashed_total(&self) -> u64 {
        self.bytes_hashed.get()
    }
}
