//! Synchronous integrity sweep over a whole tree.
//!
//! The verifier hashes every stored version with the configured algorithm and
//! compares the result with the digest the store recorded earlier. A stored
//! digest made with a different algorithm is checked by recomputing under that
//! algorithm, which separates algorithm drift from real corruption.

use attest_core::config::VerifyConfig;
use attest_core::{ResourceId, StoredDigest, VersionInfo, VersionNumber};
use attest_store::ContentStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::algorithm::{digest_reader, Algorithm};
use crate::block::VersionResult;
use crate::block_hasher::BlockHasher;
use crate::error::HashResult;
use crate::hasher::run_to_completion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Fresh digest equals the stored one
    Match,
    /// No digest was stored; the fresh one is the new baseline
    NewlyHashed,
    /// Content checks out under the stored (older) algorithm
    ObsoleteContentOk { stored_algorithm: String },
    /// Content differs from what was recorded
    Mismatch,
    /// A digest is recorded but the content is gone
    DigestButNoContent,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEvent {
    pub resource: ResourceId,
    /// Absent when the failure concerns the resource as a whole
    pub version: Option<VersionNumber>,
    #[serde(flatten)]
    pub outcome: VerifyOutcome,
}

/// Tallies for one verification sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalHashResult {
    pub resources: u64,
    pub matching: u64,
    pub newly_hashed: u64,
    pub obsolete_ok: u64,
    pub mismatched: u64,
    pub no_content: u64,
    pub errors: u64,
    pub bytes_hashed: u64,
}

impl LocalHashResult {
    fn tally(&mut self, outcome: &VerifyOutcome) {
        match outcome {
            VerifyOutcome::Match => self.matching += 1,
            VerifyOutcome::NewlyHashed => self.newly_hashed += 1,
            VerifyOutcome::ObsoleteContentOk { .. } => self.obsolete_ok += 1,
            VerifyOutcome::Mismatch => self.mismatched += 1,
            VerifyOutcome::DigestButNoContent => self.no_content += 1,
            VerifyOutcome::Error { .. } => self.errors += 1,
        }
    }

    /// True when nothing suggests data loss or corruption.
    pub fn is_clean(&self) -> bool {
        self.mismatched == 0 && self.no_content == 0 && self.errors == 0
    }
}

pub struct LocalVerifier {
    store: Arc<dyn ContentStore>,
    algorithm: Algorithm,
    max_versions: usize,
    rebaseline_obsolete: bool,
    record_new_digests: bool,
    step_bytes: usize,
}

/// A stored algorithm we cannot compute; ends verification of the resource.
struct UnsupportedStored(String);

impl LocalVerifier {
    pub fn new(store: Arc<dyn ContentStore>, config: &VerifyConfig, step_bytes: usize) -> HashResult<Self> {
        Ok(LocalVerifier {
            store,
            algorithm: config.algorithm.parse()?,
            max_versions: config.max_versions,
            rebaseline_obsolete: config.rebaseline_obsolete,
            record_new_digests: config.record_new_digests,
            step_bytes: step_bytes.max(1),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Walk the tree, reporting one event per checked version.
    pub fn run(&self, mut on_event: impl FnMut(&VerifyEvent)) -> HashResult<LocalHashResult> {
        let resources = self.store.list_resources()?;
        let mut result = LocalHashResult {
            resources: resources.len() as u64,
            ..LocalHashResult::default()
        };
        info!(
            tree = %self.store.tree_id(),
            resources = resources.len(),
            algorithm = %self.algorithm,
            "local verification started"
        );

        let mut emit = |result: &mut LocalHashResult, event: VerifyEvent| {
            result.tally(&event.outcome);
            on_event(&event);
        };

        for id in &resources {
            let versions = match self.store.list_versions(id, self.max_versions) {
                Ok(v) => v,
                Err(e) => {
                    warn!(resource = %id, "cannot list versions: {e}");
                    emit(&mut result, error_event(id, None, e.to_string()));
                    continue;
                }
            };

            for v in versions.iter().filter(|v| !v.has_content) {
                if v.stored_digest.is_some() {
                    warn!(resource = %id, version = v.number, "digest recorded but content missing");
                    emit(&mut result, event(id, v.number, VerifyOutcome::DigestButNoContent));
                }
            }
            if !versions.iter().any(|v| v.has_content) {
                continue;
            }

            let mut hasher = BlockHasher::builder(self.store.clone())
                .algorithms(&[self.algorithm])
                .max_versions(self.max_versions)
                .resources(vec![id.clone()])
                .build()?;
            run_to_completion(&mut hasher, self.step_bytes)?;

            let by_number: HashMap<VersionNumber, &VersionInfo> =
                versions.iter().map(|v| (v.number, v)).collect();

            for block in hasher.take_blocks() {
                result.bytes_hashed += block.total_filtered_length();
                for vr in block.versions() {
                    let stored = by_number
                        .get(&vr.version)
                        .and_then(|v| v.stored_digest.as_ref());
                    match self.check_version(id, vr, stored, &mut result) {
                        Ok(outcome) => emit(&mut result, event(id, vr.version, outcome)),
                        Err(UnsupportedStored(name)) => {
                            warn!(resource = %id, version = vr.version, algorithm = %name, "stored digest uses an unsupported algorithm");
                            let msg = format!("unsupported stored digest algorithm: {name}");
                            emit(&mut result, error_event(id, Some(vr.version), msg));
                            break;
                        }
                    }
                }
            }
        }

        info!(
            tree = %self.store.tree_id(),
            matching = result.matching,
            newly_hashed = result.newly_hashed,
            obsolete_ok = result.obsolete_ok,
            mismatched = result.mismatched,
            no_content = result.no_content,
            errors = result.errors,
            "local verification finished"
        );
        Ok(result)
    }

    fn check_version(
        &self,
        id: &ResourceId,
        vr: &VersionResult,
        stored: Option<&StoredDigest>,
        result: &mut LocalHashResult,
    ) -> Result<VerifyOutcome, UnsupportedStored> {
        if let Some(err) = &vr.error {
            return Ok(VerifyOutcome::Error {
                message: err.clone(),
            });
        }
        let Some(fresh) = vr.digest(0) else {
            return Ok(VerifyOutcome::Error {
                message: "no digest produced".into(),
            });
        };

        let Some(stored) = stored else {
            if self.record_new_digests {
                self.record(id, vr.version, fresh);
            }
            return Ok(VerifyOutcome::NewlyHashed);
        };

        let stored_alg: Algorithm = stored
            .algorithm
            .parse()
            .map_err(|_| UnsupportedStored(stored.algorithm.clone()))?;

        if stored_alg == self.algorithm {
            if stored.digest == fresh {
                return Ok(VerifyOutcome::Match);
            }
            self.suspect(id, vr.version);
            return Ok(VerifyOutcome::Mismatch);
        }

        // Stored under another algorithm: recompute with it before judging.
        let recomputed = self
            .store
            .open_version(id, vr.version)
            .map_err(|e| e.to_string())
            .and_then(|stream| digest_reader(stored_alg, stream).map_err(|e| e.to_string()));
        let (old_digest, bytes) = match recomputed {
            Ok(r) => r,
            Err(message) => return Ok(VerifyOutcome::Error { message }),
        };
        result.bytes_hashed += bytes;

        if old_digest == stored.digest {
            debug!(resource = %id, version = vr.version, stored = %stored_alg, "content ok under obsolete algorithm");
            if self.rebaseline_obsolete {
                self.record(id, vr.version, fresh);
            }
            Ok(VerifyOutcome::ObsoleteContentOk {
                stored_algorithm: stored_alg.name().to_string(),
            })
        } else {
            self.suspect(id, vr.version);
            Ok(VerifyOutcome::Mismatch)
        }
    }

    fn record(&self, id: &ResourceId, version: VersionNumber, digest: &[u8]) {
        let stored = StoredDigest::new(self.algorithm.name(), digest);
        if let Err(e) = self.store.record_digest(id, version, stored) {
            warn!(resource = %id, version, "failed to record digest: {e}");
        }
    }

    fn suspect(&self, id: &ResourceId, version: VersionNumber) {
        warn!(resource = %id, version, "content does not match stored digest");
        if let Err(e) = self.store.mark_suspect(id, version) {
            warn!(resource = %id, version, "failed to mark suspect: {e}");
        }
    }
}

fn event(id: &ResourceId, version: VersionNumber, outcome: VerifyOutcome) -> VerifyEvent {
    VerifyEvent {
        resource: id.clone(),
        version: Some(version),
        outcome,
    }
}

fn error_event(id: &ResourceId, version: Option<VersionNumber>, message: String) -> VerifyEvent {
    VerifyEvent {
        resource: id.clone(),
        version,
        outcome: VerifyOutcome::Error { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::digest_bytes;
    use attest_store::MemoryStore;

    fn sha1_config() -> VerifyConfig {
        VerifyConfig {
            algorithm: "SHA-1".into(),
            ..VerifyConfig::default()
        }
    }

    fn run(store: Arc<MemoryStore>, config: &VerifyConfig) -> (LocalHashResult, Vec<VerifyEvent>) {
        let verifier = LocalVerifier::new(store, config, 2).unwrap();
        let mut events = Vec::new();
        let result = verifier.run(|e| events.push(e.clone())).unwrap();
        (result, events)
    }

    #[test]
    fn obsolete_md5_digest_reports_once() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"foo");
        store
            .record_digest(&"r".into(), 1, StoredDigest::new("MD5", digest_bytes(Algorithm::Md5, b"foo")))
            .unwrap();

        let (result, events) = run(store.clone(), &sha1_config());
        let obsolete = events
            .iter()
            .filter(|e| matches!(e.outcome, VerifyOutcome::ObsoleteContentOk { .. }))
            .count();
        assert_eq!(obsolete, 1);
        assert!(!events.iter().any(|e| e.outcome == VerifyOutcome::Mismatch));
        assert_eq!(result.obsolete_ok, 1);

        // Rebaselined to the current algorithm; a second sweep matches.
        let stored = store.stored_digest(&"r".into(), 1).unwrap();
        assert_eq!(stored.algorithm, "SHA-1");
        assert_eq!(stored.digest, digest_bytes(Algorithm::Sha1, b"foo"));
        let (again, _) = run(store, &sha1_config());
        assert_eq!(again.matching, 1);
    }

    #[test]
    fn rebaseline_can_be_disabled() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"foo");
        store
            .record_digest(&"r".into(), 1, StoredDigest::new("MD5", digest_bytes(Algorithm::Md5, b"foo")))
            .unwrap();
        let config = VerifyConfig {
            rebaseline_obsolete: false,
            ..sha1_config()
        };
        run(store.clone(), &config);
        assert_eq!(store.stored_digest(&"r".into(), 1).unwrap().algorithm, "MD5");
    }

    #[test]
    fn corruption_under_old_algorithm_is_mismatch() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"foo");
        store
            .record_digest(&"r".into(), 1, StoredDigest::new("MD5", digest_bytes(Algorithm::Md5, b"bar")))
            .unwrap();

        let (result, events) = run(store.clone(), &sha1_config());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, VerifyOutcome::Mismatch);
        assert_eq!(result.mismatched, 1);
        assert!(store.is_suspect(&"r".into(), 1));
    }

    #[test]
    fn same_algorithm_mismatch_marks_suspect() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"foo");
        store
            .record_digest(&"r".into(), 1, StoredDigest::new("SHA1", digest_bytes(Algorithm::Sha1, b"fob")))
            .unwrap();
        let (result, _) = run(store.clone(), &sha1_config());
        assert_eq!(result.mismatched, 1);
        assert!(store.is_suspect(&"r".into(), 1));
        assert!(!result.is_clean());
    }

    #[test]
    fn new_versions_become_baseline() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"one");
        store.add_version("r", b"two");

        let (result, events) = run(store.clone(), &sha1_config());
        assert_eq!(result.newly_hashed, 2);
        assert_eq!(result.bytes_hashed, 6);
        let order: Vec<_> = events.iter().map(|e| e.version).collect();
        assert_eq!(order, vec![Some(2), Some(1)]);
        assert_eq!(
            store.stored_digest(&"r".into(), 1).unwrap().digest,
            digest_bytes(Algorithm::Sha1, b"one")
        );

        let (again, _) = run(store, &sha1_config());
        assert_eq!(again.matching, 2);
        assert!(again.is_clean());
    }

    #[test]
    fn missing_content_with_digest_is_reported() {
        let store = Arc::new(MemoryStore::new("t"));
        store.insert_missing_version("r", 1);
        store
            .record_digest(&"r".into(), 1, StoredDigest::new("SHA-1", vec![0u8; 20]))
            .unwrap();
        store.insert_missing_version("quiet", 1);

        let (result, events) = run(store, &sha1_config());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, VerifyOutcome::DigestButNoContent);
        assert_eq!(result.no_content, 1);
    }

    #[test]
    fn unsupported_old_algorithm_stops_that_resource_only() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("a", b"old");
        store.add_version("a", b"new");
        store
            .record_digest(&"a".into(), 2, StoredDigest::new("CRC32", vec![1, 2, 3, 4]))
            .unwrap();
        store.add_version("b", b"fine");

        let (result, events) = run(store, &sha1_config());
        let a_events: Vec<_> = events.iter().filter(|e| e.resource.as_str() == "a").collect();
        assert_eq!(a_events.len(), 1);
        assert!(matches!(a_events[0].outcome, VerifyOutcome::Error { .. }));
        assert_eq!(result.errors, 1);
        assert_eq!(result.newly_hashed, 1);
    }

    #[test]
    fn read_failure_is_version_error() {
        let store = Arc::new(MemoryStore::new("t"));
        store.add_version("r", b"data");
        store.fail_reads(&"r".into(), 1);
        let (result, events) = run(store, &sha1_config());
        assert_eq!(result.errors, 1);
        assert_eq!(events[0].version, Some(1));
    }

    #[test]
    fn event_serializes_flat() {
        let e = event(&"r".into(), 3, VerifyOutcome::ObsoleteContentOk {
            stored_algorithm: "MD5".into(),
        });
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"outcome\":\"obsolete_content_ok\""));
        assert!(json.contains("\"stored_algorithm\":\"MD5\""));
    }
}
