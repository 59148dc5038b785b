//! Digest over the names of a tree's resources.
//!
//! Every resource that has content contributes its identifier followed by a
//! NUL byte, in store order. The result is one digest per lane for the whole
//! tree rather than per-resource blocks.

use attest_core::ResourceId;
use attest_store::ContentStore;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::algorithm::{Algorithm, LaneDigest, Lanes};
use crate::error::HashResult;
use crate::hasher::{payload_budget, TreeHasher};

pub struct NameHasher {
    store: Arc<dyn ContentStore>,
    tree_id: String,
    lane_count: usize,
    digests: Vec<Box<dyn LaneDigest>>,
    pending: VecDeque<ResourceId>,
    /// Name bytes (with separator) of the resource being fed, and how far we got
    current: Option<(Vec<u8>, usize)>,
    names_hashed: u64,
    estimate: u64,
    result: Option<Vec<Vec<u8>>>,
    done: bool,
}

impl NameHasher {
    pub fn new(store: Arc<dyn ContentStore>, algorithms: &[Algorithm], init: &[u8]) -> HashResult<Self> {
        let lanes = Lanes::new(algorithms, init)?;
        let pending: VecDeque<ResourceId> = store.list_resources()?.into();
        let estimate = pending.iter().map(|id| id.as_bytes().len() as u64 + 1).sum();
        let mut hasher = NameHasher {
            tree_id: store.tree_id().to_string(),
            store,
            lane_count: lanes.len(),
            digests: lanes.fresh(),
            pending,
            current: None,
            names_hashed: 0,
            estimate,
            result: None,
            done: false,
        };
        if hasher.pending.is_empty() {
            hasher.finalize();
        }
        Ok(hasher)
    }

    pub fn names_hashed(&self) -> u64 {
        self.names_hashed
    }

    fn next_name(&mut self) -> Option<(Vec<u8>, usize)> {
        while let Some(id) = self.pending.pop_front() {
            match self.store.has_content(&id) {
                Ok(true) => {
                    let mut name = id.as_bytes().to_vec();
                    name.push(0);
                    return Some((name, 0));
                }
                Ok(false) => {}
                Err(e) => warn!(resource = %id, "name hash skipping resource: {e}"),
            }
        }
        None
    }

    fn finalize(&mut self) {
        let digests = std::mem::take(&mut self.digests)
            .into_iter()
            .map(|d| d.finalize_boxed())
            .collect();
        debug!(tree = %self.tree_id, names = self.names_hashed, "name hash finished");
        self.result = Some(digests);
        self.done = true;
    }
}

impl TreeHasher for NameHasher {
    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn kind(&self) -> &'static str {
        "name"
    }

    fn step(&mut self, max_bytes: usize) -> HashResult<u64> {
        if self.done {
            return Ok(0);
        }
        let mut budget = payload_budget(max_bytes, self.lane_count);
        let mut consumed = 0usize;

        while budget > 0 {
            if self.current.is_none() {
                self.current = self.next_name();
            }
            let Some((name, pos)) = self.current.as_mut() else {
                break;
            };
            let n = (name.len() - *pos).min(budget);
            for d in self.digests.iter_mut() {
                d.update(&name[*pos..*pos + n]);
            }
            *pos += n;
            budget -= n;
            consumed += n;
            if *pos == name.len() {
                self.current = None;
                self.names_hashed += 1;
            }
        }

        if self.current.is_none() && self.pending.is_empty() {
            self.finalize();
        }
        Ok((consumed * self.lane_count) as u64)
    }

    fn finished(&self) -> bool {
        self.done
    }

    fn abort(&mut self) {
        self.pending.clear();
        self.current = None;
        self.digests.clear();
        self.done = true;
    }

    fn lanes(&self) -> usize {
        self.lane_count
    }

    fn estimated_payload_bytes(&self) -> u64 {
        self.estimate
    }

    fn take_digests(&mut self) -> Vec<Vec<u8>> {
        self.result.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::digest_bytes;
    use crate::hasher::run_to_completion;
    use attest_store::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new("names");
        store.add_version("b/page", b"2");
        store.add_version("a/index", b"1");
        store.insert_missing_version("c/lost", 1);
        Arc::new(store)
    }

    #[test]
    fn digests_names_with_content_in_order() {
        let mut hasher = NameHasher::new(store(), &[Algorithm::Sha1, Algorithm::Md5], b"").unwrap();
        let total = run_to_completion(&mut hasher, 3).unwrap();
        assert_eq!(total, 2 * ("a/index\0b/page\0".len() as u64));
        assert_eq!(hasher.names_hashed(), 2);

        let digests = hasher.take_digests();
        assert_eq!(digests[0], digest_bytes(Algorithm::Sha1, b"a/index\0b/page\0"));
        assert_eq!(digests[1], digest_bytes(Algorithm::Md5, b"a/index\0b/page\0"));
        assert!(hasher.take_digests().is_empty());
    }

    #[test]
    fn empty_tree_finishes_with_init_only_digest() {
        let hasher_store = Arc::new(MemoryStore::new("empty"));
        let mut hasher = NameHasher::new(hasher_store, &[Algorithm::Sha1], b"nonce").unwrap();
        assert!(hasher.finished());
        assert_eq!(hasher.take_digests()[0], digest_bytes(Algorithm::Sha1, b"nonce"));
    }

    #[test]
    fn abort_drops_result() {
        let mut hasher = NameHasher::new(store(), &[Algorithm::Sha1], b"").unwrap();
        hasher.step(2).unwrap();
        hasher.abort();
        assert!(hasher.finished());
        assert_eq!(hasher.step(10).unwrap(), 0);
        assert!(hasher.take_digests().is_empty());
    }
}
