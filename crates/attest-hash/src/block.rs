//! Per-resource hashing results.

use attest_core::{ResourceId, VersionNumber};
use serde::Serialize;

/// Result of hashing one stored version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionResult {
    pub version: VersionNumber,
    /// Position in the raw stream where hashing began (0 for whole-version hashing)
    pub unfiltered_offset: u64,
    /// Raw bytes read from the store
    pub unfiltered_length: u64,
    /// Position in the filtered stream where hashing began
    pub filtered_offset: u64,
    /// Bytes the digests actually saw (after any content filter)
    pub filtered_length: u64,
    /// One finalized digest per lane; empty when `error` is set
    #[serde(serialize_with = "hex_vec")]
    pub digests: Vec<Vec<u8>>,
    pub error: Option<String>,
}

impl VersionResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Digest for lane `i`, if the version hashed cleanly.
    pub fn digest(&self, lane: usize) -> Option<&[u8]> {
        self.digests.get(lane).map(Vec::as_slice)
    }
}

fn hex_vec<S: serde::Serializer>(digests: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(digests.iter().map(hex::encode))
}

/// Hashing result for one resource across all of its hashed versions.
///
/// Versions are kept newest first no matter in which order they finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashBlock {
    resource: ResourceId,
    versions: Vec<VersionResult>,
}

impl HashBlock {
    pub fn new(resource: ResourceId) -> Self {
        HashBlock {
            resource,
            versions: Vec::new(),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Insert a version result in descending version order.
    pub fn add_version(&mut self, result: VersionResult) {
        let at = self
            .versions
            .partition_point(|v| v.version > result.version);
        self.versions.insert(at, result);
    }

    pub fn versions(&self) -> &[VersionResult] {
        &self.versions
    }

    /// The newest hashed version.
    pub fn current(&self) -> Option<&VersionResult> {
        self.versions.first()
    }

    pub fn version(&self, number: VersionNumber) -> Option<&VersionResult> {
        self.versions.iter().find(|v| v.version == number)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn all_errors(&self) -> bool {
        !self.versions.is_empty() && self.versions.iter().all(VersionResult::is_error)
    }

    pub fn total_filtered_length(&self) -> u64 {
        self.versions.iter().map(|v| v.filtered_length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vr(version: VersionNumber) -> VersionResult {
        VersionResult {
            version,
            unfiltered_offset: 0,
            unfiltered_length: 3,
            filtered_offset: 0,
            filtered_length: 3,
            digests: vec![vec![version as u8]],
            error: None,
        }
    }

    #[test]
    fn versions_iterate_newest_first() {
        let mut block = HashBlock::new("r".into());
        block.add_version(vr(1));
        block.add_version(vr(2));
        block.add_version(vr(3));
        let order: Vec<_> = block.versions().iter().map(|v| v.version).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(block.current().unwrap().version, 3);
        assert_eq!(block.version(2).unwrap().digest(0), Some(&[2u8][..]));
        assert_eq!(block.total_filtered_length(), 9);
    }

    #[test]
    fn all_errors_requires_every_version_failed() {
        let mut block = HashBlock::new("r".into());
        assert!(!block.all_errors());
        let mut bad = vr(1);
        bad.digests.clear();
        bad.error = Some("boom".into());
        block.add_version(bad.clone());
        assert!(block.all_errors());
        block.add_version(vr(2));
        assert!(!block.all_errors());
    }

    proptest! {
        #[test]
        fn order_independent_of_insertion(mut numbers in proptest::collection::hash_set(1u32..1000, 1..20)
            .prop_map(|s| s.into_iter().collect::<Vec<_>>())) {
            let mut block = HashBlock::new("r".into());
            for &n in &numbers {
                block.add_version(vr(n));
            }
            numbers.sort_unstable_by(|a, b| b.cmp(a));
            let got: Vec<_> = block.versions().iter().map(|v| v.version).collect();
            prop_assert_eq!(got, numbers);
        }
    }
}
