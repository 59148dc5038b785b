//! The content-store contract consumed by the hashers and the local verifier.

use attest_core::{ResourceId, StoredDigest, VersionInfo, VersionNumber};
use std::io::Read;

use crate::error::StoreResult;

/// An open, read-only byte stream over one stored version
pub type VersionStream = Box<dyn Read + Send>;

/// A tree of versioned resources.
///
/// Implementations only hand out readers; the hashers never mutate content.
/// `record_digest` and `mark_suspect` touch version metadata only.
pub trait ContentStore: Send + Sync {
    /// Identifier of the whole resource tree (used for cancellation and reporting)
    fn tree_id(&self) -> &str;

    /// All resources in the tree, in a stable order.
    fn list_resources(&self) -> StoreResult<Vec<ResourceId>>;

    /// True if at least one version of `id` still has content.
    fn has_content(&self, id: &ResourceId) -> StoreResult<bool>;

    /// Versions of `id`, newest first. `max == 0` returns every version.
    fn list_versions(&self, id: &ResourceId, max: usize) -> StoreResult<Vec<VersionInfo>>;

    /// Open the content of one version for reading.
    fn open_version(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<VersionStream>;

    /// Replace the stored digest recorded for one version.
    fn record_digest(
        &self,
        id: &ResourceId,
        version: VersionNumber,
        digest: StoredDigest,
    ) -> StoreResult<()>;

    /// Flag one version as failing local verification.
    fn mark_suspect(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<()>;

    /// Size of the newest version of `id` (0 if it has none).
    fn size(&self, id: &ResourceId) -> StoreResult<u64> {
        Ok(self
            .list_versions(id, 1)?
            .first()
            .map(|v| v.size)
            .unwrap_or(0))
    }

    /// Digest recorded for the newest version of `id`, if any.
    fn prior_stored_digest(&self, id: &ResourceId) -> StoreResult<Option<StoredDigest>> {
        Ok(self
            .list_versions(id, 1)?
            .into_iter()
            .next()
            .and_then(|v| v.stored_digest))
    }
}
