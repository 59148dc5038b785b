//! In-memory content store.
//!
//! Holds every version as a shared byte buffer so readers are cheap to open.
//! Also supports read-failure injection, which the hasher tests use to
//! exercise per-version error handling.

use attest_core::{ResourceId, StoredDigest, VersionInfo, VersionNumber};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{StoreError, StoreResult};
use crate::traits::{ContentStore, VersionStream};

#[derive(Debug, Clone, Default)]
struct MemVersion {
    content: Option<Arc<[u8]>>,
    stored_digest: Option<StoredDigest>,
    suspect: bool,
    fail_reads: bool,
}

type Resources = BTreeMap<ResourceId, BTreeMap<VersionNumber, MemVersion>>;

/// Thread-safe in-memory store keyed by resource id (iterated in sorted order).
pub struct MemoryStore {
    tree_id: String,
    resources: RwLock<Resources>,
}

impl MemoryStore {
    pub fn new(tree_id: impl Into<String>) -> Self {
        MemoryStore {
            tree_id: tree_id.into(),
            resources: RwLock::new(BTreeMap::new()),
        }
    }

    /// Append a new version of `id` and return its number (versions start at 1).
    pub fn add_version(&self, id: impl Into<ResourceId>, content: &[u8]) -> VersionNumber {
        let mut map = self.write();
        let versions = map.entry(id.into()).or_default();
        let next = versions.keys().next_back().map(|v| v + 1).unwrap_or(1);
        versions.insert(
            next,
            MemVersion {
                content: Some(Arc::from(content)),
                ..MemVersion::default()
            },
        );
        next
    }

    /// Insert (or replace) a specific version number.
    pub fn insert_version(
        &self,
        id: impl Into<ResourceId>,
        version: VersionNumber,
        content: &[u8],
    ) {
        let mut map = self.write();
        let slot = map
            .entry(id.into())
            .or_default()
            .entry(version)
            .or_default();
        slot.content = Some(Arc::from(content));
    }

    /// Insert a version whose metadata exists but whose content is gone.
    pub fn insert_missing_version(&self, id: impl Into<ResourceId>, version: VersionNumber) {
        let mut map = self.write();
        let slot = map
            .entry(id.into())
            .or_default()
            .entry(version)
            .or_default();
        slot.content = None;
    }

    /// Make every read of this version fail with an I/O error.
    pub fn fail_reads(&self, id: &ResourceId, version: VersionNumber) {
        if let Some(v) = self.write().get_mut(id).and_then(|vs| vs.get_mut(&version)) {
            v.fail_reads = true;
        }
    }

    pub fn stored_digest(&self, id: &ResourceId, version: VersionNumber) -> Option<StoredDigest> {
        self.read()
            .get(id)
            .and_then(|vs| vs.get(&version))
            .and_then(|v| v.stored_digest.clone())
    }

    pub fn is_suspect(&self, id: &ResourceId, version: VersionNumber) -> bool {
        self.read()
            .get(id)
            .and_then(|vs| vs.get(&version))
            .map(|v| v.suspect)
            .unwrap_or(false)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Resources> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Resources> {
        self.resources.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_version<T>(
        &self,
        id: &ResourceId,
        version: VersionNumber,
        f: impl FnOnce(&mut MemVersion) -> T,
    ) -> StoreResult<T> {
        let mut map = self.write();
        let versions = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let v = versions
            .get_mut(&version)
            .ok_or_else(|| StoreError::VersionNotFound {
                id: id.clone(),
                version,
            })?;
        Ok(f(v))
    }
}

impl ContentStore for MemoryStore {
    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn list_resources(&self) -> StoreResult<Vec<ResourceId>> {
        Ok(self.read().keys().cloned().collect())
    }

    fn has_content(&self, id: &ResourceId) -> StoreResult<bool> {
        let map = self.read();
        let versions = map.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(versions.values().any(|v| v.content.is_some()))
    }

    fn list_versions(&self, id: &ResourceId, max: usize) -> StoreResult<Vec<VersionInfo>> {
        let map = self.read();
        let versions = map.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let limit = if max == 0 { usize::MAX } else { max };
        Ok(versions
            .iter()
            .rev()
            .take(limit)
            .map(|(&number, v)| VersionInfo {
                number,
                size: v.content.as_ref().map(|c| c.len() as u64).unwrap_or(0),
                has_content: v.content.is_some(),
                stored_digest: v.stored_digest.clone(),
                suspect: v.suspect,
            })
            .collect())
    }

    fn open_version(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<VersionStream> {
        let map = self.read();
        let v = map
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?
            .get(&version)
            .ok_or_else(|| StoreError::VersionNotFound {
                id: id.clone(),
                version,
            })?;
        let content = v.content.clone().ok_or_else(|| StoreError::NoContent {
            id: id.clone(),
            version,
        })?;
        if v.fail_reads {
            return Ok(Box::new(FailingReader));
        }
        Ok(Box::new(Cursor::new(content)))
    }

    fn record_digest(
        &self,
        id: &ResourceId,
        version: VersionNumber,
        digest: StoredDigest,
    ) -> StoreResult<()> {
        self.with_version(id, version, |v| v.stored_digest = Some(digest))
    }

    fn mark_suspect(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<()> {
        self.with_version(id, version, |v| v.suspect = true)
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other("injected read failure"))
    }
}
