//! Directory-backed content store.
//!
//! Layout: every resource is a directory (its id is the path relative to the
//! root, `/`-separated). Inside it, each version is a file named by its number
//! (`1`, `2`, ...). Version metadata lives in an optional JSON sidecar next to
//! it (`1.digest.json`). A sidecar without a content file describes a version
//! whose content has been lost.

use attest_core::{ResourceId, StoredDigest, VersionInfo, VersionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{ContentStore, VersionStream};

const SIDECAR_SUFFIX: &str = ".digest.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    stored_digest: Option<StoredDigest>,
    #[serde(default)]
    suspect: bool,
}

#[derive(Debug, Default)]
struct DirEntryInfo {
    content_size: Option<u64>,
    has_sidecar: bool,
}

pub struct DirStore {
    root: PathBuf,
    tree_id: String,
}

impl DirStore {
    /// Open the tree rooted at `root`. The tree id defaults to the root's file name.
    pub fn open(root: &Path) -> StoreResult<Self> {
        let meta = std::fs::metadata(root).map_err(|e| StoreError::io(root, e))?;
        if !meta.is_dir() {
            return Err(StoreError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        let tree_id = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("root")
            .to_string();
        Ok(DirStore {
            root: root.to_path_buf(),
            tree_id,
        })
    }

    pub fn with_tree_id(mut self, tree_id: impl Into<String>) -> Self {
        self.tree_id = tree_id.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_dir(&self, id: &ResourceId) -> StoreResult<PathBuf> {
        let rel = Path::new(id.as_str());
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::NotFound(id.clone()));
        }
        let dir = self.root.join(rel);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(dir)
    }

    fn scan_versions(dir: &Path) -> StoreResult<BTreeMap<VersionNumber, DirEntryInfo>> {
        let mut versions: BTreeMap<VersionNumber, DirEntryInfo> = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry.metadata().map_err(|e| StoreError::io(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            if let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) {
                if let Ok(n) = stem.parse::<VersionNumber>() {
                    versions.entry(n).or_default().has_sidecar = true;
                }
            } else if let Ok(n) = name.parse::<VersionNumber>() {
                versions.entry(n).or_default().content_size = Some(meta.len());
            }
        }
        Ok(versions)
    }

    fn sidecar_path(dir: &Path, version: VersionNumber) -> PathBuf {
        dir.join(format!("{version}{SIDECAR_SUFFIX}"))
    }

    fn read_sidecar(dir: &Path, version: VersionNumber) -> StoreResult<Sidecar> {
        let path = Self::sidecar_path(dir, version);
        if !path.exists() {
            return Ok(Sidecar::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|source| StoreError::Sidecar { path, source })
    }

    /// Write via temp file + rename so a crash never leaves a torn sidecar.
    fn write_sidecar(dir: &Path, version: VersionNumber, sidecar: &Sidecar) -> StoreResult<()> {
        let path = Self::sidecar_path(dir, version);
        let json = serde_json::to_string_pretty(sidecar).map_err(|source| StoreError::Sidecar {
            path: path.clone(),
            source,
        })?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json).map_err(|e| StoreError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn update_sidecar(
        &self,
        id: &ResourceId,
        version: VersionNumber,
        f: impl FnOnce(&mut Sidecar),
    ) -> StoreResult<()> {
        let dir = self.resource_dir(id)?;
        let known = Self::scan_versions(&dir)?;
        if !known.contains_key(&version) {
            return Err(StoreError::VersionNotFound {
                id: id.clone(),
                version,
            });
        }
        let mut sidecar = Self::read_sidecar(&dir, version)?;
        f(&mut sidecar);
        Self::write_sidecar(&dir, version, &sidecar)
    }

    fn collect_resources(&self, dir: &Path, out: &mut Vec<ResourceId>) -> StoreResult<()> {
        let mut subdirs = Vec::new();
        let mut is_resource = false;
        for entry in std::fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(|e| StoreError::io(&path, e))?;
            if meta.is_dir() {
                subdirs.push(path);
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let stem = name.strip_suffix(SIDECAR_SUFFIX).unwrap_or(name);
                if stem.parse::<VersionNumber>().is_ok() {
                    is_resource = true;
                }
            }
        }

        if is_resource && dir != self.root {
            if let Ok(rel) = dir.strip_prefix(&self.root) {
                let id = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(ResourceId::new(id));
            }
        }

        for sub in subdirs {
            self.collect_resources(&sub, out)?;
        }
        Ok(())
    }
}

impl ContentStore for DirStore {
    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn list_resources(&self) -> StoreResult<Vec<ResourceId>> {
        let mut out = Vec::new();
        self.collect_resources(&self.root, &mut out)?;
        out.sort();
        debug!(root = %self.root.display(), resources = out.len(), "listed resources");
        Ok(out)
    }

    fn has_content(&self, id: &ResourceId) -> StoreResult<bool> {
        let dir = self.resource_dir(id)?;
        Ok(Self::scan_versions(&dir)?
            .values()
            .any(|v| v.content_size.is_some()))
    }

    fn list_versions(&self, id: &ResourceId, max: usize) -> StoreResult<Vec<VersionInfo>> {
        let dir = self.resource_dir(id)?;
        let limit = if max == 0 { usize::MAX } else { max };
        let mut out = Vec::new();
        for (number, info) in Self::scan_versions(&dir)?.into_iter().rev().take(limit) {
            let sidecar = if info.has_sidecar {
                Self::read_sidecar(&dir, number)?
            } else {
                Sidecar::default()
            };
            out.push(VersionInfo {
                number,
                size: info.content_size.unwrap_or(0),
                has_content: info.content_size.is_some(),
                stored_digest: sidecar.stored_digest,
                suspect: sidecar.suspect,
            });
        }
        Ok(out)
    }

    fn open_version(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<VersionStream> {
        let dir = self.resource_dir(id)?;
        let path = dir.join(version.to_string());
        if !path.is_file() {
            return Err(if Self::sidecar_path(&dir, version).exists() {
                StoreError::NoContent {
                    id: id.clone(),
                    version,
                }
            } else {
                StoreError::VersionNotFound {
                    id: id.clone(),
                    version,
                }
            });
        }
        let file = std::fs::File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn record_digest(
        &self,
        id: &ResourceId,
        version: VersionNumber,
        digest: StoredDigest,
    ) -> StoreResult<()> {
        self.update_sidecar(id, version, |s| s.stored_digest = Some(digest))
    }

    fn mark_suspect(&self, id: &ResourceId, version: VersionNumber) -> StoreResult<()> {
        self.update_sidecar(id, version, |s| s.suspect = true)
    }
}
