use attest_core::{AttestError, ResourceId, VersionNumber};
use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    #[error("version {version} of {id} not found")]
    VersionNotFound {
        id: ResourceId,
        version: VersionNumber,
    },

    #[error("version {version} of {id} has no content")]
    NoContent {
        id: ResourceId,
        version: VersionNumber,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt digest sidecar {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<StoreError> for AttestError {
    fn from(e: StoreError) -> Self {
        AttestError::Store(e.to_string())
    }
}
