pub mod config;
pub mod error;
pub mod types;

pub use error::{AttestError, AttestResult};
pub use types::{ResourceId, StoredDigest, VersionInfo, VersionNumber};
