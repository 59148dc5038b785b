//! attest-store: the content store the hashers read from
//!
//! - `ContentStore`: ordered, versioned byte streams per resource, plus the
//!   digest bookkeeping the local verifier writes back
//! - `memory`: in-process store used by tests and demos
//! - `dir`: a directory tree of numbered version files with JSON sidecars

pub mod dir;
pub mod error;
pub mod memory;
pub mod traits;

pub use dir::DirStore;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use traits::{ContentStore, VersionStream};
