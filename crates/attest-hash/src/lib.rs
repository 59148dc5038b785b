//! attest-hash: incremental content hashing
//!
//! - [`BlockHasher`]: hashes the newest versions of every resource in a tree
//!   through one or more digest lanes, in bounded, resumable steps
//! - [`NameHasher`]: digests the tree's resource names
//! - [`SampledBlockHasher`]: a block hasher limited to a poll's sample
//! - [`LocalVerifier`]: synchronous sweep comparing fresh digests with stored ones
//!
//! All hashers implement [`TreeHasher`], the interface the scheduler drives.

pub mod algorithm;
pub mod block;
pub mod block_hasher;
pub mod error;
pub mod filter;
pub mod hasher;
pub mod name_hasher;
pub mod sampled;
pub mod sampler;
pub mod verify;

pub use algorithm::{digest_bytes, digest_reader, parse_algorithms, Algorithm, LaneDigest, Lanes};
pub use block::{HashBlock, VersionResult};
pub use block_hasher::{BlockHandler, BlockHasher, BlockHasherBuilder, BlockHasherStats};
pub use error::{HashError, HashResult};
pub use filter::{ContentFilter, WhitespaceFilter};
pub use hasher::{run_to_completion, ResourceSelector, TreeHasher};
pub use name_hasher::NameHasher;
pub use sampled::SampledBlockHasher;
pub use sampler::{
    included_in_sample, AllSubstance, PatternSubstance, SampleSelector, SampleStats, Sampler,
    SubstanceChecker,
};
pub use verify::{LocalHashResult, LocalVerifier, VerifyEvent, VerifyOutcome};
