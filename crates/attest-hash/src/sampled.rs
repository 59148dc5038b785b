//! Block hashing restricted to a poll's sample.

use std::sync::Arc;

use crate::block::HashBlock;
use crate::block_hasher::{BlockHasher, BlockHasherBuilder, BlockHasherStats};
use crate::error::HashResult;
use crate::hasher::TreeHasher;
use crate::sampler::{SampleSelector, SampleStats, Sampler, SubstanceChecker};

/// A `BlockHasher` that only hashes resources passing both the sample and
/// substance tests. Unselected resources are treated like resources without
/// content: no stream is opened and no block is emitted.
pub struct SampledBlockHasher {
    inner: BlockHasher,
    selector: Arc<SampleSelector>,
}

impl SampledBlockHasher {
    /// Any selector already set on `builder` is replaced.
    pub fn new(
        builder: BlockHasherBuilder,
        sampler: Sampler,
        substance: Arc<dyn SubstanceChecker>,
    ) -> HashResult<Self> {
        let selector = Arc::new(SampleSelector::new(sampler, substance));
        let inner = builder.selector(selector.clone()).build()?;
        Ok(SampledBlockHasher { inner, selector })
    }

    pub fn sampler(&self) -> &Sampler {
        self.selector.sampler()
    }

    pub fn sample_stats(&self) -> SampleStats {
        self.selector.stats()
    }

    pub fn stats(&self) -> BlockHasherStats {
        self.inner.stats()
    }

    pub fn take_blocks(&mut self) -> Vec<HashBlock> {
        self.inner.take_blocks()
    }
}

impl TreeHasher for SampledBlockHasher {
    fn tree_id(&self) -> &str {
        self.inner.tree_id()
    }

    fn kind(&self) -> &'static str {
        "sampled-content"
    }

    fn step(&mut self, max_bytes: usize) -> HashResult<u64> {
        self.inner.step(max_bytes)
    }

    fn finished(&self) -> bool {
        self.inner.finished()
    }

    fn abort(&mut self) {
        self.inner.abort()
    }

    fn lanes(&self) -> usize {
        self.inner.lanes()
    }

    fn estimated_payload_bytes(&self) -> u64 {
        self.inner.estimated_payload_bytes()
    }
}
