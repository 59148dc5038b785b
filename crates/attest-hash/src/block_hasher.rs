//! Stepwise, resumable content hashing across versions and digest lanes.
//!
//! A `BlockHasher` walks the resources of a tree in store order. For each
//! resource it hashes the newest `max_versions` versions side by side: every
//! version gets its own clone of the primed lanes, and each `step` spreads its
//! byte budget across the versions still open. A version whose stream ends is
//! finalized into a `VersionResult`; once every version of the resource is
//! done the resulting `HashBlock` is handed to the block handler (or queued
//! for `take_blocks`) and the hasher moves on.
//!
//! Streams are opened lazily on first read and closed as soon as the version
//! finishes, fails, or the hasher is aborted.

use attest_core::config::HasherConfig;
use attest_core::{ResourceId, VersionInfo};
use attest_store::{ContentStore, VersionStream};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::algorithm::{parse_algorithms, Algorithm, LaneDigest, Lanes};
use crate::block::{HashBlock, VersionResult};
use crate::error::HashResult;
use crate::filter::{ContentFilter, CountingReader};
use crate::hasher::{payload_budget, ResourceSelector, TreeHasher};

/// Receives each finished block
pub type BlockHandler = Box<dyn FnMut(HashBlock) + Send>;

/// Running counters for one hashing run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockHasherStats {
    /// Resources for which a block was produced
    pub resources_hashed: u64,
    /// Resources skipped because they have no content
    pub resources_skipped: u64,
    /// Resources the selector left out of the run
    pub resources_deselected: u64,
    /// Resources whose metadata could not be read
    pub resources_failed: u64,
    pub versions_hashed: u64,
    pub version_errors: u64,
    /// Payload bytes digested (not lane-weighted)
    pub payload_bytes: u64,
}

pub struct BlockHasherBuilder {
    store: Arc<dyn ContentStore>,
    algorithms: Vec<Algorithm>,
    init: Vec<u8>,
    lane_inits: Option<Vec<Vec<u8>>>,
    max_versions: usize,
    filter: Option<Arc<dyn ContentFilter>>,
    selector: Option<Arc<dyn ResourceSelector>>,
    handler: Option<BlockHandler>,
    resources: Option<Vec<ResourceId>>,
}

impl BlockHasherBuilder {
    pub fn algorithms(mut self, algorithms: &[Algorithm]) -> Self {
        self.algorithms = algorithms.to_vec();
        self
    }

    /// Init prefix fed to every lane before any content.
    pub fn init_bytes(mut self, init: &[u8]) -> Self {
        self.init = init.to_vec();
        self
    }

    /// Distinct init prefix per lane; must match the number of algorithms.
    pub fn lane_init_bytes(mut self, inits: Vec<Vec<u8>>) -> Self {
        self.lane_inits = Some(inits);
        self
    }

    /// Versions hashed per resource, newest first (0 = all).
    pub fn max_versions(mut self, max_versions: usize) -> Self {
        self.max_versions = max_versions;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn ContentFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn ResourceSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn on_block(mut self, handler: impl FnMut(HashBlock) + Send + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Restrict the run to these resources instead of the whole tree.
    pub fn resources(mut self, resources: Vec<ResourceId>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Apply algorithm and version settings from config.
    pub fn config(mut self, config: &HasherConfig) -> HashResult<Self> {
        self.algorithms = parse_algorithms(&config.algorithms)?;
        self.max_versions = config.max_versions;
        Ok(self)
    }

    pub fn build(self) -> HashResult<BlockHasher> {
        let lanes = match &self.lane_inits {
            Some(inits) => Lanes::with_lane_inits(&self.algorithms, inits)?,
            None => Lanes::new(&self.algorithms, &self.init)?,
        };

        let candidates = match self.resources {
            Some(r) => r,
            None => self.store.list_resources()?,
        };

        let mut stats = BlockHasherStats::default();
        let mut pending = VecDeque::with_capacity(candidates.len());
        let mut estimate = 0u64;
        for id in candidates {
            if let Some(selector) = &self.selector {
                if !selector.select(&id) {
                    stats.resources_deselected += 1;
                    continue;
                }
            }
            match self.store.list_versions(&id, self.max_versions) {
                Ok(versions) => {
                    estimate += versions
                        .iter()
                        .filter(|v| v.has_content)
                        .map(|v| v.size)
                        .sum::<u64>();
                }
                Err(e) => debug!(resource = %id, "no size estimate: {e}"),
            }
            pending.push_back(id);
        }

        let tree_id = self.store.tree_id().to_string();
        let done = pending.is_empty();
        Ok(BlockHasher {
            store: self.store,
            tree_id,
            lanes,
            max_versions: self.max_versions,
            filter: self.filter,
            handler: self.handler,
            pending,
            current: None,
            completed: Vec::new(),
            stats,
            estimate,
            done,
        })
    }
}

pub struct BlockHasher {
    store: Arc<dyn ContentStore>,
    tree_id: String,
    lanes: Lanes,
    max_versions: usize,
    filter: Option<Arc<dyn ContentFilter>>,
    handler: Option<BlockHandler>,
    pending: VecDeque<ResourceId>,
    current: Option<ActiveResource>,
    completed: Vec<HashBlock>,
    stats: BlockHasherStats,
    estimate: u64,
    done: bool,
}

impl BlockHasher {
    /// Defaults: one SHA-1 lane, no init bytes, newest version only.
    pub fn builder(store: Arc<dyn ContentStore>) -> BlockHasherBuilder {
        BlockHasherBuilder {
            store,
            algorithms: vec![Algorithm::Sha1],
            init: Vec::new(),
            lane_inits: None,
            max_versions: 1,
            filter: None,
            selector: None,
            handler: None,
            resources: None,
        }
    }

    pub fn stats(&self) -> BlockHasherStats {
        self.stats
    }

    pub fn algorithms(&self) -> &[Algorithm] {
        self.lanes.algorithms()
    }

    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    /// Blocks finished so far, when no handler was installed.
    pub fn take_blocks(&mut self) -> Vec<HashBlock> {
        std::mem::take(&mut self.completed)
    }

    /// Make the next resource with hashable content current. False when none remain.
    fn start_next_resource(&mut self) -> bool {
        while let Some(id) = self.pending.pop_front() {
            match self.store.has_content(&id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(resource = %id, "skipping: no content");
                    self.stats.resources_skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(resource = %id, "skipping: {e}");
                    self.stats.resources_failed += 1;
                    continue;
                }
            }

            let versions = match self.store.list_versions(&id, self.max_versions) {
                Ok(v) => v,
                Err(e) => {
                    warn!(resource = %id, "skipping: listing versions: {e}");
                    self.stats.resources_failed += 1;
                    continue;
                }
            };

            let slots: Vec<VersionSlot> = versions
                .into_iter()
                .filter(|v| v.has_content)
                .map(|info| VersionSlot::new(info, self.lanes.fresh()))
                .collect();
            if slots.is_empty() {
                self.stats.resources_skipped += 1;
                continue;
            }

            self.current = Some(ActiveResource {
                block: HashBlock::new(id),
                slots,
            });
            return true;
        }
        false
    }

    fn close_finished_versions(&mut self) {
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let (done, open): (Vec<_>, Vec<_>) = std::mem::take(&mut active.slots)
            .into_iter()
            .partition(VersionSlot::is_done);
        active.slots = open;

        for slot in done {
            let result = slot.into_result();
            if let Some(err) = &result.error {
                warn!(
                    resource = %active.block.resource(),
                    version = result.version,
                    "version hash failed: {err}"
                );
                self.stats.version_errors += 1;
            } else {
                self.stats.versions_hashed += 1;
            }
            active.block.add_version(result);
        }

        if active.slots.is_empty() {
            if let Some(finished) = self.current.take() {
                self.emit(finished.block);
            }
        }
    }

    fn emit(&mut self, block: HashBlock) {
        debug!(
            resource = %block.resource(),
            versions = block.len(),
            bytes = block.total_filtered_length(),
            "block hashed"
        );
        self.stats.resources_hashed += 1;
        match self.handler.as_mut() {
            Some(handler) => handler(block),
            None => self.completed.push(block),
        }
    }
}

impl TreeHasher for BlockHasher {
    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn kind(&self) -> &'static str {
        "content"
    }

    fn step(&mut self, max_bytes: usize) -> HashResult<u64> {
        if self.done {
            return Ok(0);
        }
        let mut budget = payload_budget(max_bytes, self.lanes.len());
        let mut consumed = 0u64;

        while budget > 0 {
            if self.current.is_none() && !self.start_next_resource() {
                break;
            }
            let Some(active) = self.current.as_mut() else {
                break;
            };
            let used = active.hash_round(budget, self.store.as_ref(), self.filter.as_deref());
            budget -= used;
            consumed += used as u64;
            self.close_finished_versions();
        }

        // Look ahead so `finished()` turns true on the step that read the last byte.
        if self.current.is_none() && !self.start_next_resource() {
            self.done = true;
        }

        self.stats.payload_bytes += consumed;
        Ok(consumed * self.lanes.len() as u64)
    }

    fn finished(&self) -> bool {
        self.done
    }

    fn abort(&mut self) {
        if let Some(active) = self.current.take() {
            debug!(
                resource = %active.block.resource(),
                open_versions = active.slots.len(),
                "hash aborted"
            );
        }
        self.pending.clear();
        self.done = true;
    }

    fn lanes(&self) -> usize {
        self.lanes.len()
    }

    fn estimated_payload_bytes(&self) -> u64 {
        self.estimate
    }
}

struct ActiveResource {
    block: HashBlock,
    slots: Vec<VersionSlot>,
}

impl ActiveResource {
    /// Split `budget` across the open versions; returns payload bytes consumed.
    fn hash_round(
        &mut self,
        budget: usize,
        store: &dyn ContentStore,
        filter: Option<&dyn ContentFilter>,
    ) -> usize {
        let n = self.slots.len();
        if n == 0 {
            return 0;
        }
        let base = budget / n;
        let extra = budget % n;
        let mut used = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let share = base + usize::from(i < extra);
            if share > 0 {
                used += slot.hash(share, self.block.resource(), store, filter);
            }
        }
        used
    }
}

struct VersionSlot {
    info: VersionInfo,
    reader: Option<VersionStream>,
    /// One byte read past the last share, so end of stream is seen without overreading
    lookahead: Option<u8>,
    buf: Vec<u8>,
    /// Raw byte counter, present when a filter sits between store and digests
    raw_count: Option<Arc<AtomicU64>>,
    consumed: u64,
    digests: Vec<Box<dyn LaneDigest>>,
    outcome: Option<Result<(), String>>,
}

impl VersionSlot {
    fn new(info: VersionInfo, digests: Vec<Box<dyn LaneDigest>>) -> Self {
        VersionSlot {
            info,
            reader: None,
            lookahead: None,
            buf: Vec::new(),
            raw_count: None,
            consumed: 0,
            digests,
            outcome: None,
        }
    }

    fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    fn open(
        &mut self,
        id: &ResourceId,
        store: &dyn ContentStore,
        filter: Option<&dyn ContentFilter>,
    ) -> Result<(), String> {
        let raw = store
            .open_version(id, self.info.number)
            .map_err(|e| e.to_string())?;
        let reader = match filter {
            Some(f) => {
                let count = Arc::new(AtomicU64::new(0));
                let counted: VersionStream = Box::new(CountingReader::new(raw, count.clone()));
                self.raw_count = Some(count);
                f.filter(id, counted)
            }
            None => raw,
        };
        self.reader = Some(reader);
        Ok(())
    }

    /// Digest up to `share` bytes; returns the bytes digested.
    ///
    /// At most `share + 1` bytes are pulled from the stream: the extra byte is
    /// held back and tells us whether the stream ended exactly on the share.
    fn hash(
        &mut self,
        share: usize,
        id: &ResourceId,
        store: &dyn ContentStore,
        filter: Option<&dyn ContentFilter>,
    ) -> usize {
        if self.reader.is_none() {
            if let Err(e) = self.open(id, store, filter) {
                self.fail(e);
                return 0;
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };

        self.buf.clear();
        self.buf.extend(self.lookahead.take());
        let want = (share + 1 - self.buf.len()) as u64;
        let read = reader.by_ref().take(want).read_to_end(&mut self.buf);
        if let Err(e) = read {
            self.fail(e.to_string());
            return 0;
        }

        let used = self.buf.len().min(share);
        for d in self.digests.iter_mut() {
            d.update(&self.buf[..used]);
        }
        self.consumed += used as u64;
        if self.buf.len() > share {
            self.lookahead = Some(self.buf[share]);
        } else {
            self.reader = None;
            self.outcome = Some(Ok(()));
        }
        used
    }

    fn fail(&mut self, msg: String) {
        self.reader = None;
        self.lookahead = None;
        self.digests.clear();
        self.outcome = Some(Err(msg));
    }

    fn into_result(self) -> VersionResult {
        let unfiltered = self
            .raw_count
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(self.consumed);
        let (digests, error) = match self.outcome {
            Some(Err(msg)) => (Vec::new(), Some(msg)),
            _ => (
                self.digests
                    .into_iter()
                    .map(|d| d.finalize_boxed())
                    .collect(),
                None,
            ),
        };
        VersionResult {
            version: self.info.number,
            unfiltered_offset: 0,
            unfiltered_length: unfiltered,
            filtered_offset: 0,
            filtered_length: self.consumed,
            digests,
            error,
        }
    }
}
