//! The blocked cache operator.
//!
//! [`OpBlockedCache`] decomposes its wrapped output's full extent into a
//! grid of fixed-size blocks anchored at the origin, computes each block as
//! a whole on first touch, and serves later reads of any overlapping ROI
//! from the stored blocks. Upstream dirtiness invalidates exactly the
//! intersecting blocks; an optional byte budget evicts the least recently
//! read block data while keeping the block's clean/dirty record ("dirty"
//! and "resident" are independent axes).
//!
//! # Dirty-vs-inflight race
//!
//! A block's dirty flag is cleared when its recompute is *issued*. A dirty
//! signal that arrives while the request is in flight re-marks the block and
//! survives the request's completion, so the read that started before the
//! signal may deliver the pre-dirty value once, and the next read
//! recomputes. This is an accepted race: the last write due to the freshest
//! upstream value wins, and reads are never locked against concurrent
//! dirtying.

use crate::cache::persist::{chunk_name, ChunkHeader, ChunkStore};
use crate::core::error::{
    ExecResult, ExecutionError, GraphError, GraphResult, PersistError, PersistResult,
};
use crate::core::roi::{BlockKey, Roi};
use crate::core::types::Tensor;
use crate::execution::progress::BatchTracker;
use crate::execution::request::Request;
use crate::graph::operator::{Graph, Operator, OperatorState};
use crate::graph::slot::Slot;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration of a blocked cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fixed per-axis chunk size. Required before first use; the grid is
    /// anchored at the origin.
    pub block_shape: Vec<usize>,
    /// Optional byte budget; exceeding it evicts least-recently-read block
    /// data.
    pub max_memory_bytes: Option<usize>,
    /// Free block data eagerly when marked dirty instead of recomputing
    /// lazily on the next read.
    pub free_on_dirty: bool,
}

impl CacheConfig {
    /// Configuration with the given block shape and no memory budget.
    pub fn new(block_shape: Vec<usize>) -> Self {
        assert!(
            !block_shape.is_empty() && block_shape.iter().all(|&b| b > 0),
            "block shape must have positive extents"
        );
        Self {
            block_shape,
            max_memory_bytes: None,
            free_on_dirty: false,
        }
    }

    /// Set the memory budget in bytes.
    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Free block data eagerly on invalidation.
    pub fn with_free_on_dirty(mut self, free: bool) -> Self {
        self.free_on_dirty = free;
        self
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Reads served from a stored block (including joins of an in-flight
    /// computation).
    pub hits: u64,
    /// Reads that issued a block computation.
    pub misses: u64,
    /// Block data discards under memory pressure.
    pub evictions: u64,
    /// Block computations issued (initial and after invalidation).
    pub recomputed_blocks: u64,
}

impl CacheStats {
    /// Fraction of block accesses served without issuing a computation.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Report of an [`OpBlockedCache::import_blocks`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Blocks imported clean (freshness precondition held).
    pub imported: usize,
    /// Blocks imported but marked dirty (fingerprint mismatch).
    pub stale: usize,
    /// Chunks that could not be placed into the grid at all.
    pub skipped: usize,
}

struct BlockCell {
    data: Option<Arc<Tensor>>,
    dirty: bool,
    inflight: Option<Request>,
}

struct Block {
    key: BlockKey,
    roi: Roi,
    cell: Mutex<BlockCell>,
}

/// Lock order: `blocks` map before a block `cell`; `recency`/`stats` are
/// leaf locks, taken with a cell lock held but never the other way around.
struct CacheShared {
    config: CacheConfig,
    blocks: Mutex<HashMap<BlockKey, Arc<Block>>>,
    recency: Mutex<LruCache<BlockKey, usize>>,
    resident_bytes: AtomicUsize,
    stats: Mutex<CacheStats>,
    fingerprint: Mutex<Option<u64>>,
}

impl CacheShared {
    fn touch(&self, key: &BlockKey, bytes: usize) {
        self.recency.lock().put(key.clone(), bytes);
    }

    /// Install freshly computed data for a block. The dirty flag is left
    /// untouched: a dirty signal raised mid-flight must survive completion.
    fn store_block(&self, block: &Arc<Block>, data: Arc<Tensor>) {
        // A reconfiguration may have dropped the grid while this request
        // was in flight; orphaned blocks are not re-admitted.
        let live = self
            .blocks
            .lock()
            .get(&block.key)
            .is_some_and(|b| Arc::ptr_eq(b, block));
        if !live {
            block.cell.lock().inflight = None;
            return;
        }
        let bytes = data.size_bytes();
        let previous_bytes = {
            let mut cell = block.cell.lock();
            let previous = cell.data.replace(data);
            cell.inflight = None;
            previous.map(|p| p.size_bytes())
        };
        if let Some(prev) = previous_bytes {
            self.resident_bytes.fetch_sub(prev, Ordering::SeqCst);
        }
        self.resident_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.touch(&block.key, bytes);
        self.evict_over_budget();
    }

    fn evict_over_budget(&self) {
        let Some(budget) = self.config.max_memory_bytes else {
            return;
        };
        while self.resident_bytes.load(Ordering::SeqCst) > budget {
            let Some((key, bytes)) = self.recency.lock().pop_lru() else {
                break;
            };
            let block = self.blocks.lock().get(&key).cloned();
            let Some(block) = block else { continue };

            let evicted = {
                let mut cell = block.cell.lock();
                if cell.inflight.is_some() {
                    None
                } else {
                    cell.data.take().map(|d| d.size_bytes())
                }
            };
            match evicted {
                Some(freed) => {
                    self.resident_bytes.fetch_sub(freed, Ordering::SeqCst);
                    self.stats.lock().evictions += 1;
                    log::debug!("evicted block {} ({} bytes)", key, freed);
                }
                None => {
                    // Block is being computed right now; make it most
                    // recent and stop rather than spin.
                    self.touch(&key, bytes);
                    break;
                }
            }
        }
    }

    fn mark_dirty(&self, roi: &Roi) {
        let snapshot: Vec<Arc<Block>> = self.blocks.lock().values().cloned().collect();
        let mut freed: Vec<(BlockKey, usize)> = Vec::new();
        for block in snapshot {
            if block.roi.intersection(roi).is_none() {
                continue;
            }
            let mut cell = block.cell.lock();
            cell.dirty = true;
            if self.config.free_on_dirty {
                if let Some(data) = cell.data.take() {
                    freed.push((block.key.clone(), data.size_bytes()));
                }
            }
        }
        for (key, bytes) in freed {
            self.resident_bytes.fetch_sub(bytes, Ordering::SeqCst);
            self.recency.lock().pop(&key);
        }
    }

    fn clear(&self) {
        self.blocks.lock().clear();
        self.recency.lock().clear();
        self.resident_bytes.store(0, Ordering::SeqCst);
    }
}

enum Fetch {
    Cached(Arc<Tensor>),
    Pending(Request),
}

/// A blocked, dirty-tracking cache wrapped around one upstream output.
///
/// The cache is itself an operator with one input and one output, so it
/// composes into pipelines like any other node: connect `input` to the
/// output to memoize, read through `output`.
///
/// Dirty policy: a dirty region on the input marks exactly the intersecting
/// blocks and is forwarded downstream with the same (narrowed) ROI.
pub struct OpBlockedCache {
    state: OperatorState,
    /// The wrapped upstream output.
    pub input: Slot,
    /// The cached view of the input.
    pub output: Slot,
    shared: Arc<CacheShared>,
}

impl OpBlockedCache {
    /// Create and register a blocked cache.
    pub fn new(graph: &Graph, config: CacheConfig) -> Arc<Self> {
        graph.register(Arc::new(Self {
            state: OperatorState::new("OpBlockedCache"),
            input: Slot::input("Input"),
            output: Slot::output("Output"),
            shared: Arc::new(CacheShared {
                config,
                blocks: Mutex::new(HashMap::new()),
                recency: Mutex::new(LruCache::unbounded()),
                resident_bytes: AtomicUsize::new(0),
                stats: Mutex::new(CacheStats::default()),
                fingerprint: Mutex::new(None),
            }),
        }))
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.lock().clone()
    }

    /// Bytes of block data currently resident.
    pub fn memory_usage(&self) -> usize {
        self.shared.resident_bytes.load(Ordering::SeqCst)
    }

    /// Number of block records (resident or not).
    pub fn block_count(&self) -> usize {
        self.shared.blocks.lock().len()
    }

    /// Number of blocks with data resident.
    pub fn resident_block_count(&self) -> usize {
        self.shared
            .blocks
            .lock()
            .values()
            .filter(|b| b.cell.lock().data.is_some())
            .count()
    }

    /// Drop every block record and all resident data.
    pub fn clear(&self) {
        self.shared.clear();
    }

    fn configured_shape(&self) -> ExecResult<(Vec<usize>, crate::core::types::Dtype)> {
        let meta = self.output.meta();
        let not_ready = || ExecutionError::SlotNotReady {
            slot: self.output.name().to_string(),
        };
        let shape = meta.shape.clone().ok_or_else(not_ready)?;
        let dtype = meta.dtype.ok_or_else(not_ready)?;
        Ok((shape, dtype))
    }

    fn block_entry(&self, key: BlockKey, full_shape: &[usize]) -> Arc<Block> {
        let mut blocks = self.shared.blocks.lock();
        blocks
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Block {
                    roi: Roi::block_roi(&key, &self.shared.config.block_shape, full_shape),
                    key,
                    cell: Mutex::new(BlockCell {
                        data: None,
                        dirty: false,
                        inflight: None,
                    }),
                })
            })
            .clone()
    }

    /// Serve a block from storage, join its in-flight computation, or issue
    /// a fresh one. At most one computation per block is ever in flight;
    /// concurrent callers share the same request.
    fn acquire(&self, block: &Arc<Block>) -> ExecResult<Fetch> {
        let mut cell = block.cell.lock();
        // In-flight first: once a recompute is issued the dirty flag is
        // already cleared, and any data still resident is the pre-dirty
        // value — it must not be served to readers arriving now.
        if let Some(request) = &cell.inflight {
            self.shared.stats.lock().hits += 1;
            return Ok(Fetch::Pending(request.clone()));
        }
        if !cell.dirty {
            if let Some(data) = &cell.data {
                self.shared.stats.lock().hits += 1;
                self.shared.touch(&block.key, data.size_bytes());
                return Ok(Fetch::Cached(data.clone()));
            }
        }

        {
            let mut stats = self.shared.stats.lock();
            stats.misses += 1;
            stats.recomputed_blocks += 1;
        }
        // Fresh as of request start; a dirty signal arriving mid-flight
        // re-marks the block and survives completion (see module docs).
        cell.dirty = false;

        let pool = self
            .input
            .pool()
            .ok_or_else(|| ExecutionError::SlotNotReady {
                slot: self.input.name().to_string(),
            })?;
        let input = self.input.clone();
        let target = block.clone();
        let shared = self.shared.clone();
        let label = format!("{}.block{}", self.name(), block.key);
        let request = pool.submit(label, move || match input.get(&target.roi) {
            Ok(data) => {
                shared.store_block(&target, data.clone());
                Ok(data)
            }
            Err(error) => {
                target.cell.lock().inflight = None;
                Err(error)
            }
        });
        cell.inflight = Some(request.clone());
        Ok(Fetch::Pending(request))
    }

    /// Seed data into the cache as if freshly computed, bypassing upstream
    /// execution.
    ///
    /// Blocks fully covered by `roi` are stored clean; partially covered
    /// blocks are patched in place when resident, otherwise marked dirty (a
    /// partial seed cannot fabricate the rest of the block). Downstream
    /// consumers are dirty-notified over `roi`.
    pub fn force_value(&self, roi: &Roi, value: &Tensor) -> ExecResult<()> {
        let (shape, dtype) = self.configured_shape()?;
        if !roi.contained_in_shape(&shape) {
            return Err(ExecutionError::out_of_bounds(roi, &shape));
        }
        if value.dtype() != dtype {
            return Err(ExecutionError::DtypeMismatch {
                expected: dtype,
                got: value.dtype(),
            });
        }
        if value.shape() != roi.shape() {
            return Err(ExecutionError::ComputationFailed {
                operator: self.name().to_string(),
                message: format!(
                    "value shape {:?} does not match roi {}",
                    value.shape(),
                    roi
                ),
            });
        }

        for sub in roi.split_into_blocks(&self.shared.config.block_shape) {
            let key = Roi::containing_block_key(sub.start(), &self.shared.config.block_shape);
            let block = self.block_entry(key, &shape);
            let patch = value.extract(&sub.relative_to(roi));

            let delta = {
                let mut cell = block.cell.lock();
                if sub == block.roi {
                    let previous = cell.data.replace(Arc::new(patch));
                    cell.dirty = false;
                    Some((
                        previous.map(|p| p.size_bytes()),
                        block.roi.num_elements() * dtype.size_bytes(),
                    ))
                } else if let Some(existing) = cell.data.clone() {
                    let mut updated = (*existing).clone();
                    updated
                        .assign(&sub.relative_to(&block.roi), &patch)
                        .map_err(|message| ExecutionError::ComputationFailed {
                            operator: self.name().to_string(),
                            message,
                        })?;
                    let bytes = updated.size_bytes();
                    cell.data = Some(Arc::new(updated));
                    Some((Some(existing.size_bytes()), bytes))
                } else {
                    log::warn!(
                        "partial force_value on absent block {}; marking dirty",
                        block.key
                    );
                    cell.dirty = true;
                    None
                }
            };
            if let Some((previous, bytes)) = delta {
                if let Some(prev) = previous {
                    self.shared.resident_bytes.fetch_sub(prev, Ordering::SeqCst);
                }
                self.shared.resident_bytes.fetch_add(bytes, Ordering::SeqCst);
                self.shared.touch(&block.key, bytes);
            }
        }
        self.shared.evict_over_budget();

        self.output.set_dirty(roi);
        Ok(())
    }

    /// Compute (or join) every block overlapping `roi` without assembling a
    /// result. Supports cooperative cancellation: once `tracker` is
    /// cancelled, no further block requests are issued and in-flight ones
    /// are cancelled; the cache state stays valid (no half-written blocks
    /// are marked clean).
    pub fn precompute(&self, roi: &Roi, tracker: Option<&BatchTracker>) -> ExecResult<()> {
        let (shape, _) = self.configured_shape()?;
        if !roi.contained_in_shape(&shape) {
            return Err(ExecutionError::out_of_bounds(roi, &shape));
        }
        if let Some(t) = tracker {
            t.start();
        }

        let cancelled = || tracker.is_some_and(BatchTracker::is_cancelled);
        let mut pending: Vec<Request> = Vec::new();
        for sub in roi.split_into_blocks(&self.shared.config.block_shape) {
            if cancelled() {
                for request in &pending {
                    request.cancel();
                }
                return Err(ExecutionError::Cancelled);
            }
            let key = Roi::containing_block_key(sub.start(), &self.shared.config.block_shape);
            let block = self.block_entry(key, &shape);
            match self.acquire(&block)? {
                Fetch::Cached(_) => {
                    if let Some(t) = tracker {
                        t.block_completed();
                    }
                }
                Fetch::Pending(request) => pending.push(request),
            }
        }

        for (i, request) in pending.iter().enumerate() {
            if cancelled() {
                for request in &pending[i..] {
                    request.cancel();
                }
                return Err(ExecutionError::Cancelled);
            }
            request.wait()?;
            if let Some(t) = tracker {
                t.block_completed();
            }
        }
        if let Some(t) = tracker {
            t.complete();
        }
        Ok(())
    }

    /// Serialize every clean, resident block into `store` as independently
    /// addressable chunks. Partial/sparse exports are expected: blocks that
    /// are absent, dirty, or mid-computation are simply not written.
    ///
    /// Cancellation or a write failure removes the chunks written so far,
    /// leaving the store as it was found.
    pub fn export_blocks(
        &self,
        store: &mut dyn ChunkStore,
        tracker: Option<&BatchTracker>,
    ) -> PersistResult<usize> {
        let meta = self.output.meta();
        let fingerprint = meta.fingerprint();
        let axistags = meta.axistags.clone();

        let snapshot: Vec<(BlockKey, Roi, Arc<Tensor>)> = {
            let blocks = self.shared.blocks.lock();
            blocks
                .values()
                .filter_map(|block| {
                    let cell = block.cell.lock();
                    match (&cell.data, cell.dirty, &cell.inflight) {
                        (Some(data), false, None) => {
                            Some((block.key.clone(), block.roi.clone(), data.clone()))
                        }
                        _ => None,
                    }
                })
                .collect()
        };

        if let Some(t) = tracker {
            t.start();
        }
        let mut written: Vec<String> = Vec::new();
        for (key, roi, data) in snapshot {
            if tracker.is_some_and(BatchTracker::is_cancelled) {
                rollback(store, &written);
                return Err(PersistError::Cancelled);
            }
            let name = chunk_name(&key, axistags.as_deref());
            let header = ChunkHeader {
                start: roi.start().to_vec(),
                stop: roi.stop().to_vec(),
                axistags: axistags.clone(),
                dtype: data.dtype(),
                block_shape: self.shared.config.block_shape.clone(),
                fingerprint,
            };
            if let Err(error) = store.write_chunk(&name, &header, &data.to_le_bytes()) {
                if let Some(t) = tracker {
                    t.report_error(error.to_string());
                }
                rollback(store, &written);
                return Err(error);
            }
            written.push(name);
            if let Some(t) = tracker {
                t.block_completed();
            }
        }
        if let Some(t) = tracker {
            t.complete();
        }
        log::debug!("exported {} blocks from '{}'", written.len(), self.name());
        Ok(written.len())
    }

    /// Re-hydrate the block grid from previously exported chunks.
    ///
    /// Chunks are imported clean when the freshness precondition holds
    /// (same block shape, same upstream configuration fingerprint);
    /// otherwise they are imported dirty, so the next read recomputes.
    /// Chunks that cannot be placed into the grid (rank, alignment, or
    /// element type mismatch) are skipped with a warning.
    pub fn import_blocks(&self, store: &dyn ChunkStore) -> PersistResult<ImportReport> {
        let meta = self.output.meta();
        let shape = meta
            .shape
            .clone()
            .ok_or_else(|| PersistError::Incompatible("cache is not configured".to_string()))?;
        let dtype = meta
            .dtype
            .ok_or_else(|| PersistError::Incompatible("cache is not configured".to_string()))?;
        let fingerprint = meta.fingerprint();

        let mut report = ImportReport::default();
        for name in store.list_chunks()? {
            let (header, bytes) = store.read_chunk(&name)?;
            let roi = header.roi();

            if roi.ndim() != shape.len() || !roi.contained_in_shape(&shape) {
                log::warn!("skipping chunk '{}': roi {} outside volume", name, roi);
                report.skipped += 1;
                continue;
            }
            let key = Roi::containing_block_key(roi.start(), &self.shared.config.block_shape);
            let expected = Roi::block_roi(&key, &self.shared.config.block_shape, &shape);
            if expected != roi {
                log::warn!(
                    "skipping chunk '{}': roi {} not aligned to block grid",
                    name,
                    roi
                );
                report.skipped += 1;
                continue;
            }
            if header.dtype != dtype {
                log::warn!(
                    "skipping chunk '{}': element type {} does not match {}",
                    name,
                    header.dtype,
                    dtype
                );
                report.skipped += 1;
                continue;
            }
            let tensor = match header.decode(&name, &bytes) {
                Ok(tensor) => tensor,
                Err(error) => {
                    log::warn!("skipping chunk '{}': {}", name, error);
                    report.skipped += 1;
                    continue;
                }
            };

            let fresh = header.fingerprint == fingerprint
                && header.block_shape == self.shared.config.block_shape;
            let block = self.block_entry(key, &shape);
            let bytes_installed = {
                let mut cell = block.cell.lock();
                if cell.inflight.is_some() {
                    // A live recompute is more current than the container.
                    report.skipped += 1;
                    None
                } else {
                    let previous = cell.data.replace(Arc::new(tensor));
                    cell.dirty = !fresh;
                    Some((previous.map(|p| p.size_bytes()), block.roi.num_elements()
                        * dtype.size_bytes()))
                }
            };
            if let Some((previous, bytes)) = bytes_installed {
                if let Some(prev) = previous {
                    self.shared.resident_bytes.fetch_sub(prev, Ordering::SeqCst);
                }
                self.shared.resident_bytes.fetch_add(bytes, Ordering::SeqCst);
                self.shared.touch(&block.key, bytes);
                if fresh {
                    report.imported += 1;
                } else {
                    report.stale += 1;
                }
            }
        }
        self.shared.evict_over_budget();
        log::debug!(
            "imported {} blocks ({} stale, {} skipped) into '{}'",
            report.imported,
            report.stale,
            report.skipped,
            self.name()
        );
        Ok(report)
    }
}

fn rollback(store: &mut dyn ChunkStore, written: &[String]) {
    for name in written {
        if let Err(error) = store.remove_chunk(name) {
            log::warn!("failed to remove partial chunk '{}': {}", name, error);
        }
    }
}

impl Operator for OpBlockedCache {
    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![self.output.clone()]
    }

    fn setup_outputs(&self) -> GraphResult<()> {
        let meta = self.input.meta();
        if let Some(shape) = &meta.shape {
            if shape.len() != self.shared.config.block_shape.len() {
                return Err(GraphError::ConstraintViolation {
                    operator: self.name().to_string(),
                    message: format!(
                        "block shape rank {} does not match data rank {}",
                        self.shared.config.block_shape.len(),
                        shape.len()
                    ),
                });
            }
        }

        // A changed upstream configuration invalidates every block.
        let fingerprint = meta.fingerprint();
        {
            let mut stored = self.shared.fingerprint.lock();
            if *stored != Some(fingerprint) {
                if stored.is_some() {
                    log::debug!(
                        "cache '{}' reconfigured; dropping {} blocks",
                        self.name(),
                        self.shared.blocks.lock().len()
                    );
                }
                self.shared.clear();
                *stored = Some(fingerprint);
            }
        }

        self.output.set_meta(meta);
        Ok(())
    }

    fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        let (shape, dtype) = self.configured_shape()?;
        let mut result = Tensor::zeros(dtype, &roi.shape());

        let mut pending: Vec<(Roi, Arc<Block>, Request)> = Vec::new();
        for sub in roi.split_into_blocks(&self.shared.config.block_shape) {
            let key = Roi::containing_block_key(sub.start(), &self.shared.config.block_shape);
            let block = self.block_entry(key, &shape);
            match self.acquire(&block)? {
                Fetch::Cached(data) => {
                    result
                        .assign(&sub.relative_to(roi), &data.extract(&sub.relative_to(&block.roi)))
                        .map_err(|message| ExecutionError::ComputationFailed {
                            operator: self.name().to_string(),
                            message,
                        })?;
                }
                Fetch::Pending(request) => pending.push((sub, block, request)),
            }
        }

        for (sub, block, request) in pending {
            let data = request.wait()?;
            result
                .assign(&sub.relative_to(roi), &data.extract(&sub.relative_to(&block.roi)))
                .map_err(|message| ExecutionError::ComputationFailed {
                    operator: self.name().to_string(),
                    message,
                })?;
        }
        Ok(Arc::new(result))
    }

    // Narrowed policy: a dirty input region marks exactly the intersecting
    // blocks and forwards the same region downstream.
    fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
        self.shared.mark_dirty(roi);
        self.output.set_dirty(roi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persist::MemoryStore;
    use crate::core::metadata::SlotMeta;
    use crate::core::types::Dtype;
    use ndarray::{ArrayD, IxDyn};
    use std::time::Duration;

    /// Test source that counts executions and records requested ROIs.
    struct CountingSource {
        state: OperatorState,
        output: Slot,
        data: Mutex<Arc<Tensor>>,
        executions: AtomicUsize,
        executed_rois: Mutex<Vec<Roi>>,
        delay: Option<Duration>,
        fail_on: Mutex<Option<Roi>>,
        range: Option<(f64, f64)>,
    }

    impl CountingSource {
        fn new(graph: &Graph, data: Tensor) -> Arc<Self> {
            Self::with_options(graph, data, None, None)
        }

        fn with_options(
            graph: &Graph,
            data: Tensor,
            delay: Option<Duration>,
            range: Option<(f64, f64)>,
        ) -> Arc<Self> {
            graph.register(Arc::new(Self {
                state: OperatorState::new("CountingSource"),
                output: Slot::output("Output"),
                data: Mutex::new(Arc::new(data)),
                executions: AtomicUsize::new(0),
                executed_rois: Mutex::new(Vec::new()),
                delay,
                fail_on: Mutex::new(None),
                range,
            }))
        }

        fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }

        fn set_region(&self, roi: &Roi, patch: &Tensor) {
            {
                let mut data = self.data.lock();
                let mut updated = (**data).clone();
                updated.assign(roi, patch).unwrap();
                *data = Arc::new(updated);
            }
            self.output.set_dirty(roi);
        }
    }

    impl Operator for CountingSource {
        fn state(&self) -> &OperatorState {
            &self.state
        }
        fn inputs(&self) -> Vec<Slot> {
            Vec::new()
        }
        fn outputs(&self) -> Vec<Slot> {
            vec![self.output.clone()]
        }
        fn setup_outputs(&self) -> GraphResult<()> {
            let data = self.data.lock();
            let mut meta = SlotMeta::new()
                .with_shape(data.shape().to_vec())
                .with_dtype(data.dtype());
            if let Some((lo, hi)) = self.range {
                meta = meta.with_range(lo, hi);
            }
            self.output
                .set_meta(meta.mark_ready().map_err(GraphError::InconsistentMeta)?);
            Ok(())
        }
        fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
            if let Some(fail) = self.fail_on.lock().clone() {
                if fail.intersection(roi).is_some() {
                    return Err(ExecutionError::ComputationFailed {
                        operator: self.name().to_string(),
                        message: "injected failure".to_string(),
                    });
                }
            }
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.executed_rois.lock().push(roi.clone());
            Ok(Arc::new(self.data.lock().extract(roi)))
        }
        fn propagate_dirty(&self, _input: &Slot, _roi: &Roi) {}
    }

    fn ramp_f32(len: usize) -> Tensor {
        let values: Vec<f32> = (0..len).map(|i| i as f32).collect();
        Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[len]), values).unwrap())
    }

    fn as_f32(data: &Tensor) -> Vec<f32> {
        match data {
            Tensor::F32(a) => a.iter().copied().collect(),
            _ => panic!("expected f32"),
        }
    }

    fn pipeline(graph: &Graph, len: usize, block: usize) -> (Arc<CountingSource>, Arc<OpBlockedCache>) {
        let source = CountingSource::new(graph, ramp_f32(len));
        let cache = OpBlockedCache::new(graph, CacheConfig::new(vec![block]));
        cache.input.connect(&source.output).unwrap();
        (source, cache)
    }

    #[test]
    fn test_read_through_and_idempotence() {
        let graph = Graph::with_workers(4);
        let (source, cache) = pipeline(&graph, 100, 10);

        let roi = Roi::new(vec![0], vec![25]);
        let first = cache.output.get(&roi).unwrap();
        assert_eq!(as_f32(&first), (0..25).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(source.executions(), 3); // blocks [0,10) [10,20) [20,30)

        // Whole blocks are computed, not just the requested sub-ROI.
        for executed in source.executed_rois.lock().iter() {
            assert_eq!(executed.shape(), vec![10]);
        }

        let second = cache.output.get(&roi).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.executions(), 3); // all served from blocks

        let stats = cache.stats();
        assert_eq!(stats.recomputed_blocks, 3);
        assert!(stats.hits >= 3);
    }

    #[test]
    fn test_scenario_a_partial_invalidation() {
        // 1-D array of length 100, blocks of 10: get [0,25), dirty [15,20),
        // get [0,25). Ranges are half-open, so the dirty range touches only
        // block [10,20); it recomputes while [0,10) and [20,30) are served
        // from cache.
        let graph = Graph::with_workers(4);
        let (source, cache) = pipeline(&graph, 100, 10);

        let roi = Roi::new(vec![0], vec![25]);
        cache.output.get(&roi).unwrap();
        assert_eq!(source.executions(), 3);

        let patch_roi = Roi::new(vec![15], vec![20]);
        let patch = Tensor::F32(ArrayD::from_elem(IxDyn(&[5]), 1000.0));
        source.set_region(&patch_roi, &patch);

        let data = cache.output.get(&roi).unwrap();
        // Only block [10,20) intersects the dirty range.
        assert_eq!(source.executions(), 4);
        let values = as_f32(&data);
        assert_eq!(values[14], 14.0);
        assert_eq!(values[15], 1000.0);
        assert_eq!(values[19], 1000.0);
        assert_eq!(values[20], 20.0);
    }

    #[test]
    fn test_dirty_spanning_two_blocks() {
        let graph = Graph::with_workers(4);
        let (source, cache) = pipeline(&graph, 100, 10);

        cache.output.get(&Roi::new(vec![0], vec![30])).unwrap();
        assert_eq!(source.executions(), 3);

        // [15,25) touches blocks [10,20) and [20,30); [0,10) stays cached.
        let dirty = Roi::new(vec![15], vec![25]);
        let patch = Tensor::F32(ArrayD::from_elem(IxDyn(&[10]), -1.0));
        source.set_region(&dirty, &patch);

        cache.output.get(&Roi::new(vec![0], vec![30])).unwrap();
        assert_eq!(source.executions(), 5);
    }

    #[test]
    fn test_coalescing_concurrent_reads() {
        let graph = Graph::with_workers(8);
        let source = CountingSource::with_options(
            &graph,
            ramp_f32(20),
            Some(Duration::from_millis(50)),
            None,
        );
        let cache = OpBlockedCache::new(&graph, CacheConfig::new(vec![10]));
        cache.input.connect(&source.output).unwrap();

        // N concurrent reads of ROIs mapping to the same block must trigger
        // exactly one execute for that block.
        let mut handles = Vec::new();
        for i in 0..4 {
            let output = cache.output.clone();
            handles.push(std::thread::spawn(move || {
                let roi = Roi::new(vec![i], vec![8 + i]);
                output.get(&roi).map(|d| d.len())
            }));
        }
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(source.executions(), 1);
    }

    #[test]
    fn test_scenario_c_eviction_keeps_status() {
        let graph = Graph::with_workers(2);
        let source = CountingSource::new(&graph, ramp_f32(100));
        // f32 blocks of 10 are 40 bytes; budget of 200 keeps 5 resident.
        let cache = OpBlockedCache::new(
            &graph,
            CacheConfig::new(vec![10]).with_max_memory_bytes(200),
        );
        cache.input.connect(&source.output).unwrap();

        for i in 0..10 {
            cache
                .output
                .get(&Roi::new(vec![i * 10], vec![(i + 1) * 10]))
                .unwrap();
        }
        assert_eq!(source.executions(), 10);
        assert!(cache.memory_usage() <= 200);
        assert!(cache.resident_block_count() <= 5);
        assert!(cache.stats().evictions >= 5);
        // Block records survive eviction; only the data is freed.
        assert_eq!(cache.block_count(), 10);

        // The least-recently-read block was evicted: re-reading it
        // recomputes from upstream without dirtying the surviving blocks.
        let before = source.executions();
        cache.output.get(&Roi::new(vec![0], vec![10])).unwrap();
        assert_eq!(source.executions(), before + 1);

        let recent = source.executions();
        cache.output.get(&Roi::new(vec![90], vec![100])).unwrap();
        assert_eq!(source.executions(), recent); // still resident
    }

    #[test]
    fn test_free_on_dirty_policy() {
        let graph = Graph::with_workers(2);
        let source = CountingSource::new(&graph, ramp_f32(20));
        let cache = OpBlockedCache::new(
            &graph,
            CacheConfig::new(vec![10]).with_free_on_dirty(true),
        );
        cache.input.connect(&source.output).unwrap();

        cache.output.get(&Roi::new(vec![0], vec![20])).unwrap();
        assert_eq!(cache.resident_block_count(), 2);

        source.set_region(&Roi::new(vec![0], vec![5]), &Tensor::zeros(Dtype::F32, &[5]));
        // The intersecting block's data was freed eagerly.
        assert_eq!(cache.resident_block_count(), 1);
        assert_eq!(cache.block_count(), 2);
    }

    #[test]
    fn test_dirty_notification_forwards_downstream() {
        let graph = Graph::with_workers(2);
        let (source, cache) = pipeline(&graph, 40, 10);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        cache.output.events().dirty.subscribe(move |e| {
            seen2.lock().push(e.roi.clone());
        });

        source.set_region(
            &Roi::new(vec![5], vec![12]),
            &Tensor::zeros(Dtype::F32, &[7]),
        );
        assert_eq!(&*seen.lock(), &[Roi::new(vec![5], vec![12])]);
    }

    #[test]
    fn test_force_value_bypasses_execute() {
        let graph = Graph::with_workers(2);
        let (source, cache) = pipeline(&graph, 40, 10);

        let seeded = Tensor::F32(ArrayD::from_elem(IxDyn(&[20]), 9.0));
        cache
            .force_value(&Roi::new(vec![0], vec![20]), &seeded)
            .unwrap();

        let data = cache.output.get(&Roi::new(vec![0], vec![20])).unwrap();
        assert!(as_f32(&data).iter().all(|&v| v == 9.0));
        assert_eq!(source.executions(), 0);

        // A partial seed on an absent block only marks it dirty.
        let partial = Tensor::F32(ArrayD::from_elem(IxDyn(&[3]), 5.0));
        cache
            .force_value(&Roi::new(vec![21], vec![24]), &partial)
            .unwrap();
        let data = cache.output.get(&Roi::new(vec![20], vec![30])).unwrap();
        assert_eq!(source.executions(), 1); // recomputed from upstream
        assert_eq!(as_f32(&data)[0], 20.0);
    }

    #[test]
    fn test_failure_confined_to_its_block() {
        let graph = Graph::with_workers(4);
        let (source, cache) = pipeline(&graph, 30, 10);
        *source.fail_on.lock() = Some(Roi::new(vec![10], vec![20]));

        let err = cache.output.get(&Roi::new(vec![0], vec![30])).unwrap_err();
        assert!(matches!(err, ExecutionError::ComputationFailed { .. }));

        // Sibling blocks are unaffected and readable.
        assert!(cache.output.get(&Roi::new(vec![0], vec![10])).is_ok());
        assert!(cache.output.get(&Roi::new(vec![20], vec![30])).is_ok());

        // The failed block recovers once the cause is gone.
        *source.fail_on.lock() = None;
        assert!(cache.output.get(&Roi::new(vec![10], vec![20])).is_ok());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let graph = Graph::with_workers(2);
        let (source, cache) = pipeline(&graph, 50, 10);

        let roi = Roi::new(vec![0], vec![30]);
        let original = cache.output.get(&roi).unwrap();

        let mut store = MemoryStore::new();
        let exported = cache.export_blocks(&mut store, None).unwrap();
        assert_eq!(exported, 3);
        let _ = source;

        // Fresh pipeline of identical configuration.
        let (source2, cache2) = pipeline(&graph, 50, 10);
        let report = cache2.import_blocks(&store).unwrap();
        assert_eq!(
            report,
            ImportReport {
                imported: 3,
                stale: 0,
                skipped: 0
            }
        );

        let rehydrated = cache2.output.get(&roi).unwrap();
        assert_eq!(original, rehydrated);
        assert_eq!(source2.executions(), 0);
    }

    #[test]
    fn test_import_stale_on_fingerprint_mismatch() {
        let graph = Graph::with_workers(2);
        let (_, cache) = pipeline(&graph, 50, 10);
        cache.output.get(&Roi::new(vec![0], vec![20])).unwrap();

        let mut store = MemoryStore::new();
        cache.export_blocks(&mut store, None).unwrap();

        // Same shape/dtype but a different declared range changes the
        // upstream configuration fingerprint.
        let source2 =
            CountingSource::with_options(&graph, ramp_f32(50), None, Some((0.0, 49.0)));
        let cache2 = OpBlockedCache::new(&graph, CacheConfig::new(vec![10]));
        cache2.input.connect(&source2.output).unwrap();

        let report = cache2.import_blocks(&store).unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.stale, 2);

        // Stale blocks recompute on first read.
        cache2.output.get(&Roi::new(vec![0], vec![20])).unwrap();
        assert_eq!(source2.executions(), 2);
    }

    #[test]
    fn test_export_cancellation_rolls_back() {
        let graph = Graph::with_workers(2);
        let (_, cache) = pipeline(&graph, 50, 10);
        cache.output.get(&Roi::new(vec![0], vec![50])).unwrap();

        let tracker = BatchTracker::new(5);
        tracker.cancel();
        let mut store = MemoryStore::new();
        let err = cache.export_blocks(&mut store, Some(&tracker)).unwrap_err();
        assert!(matches!(err, PersistError::Cancelled));
        assert!(store.is_empty());
    }

    #[test]
    fn test_precompute_cancellation_issues_nothing() {
        let graph = Graph::with_workers(2);
        let (source, cache) = pipeline(&graph, 50, 10);

        let tracker = BatchTracker::new(5);
        tracker.cancel();
        let err = cache
            .precompute(&Roi::new(vec![0], vec![50]), Some(&tracker))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(source.executions(), 0);
    }

    #[test]
    fn test_precompute_fills_blocks() {
        let graph = Graph::with_workers(4);
        let (source, cache) = pipeline(&graph, 50, 10);

        cache
            .precompute(&Roi::new(vec![0], vec![50]), None)
            .unwrap();
        assert_eq!(source.executions(), 5);
        assert_eq!(cache.resident_block_count(), 5);

        // Subsequent reads are pure cache hits.
        cache.output.get(&Roi::new(vec![0], vec![50])).unwrap();
        assert_eq!(source.executions(), 5);
    }

    #[test]
    fn test_reconfiguration_clears_blocks() {
        let graph = Graph::with_workers(2);
        let source = CountingSource::new(&graph, ramp_f32(40));
        let cache = OpBlockedCache::new(&graph, CacheConfig::new(vec![10]));
        cache.input.connect(&source.output).unwrap();

        cache.output.get(&Roi::new(vec![0], vec![40])).unwrap();
        assert_eq!(cache.block_count(), 4);

        // Shape change reconfigures the cache and drops all blocks.
        {
            let mut data = source.data.lock();
            *data = Arc::new(ramp_f32(20));
        }
        crate::graph::operator::configure(source.as_ref()).unwrap();
        assert_eq!(cache.block_count(), 0);
        assert_eq!(cache.memory_usage(), 0);
        assert_eq!(cache.output.meta().shape, Some(vec![20]));
    }

    #[test]
    fn test_block_shape_rank_mismatch_is_constraint_violation() {
        let graph = Graph::with_workers(2);
        let source = CountingSource::new(&graph, ramp_f32(40));
        let cache = OpBlockedCache::new(&graph, CacheConfig::new(vec![10, 10]));
        let result = cache.input.connect(&source.output);
        assert!(result.is_ok());
        assert!(matches!(
            cache.state().configure_error(),
            Some(GraphError::ConstraintViolation { .. })
        ));
        assert!(cache.output.get(&Roi::new(vec![0], vec![1])).is_err());
    }
}
