//! # Voxelflow - Lazy ROI Dataflow with Blockwise Caching
//!
//! Voxelflow is the computational backbone for interactive analysis of
//! large N-dimensional image volumes (time/x/y/z/channel): a lazy,
//! dirty-propagating dataflow graph with chunked, blockwise caching.
//! Reading a region of interest triggers on-demand, asynchronous
//! computation of only that sub-region; when upstream data changes, dirty
//! notifications invalidate exactly the affected cache blocks, so edits
//! never force a full recomputation.
//!
//! ## Features
//!
//! - **ROI-driven laziness**: slots serve `get(roi)`/`get_async(roi)`;
//!   nothing computes until someone asks
//! - **Dirty propagation**: typed, synchronous notifications flow
//!   upstream-to-downstream with region granularity
//! - **Blockwise caching**: fixed-size origin-anchored blocks, request
//!   coalescing, LRU eviction under a memory budget, chunk-container
//!   export/import
//! - **Multi-lane pipelines**: one wrapper replicates a single-image
//!   operator across N datasets, keeping slot lists in lockstep
//! - **Cooperative execution**: an adaptively growing worker pool runs the
//!   blocking-call graph without starving deep operator chains
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voxelflow::prelude::*;
//!
//! let graph = Graph::new();
//!
//! // A synthetic volume, a pointwise operator, and a blocked cache.
//! let source = OpArraySource::new(&graph, volume);
//! let scale = OpScale::new(&graph, 2.0);
//! let cache = OpBlockedCache::new(&graph, CacheConfig::new(vec![64, 64]));
//!
//! scale.input.connect(&source.output)?;
//! cache.input.connect(&scale.output)?;
//!
//! // Only the touched blocks compute; repeated reads are free.
//! let roi = Roi::new(vec![0, 0], vec![100, 100]);
//! let data = cache.output.get(&roi)?;
//!
//! // An edit invalidates exactly the intersecting blocks.
//! source.write_region(&Roi::new(vec![10, 10], vec![20, 20]), &patch)?;
//! let fresh = cache.output.get(&roi)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: ROIs, tensors, slot metadata, and the error taxonomy
//! - [`graph`]: slots, operators, typed events, multi-lane replication
//! - [`execution`]: the request pool and batch progress tracking
//! - [`cache`]: the blocked cache and chunk-container persistence
//! - [`operators`]: generic built-in operators

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod core;
pub mod execution;
pub mod graph;
pub mod operators;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use voxelflow::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::metadata::{Axis, SlotMeta};
    pub use crate::core::roi::{BlockKey, Roi};
    pub use crate::core::types::{Dtype, SlotValue, Tensor};

    // Errors
    pub use crate::core::error::{
        ExecResult, ExecutionError, FlowError, FlowResult, GraphError, GraphResult, OperatorId,
        PersistError, PersistResult, RequestId,
    };

    // Graph
    pub use crate::graph::events::{DirtyEvent, LaneEvent, MetaEvent, ResizeEvent, SubscriptionId};
    pub use crate::graph::operator::{
        configure, dirty_all_outputs, dispose, Graph, Lifecycle, Operator, OperatorState,
    };
    pub use crate::graph::slot::{Slot, SlotDirection, SlotEvents};
    pub use crate::graph::wrapper::{LaneView, OperatorWrapper};

    // Execution
    pub use crate::execution::progress::{BatchTracker, BatchUpdate};
    pub use crate::execution::request::{Request, RequestPool, RequestStatus};

    // Cache
    pub use crate::cache::blocked::{CacheConfig, CacheStats, ImportReport, OpBlockedCache};
    pub use crate::cache::persist::{
        chunk_name, ChunkHeader, ChunkStore, DirectoryStore, MemoryStore,
    };

    // Built-in operators
    pub use crate::operators::{OpArrayPiper, OpArraySource, OpScale, OpTemporalDifference};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
