//! Blockwise caching and chunk-container persistence.

pub mod blocked;
pub mod persist;

pub use blocked::{CacheConfig, CacheStats, ImportReport, OpBlockedCache};
pub use persist::{chunk_name, ChunkHeader, ChunkStore, DirectoryStore, MemoryStore};
