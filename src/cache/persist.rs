//! Chunk container persistence for blocked caches.
//!
//! Each exported block is an independently addressable chunk keyed by a
//! coordinate-encoded name derived from its block index. Every chunk is
//! self-describing: a JSON header records the absolute block ROI, the axis
//! tag order, the element type, the cache's block shape and the upstream
//! configuration fingerprint, followed by the raw little-endian element
//! bytes. Partial exports (only the blocks resident and clean at export
//! time) therefore remain importable on their own.

use crate::core::error::{PersistError, PersistResult};
use crate::core::metadata::Axis;
use crate::core::roi::{BlockKey, Roi};
use crate::core::types::{Dtype, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const CHUNK_EXTENSION: &str = "chunk";

/// Self-describing metadata stored with every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Absolute start of the block ROI.
    pub start: Vec<usize>,
    /// Absolute stop of the block ROI.
    pub stop: Vec<usize>,
    /// Axis tag order of the source output, when known.
    pub axistags: Option<Vec<Axis>>,
    /// Element type of the payload.
    pub dtype: Dtype,
    /// Block shape of the exporting cache.
    pub block_shape: Vec<usize>,
    /// Fingerprint of the upstream configuration at export time.
    pub fingerprint: u64,
}

impl ChunkHeader {
    /// The block ROI recorded in this header.
    pub fn roi(&self) -> Roi {
        Roi::new(self.start.clone(), self.stop.clone())
    }

    /// Decode the payload bytes into a tensor of the recorded shape.
    pub fn decode(&self, name: &str, bytes: &[u8]) -> PersistResult<Tensor> {
        Tensor::from_le_bytes(self.dtype, &self.roi().shape(), bytes).map_err(|reason| {
            PersistError::Corrupt {
                chunk: name.to_string(),
                reason,
            }
        })
    }
}

/// Stable chunk name for a block: coordinate-encoded from the block key,
/// with axis letters when the axis order is known (`block_t0_x2_y1`).
pub fn chunk_name(key: &BlockKey, axistags: Option<&[Axis]>) -> String {
    let mut name = String::from("block");
    for (i, coord) in key.0.iter().enumerate() {
        name.push('_');
        if let Some(tags) = axistags {
            if let Some(axis) = tags.get(i) {
                name.push(axis.key());
            }
        }
        name.push_str(&coord.to_string());
    }
    name
}

/// Destination/source of independently addressable chunks.
pub trait ChunkStore: Send {
    /// Write one chunk under `name`, replacing any previous content.
    fn write_chunk(&mut self, name: &str, header: &ChunkHeader, data: &[u8]) -> PersistResult<()>;

    /// Read back the chunk stored under `name`.
    fn read_chunk(&self, name: &str) -> PersistResult<(ChunkHeader, Vec<u8>)>;

    /// Names of all stored chunks.
    fn list_chunks(&self) -> PersistResult<Vec<String>>;

    /// Remove the chunk stored under `name` (used to release partially
    /// written output on cancellation or failure).
    fn remove_chunk(&mut self, name: &str) -> PersistResult<()>;
}

/// A chunk container backed by a directory: one `<name>.chunk` file per
/// block, each holding a length-prefixed JSON header followed by the raw
/// element bytes.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if necessary) a container at `root`.
    pub fn open(root: impl Into<PathBuf>) -> PersistResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The container directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, CHUNK_EXTENSION))
    }
}

impl ChunkStore for DirectoryStore {
    fn write_chunk(&mut self, name: &str, header: &ChunkHeader, data: &[u8]) -> PersistResult<()> {
        let header_bytes = serde_json::to_vec(header)?;
        let mut file = fs::File::create(self.chunk_path(name))?;
        file.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        file.write_all(data)?;
        Ok(())
    }

    fn read_chunk(&self, name: &str) -> PersistResult<(ChunkHeader, Vec<u8>)> {
        let mut file = fs::File::open(self.chunk_path(name))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let mut header_bytes = vec![0u8; header_len];
        file.read_exact(&mut header_bytes)?;
        let header: ChunkHeader = serde_json::from_slice(&header_bytes)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok((header, data))
    }

    fn list_chunks(&self) -> PersistResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_chunk(&mut self, name: &str) -> PersistResult<()> {
        let path = self.chunk_path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// An in-memory chunk container, for tests and collaborators that move
/// exported blocks without touching the filesystem.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: HashMap<String, (ChunkHeader, Vec<u8>)>,
}

impl MemoryStore {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ChunkStore for MemoryStore {
    fn write_chunk(&mut self, name: &str, header: &ChunkHeader, data: &[u8]) -> PersistResult<()> {
        self.chunks
            .insert(name.to_string(), (header.clone(), data.to_vec()));
        Ok(())
    }

    fn read_chunk(&self, name: &str) -> PersistResult<(ChunkHeader, Vec<u8>)> {
        self.chunks.get(name).cloned().ok_or_else(|| {
            PersistError::Corrupt {
                chunk: name.to_string(),
                reason: "chunk not found".to_string(),
            }
        })
    }

    fn list_chunks(&self) -> PersistResult<Vec<String>> {
        let mut names: Vec<String> = self.chunks.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn remove_chunk(&mut self, name: &str) -> PersistResult<()> {
        self.chunks.remove(name);
        Ok(())
    }
}
