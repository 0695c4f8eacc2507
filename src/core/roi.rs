//! Region-of-interest model for N-dimensional volumes.
//!
//! A [`Roi`] is an axis-aligned bounding box given by inclusive start and
//! exclusive stop coordinates per axis. ROIs are immutable value types,
//! created per request. The block grid used by the cache is always anchored
//! at the absolute origin, never at a ROI's start, so a block's identity is
//! stable regardless of which read first touched it.

use ndarray::SliceInfoElem;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An axis-aligned region of an N-dimensional volume.
///
/// Invariant: `start.len() == stop.len()` and `start[i] <= stop[i]` for all
/// axes. A zero-volume ROI (`stop[i] == start[i]` on any axis) is valid and
/// represents "nothing".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    /// Create a ROI from start/stop coordinates.
    ///
    /// # Panics
    /// Panics if the coordinate vectors differ in length or any
    /// `start[i] > stop[i]`. Both are programming errors at the call site.
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Self {
        assert_eq!(
            start.len(),
            stop.len(),
            "ROI start/stop dimensionality mismatch"
        );
        assert!(
            start.iter().zip(&stop).all(|(s, e)| s <= e),
            "ROI start must not exceed stop"
        );
        Self { start, stop }
    }

    /// The full extent of a volume with the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Start coordinates (inclusive).
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// Stop coordinates (exclusive).
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Per-axis extent (`stop - start`).
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(s, e)| e - s)
            .collect()
    }

    /// Total number of elements covered.
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether this ROI covers no elements.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(s, e)| s == e)
    }

    /// Elementwise min/max intersection. Returns `None` when the regions do
    /// not overlap (any axis degenerates).
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let mut start = Vec::with_capacity(self.ndim());
        let mut stop = Vec::with_capacity(self.ndim());
        for i in 0..self.ndim() {
            let s = self.start[i].max(other.start[i]);
            let e = self.stop[i].min(other.stop[i]);
            if s >= e {
                return None;
            }
            start.push(s);
            stop.push(e);
        }
        Some(Roi { start, stop })
    }

    /// Whether `other` lies entirely within this ROI.
    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && (0..self.ndim())
                .all(|i| self.start[i] <= other.start[i] && other.stop[i] <= self.stop[i])
    }

    /// Whether this ROI fits inside a volume of the given shape.
    pub fn contained_in_shape(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len() && self.stop.iter().zip(shape).all(|(e, dim)| e <= dim)
    }

    /// Express this ROI relative to `base.start` (for indexing into a buffer
    /// that covers `base`). `self` must lie within `base`.
    pub fn relative_to(&self, base: &Roi) -> Roi {
        debug_assert!(base.contains(self), "ROI not contained in base");
        Roi {
            start: self
                .start
                .iter()
                .zip(&base.start)
                .map(|(a, b)| a - b)
                .collect(),
            stop: self
                .stop
                .iter()
                .zip(&base.start)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Decompose this ROI into the grid cells it overlaps, each clipped to
    /// the ROI.
    ///
    /// The grid is anchored at the absolute origin and advances in multiples
    /// of `block_shape`, so overlapping ROIs always decompose into cells with
    /// identical absolute boundaries. Cells are emitted in row-major order of
    /// their grid indices. A zero-volume ROI yields no cells.
    pub fn split_into_blocks(&self, block_shape: &[usize]) -> Vec<Roi> {
        assert_eq!(self.ndim(), block_shape.len(), "block shape rank mismatch");
        assert!(
            block_shape.iter().all(|&b| b > 0),
            "block shape axes must be positive"
        );
        if self.is_empty() {
            return Vec::new();
        }

        let first: Vec<usize> = (0..self.ndim())
            .map(|i| self.start[i] / block_shape[i])
            .collect();
        let last: Vec<usize> = (0..self.ndim())
            .map(|i| (self.stop[i] - 1) / block_shape[i])
            .collect();

        let mut cells = Vec::new();
        let mut index = first.clone();
        loop {
            let cell_start: Vec<usize> = (0..self.ndim())
                .map(|i| (index[i] * block_shape[i]).max(self.start[i]))
                .collect();
            let cell_stop: Vec<usize> = (0..self.ndim())
                .map(|i| ((index[i] + 1) * block_shape[i]).min(self.stop[i]))
                .collect();
            cells.push(Roi {
                start: cell_start,
                stop: cell_stop,
            });

            // Row-major advance over the grid index range [first, last].
            let mut axis = self.ndim();
            loop {
                if axis == 0 {
                    return cells;
                }
                axis -= 1;
                if index[axis] < last[axis] {
                    index[axis] += 1;
                    break;
                }
                index[axis] = first[axis];
            }
        }
    }

    /// Grid index of the block containing `point`.
    pub fn containing_block_key(point: &[usize], block_shape: &[usize]) -> BlockKey {
        BlockKey(
            point
                .iter()
                .zip(block_shape)
                .map(|(p, b)| p / b)
                .collect(),
        )
    }

    /// Full extent of a grid cell, clipped to the volume shape. This is the
    /// region a cache always computes as a unit.
    pub fn block_roi(key: &BlockKey, block_shape: &[usize], full_shape: &[usize]) -> Roi {
        let start: Vec<usize> = key
            .0
            .iter()
            .zip(block_shape)
            .map(|(k, b)| k * b)
            .collect();
        let stop: Vec<usize> = start
            .iter()
            .zip(block_shape)
            .zip(full_shape)
            .map(|((s, b), dim)| (s + b).min(*dim))
            .collect();
        Roi { start, stop }
    }

    /// ndarray slice specification for this ROI, interpreted relative to a
    /// buffer origin.
    pub fn slice_info(&self) -> Vec<SliceInfoElem> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&s, &e)| SliceInfoElem::Slice {
                start: s as isize,
                end: Some(e as isize),
                step: 1,
            })
            .collect()
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.ndim() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}", self.start[i], self.stop[i])?;
        }
        write!(f, "]")
    }
}

/// Identity of a block in the cache's grid decomposition: the per-axis block
/// indices of the cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey(pub Vec<usize>);

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, k) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", k)?;
        }
        write!(f, ")")
    }
}
