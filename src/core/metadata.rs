//! Per-slot metadata: shape, element type, axis identity, value range.
//!
//! Metadata travels separately from pixel data so connections can be
//! validated and pipelines configured without touching a single voxel.
//! An operator's metadata-setup step recomputes its outputs' metadata
//! whenever upstream metadata changes.

use crate::core::roi::Roi;
use crate::core::types::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of one volume axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Temporal axis.
    Time,
    /// Spatial x.
    X,
    /// Spatial y.
    Y,
    /// Spatial z.
    Z,
    /// Channel axis.
    Channel,
}

impl Axis {
    /// Single-character key (`t`, `x`, `y`, `z`, `c`).
    pub fn key(&self) -> char {
        match self {
            Axis::Time => 't',
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
            Axis::Channel => 'c',
        }
    }

    /// Parse an axis from its key character.
    pub fn from_key(key: char) -> Option<Axis> {
        match key {
            't' => Some(Axis::Time),
            'x' => Some(Axis::X),
            'y' => Some(Axis::Y),
            'z' => Some(Axis::Z),
            'c' => Some(Axis::Channel),
            _ => None,
        }
    }

    /// The conventional 5-D ordering `txyzc`.
    pub fn txyzc() -> Vec<Axis> {
        vec![Axis::Time, Axis::X, Axis::Y, Axis::Z, Axis::Channel]
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Descriptor of the data a slot carries.
///
/// Invariant: once `ready`, shape and dtype are present and, when axis tags
/// are given, `axistags.len() == shape.len()`. Scalar value slots stay ready
/// with no shape at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotMeta {
    /// Per-axis extent; `None` for scalar value slots.
    pub shape: Option<Vec<usize>>,
    /// Element type; `None` for scalar value slots.
    pub dtype: Option<Dtype>,
    /// Ordered axis identities matching `shape`.
    pub axistags: Option<Vec<Axis>>,
    /// Optional numeric value range (min, max).
    pub range: Option<(f64, f64)>,
    ready: bool,
}

impl SlotMeta {
    /// Empty, not-ready metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shape.
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Set the element type.
    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Set the axis tags.
    pub fn with_axistags(mut self, axistags: Vec<Axis>) -> Self {
        self.axistags = Some(axistags);
        self
    }

    /// Set the numeric range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Whether this metadata has been marked ready.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Check internal consistency: array metadata needs shape and dtype, and
    /// axis count must match shape length when tags are present. Scalar
    /// metadata (no shape, no tags) is consistent by definition.
    pub fn is_consistent(&self) -> bool {
        match (&self.shape, &self.axistags) {
            (Some(shape), Some(tags)) => self.dtype.is_some() && tags.len() == shape.len(),
            (Some(_), None) => self.dtype.is_some(),
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    /// Mark ready, validating consistency first.
    pub fn mark_ready(mut self) -> Result<Self, String> {
        if !self.is_consistent() {
            return Err(format!(
                "inconsistent metadata: shape={:?} dtype={:?} axistags={:?}",
                self.shape, self.dtype, self.axistags
            ));
        }
        self.ready = true;
        Ok(self)
    }

    /// Reset to the not-ready state, dropping all fields.
    pub fn clear(&mut self) {
        *self = SlotMeta::default();
    }

    /// Structural compatibility for connections: when both sides are ready,
    /// axis counts and element types must agree.
    pub fn structurally_compatible(&self, other: &SlotMeta) -> bool {
        if !self.ready || !other.ready {
            return true;
        }
        let ndim_ok = match (&self.shape, &other.shape) {
            (Some(a), Some(b)) => a.len() == b.len(),
            (None, None) => true,
            _ => false,
        };
        let dtype_ok = match (self.dtype, other.dtype) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        ndim_ok && dtype_ok
    }

    /// ROI covering the whole declared extent.
    pub fn full_roi(&self) -> Option<Roi> {
        self.shape.as_ref().map(|s| Roi::from_shape(s))
    }

    /// Stable hash of the configuration-relevant fields (shape, dtype, axis
    /// order). Used as the freshness precondition when re-hydrating a cache
    /// from exported chunks.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.axistags.hash(&mut hasher);
        if let Some((lo, hi)) = self.range {
            lo.to_bits().hash(&mut hasher);
            hi.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for SlotMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.shape, self.dtype) {
            (Some(shape), Some(dtype)) => {
                write!(f, "{}{:?}", dtype, shape)?;
                if let Some(tags) = &self.axistags {
                    write!(f, " (")?;
                    for t in tags {
                        write!(f, "{}", t)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            _ => write!(f, "<scalar>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_keys() {
        assert_eq!(Axis::Time.key(), 't');
        assert_eq!(Axis::from_key('c'), Some(Axis::Channel));
        assert_eq!(Axis::from_key('q'), None);
        assert_eq!(Axis::txyzc().len(), 5);
    }

    #[test]
    fn test_consistency() {
        let meta = SlotMeta::new()
            .with_shape(vec![10, 20])
            .with_dtype(Dtype::F32)
            .with_axistags(vec![Axis::X, Axis::Y]);
        assert!(meta.is_consistent());
        assert!(meta.mark_ready().is_ok());

        let bad = SlotMeta::new()
            .with_shape(vec![10, 20])
            .with_dtype(Dtype::F32)
            .with_axistags(vec![Axis::X]);
        assert!(!bad.is_consistent());
        assert!(bad.mark_ready().is_err());

        // Scalar metadata is consistent with nothing set.
        assert!(SlotMeta::new().mark_ready().is_ok());
    }

    #[test]
    fn test_structural_compatibility() {
        let a = SlotMeta::new()
            .with_shape(vec![10, 20])
            .with_dtype(Dtype::F32)
            .mark_ready()
            .unwrap();
        let b = SlotMeta::new()
            .with_shape(vec![5, 5])
            .with_dtype(Dtype::F32)
            .mark_ready()
            .unwrap();
        let c = SlotMeta::new()
            .with_shape(vec![5])
            .with_dtype(Dtype::F32)
            .mark_ready()
            .unwrap();
        let d = SlotMeta::new()
            .with_shape(vec![5, 5])
            .with_dtype(Dtype::U8)
            .mark_ready()
            .unwrap();

        assert!(a.structurally_compatible(&b));
        assert!(!a.structurally_compatible(&c));
        assert!(!a.structurally_compatible(&d));
        // Not-ready sides always pass; the configure pass revisits them.
        assert!(a.structurally_compatible(&SlotMeta::new()));
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let base = SlotMeta::new()
            .with_shape(vec![100])
            .with_dtype(Dtype::F32);
        let same = base.clone();
        assert_eq!(base.fingerprint(), same.fingerprint());

        let other_shape = base.clone().with_shape(vec![101]);
        assert_ne!(base.fingerprint(), other_shape.fingerprint());

        let other_dtype = base.with_dtype(Dtype::F64);
        assert_ne!(other_dtype.fingerprint(), same.fingerprint());
    }

    #[test]
    fn test_full_roi() {
        let meta = SlotMeta::new().with_shape(vec![4, 6]);
        assert_eq!(meta.full_roi(), Some(Roi::from_shape(&[4, 6])));
        assert_eq!(SlotMeta::new().full_roi(), None);
    }
}
