//! Core value types that flow through the dataflow graph.
//!
//! The type system uses an enum-based approach: image analysis pipelines
//! move a closed set of element types, so a closed enum gives exhaustive
//! matching, cheap dispatch, and native serde support. Array payloads are
//! shared behind `Arc` so cache blocks and concurrent readers never copy
//! pixel data just to hand it around.

use crate::core::roi::Roi;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::U32 => 4,
            Dtype::I64 => 8,
            Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }

    /// Short lowercase name, e.g. `"f32"`.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::U8 => "u8",
            Dtype::U16 => "u16",
            Dtype::U32 => "u32",
            Dtype::I64 => "i64",
            Dtype::F32 => "f32",
            Dtype::F64 => "f64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Run `$body` with `$arr` bound to the concrete array of any variant.
macro_rules! for_each_tensor {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            Tensor::U8($arr) => $body,
            Tensor::U16($arr) => $body,
            Tensor::U32($arr) => $body,
            Tensor::I64($arr) => $body,
            Tensor::F32($arr) => $body,
            Tensor::F64($arr) => $body,
        }
    };
}

/// Like `for_each_tensor!` but re-wraps the result in the same variant.
macro_rules! map_tensor {
    ($value:expr, $arr:ident => $body:expr) => {
        match $value {
            Tensor::U8($arr) => Tensor::U8($body),
            Tensor::U16($arr) => Tensor::U16($body),
            Tensor::U32($arr) => Tensor::U32($body),
            Tensor::I64($arr) => Tensor::I64($body),
            Tensor::F32($arr) => Tensor::F32($body),
            Tensor::F64($arr) => Tensor::F64($body),
        }
    };
}

/// Match two tensors of the same variant, or fall through to `$err`.
macro_rules! zip_tensor {
    ($a:expr, $b:expr, ($x:ident, $y:ident) => $body:expr, else => $err:expr) => {
        match ($a, $b) {
            (Tensor::U8($x), Tensor::U8($y)) => $body,
            (Tensor::U16($x), Tensor::U16($y)) => $body,
            (Tensor::U32($x), Tensor::U32($y)) => $body,
            (Tensor::I64($x), Tensor::I64($y)) => $body,
            (Tensor::F32($x), Tensor::F32($y)) => $body,
            (Tensor::F64($x), Tensor::F64($y)) => $body,
            _ => $err,
        }
    };
}

/// An N-dimensional array with a runtime element type.
///
/// Each variant wraps an `ndarray::ArrayD` of the corresponding element
/// type. Regions are addressed with [`Roi`]s relative to the tensor origin.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// Unsigned 8-bit elements.
    U8(ArrayD<u8>),
    /// Unsigned 16-bit elements.
    U16(ArrayD<u16>),
    /// Unsigned 32-bit elements.
    U32(ArrayD<u32>),
    /// Signed 64-bit elements.
    I64(ArrayD<i64>),
    /// 32-bit float elements.
    F32(ArrayD<f32>),
    /// 64-bit float elements.
    F64(ArrayD<f64>),
}

impl Tensor {
    /// A zero-filled tensor of the given element type and shape.
    pub fn zeros(dtype: Dtype, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            Dtype::U8 => Tensor::U8(ArrayD::zeros(dim)),
            Dtype::U16 => Tensor::U16(ArrayD::zeros(dim)),
            Dtype::U32 => Tensor::U32(ArrayD::zeros(dim)),
            Dtype::I64 => Tensor::I64(ArrayD::zeros(dim)),
            Dtype::F32 => Tensor::F32(ArrayD::zeros(dim)),
            Dtype::F64 => Tensor::F64(ArrayD::zeros(dim)),
        }
    }

    /// Element type of this tensor.
    pub fn dtype(&self) -> Dtype {
        match self {
            Tensor::U8(_) => Dtype::U8,
            Tensor::U16(_) => Dtype::U16,
            Tensor::U32(_) => Dtype::U32,
            Tensor::I64(_) => Dtype::I64,
            Tensor::F32(_) => Dtype::F32,
            Tensor::F64(_) => Dtype::F64,
        }
    }

    /// Per-axis extent.
    pub fn shape(&self) -> &[usize] {
        for_each_tensor!(self, a => a.shape())
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        for_each_tensor!(self, a => a.ndim())
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        for_each_tensor!(self, a => a.len())
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype().size_bytes()
    }

    /// Copy out the region `roi` (relative to this tensor's origin).
    pub fn extract(&self, roi: &Roi) -> Tensor {
        let info = roi.slice_info();
        map_tensor!(self, a => a.slice(&info[..]).to_owned())
    }

    /// Write `src` into the region `roi` (relative to this tensor's origin).
    /// `src` must have the same element type and exactly the region's shape.
    pub fn assign(&mut self, roi: &Roi, src: &Tensor) -> Result<(), String> {
        if roi.shape() != src.shape() {
            return Err(format!(
                "region shape {:?} does not match source shape {:?}",
                roi.shape(),
                src.shape()
            ));
        }
        let info = roi.slice_info();
        let self_dtype = self.dtype();
        zip_tensor!(self, src, (dst, s) => {
            dst.slice_mut(&info[..]).assign(s);
            Ok(())
        }, else => Err(format!(
            "dtype mismatch: cannot assign {} into {}",
            src.dtype(),
            self_dtype
        )))
    }

    /// Widen to `f64` (lossless for every variant except large `i64`).
    pub fn to_f64(&self) -> ArrayD<f64> {
        for_each_tensor!(self, a => a.mapv(|v| v as f64))
    }

    /// Narrow an `f64` array back to the given element type (`as` casts).
    pub fn from_f64(dtype: Dtype, values: ArrayD<f64>) -> Tensor {
        match dtype {
            Dtype::U8 => Tensor::U8(values.mapv(|v| v as u8)),
            Dtype::U16 => Tensor::U16(values.mapv(|v| v as u16)),
            Dtype::U32 => Tensor::U32(values.mapv(|v| v as u32)),
            Dtype::I64 => Tensor::I64(values.mapv(|v| v as i64)),
            Dtype::F32 => Tensor::F32(values.mapv(|v| v as f32)),
            Dtype::F64 => Tensor::F64(values),
        }
    }

    /// Apply a pointwise function through `f64`, preserving the element type.
    pub fn map_f64(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor::from_f64(self.dtype(), self.to_f64().mapv(f))
    }

    /// Serialize the elements as little-endian bytes in row-major order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        for_each_tensor!(self, a => a.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Rebuild a tensor from little-endian bytes produced by
    /// [`Tensor::to_le_bytes`].
    pub fn from_le_bytes(dtype: Dtype, shape: &[usize], bytes: &[u8]) -> Result<Tensor, String> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if bytes.len() != expected {
            return Err(format!(
                "byte length {} does not match shape {:?} of {} ({} bytes expected)",
                bytes.len(),
                shape,
                dtype,
                expected
            ));
        }

        macro_rules! decode {
            ($ty:ty, $variant:ident) => {{
                const WIDTH: usize = std::mem::size_of::<$ty>();
                let values: Vec<$ty> = bytes
                    .chunks_exact(WIDTH)
                    .map(|chunk| {
                        let mut buf = [0u8; WIDTH];
                        buf.copy_from_slice(chunk);
                        <$ty>::from_le_bytes(buf)
                    })
                    .collect();
                ArrayD::from_shape_vec(IxDyn(shape), values)
                    .map(Tensor::$variant)
                    .map_err(|e| e.to_string())
            }};
        }

        match dtype {
            Dtype::U8 => decode!(u8, U8),
            Dtype::U16 => decode!(u16, U16),
            Dtype::U32 => decode!(u32, U32),
            Dtype::I64 => decode!(i64, I64),
            Dtype::F32 => decode!(f32, F32),
            Dtype::F64 => decode!(f64, F64),
        }
    }
}

impl From<ArrayD<u8>> for Tensor {
    fn from(a: ArrayD<u8>) -> Self {
        Tensor::U8(a)
    }
}

impl From<ArrayD<u16>> for Tensor {
    fn from(a: ArrayD<u16>) -> Self {
        Tensor::U16(a)
    }
}

impl From<ArrayD<u32>> for Tensor {
    fn from(a: ArrayD<u32>) -> Self {
        Tensor::U32(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::I64(a)
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::F32(a)
    }
}

impl From<ArrayD<f64>> for Tensor {
    fn from(a: ArrayD<f64>) -> Self {
        Tensor::F64(a)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<{}>{:?}", self.dtype(), self.shape())
    }
}

/// A value carried by a level-0 slot.
///
/// Array payloads move through [`Tensor`]s; the scalar variants cover
/// configuration values; `Bytes` carries opaque serialized model blobs
/// (classifiers cross the graph as in-memory buffers, never temp files).
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    /// N-dimensional array data.
    Array(Arc<Tensor>),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// UTF-8 string.
    Str(String),
    /// Opaque serialized payload (e.g. a trained model).
    Bytes(Arc<Vec<u8>>),
    /// Absence of a value.
    None,
}

impl SlotValue {
    /// Try to view this value as a tensor.
    pub fn as_tensor(&self) -> Option<&Arc<Tensor>> {
        if let SlotValue::Array(t) = self {
            Some(t)
        } else {
            None
        }
    }

    /// Try to get this value as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        if let SlotValue::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    /// Try to get this value as a float. Integers convert implicitly.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            SlotValue::Float(f) => Some(*f),
            SlotValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get this value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        if let SlotValue::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    /// Try to get this value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        if let SlotValue::Str(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Try to get this value as a byte buffer.
    pub fn as_bytes(&self) -> Option<&Arc<Vec<u8>>> {
        if let SlotValue::Bytes(b) = self {
            Some(b)
        } else {
            None
        }
    }

    /// Check if this value is `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, SlotValue::None)
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotValue::Array(t) => write!(f, "{}", t),
            SlotValue::Integer(i) => write!(f, "{}", i),
            SlotValue::Float(v) => write!(f, "{:.4}", v),
            SlotValue::Bool(b) => write!(f, "{}", b),
            SlotValue::Str(s) => write!(f, "\"{}\"", s),
            SlotValue::Bytes(b) => write!(f, "Bytes[{}]", b.len()),
            SlotValue::None => write!(f, "None"),
        }
    }
}
