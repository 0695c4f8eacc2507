//! Error types for voxelflow.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Name the slot or operator involved so UI layers can point at it
//! - Stay `Clone` on the execution path, since one failed block computation
//!   fans out to every waiter of the shared request
//! - Support chaining into a single top-level error for callers that do not
//!   care which subsystem failed

use crate::core::roi::Roi;
use crate::core::types::Dtype;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorId(pub Uuid);

impl OperatorId {
    /// Create a new random operator ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Errors raised while wiring or configuring the graph.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("cannot connect '{upstream}' to '{downstream}': {reason}")]
    TypeMismatch {
        upstream: String,
        downstream: String,
        reason: String,
    },

    #[error("slot levels differ: upstream '{upstream}' is level {upstream_level}, downstream '{downstream}' is level {downstream_level}")]
    LevelMismatch {
        upstream: String,
        upstream_level: usize,
        downstream: String,
        downstream_level: usize,
    },

    #[error("invalid operation on slot '{slot}': {reason}")]
    InvalidOperation { slot: String, reason: String },

    #[error("constraint violated in operator '{operator}': {message}")]
    ConstraintViolation { operator: String, message: String },

    #[error("operator '{operator}' is disposed")]
    Disposed { operator: String },

    #[error("inconsistent metadata: {0}")]
    InconsistentMeta(String),
}

/// Errors raised while reading data through the graph.
///
/// Kept `Clone` so a single failure can be delivered to every waiter of a
/// coalesced request.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionError {
    /// Read attempted before configuration completed. Recoverable: the
    /// caller should wait for readiness and retry.
    #[error("slot '{slot}' is not ready")]
    SlotNotReady { slot: String },

    /// ROI outside the slot's declared shape. A programming error, not
    /// retried.
    #[error("roi {roi} out of bounds for shape {shape:?}")]
    OutOfBounds { roi: String, shape: Vec<usize> },

    /// A domain precondition failed (e.g. too few time points). Surfaced to
    /// the user as an actionable message; graph state remains valid.
    #[error("constraint violated in operator '{operator}': {message}")]
    ConstraintViolation { operator: String, message: String },

    /// Cooperative cancellation. A normal terminal outcome, not a failure.
    #[error("request cancelled")]
    Cancelled,

    /// An operator's execute failed. Propagated to all waiters of the
    /// request; sibling blocks and operators are unaffected.
    #[error("computation failed in operator '{operator}': {message}")]
    ComputationFailed { operator: String, message: String },

    /// Data of the wrong element type crossed a slot boundary.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: Dtype, got: Dtype },
}

impl ExecutionError {
    /// Build an out-of-bounds error from the offending ROI and shape.
    pub fn out_of_bounds(roi: &Roi, shape: &[usize]) -> Self {
        ExecutionError::OutOfBounds {
            roi: roi.to_string(),
            shape: shape.to_vec(),
        }
    }

    /// Whether a retry after reconfiguration can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::SlotNotReady { .. } | ExecutionError::ConstraintViolation { .. }
        )
    }

    /// Whether this outcome is a cooperative cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

/// Errors raised while exporting or importing cache blocks.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt chunk '{chunk}': {reason}")]
    Corrupt { chunk: String, reason: String },

    #[error("incompatible chunk container: {0}")]
    Incompatible(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for graph wiring operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for data reads and computations.
pub type ExecResult<T> = Result<T, ExecutionError>;

/// Result type alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Result type alias for top-level operations.
pub type FlowResult<T> = Result<T, FlowError>;
