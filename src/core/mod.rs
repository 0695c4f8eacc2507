//! Core types: ROIs, tensors, slot metadata, and error taxonomy.

pub mod error;
pub mod metadata;
pub mod roi;
pub mod types;

pub use error::{
    ExecResult, ExecutionError, FlowError, FlowResult, GraphError, GraphResult, OperatorId,
    PersistError, PersistResult, RequestId,
};
pub use metadata::{Axis, SlotMeta};
pub use roi::{BlockKey, Roi};
pub use types::{Dtype, SlotValue, Tensor};
