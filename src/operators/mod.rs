//! Generic built-in operators.
//!
//! These are the domain-free operators the core ships with: an in-memory
//! volume source, an identity piper, a pointwise scaler, and an
//! adjacent-frame temporal difference. Domain operators (feature filters,
//! classifiers, trackers) live with their applications and compose against
//! the same [`Operator`] trait.
//!
//! Every operator here documents its `propagate_dirty` policy.

use crate::core::error::{ExecResult, ExecutionError, GraphError, GraphResult};
use crate::core::metadata::{Axis, SlotMeta};
use crate::core::roi::Roi;
use crate::core::types::Tensor;
use crate::graph::operator::{configure, Graph, Operator, OperatorState};
use crate::graph::slot::Slot;
use ndarray::Slice;
use parking_lot::Mutex;
use std::sync::Arc;

/// An in-memory volume source.
///
/// Holds a tensor and serves arbitrary sub-ROIs of it. Region writes patch
/// the data in place and raise a dirty signal over exactly the written
/// region; replacing the whole tensor reconfigures downstream and dirties
/// the full extent.
///
/// Dirty policy: not applicable — the source originates dirtiness, it never
/// receives it.
pub struct OpArraySource {
    state: OperatorState,
    /// The served volume.
    pub output: Slot,
    data: Mutex<Arc<Tensor>>,
    axistags: Option<Vec<Axis>>,
}

impl OpArraySource {
    /// Create a source serving `data`, without axis identities.
    pub fn new(graph: &Graph, data: Tensor) -> Arc<Self> {
        Self::with_axistags_impl(graph, data, None)
    }

    /// Create a source serving `data` with the given axis order.
    pub fn with_axistags(graph: &Graph, data: Tensor, axistags: Vec<Axis>) -> Arc<Self> {
        Self::with_axistags_impl(graph, data, Some(axistags))
    }

    fn with_axistags_impl(graph: &Graph, data: Tensor, axistags: Option<Vec<Axis>>) -> Arc<Self> {
        graph.register(Arc::new(Self {
            state: OperatorState::new("OpArraySource"),
            output: Slot::output("Output"),
            data: Mutex::new(Arc::new(data)),
            axistags,
        }))
    }

    /// Replace the whole volume. Shape or dtype changes reconfigure every
    /// downstream operator; the full new extent is dirtied.
    pub fn set_data(&self, data: Tensor) -> GraphResult<()> {
        let full = Roi::from_shape(data.shape());
        *self.data.lock() = Arc::new(data);
        configure(self)?;
        self.output.set_dirty(&full);
        Ok(())
    }

    /// Patch the region `roi` and dirty exactly that region.
    pub fn write_region(&self, roi: &Roi, patch: &Tensor) -> ExecResult<()> {
        {
            let mut data = self.data.lock();
            if !roi.contained_in_shape(data.shape()) {
                return Err(ExecutionError::out_of_bounds(roi, data.shape()));
            }
            let mut updated = (**data).clone();
            updated
                .assign(roi, patch)
                .map_err(|message| ExecutionError::ComputationFailed {
                    operator: self.name().to_string(),
                    message,
                })?;
            *data = Arc::new(updated);
        }
        self.output.set_dirty(roi);
        Ok(())
    }
}

impl Operator for OpArraySource {
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
        if let Some(tags) = &self.axistags {
            meta = meta.with_axistags(tags.clone());
        }
        self.output
            .set_meta(meta.mark_ready().map_err(GraphError::InconsistentMeta)?);
        Ok(())
    }

    fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        Ok(Arc::new(self.data.lock().extract(roi)))
    }

    fn propagate_dirty(&self, _input: &Slot, _roi: &Roi) {}
}

/// Identity pass-through.
///
/// Useful as a connection point and as the template for new operators.
///
/// Dirty policy: narrowed — the dirty region maps one-to-one onto the
/// output.
pub struct OpArrayPiper {
    state: OperatorState,
    /// Upstream data.
    pub input: Slot,
    /// Unchanged copy of the input.
    pub output: Slot,
}

impl OpArrayPiper {
    /// Create and register a piper.
    pub fn new(graph: &Graph) -> Arc<Self> {
        graph.register(Arc::new(Self {
            state: OperatorState::new("OpArrayPiper"),
            input: Slot::input("Input"),
            output: Slot::output("Output"),
        }))
    }
}

impl Operator for OpArrayPiper {
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
        self.output.set_meta(self.input.meta());
        Ok(())
    }

    fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        self.input.get(roi)
    }

    fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
        self.output.set_dirty(roi);
    }
}

/// Pointwise linear scaling (`value * factor`), element type preserved.
///
/// Dirty policy: narrowed — a pointwise map leaves regions unchanged.
pub struct OpScale {
    state: OperatorState,
    /// Upstream data.
    pub input: Slot,
    /// Scaled data.
    pub output: Slot,
    factor: f64,
}

impl OpScale {
    /// Create and register a scaler.
    pub fn new(graph: &Graph, factor: f64) -> Arc<Self> {
        graph.register(Arc::new(Self {
            state: OperatorState::new("OpScale"),
            input: Slot::input("Input"),
            output: Slot::output("Output"),
            factor,
        }))
    }

    /// The scale factor.
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Operator for OpScale {
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
        let mut meta = self.input.meta();
        meta.range = meta.range.map(|(lo, hi)| {
            let a = lo * self.factor;
            let b = hi * self.factor;
            (a.min(b), a.max(b))
        });
        self.output.set_meta(meta);
        Ok(())
    }

    fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        let data = self.input.get(roi)?;
        let factor = self.factor;
        Ok(Arc::new(data.map_f64(|v| v * factor)))
    }

    fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
        self.output.set_dirty(roi);
    }
}

/// Difference of adjacent frames along the time axis.
///
/// The output has one frame fewer than the input; frame `t` of the output
/// is `input[t + 1] - input[t]`. Requires tagged axes including time and at
/// least two time points (`ConstraintViolation` otherwise). `execute` reads
/// one extra frame of input beyond the requested output region — the
/// classic halo read.
///
/// Dirty policy: narrowed and transformed — a dirty input frame range
/// `[t0, t1)` dirties output frames `[t0 - 1, t1)` clipped to the output
/// extent; other axes map one-to-one.
pub struct OpTemporalDifference {
    state: OperatorState,
    /// Upstream time series.
    pub input: Slot,
    /// Frame-to-frame difference.
    pub output: Slot,
}

impl OpTemporalDifference {
    /// Create and register a temporal-difference operator.
    pub fn new(graph: &Graph) -> Arc<Self> {
        graph.register(Arc::new(Self {
            state: OperatorState::new("OpTemporalDifference"),
            input: Slot::input("Input"),
            output: Slot::output("Output"),
        }))
    }

    fn time_axis(&self) -> Option<usize> {
        self.input
            .meta()
            .axistags
            .as_ref()
            .and_then(|tags| tags.iter().position(|a| *a == Axis::Time))
    }
}

impl Operator for OpTemporalDifference {
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
        let time_axis = self.time_axis().ok_or_else(|| GraphError::ConstraintViolation {
            operator: self.name().to_string(),
            message: "input has no time axis".to_string(),
        })?;
        let shape = meta.shape.clone().ok_or_else(|| {
            GraphError::InconsistentMeta("ready input without shape".to_string())
        })?;
        if shape[time_axis] < 2 {
            return Err(GraphError::ConstraintViolation {
                operator: self.name().to_string(),
                message: format!(
                    "needs at least 2 time points, input has {}",
                    shape[time_axis]
                ),
            });
        }

        let mut out_shape = shape;
        out_shape[time_axis] -= 1;
        let mut out_meta = meta;
        out_meta.shape = Some(out_shape);
        self.output.set_meta(out_meta);
        Ok(())
    }

    fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        let time_axis = self
            .time_axis()
            .ok_or_else(|| ExecutionError::SlotNotReady {
                slot: self.output.name().to_string(),
            })?;

        // Read one extra frame beyond the requested output range.
        let mut stop = roi.stop().to_vec();
        stop[time_axis] += 1;
        let halo = Roi::new(roi.start().to_vec(), stop);
        let data = self.input.get(&halo)?;

        let wide = data.to_f64();
        let frames = wide.shape()[time_axis];
        let later = wide.slice_axis(ndarray::Axis(time_axis), Slice::from(1..frames));
        let earlier = wide.slice_axis(ndarray::Axis(time_axis), Slice::from(0..frames - 1));
        let diff = &later - &earlier;
        Ok(Arc::new(Tensor::from_f64(data.dtype(), diff)))
    }

    fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
        let meta = self.output.meta();
        let Some(shape) = meta.shape else { return };
        let Some(time_axis) = self.time_axis() else { return };

        let mut start = roi.start().to_vec();
        let mut stop = roi.stop().to_vec();
        start[time_axis] = start[time_axis].saturating_sub(1);
        for axis in 0..stop.len() {
            stop[axis] = stop[axis].min(shape[axis]);
            start[axis] = start[axis].min(stop[axis]);
        }
        let dirty = Roi::new(start, stop);
        if !dirty.is_empty() {
            self.output.set_dirty(&dirty);
        }
    }
}
