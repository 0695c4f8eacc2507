//! The Operator trait, lifecycle state machine, and graph registration.
//!
//! An operator owns a fixed set of input/output slots and implements two
//! phases: `setup_outputs` derives output metadata purely from input
//! metadata (re-run on every upstream metadata change, so it must be
//! idempotent and must fully repopulate the metadata), and `execute`
//! produces data for a requested ROI on one output. `propagate_dirty`
//! decides, for a dirty region on one input, what becomes dirty on which
//! outputs — there is deliberately no inherited default: every operator
//! states its own policy.
//!
//! # Lifecycle
//!
//! `Unconfigured -> Configuring -> Ready -> (dirty/ready cycles) -> Disposed`
//!
//! Construction and any input metadata change move the operator into
//! `Configuring`; a successful `setup_outputs` moves it to `Ready`. Output
//! reads while not `Ready` fail with `SlotNotReady`. `Disposed` is terminal:
//! all slot connections are released and no further reads are served.
//!
//! # Example implementation
//!
//! ```ignore
//! struct OpThreshold {
//!     state: OperatorState,
//!     input: Slot,
//!     output: Slot,
//! }
//!
//! impl Operator for OpThreshold {
//!     fn state(&self) -> &OperatorState { &self.state }
//!     fn inputs(&self) -> Vec<Slot> { vec![self.input.clone()] }
//!     fn outputs(&self) -> Vec<Slot> { vec![self.output.clone()] }
//!
//!     fn setup_outputs(&self) -> GraphResult<()> {
//!         self.output.set_meta(self.input.meta());
//!         Ok(())
//!     }
//!
//!     fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
//!         let data = self.input.get(roi)?;
//!         Ok(Arc::new(data.map_f64(|v| if v > 0.5 { 1.0 } else { 0.0 })))
//!     }
//!
//!     // Pointwise map: dirty regions map one-to-one.
//!     fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
//!         self.output.set_dirty(roi);
//!     }
//! }
//! ```

use crate::core::error::{ExecResult, GraphError, GraphResult, OperatorId};
use crate::core::roi::Roi;
use crate::core::types::Tensor;
use crate::execution::request::RequestPool;
use crate::graph::slot::Slot;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Lifecycle phase of an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, configure pass not yet run.
    Unconfigured,
    /// Waiting for inputs, or the last `setup_outputs` failed.
    Configuring,
    /// Outputs are configured and readable.
    Ready,
    /// Terminal: connections released, no further reads.
    Disposed,
}

/// Per-instance identity and lifecycle bookkeeping every operator embeds.
pub struct OperatorState {
    id: OperatorId,
    name: String,
    lifecycle: Mutex<Lifecycle>,
    configure_error: Mutex<Option<GraphError>>,
}

impl OperatorState {
    /// Create state for a freshly constructed operator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: OperatorId::new(),
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle::Unconfigured),
            configure_error: Mutex::new(None),
        }
    }

    /// Unique instance id.
    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// Instance name (used in logs and error messages).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle phase.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Whether the operator is ready to serve reads.
    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    /// The error of the last failed configure pass, if any. Surfaced to UI
    /// layers; the graph itself stays valid.
    pub fn configure_error(&self) -> Option<GraphError> {
        self.configure_error.lock().clone()
    }

    fn set_lifecycle(&self, phase: Lifecycle) {
        *self.lifecycle.lock() = phase;
    }

    fn record_error(&self, error: Option<GraphError>) {
        *self.configure_error.lock() = error;
    }
}

impl std::fmt::Debug for OperatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// A node in the dataflow graph.
///
/// Implementations hold their slots as named struct fields (explicit
/// ownership — sub-operators of a composite are named, typed handles
/// assembled at construction) and are registered against a [`Graph`] via
/// [`Graph::register`], which binds the slots and runs the first configure
/// pass.
pub trait Operator: Send + Sync + 'static {
    /// Lifecycle/identity state embedded in the operator.
    fn state(&self) -> &OperatorState;

    /// All input slots, in declaration order.
    fn inputs(&self) -> Vec<Slot>;

    /// All output slots, in declaration order.
    fn outputs(&self) -> Vec<Slot>;

    /// Derive output metadata from current input metadata.
    ///
    /// Must be idempotent and must fully repopulate metadata rather than
    /// patch it incrementally, to avoid stale leftover fields. Runs
    /// synchronously on the thread that changed the inputs; no suspension
    /// points are permitted here.
    fn setup_outputs(&self) -> GraphResult<()>;

    /// Produce the data of `roi` on `output`.
    ///
    /// Runs on a pool worker. May call `get` on input slots (which blocks
    /// the worker cooperatively) over whatever sub-region it needs — not
    /// necessarily `roi` (a convolution reads a halo, a temporal filter
    /// reads extra frames).
    fn execute(&self, output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>>;

    /// Translate a dirty region on `input` into dirty regions on outputs.
    ///
    /// The safe fallback is "entire output dirty" (see
    /// [`dirty_all_outputs`]); operators computing cheap per-region maps
    /// should narrow to the corresponding transformed region.
    fn propagate_dirty(&self, input: &Slot, roi: &Roi);

    /// Hook invoked at the start of disposal, before connections release.
    fn on_dispose(&self) {}

    /// Instance name.
    fn name(&self) -> &str {
        self.state().name()
    }
}

/// Safe fallback dirty policy: mark every configured output entirely dirty.
pub fn dirty_all_outputs(op: &dyn Operator) {
    for output in op.outputs() {
        if let Some(roi) = output.meta().full_roi() {
            output.set_dirty(&roi);
        }
    }
}

/// Run the configure pass on an operator.
///
/// Moves the operator through `Configuring`, and to `Ready` when every
/// non-optional input is ready and `setup_outputs` succeeds. A failed
/// `setup_outputs` (typically a `ConstraintViolation`) leaves the operator
/// in `Configuring` with the error recorded on its state, and its outputs
/// not-ready; the graph remains valid.
pub fn configure(op: &dyn Operator) -> GraphResult<()> {
    let state = op.state();
    if state.lifecycle() == Lifecycle::Disposed {
        return Err(GraphError::Disposed {
            operator: op.name().to_string(),
        });
    }
    state.set_lifecycle(Lifecycle::Configuring);

    let inputs_ready = op
        .inputs()
        .iter()
        .all(|slot| slot.is_optional() || slot.is_ready());
    if !inputs_ready {
        for output in op.outputs() {
            if output.level() == 0 {
                output.mark_unready();
            }
        }
        log::debug!("operator '{}' waiting for inputs", op.name());
        return Ok(());
    }

    match op.setup_outputs() {
        Ok(()) => {
            state.record_error(None);
            state.set_lifecycle(Lifecycle::Ready);
            log::debug!("operator '{}' configured", op.name());
            Ok(())
        }
        Err(error) => {
            for output in op.outputs() {
                if output.level() == 0 {
                    output.mark_unready();
                }
            }
            state.record_error(Some(error.clone()));
            log::warn!("operator '{}' failed to configure: {}", op.name(), error);
            Err(error)
        }
    }
}

/// Dispose an operator: release every slot connection and enter the
/// terminal `Disposed` state. Idempotent.
pub fn dispose(op: &dyn Operator) {
    if op.state().lifecycle() == Lifecycle::Disposed {
        return;
    }
    op.on_dispose();
    for input in op.inputs() {
        for sub in input.subslots() {
            sub.disconnect();
        }
        input.disconnect();
    }
    for output in op.outputs() {
        for sub in output.subslots() {
            for partner in sub.downstream_partners() {
                partner.disconnect();
            }
        }
        for partner in output.downstream_partners() {
            partner.disconnect();
        }
        if output.level() == 0 {
            output.mark_unready();
        }
    }
    op.state().set_lifecycle(Lifecycle::Disposed);
    log::debug!("operator '{}' disposed", op.name());
}

struct GraphInner {
    pool: RequestPool,
    operators: Mutex<Vec<Weak<dyn Operator>>>,
}

/// Handle to a dataflow graph: owns the shared request pool and tracks the
/// operators registered against it. Cheap to clone.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// A graph with one pool worker per available CPU.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(workers)
    }

    /// A graph with an explicit base worker count.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                pool: RequestPool::new(workers),
                operators: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The shared request pool.
    pub fn pool(&self) -> &RequestPool {
        &self.inner.pool
    }

    /// Register a freshly constructed operator: bind its slots to the
    /// operator and this graph's pool, then run the initial configure pass.
    pub fn register<T: Operator>(&self, op: Arc<T>) -> Arc<T> {
        let dyn_op: Arc<dyn Operator> = op.clone();
        for slot in dyn_op.inputs().into_iter().chain(dyn_op.outputs()) {
            slot.bind(&dyn_op, &self.inner.pool);
        }
        self.inner.operators.lock().push(Arc::downgrade(&dyn_op));
        if let Err(error) = configure(dyn_op.as_ref()) {
            log::debug!(
                "initial configure of '{}' pending: {}",
                dyn_op.name(),
                error
            );
        }
        op
    }

    /// Number of live registered operators.
    pub fn operator_count(&self) -> usize {
        let mut ops = self.inner.operators.lock();
        ops.retain(|w| w.upgrade().is_some());
        ops.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("operators", &self.inner.operators.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ExecutionError;
    use crate::core::metadata::SlotMeta;
    use crate::core::types::{Dtype, SlotValue};
    use ndarray::{ArrayD, IxDyn};

    struct OpConstant {
        state: OperatorState,
        output: Slot,
        value: f32,
        len: usize,
    }

    impl OpConstant {
        fn new(graph: &Graph, value: f32, len: usize) -> Arc<Self> {
            graph.register(Arc::new(Self {
                state: OperatorState::new("OpConstant"),
                output: Slot::output("Output"),
                value,
                len,
            }))
        }
    }

    impl Operator for OpConstant {
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
            self.output.set_meta(
                SlotMeta::new()
                    .with_shape(vec![self.len])
                    .with_dtype(Dtype::F32)
                    .mark_ready()
                    .map_err(GraphError::InconsistentMeta)?,
            );
            Ok(())
        }
        fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
            let shape = roi.shape();
            Ok(Arc::new(Tensor::F32(ArrayD::from_elem(
                IxDyn(&shape),
                self.value,
            ))))
        }
        fn propagate_dirty(&self, _input: &Slot, _roi: &Roi) {}
    }

    struct OpDouble {
        state: OperatorState,
        input: Slot,
        output: Slot,
    }

    impl OpDouble {
        fn new(graph: &Graph) -> Arc<Self> {
            graph.register(Arc::new(Self {
                state: OperatorState::new("OpDouble"),
                input: Slot::input("Input"),
                output: Slot::output("Output"),
            }))
        }
    }

    impl Operator for OpDouble {
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
            let data = self.input.get(roi)?;
            Ok(Arc::new(data.map_f64(|v| v * 2.0)))
        }
        // Pointwise map: region maps one-to-one.
        fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
            self.output.set_dirty(roi);
        }
    }

    #[test]
    fn test_source_operator_ready_after_register() {
        let graph = Graph::with_workers(2);
        let op = OpConstant::new(&graph, 3.0, 10);
        assert_eq!(op.state().lifecycle(), Lifecycle::Ready);

        let data = op.output.get(&Roi::new(vec![0], vec![4])).unwrap();
        assert_eq!(data.shape(), &[4]);
        if let Tensor::F32(a) = data.as_ref() {
            assert!(a.iter().all(|&v| v == 3.0));
        }
    }

    #[test]
    fn test_unconnected_operator_stays_configuring() {
        let graph = Graph::with_workers(2);
        let op = OpDouble::new(&graph);
        assert_eq!(op.state().lifecycle(), Lifecycle::Configuring);

        let err = op.output.get(&Roi::new(vec![0], vec![1])).unwrap_err();
        assert!(matches!(err, ExecutionError::SlotNotReady { .. }));
    }

    #[test]
    fn test_configure_chains_through_connection() {
        let graph = Graph::with_workers(2);
        let source = OpConstant::new(&graph, 2.0, 8);
        let double = OpDouble::new(&graph);

        double.input.connect(&source.output).unwrap();
        assert_eq!(double.state().lifecycle(), Lifecycle::Ready);

        let data = double.output.get(&Roi::new(vec![2], vec![6])).unwrap();
        if let Tensor::F32(a) = data.as_ref() {
            assert!(a.iter().all(|&v| v == 4.0));
        }
    }

    #[test]
    fn test_out_of_bounds_read() {
        let graph = Graph::with_workers(2);
        let op = OpConstant::new(&graph, 1.0, 5);
        let err = op.output.get(&Roi::new(vec![0], vec![6])).unwrap_err();
        assert!(matches!(err, ExecutionError::OutOfBounds { .. }));
    }

    #[test]
    fn test_empty_roi_short_circuits() {
        let graph = Graph::with_workers(2);
        let op = OpConstant::new(&graph, 1.0, 5);
        let data = op.output.get(&Roi::new(vec![3], vec![3])).unwrap();
        assert_eq!(data.len(), 0);
    }

    #[test]
    fn test_dispose_is_terminal() {
        let graph = Graph::with_workers(2);
        let source = OpConstant::new(&graph, 1.0, 5);
        let double = OpDouble::new(&graph);
        double.input.connect(&source.output).unwrap();

        dispose(double.as_ref());
        assert_eq!(double.state().lifecycle(), Lifecycle::Disposed);
        assert!(!double.input.is_connected());
        assert!(double.output.get(&Roi::new(vec![0], vec![1])).is_err());

        // Configure on a disposed operator is rejected.
        assert!(matches!(
            configure(double.as_ref()),
            Err(GraphError::Disposed { .. })
        ));
    }

    #[test]
    fn test_setup_reruns_on_meta_change() {
        let graph = Graph::with_workers(2);
        let upstream = Slot::output("External");
        let double = OpDouble::new(&graph);
        double.input.connect(&upstream).unwrap();
        assert_eq!(double.state().lifecycle(), Lifecycle::Configuring);

        upstream.set_meta(
            SlotMeta::new()
                .with_shape(vec![6])
                .with_dtype(Dtype::F32)
                .mark_ready()
                .unwrap(),
        );
        assert_eq!(double.state().lifecycle(), Lifecycle::Ready);
        assert_eq!(double.output.meta().shape, Some(vec![6]));

        upstream.set_meta(
            SlotMeta::new()
                .with_shape(vec![9])
                .with_dtype(Dtype::F32)
                .mark_ready()
                .unwrap(),
        );
        assert_eq!(double.output.meta().shape, Some(vec![9]));
    }

    #[test]
    fn test_value_slot_feeds_operator() {
        let graph = Graph::with_workers(2);
        let double = OpDouble::new(&graph);
        let values: Vec<f32> = (0..4).map(|i| i as f32).collect();
        double
            .input
            .set_value(SlotValue::Array(Arc::new(Tensor::F32(
                ArrayD::from_shape_vec(IxDyn(&[4]), values).unwrap(),
            ))))
            .unwrap();

        assert_eq!(double.state().lifecycle(), Lifecycle::Ready);
        let data = double.output.get(&Roi::new(vec![0], vec![4])).unwrap();
        if let Tensor::F32(a) = data.as_ref() {
            assert_eq!(a.as_slice().unwrap(), &[0.0, 2.0, 4.0, 6.0]);
        }
    }

    #[test]
    fn test_dirty_all_outputs_fallback() {
        let graph = Graph::with_workers(2);
        let op = OpConstant::new(&graph, 1.0, 6);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        op.output.events().dirty.subscribe(move |e| {
            seen2.lock().push(e.roi.clone());
        });

        dirty_all_outputs(op.as_ref());
        assert_eq!(&*seen.lock(), &[Roi::from_shape(&[6])]);
    }

    struct OpWithOptional {
        state: OperatorState,
        required: Slot,
        bias: Slot,
        output: Slot,
    }

    impl Operator for OpWithOptional {
        fn state(&self) -> &OperatorState {
            &self.state
        }
        fn inputs(&self) -> Vec<Slot> {
            vec![self.required.clone(), self.bias.clone()]
        }
        fn outputs(&self) -> Vec<Slot> {
            vec![self.output.clone()]
        }
        fn setup_outputs(&self) -> GraphResult<()> {
            self.output.set_meta(self.required.meta());
            Ok(())
        }
        fn execute(&self, _output: &Slot, roi: &Roi) -> ExecResult<Arc<Tensor>> {
            let bias = self
                .bias
                .value()
                .and_then(|v| v.as_float())
                .unwrap_or(0.0);
            let data = self.required.get(roi)?;
            Ok(Arc::new(data.map_f64(|v| v + bias)))
        }
        fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
            self.output.set_dirty(roi);
        }
    }

    #[test]
    fn test_optional_input_does_not_block_configure() {
        let graph = Graph::with_workers(2);
        let source = OpConstant::new(&graph, 1.0, 4);
        let op = graph.register(Arc::new(OpWithOptional {
            state: OperatorState::new("OpWithOptional"),
            required: Slot::input("Input"),
            bias: Slot::optional_input("Bias"),
            output: Slot::output("Output"),
        }));

        op.required.connect(&source.output).unwrap();
        // Ready without the optional input.
        assert_eq!(op.state().lifecycle(), Lifecycle::Ready);

        let data = op.output.get(&Roi::new(vec![0], vec![4])).unwrap();
        if let Tensor::F32(a) = data.as_ref() {
            assert!(a.iter().all(|&v| v == 1.0));
        }

        op.bias.set_value(SlotValue::Float(2.0)).unwrap();
        let data = op.output.get(&Roi::new(vec![0], vec![4])).unwrap();
        if let Tensor::F32(a) = data.as_ref() {
            assert!(a.iter().all(|&v| v == 3.0));
        }
    }

    #[test]
    fn test_graph_tracks_operators() {
        let graph = Graph::with_workers(1);
        let _a = OpConstant::new(&graph, 0.0, 1);
        assert_eq!(graph.operator_count(), 1);
        {
            let _b = OpConstant::new(&graph, 0.0, 1);
            assert_eq!(graph.operator_count(), 2);
        }
        assert_eq!(graph.operator_count(), 1);
    }
}
