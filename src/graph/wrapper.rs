//! Multi-lane replication: one inner operator per loaded dataset.
//!
//! An [`OperatorWrapper`] replicates a single-lane operator across N
//! independent lanes. It exposes one level-1 slot per slot of the inner
//! operator; sub-slot `i` of every wrapper slot belongs to lane `i`.
//! Inserting or removing a lane keeps every wrapper slot in lockstep: the
//! structural notification fires and is fully handled synchronously, so all
//! sibling slots are resized before the triggering call returns and no read
//! can reach a half-wired lane.
//!
//! [`LaneView`] gives collaborators a fixed-lane window: exactly the
//! declared slot set of the wrapped operator at one lane index, with no
//! fallback name resolution.

use crate::core::error::{ExecResult, GraphError, GraphResult};
use crate::core::roi::Roi;
use crate::core::types::Tensor;
use crate::graph::operator::{dispose, Graph, Lifecycle, Operator, OperatorState};
use crate::graph::slot::Slot;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

type LaneFactory = Box<dyn Fn(&Graph) -> Arc<dyn Operator> + Send + Sync>;

/// Replicates a single-lane operator across N lanes, keeping all level-1
/// slots synchronized as lanes are added and removed.
pub struct OperatorWrapper {
    state: OperatorState,
    graph: Graph,
    factory: LaneFactory,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    lanes: Mutex<Vec<Arc<dyn Operator>>>,
    /// Guards against re-entrant lane synchronization while a structural
    /// change is already being handled. Structural changes happen only on
    /// the single coordinating edit context.
    syncing: Mutex<bool>,
}

impl OperatorWrapper {
    /// Create a wrapper around the operator type produced by `factory`.
    ///
    /// A probe instance is created (and immediately disposed) to discover
    /// the inner slot set; the wrapper exposes a level-1 slot for each.
    pub fn new(
        graph: &Graph,
        name: impl Into<String>,
        factory: impl Fn(&Graph) -> Arc<dyn Operator> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let factory: LaneFactory = Box::new(factory);
        let probe = factory(graph);
        let input_names: Vec<String> = probe
            .inputs()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        let output_names: Vec<String> = probe
            .outputs()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        dispose(probe.as_ref());

        let inputs: Vec<Slot> = input_names.iter().map(Slot::multi_input).collect();
        let outputs: Vec<Slot> = output_names.iter().map(Slot::multi_output).collect();

        let wrapper = graph.register(Arc::new(Self {
            state: OperatorState::new(name),
            graph: graph.clone(),
            factory,
            inputs,
            outputs,
            lanes: Mutex::new(Vec::new()),
            syncing: Mutex::new(false),
        }));

        // Structural changes arriving through a connection (an upstream
        // multi-slot resized) must create/destroy lanes before the
        // triggering call returns.
        for slot in &wrapper.inputs {
            let weak = Arc::downgrade(&wrapper);
            slot.events().inserted.subscribe(move |event| {
                if let Some(wrapper) = weak.upgrade() {
                    wrapper.sync_inserted(event.index);
                }
            });
            let weak = Arc::downgrade(&wrapper);
            slot.events().removed.subscribe(move |event| {
                if let Some(wrapper) = weak.upgrade() {
                    wrapper.sync_removed(event.index);
                }
            });
        }
        wrapper
    }

    /// Current number of lanes.
    pub fn num_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// The wrapper's level-1 input slot named `name`.
    pub fn input(&self, name: &str) -> Option<Slot> {
        self.inputs.iter().find(|s| s.name() == name).cloned()
    }

    /// The wrapper's level-1 output slot named `name`.
    pub fn output(&self, name: &str) -> Option<Slot> {
        self.outputs.iter().find(|s| s.name() == name).cloned()
    }

    /// The inner operator of lane `index`.
    pub fn lane_operator(&self, index: usize) -> Option<Arc<dyn Operator>> {
        self.lanes.lock().get(index).cloned()
    }

    /// Append a lane; returns its index.
    pub fn add_lane(&self) -> GraphResult<usize> {
        let index = self.num_lanes();
        self.insert_lane(index)?;
        Ok(index)
    }

    /// Insert a lane at `index`.
    ///
    /// The change is atomic: if any wiring step fails, inserted sub-slots
    /// are removed again and the lane operator is disposed.
    pub fn insert_lane(&self, index: usize) -> GraphResult<()> {
        let _guard = self.enter_sync()?;
        self.insert_lane_locked(index)
    }

    /// Remove the lane at `index`, disposing its inner operator.
    pub fn remove_lane(&self, index: usize) -> GraphResult<()> {
        let _guard = self.enter_sync()?;
        self.remove_lane_locked(index)
    }

    /// Grow or shrink to exactly `count` lanes.
    pub fn set_num_lanes(&self, count: usize) -> GraphResult<()> {
        while self.num_lanes() < count {
            self.add_lane()?;
        }
        while self.num_lanes() > count {
            let index = self.num_lanes() - 1;
            self.remove_lane(index)?;
        }
        Ok(())
    }

    /// A fixed-lane window onto the wrapper: exactly the declared slot set
    /// (the wrapper's own sub-slots) at lane `index`.
    pub fn lane_view(&self, index: usize) -> GraphResult<LaneView> {
        if index >= self.num_lanes() {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: format!("lane {} does not exist ({} lanes)", index, self.num_lanes()),
            });
        }
        let mut inputs = IndexMap::new();
        for slot in &self.inputs {
            if let Some(sub) = slot.subslot(index) {
                inputs.insert(slot.name().to_string(), sub);
            }
        }
        let mut outputs = IndexMap::new();
        for slot in &self.outputs {
            if let Some(sub) = slot.subslot(index) {
                outputs.insert(slot.name().to_string(), sub);
            }
        }
        Ok(LaneView {
            operator_name: self.name().to_string(),
            lane: index,
            inputs,
            outputs,
        })
    }

    fn enter_sync(&self) -> GraphResult<SyncGuard<'_>> {
        let mut syncing = self.syncing.lock();
        if *syncing {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: "lane change already in progress".to_string(),
            });
        }
        *syncing = true;
        Ok(SyncGuard { flag: &self.syncing })
    }

    fn sync_inserted(&self, index: usize) {
        let guard = {
            let mut syncing = self.syncing.lock();
            if *syncing {
                return; // our own lane change; already handled
            }
            *syncing = true;
            SyncGuard { flag: &self.syncing }
        };
        if let Err(error) = self.insert_lane_locked(index) {
            log::error!(
                "wrapper '{}' failed to create lane {}: {}",
                self.name(),
                index,
                error
            );
        }
        drop(guard);
    }

    fn sync_removed(&self, index: usize) {
        let guard = {
            let mut syncing = self.syncing.lock();
            if *syncing {
                return;
            }
            *syncing = true;
            SyncGuard { flag: &self.syncing }
        };
        if let Err(error) = self.remove_lane_locked(index) {
            log::error!(
                "wrapper '{}' failed to remove lane {}: {}",
                self.name(),
                index,
                error
            );
        }
        drop(guard);
    }

    fn insert_lane_locked(&self, index: usize) -> GraphResult<()> {
        if self.state.lifecycle() == Lifecycle::Disposed {
            return Err(GraphError::Disposed {
                operator: self.name().to_string(),
            });
        }
        let lane_count = self.lanes.lock().len();
        if index > lane_count {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: format!("lane index {} beyond {} lanes", index, lane_count),
            });
        }
        let target = lane_count + 1;
        let inner = (self.factory)(&self.graph);

        let wire = (|| -> GraphResult<()> {
            // Bring every wrapper slot to the new lane count. The slot that
            // triggered an external sync already has its sub-slot.
            for slot in self.inputs.iter().chain(&self.outputs) {
                if slot.len() < target {
                    slot.insert_subslot(index)?;
                }
            }
            // Inner inputs read through the wrapper's input sub-slots.
            for inner_input in inner.inputs() {
                let outer = self.input(inner_input.name()).ok_or_else(|| {
                    GraphError::InvalidOperation {
                        slot: inner_input.name().to_string(),
                        reason: "inner operator slot not declared by probe".to_string(),
                    }
                })?;
                let sub = outer.subslot(index).ok_or_else(|| {
                    GraphError::InvalidOperation {
                        slot: outer.name().to_string(),
                        reason: format!("missing sub-slot {}", index),
                    }
                })?;
                inner_input.connect(&sub)?;
            }
            // Wrapper output sub-slots forward from the inner outputs.
            for inner_output in inner.outputs() {
                let outer = self.output(inner_output.name()).ok_or_else(|| {
                    GraphError::InvalidOperation {
                        slot: inner_output.name().to_string(),
                        reason: "inner operator slot not declared by probe".to_string(),
                    }
                })?;
                let sub = outer.subslot(index).ok_or_else(|| {
                    GraphError::InvalidOperation {
                        slot: outer.name().to_string(),
                        reason: format!("missing sub-slot {}", index),
                    }
                })?;
                sub.connect(&inner_output)?;
            }
            Ok(())
        })();

        match wire {
            Ok(()) => {
                self.lanes.lock().insert(index, inner);
                log::debug!("wrapper '{}' now has {} lanes", self.name(), target);
                Ok(())
            }
            Err(error) => {
                // Roll back: no partially resized slot lists survive.
                for slot in self.inputs.iter().chain(&self.outputs) {
                    while slot.len() > lane_count {
                        let _ = slot.remove_subslot(index.min(slot.len() - 1));
                    }
                }
                dispose(inner.as_ref());
                Err(error)
            }
        }
    }

    fn remove_lane_locked(&self, index: usize) -> GraphResult<()> {
        let inner = {
            let mut lanes = self.lanes.lock();
            if index >= lanes.len() {
                return Err(GraphError::InvalidOperation {
                    slot: self.name().to_string(),
                    reason: format!("lane {} does not exist ({} lanes)", index, lanes.len()),
                });
            }
            lanes.remove(index)
        };
        let target = self.lanes.lock().len();
        for slot in self.inputs.iter().chain(&self.outputs) {
            if slot.len() > target {
                slot.remove_subslot(index)?;
            }
        }
        dispose(inner.as_ref());
        log::debug!("wrapper '{}' now has {} lanes", self.name(), target);
        Ok(())
    }
}

struct SyncGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        *self.flag.lock() = false;
    }
}

impl Operator for OperatorWrapper {
    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn inputs(&self) -> Vec<Slot> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<Slot> {
        self.outputs.clone()
    }

    fn setup_outputs(&self) -> GraphResult<()> {
        // Lane metadata flows through the per-lane connections; the wrapper
        // itself has nothing to derive.
        Ok(())
    }

    fn execute(&self, output: &Slot, _roi: &Roi) -> ExecResult<Arc<Tensor>> {
        // Reads land on lane sub-slots, which forward to the inner
        // operators; the wrapper never computes.
        Err(crate::core::error::ExecutionError::ComputationFailed {
            operator: self.name().to_string(),
            message: format!(
                "output '{}' is a lane list; read a sub-slot instead",
                output.name()
            ),
        })
    }

    // Dirtiness flows through the per-lane connections.
    fn propagate_dirty(&self, _input: &Slot, _roi: &Roi) {}

    fn on_dispose(&self) {
        let lanes: Vec<Arc<dyn Operator>> = self.lanes.lock().drain(..).collect();
        for lane in lanes {
            dispose(lane.as_ref());
        }
    }
}

/// Explicit per-lane window onto an [`OperatorWrapper`]: exactly the
/// declared slot set at a fixed lane index.
#[derive(Debug, Clone)]
pub struct LaneView {
    operator_name: String,
    lane: usize,
    inputs: IndexMap<String, Slot>,
    outputs: IndexMap<String, Slot>,
}

impl LaneView {
    /// The wrapped operator's name.
    pub fn operator_name(&self) -> &str {
        &self.operator_name
    }

    /// The lane index this view is fixed to.
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// The lane's sub-slot of the named input.
    pub fn input(&self, name: &str) -> Option<&Slot> {
        self.inputs.get(name)
    }

    /// The lane's sub-slot of the named output.
    pub fn output(&self, name: &str) -> Option<&Slot> {
        self.outputs.get(name)
    }

    /// Declared input names, in order.
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    /// Declared output names, in order.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ExecutionError;
    use crate::core::metadata::SlotMeta;
    use crate::core::types::{Dtype, SlotValue};
    use ndarray::{ArrayD, IxDyn};

    /// Single-lane doubler used as the wrapped operator.
    struct OpLaneDouble {
        state: OperatorState,
        input: Slot,
        output: Slot,
    }

    impl OpLaneDouble {
        fn new(graph: &Graph) -> Arc<Self> {
            graph.register(Arc::new(Self {
                state: OperatorState::new("OpLaneDouble"),
                input: Slot::input("Input"),
                output: Slot::output("Output"),
            }))
        }
    }

    impl Operator for OpLaneDouble {
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
        // Pointwise map: regions map one-to-one.
        fn propagate_dirty(&self, _input: &Slot, roi: &Roi) {
            self.output.set_dirty(roi);
        }
    }

    fn wrapper(graph: &Graph) -> Arc<OperatorWrapper> {
        OperatorWrapper::new(graph, "WrappedDouble", |g| {
            OpLaneDouble::new(g) as Arc<dyn Operator>
        })
    }

    fn lane_value(values: &[f32]) -> SlotValue {
        SlotValue::Array(Arc::new(Tensor::F32(
            ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap(),
        )))
    }

    #[test]
    fn test_probe_defines_multi_slots() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        assert_eq!(w.num_lanes(), 0);
        assert_eq!(w.input("Input").unwrap().level(), 1);
        assert_eq!(w.output("Output").unwrap().level(), 1);
        assert!(w.input("Missing").is_none());
    }

    #[test]
    fn test_lanes_compute_independently() {
        let graph = Graph::with_workers(4);
        let w = wrapper(&graph);
        w.set_num_lanes(2).unwrap();

        let lane0 = w.lane_view(0).unwrap();
        let lane1 = w.lane_view(1).unwrap();
        lane0.input("Input").unwrap().set_value(lane_value(&[1.0, 2.0])).unwrap();
        lane1.input("Input").unwrap().set_value(lane_value(&[10.0])).unwrap();

        let out0 = lane0
            .output("Output")
            .unwrap()
            .get(&Roi::new(vec![0], vec![2]))
            .unwrap();
        let out1 = lane1
            .output("Output")
            .unwrap()
            .get(&Roi::new(vec![0], vec![1]))
            .unwrap();
        if let Tensor::F32(a) = out0.as_ref() {
            assert_eq!(a.as_slice().unwrap(), &[2.0, 4.0]);
        }
        if let Tensor::F32(a) = out1.as_ref() {
            assert_eq!(a.as_slice().unwrap(), &[20.0]);
        }
        // Independent metadata per lane.
        assert_eq!(
            lane0.output("Output").unwrap().meta().shape,
            Some(vec![2])
        );
        assert_eq!(
            lane1.output("Output").unwrap().meta().shape,
            Some(vec![1])
        );
    }

    #[test]
    fn test_new_lane_never_leaks_other_lane_data() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        w.set_num_lanes(2).unwrap();
        w.lane_view(0)
            .unwrap()
            .input("Input")
            .unwrap()
            .set_value(lane_value(&[1.0, 2.0, 3.0]))
            .unwrap();

        // Resize 2 -> 3; every wrapper slot resizes in the same call.
        w.add_lane().unwrap();
        assert_eq!(w.input("Input").unwrap().len(), 3);
        assert_eq!(w.output("Output").unwrap().len(), 3);

        // Reading the new, unconfigured lane fails; it never serves lane 0.
        let lane2 = w.lane_view(2).unwrap();
        let err = lane2
            .output("Output")
            .unwrap()
            .get(&Roi::new(vec![0], vec![3]))
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::SlotNotReady { .. } | ExecutionError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_remove_lane_shifts_and_disposes() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        w.set_num_lanes(3).unwrap();
        for (lane, v) in [(0, 1.0f32), (1, 2.0), (2, 3.0)] {
            w.lane_view(lane)
                .unwrap()
                .input("Input")
                .unwrap()
                .set_value(lane_value(&[v]))
                .unwrap();
        }
        let middle = w.lane_operator(1).unwrap();

        w.remove_lane(1).unwrap();
        assert_eq!(w.num_lanes(), 2);
        assert_eq!(middle.state().lifecycle(), Lifecycle::Disposed);

        // Lane 2 shifted down to index 1.
        let out = w
            .lane_view(1)
            .unwrap()
            .output("Output")
            .unwrap()
            .get(&Roi::new(vec![0], vec![1]))
            .unwrap();
        if let Tensor::F32(a) = out.as_ref() {
            assert_eq!(a.as_slice().unwrap(), &[6.0]);
        }
    }

    #[test]
    fn test_upstream_resize_creates_lanes_synchronously() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);

        // An external multi-output feeding the wrapper's input list.
        let upstream = Slot::multi_output("Datasets");
        w.input("Input").unwrap().connect(&upstream).unwrap();

        upstream.resize(2).unwrap();
        // Lanes and all sibling slots exist before resize() returned.
        assert_eq!(w.num_lanes(), 2);
        assert_eq!(w.input("Input").unwrap().len(), 2);
        assert_eq!(w.output("Output").unwrap().len(), 2);

        // Feed lane 0 through the upstream sub-slot.
        upstream.subslot(0).unwrap().set_meta(
            SlotMeta::new()
                .with_shape(vec![4])
                .with_dtype(Dtype::F32)
                .mark_ready()
                .unwrap(),
        );
        assert!(w.lane_view(0).unwrap().input("Input").unwrap().is_ready());

        upstream.remove_subslot(0).unwrap();
        assert_eq!(w.num_lanes(), 1);
        assert_eq!(w.output("Output").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_lane_insert_rolls_back() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        let err = w.insert_lane(3).unwrap_err();
        assert!(matches!(err, GraphError::InvalidOperation { .. }));
        assert_eq!(w.num_lanes(), 0);
        assert_eq!(w.input("Input").unwrap().len(), 0);
        assert_eq!(w.output("Output").unwrap().len(), 0);
    }

    #[test]
    fn test_lane_view_is_explicit() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        w.set_num_lanes(1).unwrap();
        let view = w.lane_view(0).unwrap();
        assert_eq!(view.lane(), 0);
        assert_eq!(view.input_names(), vec!["Input"]);
        assert_eq!(view.output_names(), vec!["Output"]);
        assert!(view.input("NotASlot").is_none());
        assert!(w.lane_view(1).is_err());
    }

    #[test]
    fn test_dispose_wrapper_disposes_lanes() {
        let graph = Graph::with_workers(2);
        let w = wrapper(&graph);
        w.set_num_lanes(2).unwrap();
        let lane0 = w.lane_operator(0).unwrap();

        dispose(w.as_ref());
        assert_eq!(w.state().lifecycle(), Lifecycle::Disposed);
        assert_eq!(lane0.state().lifecycle(), Lifecycle::Disposed);
        assert!(w.add_lane().is_err());
    }
}
