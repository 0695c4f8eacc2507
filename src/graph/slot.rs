//! Slots: typed graph ports carrying metadata and, on demand, data.
//!
//! A slot belongs to exactly one operator. Input slots accept at most one
//! upstream connection; output slots fan out to any number of downstream
//! partners. Output slots may themselves be *forwarded* to another slot —
//! composite operators and the lane wrapper wire an outer output directly to
//! an inner operator's output, and reads follow the forwarding link.
//!
//! Level-0 slots carry a single value or array; level-1 slots are ordered,
//! insertable lists of sub-slots, one per lane. Structural changes to a
//! level-1 slot mirror synchronously into every connected partner before the
//! triggering call returns.
//!
//! Reads are ROI-driven: `get`/`get_async` resolve against the connected
//! upstream, a stored value, or the owning operator's `execute`, in that
//! order. Dirty marks propagate synchronously, upstream before downstream.

use crate::core::error::{ExecResult, ExecutionError, GraphError, GraphResult};
use crate::core::metadata::SlotMeta;
use crate::core::roi::Roi;
use crate::core::types::{SlotValue, Tensor};
use crate::execution::request::{Request, RequestPool};
use crate::graph::events::{DirtyEvent, LaneEvent, MetaEvent, ResizeEvent, SubscriberList};
use crate::graph::operator::{configure, Lifecycle, Operator};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

/// Direction of a slot relative to its owning operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotDirection {
    /// Consumes data from an upstream partner.
    Input,
    /// Produces data via the owning operator.
    Output,
}

/// Event lists a slot exposes to subscribers.
///
/// Callbacks run synchronously at the point of the transition. Subscribers
/// must not assume ordering across independently-subscribed slots beyond
/// "upstream before downstream".
#[derive(Debug, Default)]
pub struct SlotEvents {
    /// A sub-region became stale.
    pub dirty: SubscriberList<DirtyEvent>,
    /// The slot transitioned to ready.
    pub ready: SubscriberList<()>,
    /// The slot transitioned to not-ready.
    pub unready: SubscriberList<()>,
    /// Metadata changed.
    pub meta_changed: SubscriberList<MetaEvent>,
    /// A sub-slot was inserted (level >= 1).
    pub inserted: SubscriberList<LaneEvent>,
    /// A sub-slot was removed (level >= 1).
    pub removed: SubscriberList<LaneEvent>,
    /// The sub-slot list length changed (level >= 1).
    pub resized: SubscriberList<ResizeEvent>,
}

struct Links {
    upstream: Option<Slot>,
    downstream: Vec<Weak<SlotInner>>,
}

struct SlotInner {
    name: String,
    direction: SlotDirection,
    level: usize,
    optional: bool,
    meta: RwLock<SlotMeta>,
    links: Mutex<Links>,
    value: Mutex<Option<SlotValue>>,
    subslots: RwLock<Vec<Slot>>,
    parent: RwLock<Option<Weak<SlotInner>>>,
    operator: RwLock<Option<Weak<dyn Operator>>>,
    pool: RwLock<Option<RequestPool>>,
    events: SlotEvents,
}

/// A graph port. Cheap to clone; clones share the same underlying slot.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl Slot {
    fn make(name: impl Into<String>, direction: SlotDirection, level: usize, optional: bool) -> Slot {
        Slot {
            inner: Arc::new(SlotInner {
                name: name.into(),
                direction,
                level,
                optional,
                meta: RwLock::new(SlotMeta::new()),
                links: Mutex::new(Links {
                    upstream: None,
                    downstream: Vec::new(),
                }),
                value: Mutex::new(None),
                subslots: RwLock::new(Vec::new()),
                parent: RwLock::new(None),
                operator: RwLock::new(None),
                pool: RwLock::new(None),
                events: SlotEvents::default(),
            }),
        }
    }

    /// A required level-0 input slot.
    pub fn input(name: impl Into<String>) -> Slot {
        Self::make(name, SlotDirection::Input, 0, false)
    }

    /// An optional level-0 input slot (configuration proceeds without it).
    pub fn optional_input(name: impl Into<String>) -> Slot {
        Self::make(name, SlotDirection::Input, 0, true)
    }

    /// A level-0 output slot.
    pub fn output(name: impl Into<String>) -> Slot {
        Self::make(name, SlotDirection::Output, 0, false)
    }

    /// A level-1 (multi-lane) input slot.
    pub fn multi_input(name: impl Into<String>) -> Slot {
        Self::make(name, SlotDirection::Input, 1, false)
    }

    /// A level-1 (multi-lane) output slot.
    pub fn multi_output(name: impl Into<String>) -> Slot {
        Self::make(name, SlotDirection::Output, 1, false)
    }

    // ========================================================================
    // Identity and introspection
    // ========================================================================

    /// The slot's name within its operator.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Input or output.
    pub fn direction(&self) -> SlotDirection {
        self.inner.direction
    }

    /// Whether this is an input slot.
    pub fn is_input(&self) -> bool {
        self.inner.direction == SlotDirection::Input
    }

    /// Whether this is an output slot.
    pub fn is_output(&self) -> bool {
        self.inner.direction == SlotDirection::Output
    }

    /// Slot level: 0 carries a single value, 1 carries a lane list.
    pub fn level(&self) -> usize {
        self.inner.level
    }

    /// Whether configuration may proceed while this input is unset.
    pub fn is_optional(&self) -> bool {
        self.inner.optional
    }

    /// Whether two handles refer to the same slot.
    pub fn same(&self, other: &Slot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The slot's event lists.
    pub fn events(&self) -> &SlotEvents {
        &self.inner.events
    }

    /// Current metadata (a copy).
    pub fn meta(&self) -> SlotMeta {
        self.inner.meta.read().clone()
    }

    /// Whether the slot can serve reads: level-0 slots need ready metadata,
    /// level-1 slots need a non-empty, fully ready lane list.
    pub fn is_ready(&self) -> bool {
        if self.inner.level == 0 {
            self.inner.meta.read().is_ready()
        } else {
            let subs = self.inner.subslots.read();
            !subs.is_empty() && subs.iter().all(Slot::is_ready)
        }
    }

    /// The connected upstream slot, if any.
    pub fn upstream(&self) -> Option<Slot> {
        self.inner.links.lock().upstream.clone()
    }

    /// Whether an upstream connection exists.
    pub fn is_connected(&self) -> bool {
        self.inner.links.lock().upstream.is_some()
    }

    pub(crate) fn downstream_partners(&self) -> Vec<Slot> {
        self.inner
            .links
            .lock()
            .downstream
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Slot { inner })
            .collect()
    }

    pub(crate) fn operator(&self) -> Option<Arc<dyn Operator>> {
        self.inner.operator.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn pool(&self) -> Option<RequestPool> {
        self.inner.pool.read().clone()
    }

    /// Associate this slot (and existing sub-slots) with its owning operator
    /// and the graph's request pool. Called once at registration.
    pub(crate) fn bind(&self, operator: &Arc<dyn Operator>, pool: &RequestPool) {
        *self.inner.operator.write() = Some(Arc::downgrade(operator));
        *self.inner.pool.write() = Some(pool.clone());
        for sub in self.inner.subslots.read().iter() {
            sub.bind(operator, pool);
        }
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Connect this slot to an upstream partner.
    ///
    /// Fails with `TypeMismatch` when both sides are ready and structurally
    /// incompatible (axis count or element type differ), and with
    /// `LevelMismatch` when the slot levels differ. A stored value is
    /// cleared. Metadata propagates immediately when the upstream is ready,
    /// which triggers the downstream configure pass.
    pub fn connect(&self, upstream: &Slot) -> GraphResult<()> {
        if self.same(upstream) {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: "cannot connect a slot to itself".to_string(),
            });
        }
        if self.level() != upstream.level() {
            return Err(GraphError::LevelMismatch {
                upstream: upstream.name().to_string(),
                upstream_level: upstream.level(),
                downstream: self.name().to_string(),
                downstream_level: self.level(),
            });
        }
        let up_meta = upstream.meta();
        let own_meta = self.meta();
        if !own_meta.structurally_compatible(&up_meta) {
            return Err(GraphError::TypeMismatch {
                upstream: format!("{} ({})", upstream.name(), up_meta),
                downstream: format!("{} ({})", self.name(), own_meta),
                reason: "axis count or element type differ".to_string(),
            });
        }

        {
            let mut links = self.inner.links.lock();
            if let Some(old) = &links.upstream {
                if old.same(upstream) {
                    return Ok(());
                }
            }
            if let Some(old) = links.upstream.take() {
                old.remove_downstream(self);
            }
            links.upstream = Some(upstream.clone());
        }
        self.inner.value.lock().take();
        upstream
            .inner
            .links
            .lock()
            .downstream
            .push(Arc::downgrade(&self.inner));

        log::debug!("connected slot '{}' <- '{}'", self.name(), upstream.name());

        if self.level() >= 1 {
            // Mirror the lane list, then pair up children.
            let target = upstream.len();
            self.resize(target)?;
            for i in 0..target {
                if let (Some(mine), Some(theirs)) = (self.subslot(i), upstream.subslot(i)) {
                    mine.connect(&theirs)?;
                }
            }
        } else if up_meta.is_ready() {
            self.apply_meta(up_meta);
        } else {
            // Drop any metadata left over from a previous feed; the new
            // upstream repopulates it on its configure pass.
            self.apply_meta(SlotMeta::new());
        }
        Ok(())
    }

    /// Drop the upstream connection and clear metadata.
    pub fn disconnect(&self) {
        let old = self.inner.links.lock().upstream.take();
        if let Some(old) = old {
            old.remove_downstream(self);
            log::debug!("disconnected slot '{}' from '{}'", self.name(), old.name());
        }
        self.apply_meta(SlotMeta::new());
    }

    fn remove_downstream(&self, partner: &Slot) {
        self.inner
            .links
            .lock()
            .downstream
            .retain(|w| w.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, &partner.inner)));
    }

    // ========================================================================
    // Values (level-0 scalar/array slots)
    // ========================================================================

    /// Store a value directly in the slot, marking it ready and dirty.
    ///
    /// Policy: fails with `InvalidOperation` when the slot is fed by a
    /// connection — inputs fed upstream cannot also be set directly.
    pub fn set_value(&self, value: SlotValue) -> GraphResult<()> {
        if self.is_connected() {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: "slot is fed by a connection; disconnect before setting a value"
                    .to_string(),
            });
        }
        if self.level() != 0 {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: "values can only be set on level-0 slots".to_string(),
            });
        }

        let meta = match &value {
            SlotValue::Array(t) => SlotMeta::new()
                .with_shape(t.shape().to_vec())
                .with_dtype(t.dtype()),
            _ => SlotMeta::new(),
        };
        let meta = meta
            .mark_ready()
            .map_err(GraphError::InconsistentMeta)?;
        let dirty_roi = meta
            .full_roi()
            .unwrap_or_else(|| Roi::new(Vec::new(), Vec::new()));

        *self.inner.value.lock() = Some(value);
        self.apply_meta(meta);
        self.set_dirty(&dirty_roi);
        Ok(())
    }

    /// The stored value, following the forwarding chain upstream.
    pub fn value(&self) -> Option<SlotValue> {
        if let Some(v) = self.inner.value.lock().clone() {
            return Some(v);
        }
        self.upstream().and_then(|up| up.value())
    }

    // ========================================================================
    // Metadata propagation
    // ========================================================================

    /// Install new metadata on this slot, firing transitions and mirroring
    /// into every connected downstream partner. Operators call this from
    /// `setup_outputs`; connected slots receive it automatically.
    pub fn set_meta(&self, meta: SlotMeta) {
        self.apply_meta(meta);
    }

    /// Clear metadata, transitioning the slot (and its downstream mirrors)
    /// to not-ready.
    pub fn mark_unready(&self) {
        self.apply_meta(SlotMeta::new());
    }

    fn apply_meta(&self, meta: SlotMeta) {
        let (was_ready, changed) = {
            let mut own = self.inner.meta.write();
            let was_ready = own.is_ready();
            let changed = *own != meta;
            *own = meta.clone();
            (was_ready, changed)
        };
        if !changed {
            return;
        }

        self.inner
            .events
            .meta_changed
            .emit(&MetaEvent { meta: meta.clone() });
        if meta.is_ready() && !was_ready {
            self.inner.events.ready.emit(&());
        } else if !meta.is_ready() && was_ready {
            self.inner.events.unready.emit(&());
        }

        // Mirror into downstream partners first so the whole subtree sees
        // consistent metadata before any operator reconfigures against it.
        for partner in self.downstream_partners() {
            partner.apply_meta(meta.clone());
        }

        if self.is_input() {
            self.configure_operator();
        }
    }

    fn configure_operator(&self) {
        if let Some(op) = self.operator() {
            if let Err(e) = configure(op.as_ref()) {
                log::warn!(
                    "configuring operator '{}' after change on slot '{}' failed: {}",
                    op.name(),
                    self.name(),
                    e
                );
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read the region `roi`, blocking until the data is available.
    pub fn get(&self, roi: &Roi) -> ExecResult<Arc<Tensor>> {
        self.get_async(roi)?.wait()
    }

    /// Start an asynchronous read of the region `roi`.
    ///
    /// Resolution order: a connected upstream slot (forwarding), a stored
    /// array value, then the owning operator's `execute` dispatched on the
    /// graph's request pool. Scalar value slots are not ROI-readable; use
    /// [`Slot::value`].
    ///
    /// Fails with `SlotNotReady` before configuration completes and with
    /// `OutOfBounds` when `roi` exceeds the declared shape.
    pub fn get_async(&self, roi: &Roi) -> ExecResult<Request> {
        if let Some(upstream) = self.upstream() {
            return upstream.get_async(roi);
        }

        let not_ready = || ExecutionError::SlotNotReady {
            slot: self.name().to_string(),
        };

        if let Some(value) = self.inner.value.lock().clone() {
            return match value {
                SlotValue::Array(tensor) => {
                    if !roi.contained_in_shape(tensor.shape()) {
                        return Err(ExecutionError::out_of_bounds(roi, tensor.shape()));
                    }
                    Ok(Request::ready(Arc::new(tensor.extract(roi))))
                }
                _ => Err(not_ready()),
            };
        }

        if !self.is_output() {
            return Err(not_ready());
        }
        let op = self.operator().ok_or_else(not_ready)?;
        if op.state().lifecycle() != Lifecycle::Ready {
            return Err(not_ready());
        }
        let meta = self.meta();
        if !meta.is_ready() {
            return Err(not_ready());
        }
        let shape = meta.shape.clone().ok_or_else(not_ready)?;
        let dtype = meta.dtype.ok_or_else(not_ready)?;
        if !roi.contained_in_shape(&shape) {
            return Err(ExecutionError::out_of_bounds(roi, &shape));
        }
        if roi.is_empty() {
            // Zero-volume reads short-circuit without touching the pool.
            return Ok(Request::ready(Arc::new(Tensor::zeros(dtype, &roi.shape()))));
        }

        let pool = self.pool().ok_or_else(not_ready)?;
        let label = format!("{}.{}{}", op.name(), self.name(), roi);
        let slot = self.clone();
        let roi = roi.clone();
        Ok(pool.submit(label, move || op.execute(&slot, &roi)))
    }

    // ========================================================================
    // Dirty propagation
    // ========================================================================

    /// Mark the region `roi` stale and propagate downstream.
    ///
    /// Subscribers on this slot fire first; then the owning operator's
    /// `propagate_dirty` (for inputs) decides what becomes dirty on which
    /// outputs; then every connected downstream partner receives the same
    /// region. Delivery is synchronous, upstream before downstream.
    pub fn set_dirty(&self, roi: &Roi) {
        self.inner
            .events
            .dirty
            .emit(&DirtyEvent { roi: roi.clone() });

        if self.is_input() {
            if let Some(op) = self.operator() {
                op.propagate_dirty(self, roi);
            }
        }

        for partner in self.downstream_partners() {
            partner.set_dirty(roi);
        }
    }

    // ========================================================================
    // Level-1 lane lists
    // ========================================================================

    /// Number of sub-slots (level >= 1).
    pub fn len(&self) -> usize {
        self.inner.subslots.read().len()
    }

    /// Whether the lane list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sub-slot at `index`.
    pub fn subslot(&self, index: usize) -> Option<Slot> {
        self.inner.subslots.read().get(index).cloned()
    }

    /// Snapshot of all sub-slots.
    pub fn subslots(&self) -> Vec<Slot> {
        self.inner.subslots.read().clone()
    }

    /// Index of a sub-slot within this slot.
    pub fn index_of(&self, child: &Slot) -> Option<usize> {
        self.inner
            .subslots
            .read()
            .iter()
            .position(|s| s.same(child))
    }

    /// The lane index of this slot within its parent multi-slot.
    pub fn lane_index(&self) -> Option<usize> {
        let parent = self.inner.parent.read().as_ref().and_then(Weak::upgrade)?;
        Slot { inner: parent }.index_of(self)
    }

    /// Grow or shrink the lane list to `size`, inserting/removing at the end.
    pub fn resize(&self, size: usize) -> GraphResult<()> {
        self.require_multi()?;
        while self.len() < size {
            let at = self.len();
            self.insert_subslot(at)?;
        }
        while self.len() > size {
            let at = self.len() - 1;
            self.remove_subslot(at)?;
        }
        Ok(())
    }

    /// Insert a new sub-slot at `index`.
    ///
    /// The structural change mirrors synchronously into every connected
    /// downstream partner, and `inserted`/`resized` events fire before this
    /// call returns, so sibling multi-slots can be brought into lockstep
    /// before any read reaches the new lane.
    pub fn insert_subslot(&self, index: usize) -> GraphResult<Slot> {
        self.require_multi()?;
        let child = Slot::make(
            format!("{}[{}]", self.name(), index),
            self.inner.direction,
            self.inner.level - 1,
            self.inner.optional,
        );
        *child.inner.parent.write() = Some(Arc::downgrade(&self.inner));
        if let (Some(op), Some(pool)) = (
            self.inner.operator.read().clone(),
            self.inner.pool.read().clone(),
        ) {
            *child.inner.operator.write() = Some(op);
            *child.inner.pool.write() = Some(pool);
        }

        let size = {
            let mut subs = self.inner.subslots.write();
            if index > subs.len() {
                return Err(GraphError::InvalidOperation {
                    slot: self.name().to_string(),
                    reason: format!("insert index {} beyond length {}", index, subs.len()),
                });
            }
            subs.insert(index, child.clone());
            subs.len()
        };

        // Fire own structural events first: the operator wrapper listens
        // here and synchronizes its sibling slots and lane operators before
        // the mirror below or the caller can issue reads.
        self.inner.events.inserted.emit(&LaneEvent { index, size });
        self.inner.events.resized.emit(&ResizeEvent { size });

        for partner in self.downstream_partners() {
            if partner.len() < size {
                partner.insert_subslot(index)?;
            }
            if let (Some(theirs), Some(mine)) = (partner.subslot(index), self.subslot(index)) {
                theirs.connect(&mine)?;
            }
        }
        Ok(child)
    }

    /// Remove the sub-slot at `index`, disconnecting it and mirroring the
    /// removal into every connected downstream partner.
    pub fn remove_subslot(&self, index: usize) -> GraphResult<()> {
        self.require_multi()?;
        let child = {
            let mut subs = self.inner.subslots.write();
            if index >= subs.len() {
                return Err(GraphError::InvalidOperation {
                    slot: self.name().to_string(),
                    reason: format!("remove index {} beyond length {}", index, subs.len()),
                });
            }
            subs.remove(index)
        };
        for partner in child.downstream_partners() {
            partner.disconnect();
        }
        child.disconnect();
        let size = self.len();

        self.inner.events.removed.emit(&LaneEvent { index, size });
        self.inner.events.resized.emit(&ResizeEvent { size });

        for partner in self.downstream_partners() {
            if partner.len() > size {
                partner.remove_subslot(index)?;
            }
        }
        Ok(())
    }

    fn require_multi(&self) -> GraphResult<()> {
        if self.inner.level == 0 {
            return Err(GraphError::InvalidOperation {
                slot: self.name().to_string(),
                reason: "lane operations require a level-1 slot".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("level", &self.inner.level)
            .field("ready", &self.is_ready())
            .finish()
    }
}
