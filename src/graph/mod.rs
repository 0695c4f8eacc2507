//! Graph wiring: slots, operators, typed events, and multi-lane
//! replication.

pub mod events;
pub mod operator;
pub mod slot;
pub mod wrapper;

pub use events::{DirtyEvent, LaneEvent, MetaEvent, ResizeEvent, SubscriberList, SubscriptionId};
pub use operator::{
    configure, dirty_all_outputs, dispose, Graph, Lifecycle, Operator, OperatorState,
};
pub use slot::{Slot, SlotDirection, SlotEvents};
pub use wrapper::{LaneView, OperatorWrapper};
