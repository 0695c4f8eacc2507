//! Request scheduling: the worker pool, request lifecycle, and batch
//! progress tracking.

pub mod progress;
pub mod request;

pub use progress::{BatchCallback, BatchTracker, BatchUpdate};
pub use request::{Request, RequestPool, RequestStatus};
