//! Asynchronous requests and the shared worker pool.
//!
//! Every slot read that cannot be satisfied immediately becomes a
//! [`Request`]: one unit of asynchronous work bound to an operator output
//! and ROI. Requests are waitable, cancellable, and fire exactly-once
//! completion callbacks.
//!
//! The [`RequestPool`] executes requests on named worker threads. Operator
//! `execute` bodies block on `get` calls of their inputs, which recursively
//! spawn further requests — a cooperative blocking-call graph. To keep deep
//! operator chains from starving the pool, a worker about to block in
//! [`Request::wait`] notifies the pool, which spawns a replacement worker
//! when no idle worker remains. Growth is adaptive; workers are only torn
//! down when the pool itself is dropped.

use crate::core::error::{ExecResult, ExecutionError, RequestId};
use crate::core::types::Tensor;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Job = Box<dyn FnOnce() + Send>;

thread_local! {
    static WORKER_POOL: RefCell<Option<Arc<PoolInner>>> = const { RefCell::new(None) };
    static CURRENT_CANCEL: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Externally observable status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Executing on a worker.
    Running,
    /// Completed with data.
    Finished,
    /// Completed with an error.
    Failed,
    /// Terminated by cooperative cancellation.
    Cancelled,
}

enum RequestState {
    Pending,
    Running,
    Finished(Arc<Tensor>),
    Failed(ExecutionError),
    Cancelled,
}

impl RequestState {
    fn status(&self) -> RequestStatus {
        match self {
            RequestState::Pending => RequestStatus::Pending,
            RequestState::Running => RequestStatus::Running,
            RequestState::Finished(_) => RequestStatus::Finished,
            RequestState::Failed(_) => RequestStatus::Failed,
            RequestState::Cancelled => RequestStatus::Cancelled,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Finished(_) | RequestState::Failed(_) | RequestState::Cancelled
        )
    }
}

type FinishedCallback = Box<dyn FnOnce(&Arc<Tensor>) + Send>;
type FailedCallback = Box<dyn FnOnce(&ExecutionError) + Send>;
type CancelledCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    finished: Vec<FinishedCallback>,
    failed: Vec<FailedCallback>,
    cancelled: Vec<CancelledCallback>,
}

struct StateCell {
    state: RequestState,
    callbacks: Callbacks,
}

struct RequestShared {
    id: RequestId,
    label: String,
    cell: Mutex<StateCell>,
    cond: Condvar,
    cancel: Arc<AtomicBool>,
}

impl RequestShared {
    fn new(label: String, state: RequestState) -> Self {
        Self {
            id: RequestId::new(),
            label,
            cell: Mutex::new(StateCell {
                state,
                callbacks: Callbacks::default(),
            }),
            cond: Condvar::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

enum Outcome {
    Finished(Arc<Tensor>),
    Failed(ExecutionError),
    Cancelled,
}

fn complete(shared: &RequestShared, outcome: Outcome) {
    let fired = {
        let mut cell = shared.cell.lock();
        if cell.state.is_terminal() {
            return;
        }
        let callbacks = std::mem::take(&mut cell.callbacks);
        let fired = match outcome {
            Outcome::Finished(data) => {
                cell.state = RequestState::Finished(data.clone());
                Fired::Finished(data, callbacks.finished)
            }
            Outcome::Failed(error) => {
                cell.state = RequestState::Failed(error.clone());
                Fired::Failed(error, callbacks.failed)
            }
            Outcome::Cancelled => {
                cell.state = RequestState::Cancelled;
                Fired::Cancelled(callbacks.cancelled)
            }
        };
        shared.cond.notify_all();
        fired
    };

    // Callbacks run outside the lock, exactly once, exclusively.
    match fired {
        Fired::Finished(data, callbacks) => {
            for cb in callbacks {
                cb(&data);
            }
        }
        Fired::Failed(error, callbacks) => {
            for cb in callbacks {
                cb(&error);
            }
        }
        Fired::Cancelled(callbacks) => {
            for cb in callbacks {
                cb();
            }
        }
    }
}

enum Fired {
    Finished(Arc<Tensor>, Vec<FinishedCallback>),
    Failed(ExecutionError, Vec<FailedCallback>),
    Cancelled(Vec<CancelledCallback>),
}

/// Handle to one in-flight (or completed) computation. Cheap to clone;
/// clones share the same underlying request, so concurrent readers of the
/// same block coalesce onto one unit of work.
#[derive(Clone)]
pub struct Request {
    shared: Arc<RequestShared>,
}

impl Request {
    /// An already-finished request carrying `data`.
    pub fn ready(data: Arc<Tensor>) -> Request {
        Request {
            shared: Arc::new(RequestShared::new(
                "ready".to_string(),
                RequestState::Finished(data),
            )),
        }
    }

    /// An already-failed request carrying `error`.
    pub fn failed(error: ExecutionError) -> Request {
        Request {
            shared: Arc::new(RequestShared::new(
                "failed".to_string(),
                RequestState::Failed(error),
            )),
        }
    }

    /// Unique request id.
    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    /// Human-readable label (operator, slot and ROI), for logs.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Current status snapshot.
    pub fn status(&self) -> RequestStatus {
        self.shared.cell.lock().state.status()
    }

    /// Block until the request completes.
    ///
    /// Returns the computed data, the propagated failure, or
    /// `ExecutionError::Cancelled`. When called from a pool worker, the pool
    /// is notified so it can spawn a replacement worker — nested reads in
    /// deep operator chains therefore never starve the pool.
    pub fn wait(&self) -> ExecResult<Arc<Tensor>> {
        {
            let cell = self.shared.cell.lock();
            match &cell.state {
                RequestState::Finished(data) => return Ok(data.clone()),
                RequestState::Failed(error) => return Err(error.clone()),
                RequestState::Cancelled => return Err(ExecutionError::Cancelled),
                _ => {}
            }
        }

        let _guard = BlockGuard::enter();
        let mut cell = self.shared.cell.lock();
        loop {
            match &cell.state {
                RequestState::Finished(data) => return Ok(data.clone()),
                RequestState::Failed(error) => return Err(error.clone()),
                RequestState::Cancelled => return Err(ExecutionError::Cancelled),
                _ => self.shared.cond.wait(&mut cell),
            }
        }
    }

    /// Request cooperative cancellation.
    ///
    /// A request that has not started yet terminates immediately; a running
    /// request keeps executing until its operator polls
    /// [`Request::current_cancelled`] (or finishes), after which its waiters
    /// receive a `Cancelled` outcome instead of a result.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        let should_complete = {
            let cell = self.shared.cell.lock();
            matches!(cell.state, RequestState::Pending)
        };
        if should_complete {
            complete(&self.shared, Outcome::Cancelled);
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    /// Cancellation flag of the request currently executing on this thread.
    /// Operators performing long loops should poll this and return
    /// `ExecutionError::Cancelled` when it is set.
    pub fn current_cancelled() -> bool {
        CURRENT_CANCEL.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
        })
    }

    /// Register a callback fired once when the request finishes with data.
    /// Fires immediately when the request already finished.
    pub fn on_finished(&self, callback: impl FnOnce(&Arc<Tensor>) + Send + 'static) {
        let immediate = {
            let mut cell = self.shared.cell.lock();
            match &cell.state {
                RequestState::Finished(data) => Some(data.clone()),
                _ if cell.state.is_terminal() => None,
                _ => {
                    cell.callbacks.finished.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(data) = immediate {
            callback(&data);
        }
    }

    /// Register a callback fired once when the request fails.
    pub fn on_failed(&self, callback: impl FnOnce(&ExecutionError) + Send + 'static) {
        let immediate = {
            let mut cell = self.shared.cell.lock();
            match &cell.state {
                RequestState::Failed(error) => Some(error.clone()),
                _ if cell.state.is_terminal() => None,
                _ => {
                    cell.callbacks.failed.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(error) = immediate {
            callback(&error);
        }
    }

    /// Register a callback fired once when the request is cancelled.
    pub fn on_cancelled(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut cell = self.shared.cell.lock();
            match &cell.state {
                RequestState::Cancelled => {}
                _ if cell.state.is_terminal() => return,
                _ => {
                    cell.callbacks.cancelled.push(Box::new(callback));
                    return;
                }
            }
        }
        callback();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("status", &self.status())
            .finish()
    }
}

struct BlockGuard {
    pool: Arc<PoolInner>,
}

impl BlockGuard {
    fn enter() -> Option<BlockGuard> {
        let pool = WORKER_POOL.with(|p| p.borrow().clone())?;
        pool.enter_blocking();
        Some(BlockGuard { pool })
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.pool.exit_blocking();
    }
}

struct PoolInner {
    rx: Receiver<Job>,
    idle: AtomicUsize,
    blocked: AtomicUsize,
    live: AtomicUsize,
    next_worker: AtomicUsize,
}

impl PoolInner {
    fn enter_blocking(self: &Arc<Self>) {
        self.blocked.fetch_add(1, Ordering::SeqCst);
        // Every worker is either busy or blocked: grow so queued requests
        // (which this blocked worker may be waiting on) still get a thread.
        if self.idle.load(Ordering::SeqCst) == 0 {
            spawn_worker(self.clone());
        }
    }

    fn exit_blocking(&self) {
        self.blocked.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_worker(inner: Arc<PoolInner>) {
    let id = inner.next_worker.fetch_add(1, Ordering::SeqCst);
    inner.live.fetch_add(1, Ordering::SeqCst);
    let worker_inner = inner.clone();
    let result = std::thread::Builder::new()
        .name(format!("vxf-worker-{}", id))
        .spawn(move || {
            WORKER_POOL.with(|p| *p.borrow_mut() = Some(worker_inner.clone()));
            loop {
                worker_inner.idle.fetch_add(1, Ordering::SeqCst);
                let job = worker_inner.rx.recv();
                worker_inner.idle.fetch_sub(1, Ordering::SeqCst);
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }
            worker_inner.live.fetch_sub(1, Ordering::SeqCst);
        });
    if let Err(error) = result {
        inner.live.fetch_sub(1, Ordering::SeqCst);
        log::error!("failed to spawn pool worker: {}", error);
    }
}

/// Shared worker pool executing requests. Cheap to clone; all clones feed
/// the same workers. Workers exit when every clone has been dropped.
#[derive(Clone)]
pub struct RequestPool {
    tx: Sender<Job>,
    inner: Arc<PoolInner>,
}

impl RequestPool {
    /// Create a pool with `workers` base threads (at least one).
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let inner = Arc::new(PoolInner {
            rx,
            idle: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            next_worker: AtomicUsize::new(0),
        });
        for _ in 0..workers.max(1) {
            spawn_worker(inner.clone());
        }
        Self { tx, inner }
    }

    /// Submit a unit of work; returns immediately with its [`Request`].
    ///
    /// Panics inside `work` are contained and delivered to waiters as
    /// `ComputationFailed`.
    pub fn submit(
        &self,
        label: impl Into<String>,
        work: impl FnOnce() -> ExecResult<Arc<Tensor>> + Send + 'static,
    ) -> Request {
        let shared = Arc::new(RequestShared::new(label.into(), RequestState::Pending));
        let request = Request {
            shared: shared.clone(),
        };

        let job_shared = shared.clone();
        let job: Job = Box::new(move || run_job(job_shared, work));
        if self.tx.send(job).is_err() {
            complete(
                &shared,
                Outcome::Failed(ExecutionError::ComputationFailed {
                    operator: "pool".to_string(),
                    message: "request pool is shut down".to_string(),
                }),
            );
        }
        request
    }

    /// Number of live worker threads (base plus adaptive growth).
    pub fn worker_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of workers currently blocked in [`Request::wait`].
    pub fn blocked_count(&self) -> usize {
        self.inner.blocked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPool")
            .field("workers", &self.worker_count())
            .field("blocked", &self.blocked_count())
            .finish()
    }
}

fn run_job(
    shared: Arc<RequestShared>,
    work: impl FnOnce() -> ExecResult<Arc<Tensor>> + Send,
) {
    if shared.cancel.load(Ordering::SeqCst) {
        complete(&shared, Outcome::Cancelled);
        return;
    }
    {
        let mut cell = shared.cell.lock();
        if cell.state.is_terminal() {
            return;
        }
        cell.state = RequestState::Running;
    }

    CURRENT_CANCEL.with(|c| *c.borrow_mut() = Some(shared.cancel.clone()));
    let result = catch_unwind(AssertUnwindSafe(work));
    CURRENT_CANCEL.with(|c| *c.borrow_mut() = None);

    let outcome = match result {
        Ok(Ok(data)) => {
            if shared.cancel.load(Ordering::SeqCst) {
                Outcome::Cancelled
            } else {
                Outcome::Finished(data)
            }
        }
        Ok(Err(error)) => {
            if error.is_cancellation() {
                Outcome::Cancelled
            } else {
                log::error!("request '{}' failed: {}", shared.label, error);
                Outcome::Failed(error)
            }
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panicked".to_string());
            log::error!("request '{}' panicked: {}", shared.label, message);
            Outcome::Failed(ExecutionError::ComputationFailed {
                operator: shared.label.clone(),
                message,
            })
        }
    };
    complete(&shared, outcome);
}
