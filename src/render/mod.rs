//! Cooperative execution of a page's operator list on a drawing surface.
//!
//! A [RenderTask] executes its operator list in time slices, yielding to the runtime between
//!  slices and waiting whenever it caught up with the operators received so far. It can be
//!  cancelled synchronously, and it completes exactly once.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::RenderConfig;
use crate::error::DocError;
use crate::transport::operator_list::{OperatorList, OperatorListBucket};
use crate::util::latch::Latch;

/// The budget of a single slice of operator execution
pub struct SliceBudget {
    deadline: Instant,
    ops_left: usize,
    cancelled: Option<Arc<AtomicBool>>,
}

impl SliceBudget {
    pub fn new(time_slice: Duration, max_ops: usize) -> SliceBudget {
        SliceBudget {
            deadline: Instant::now() + time_slice,
            ops_left: max_ops,
            cancelled: None,
        }
    }

    fn for_task(config: &RenderConfig, cancelled: Arc<AtomicBool>) -> SliceBudget {
        SliceBudget {
            cancelled: Some(cancelled),
            ..Self::new(config.time_slice, config.max_ops_per_slice)
        }
    }

    /// Accounts for one executed operator. Returns `false` once the executor must stop and
    ///  return: the slice is used up, or the task was cancelled.
    pub fn tick(&mut self) -> bool {
        self.ops_left = self.ops_left.saturating_sub(1);
        !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.ops_left == 0
            || Instant::now() >= self.deadline
            || self.cancelled.as_ref().map(|c| c.load(Ordering::Acquire)).unwrap_or(false)
    }
}

/// The executor of drawing programs on some 2D surface
#[cfg_attr(test, mockall::automock)]
pub trait DrawingSurface: Send {
    fn begin_drawing(&mut self);

    /// Executes operators starting at `from`, calling [SliceBudget::tick] after each of them
    ///  and returning as soon as it says so or the list is exhausted. Returns the index of the
    ///  next operator to execute.
    fn execute_operator_list(&mut self, list: &OperatorList, from: usize, budget: &mut SliceBudget) -> usize;

    fn end_drawing(&mut self);
}

/// A drawing surface that at most one render task can use at a time
pub struct SurfaceSlot {
    surface: Mutex<Box<dyn DrawingSurface>>,
    in_use: AtomicBool,
}

impl SurfaceSlot {
    pub fn new(surface: impl DrawingSurface + 'static) -> Arc<SurfaceSlot> {
        Arc::new(SurfaceSlot {
            surface: Mutex::new(Box::new(surface)),
            in_use: AtomicBool::new(false),
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Starting a second render task on a surface that is in use is a bug in the caller.
    pub fn acquire(self: &Arc<Self>) -> anyhow::Result<SurfaceLease> {
        if self.in_use.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            bail!("the drawing surface is already in use by another render task");
        }
        Ok(SurfaceLease { slot: self.clone() })
    }
}

/// Exclusive use of a [SurfaceSlot], released on drop
pub struct SurfaceLease {
    slot: Arc<SurfaceSlot>,
}

impl SurfaceLease {
    fn surface(&self) -> MutexGuard<'_, Box<dyn DrawingSurface>> {
        self.slot.surface.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        self.slot.in_use.store(false, Ordering::Release);
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Result<(), DocError>) + Send>;

/// What a call to [RenderStepper::step] left to do
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// the slice was used up - yield, then step again
    Yield,
    /// all operators received so far were executed - wait for more than `known_len`
    NeedMore { known_len: usize },
    Done,
    Failed(DocError),
}

/// The resumable part of a render task: executes until the slice budget is exhausted, and
///  remembers where to continue.
pub struct RenderStepper {
    bucket: Arc<OperatorListBucket>,
    lease: SurfaceLease,
    config: RenderConfig,
    next_index: usize,
}

impl RenderStepper {
    fn new(bucket: Arc<OperatorListBucket>, lease: SurfaceLease, config: RenderConfig) -> RenderStepper {
        RenderStepper { bucket, lease, config, next_index: 0 }
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn step(&mut self, cancelled: &Arc<AtomicBool>) -> Step {
        let mut budget = SliceBudget::for_task(&self.config, cancelled.clone());
        let from = self.next_index;
        let lease = &self.lease;

        let (next_index, step) = self.bucket.with_list(|list| {
            let list = match list {
                Ok(list) => list,
                Err(e) => return (from, Step::Failed(e.clone())),
            };

            let mut next_index = from;
            if from < list.len() {
                next_index = lease.surface().execute_operator_list(list, from, &mut budget).max(from);
            }

            let step = if next_index >= list.len() {
                if list.last_chunk {
                    Step::Done
                }
                else {
                    Step::NeedMore { known_len: list.len() }
                }
            }
            else {
                Step::Yield
            };
            (next_index, step)
        });

        trace!(from, next_index, ?step, "render slice");
        self.next_index = next_index;
        step
    }
}

struct RenderShared {
    cancelled: Arc<AtomicBool>,
    cancel_signal: Latch<()>,
    outcome: Latch<Result<(), DocError>>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl RenderShared {
    fn complete(&self, outcome: Result<(), DocError>) {
        if !self.outcome.set(outcome.clone()) {
            return;
        }
        let callback = self.on_complete.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

/// A running render of an operator list onto a surface. Cloning gives another handle to the
///  same task.
#[derive(Clone)]
pub struct RenderTask {
    shared: Arc<RenderShared>,
}

impl Debug for RenderTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RenderTask{{cancelled:{}, done:{}}}", self.is_cancelled(), self.is_done())
    }
}

impl RenderTask {
    /// Starts rendering `bucket` on the leased surface. The surface is released before the
    ///  task completes. Must be called from inside a tokio runtime.
    pub fn start(bucket: Arc<OperatorListBucket>, lease: SurfaceLease, config: RenderConfig, on_complete: Option<CompletionCallback>) -> RenderTask {
        let shared = Arc::new(RenderShared {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_signal: Latch::new(),
            outcome: Latch::new(),
            on_complete: Mutex::new(on_complete),
        });

        let stepper = RenderStepper::new(bucket, lease, config);
        tokio::spawn(drive(stepper, shared.clone()));
        RenderTask { shared }
    }

    /// Stops the task: no operator is executed after the slice in progress, and the task
    ///  completes with an [DocError::Abort]. Cancelling a completed task has no effect.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("cancelling render task");
        self.shared.cancel_signal.set(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.shared.outcome.is_set()
    }

    /// Resolves with the task's outcome once it completed
    pub async fn completion(&self) -> Result<(), DocError> {
        self.shared.outcome.wait().await
    }
}

async fn drive(mut stepper: RenderStepper, shared: Arc<RenderShared>) {
    stepper.lease.surface().begin_drawing();

    let outcome = loop {
        if shared.cancelled.load(Ordering::Acquire) {
            break Err(DocError::abort(format!("rendering cancelled at operator {}", stepper.next_index())));
        }

        match stepper.step(&shared.cancelled) {
            Step::Yield => tokio::task::yield_now().await,
            Step::NeedMore { known_len } => {
                let bucket = stepper.bucket.clone();
                select! {
                    _ = shared.cancel_signal.wait() => {}
                    _ = bucket.wait_for_more(known_len) => {}
                }
            }
            Step::Done => break Ok(()),
            Step::Failed(e) => break Err(e),
        }
    };

    debug!(executed = stepper.next_index(), ok = outcome.is_ok(), "render task finished");
    let RenderStepper { lease, .. } = stepper;
    lease.surface().end_drawing();
    drop(lease);
    shared.complete(outcome);
}
