//! Task lifecycle: the unit of work the scheduler dispatches, and the state it
//! accumulates from creation through completion.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::fiber::Fiber;
use crate::runtime::Runtime;
use crate::scheduler;
use crate::synctree::{ArrivalTreeHandle, Reducer, ReductionTreeHandle};

/// Priority value meaning "heap slot empty" / "no preference".
pub const PRIO_EMPTY: u16 = u16::MAX;

/// A type-erased task result or argument. The host's real value representation is out of
/// scope for this core; `Value` is the Rust stand-in.
pub type Value = Box<dyn Any + Send>;

/// A task body: runs once, to completion or panic, and produces a `Value`.
pub type Body = Box<dyn FnOnce() -> Value + Send>;

/// What `sync()` hands back: shared so that multiple waiters on the same task (or a
/// reducing grain family's parent) can each read the completed value without the first
/// reader consuming it.
pub type SharedValue = Arc<Value>;

/// Terminal and non-terminal task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// A reduction tree paired with the user's combine function for one grain family.
pub(crate) struct GrainReduction {
    pub tree: ReductionTreeHandle,
    pub reducer: Arc<Reducer>,
}

/// Grain-specific metadata, present only on tasks produced by `new_multi`.
pub(crate) struct GrainInfo {
    pub grain_num: usize,
    pub start: usize,
    pub end: usize,
    /// `None` for a reducing family: `ReductionData` tracks its own last-arriver
    /// internally, so the top-level arrival tree would never be touched.
    pub arr: Option<ArrivalTreeHandle>,
    pub red: Option<GrainReduction>,
}

/// One schedulable unit of work.
pub struct Task {
    pub(crate) id: u64,
    pub(crate) fiber: Mutex<Fiber>,
    pub(crate) prio: AtomicU16,
    pub(crate) state: Mutex<TaskState>,
    pub(crate) started: AtomicBool,
    pub(crate) sticky: bool,
    pub(crate) detached: bool,
    /// Worker this task is permanently bound to once dispatched, if `sticky`. -1 = unbound.
    pub(crate) sticky_tid: AtomicI64,
    /// Worker currently executing this task, if any. -1 = not running.
    pub(crate) current_tid: AtomicI64,
    /// For a grain task, the head of its family (`grain_num == 0`). `None` for the head
    /// itself and for ordinary (non-grain) tasks.
    pub(crate) parent: Option<Arc<Task>>,
    /// Tasks waiting on this task's completion, via `sync`.
    pub(crate) cq: Mutex<VecDeque<Arc<Task>>>,
    pub(crate) result: Mutex<Option<SharedValue>>,
    pub(crate) red_result: Mutex<Option<SharedValue>>,
    pub(crate) exception: Mutex<Option<SharedValue>>,
    pub(crate) grain: Option<GrainInfo>,
    /// Set only once `red_result` has actually been published for a reducing family's
    /// parent. `state` goes terminal as soon as the parent's own grain body returns,
    /// which for the typical non-last-arriver case happens well before `sync_grains`
    /// resumes it with the folded value — so `sync()` can't use raw terminal state as
    /// "the value is ready" for this one case. See `sync_ready`.
    pub(crate) reduction_ready: AtomicBool,
}

impl Task {
    /// Build a task bound to a runtime: `body` runs inside `task_wrapper`'s panic
    /// boundary, and completion hands the task back to `runtime` for completion-queue
    /// drainage and, if applicable, grain synchronization.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        body: Body,
        stack_size: usize,
        runtime: Weak<Runtime>,
        sticky: bool,
        detached: bool,
        parent: Option<Arc<Task>>,
        grain: Option<GrainInfo>,
    ) -> std::io::Result<Arc<Task>> {
        static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let mut stack_alloc_err = None;
        let task = Arc::new_cyclic(|weak_self: &Weak<Task>| {
            let weak_self = weak_self.clone();
            let fiber = match Fiber::new(stack_size, move || run_body(weak_self, runtime, body)) {
                Ok(f) => f,
                Err(e) => {
                    stack_alloc_err = Some(e);
                    // Never resumed: `new` bails out with the error below.
                    Fiber::new(1, || Box::new(()) as Value).expect("minimal fallback stack")
                }
            };
            Task {
                id,
                fiber: Mutex::new(fiber),
                prio: AtomicU16::new(PRIO_EMPTY),
                state: Mutex::new(TaskState::Runnable),
                started: AtomicBool::new(false),
                sticky,
                detached,
                sticky_tid: AtomicI64::new(-1),
                current_tid: AtomicI64::new(-1),
                parent,
                cq: Mutex::new(VecDeque::new()),
                result: Mutex::new(None),
                red_result: Mutex::new(None),
                exception: Mutex::new(None),
                grain,
                reduction_ready: AtomicBool::new(false),
            }
        });

        if let Some(e) = stack_alloc_err {
            return Err(e);
        }
        Ok(task)
    }

    /// Build a task with no runtime backing. Only used by unit tests in other modules
    /// that exercise queue placement without ever resuming the fiber.
    #[cfg(test)]
    pub(crate) fn new_detached(body: Body, stack_size: usize) -> std::io::Result<Arc<Task>> {
        Task::new(body, stack_size, Weak::new(), false, true, None, None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The exception caught from a failed task body, if any.
    pub fn exception(&self) -> Option<SharedValue> {
        self.exception.lock().clone()
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn sticky_tid(&self) -> Option<usize> {
        let v = self.sticky_tid.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v as usize)
        }
    }

    /// Set-at-most-once: a racing worker may already have bound this task, in which case
    /// this harmlessly loses the compare-exchange.
    pub(crate) fn bind_sticky(&self, tid: usize) {
        let _ = self
            .sticky_tid
            .compare_exchange(-1, tid as i64, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn set_current_tid(&self, tid: Option<usize>) {
        self.current_tid
            .store(tid.map(|t| t as i64).unwrap_or(-1), Ordering::Release);
    }

    /// Record the task body's outcome: success stores `result` and marks `Done`; a caught
    /// panic stores `exception` and marks `Failed`. Called once, from `task_wrapper`.
    fn finish(&self, outcome: Result<Value, Value>) {
        match outcome {
            Ok(v) => {
                *self.result.lock() = Some(Arc::new(v));
                *self.state.lock() = TaskState::Done;
            }
            Err(e) => {
                *self.exception.lock() = Some(Arc::new(e));
                *self.state.lock() = TaskState::Failed;
            }
        }
    }

    /// Whether `sync()` may treat this task as finished. For an ordinary task or a
    /// non-parent grain this is just terminal state; for a reducing family's parent it
    /// also requires that the reduction has actually published `red_result` (terminal
    /// state alone only means the parent's own grain body returned, not that the fold is
    /// done — see `reduction_ready`).
    pub(crate) fn sync_ready(&self) -> bool {
        let is_reducing_parent = self
            .grain
            .as_ref()
            .is_some_and(|g| g.grain_num == 0 && g.red.is_some());
        if is_reducing_parent {
            self.reduction_ready.load(Ordering::Acquire)
        } else {
            self.state().is_terminal()
        }
    }

    /// The value `sync()` should hand back: for a reducing grain family's parent, the
    /// folded `red_result` once available, else the task's own `result`.
    pub(crate) fn sync_value(&self) -> Option<SharedValue> {
        let wants_reduction = self.grain.as_ref().is_some_and(|g| g.red.is_some());
        if wants_reduction {
            self.red_result.lock().clone().or_else(|| self.result.lock().clone())
        } else {
            self.result.lock().clone()
        }
    }
}

/// The body that runs inside the task's fiber: invokes the user closure behind a panic
/// boundary, records the outcome, synchronizes grain families, then hands the task off
/// to the scheduler for completion-queue drainage.
fn run_body(self_weak: Weak<Task>, runtime_weak: Weak<Runtime>, body: Body) -> Value {
    let task = self_weak.upgrade().expect("task outlives its own fiber body");
    task.mark_started();

    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    task.finish(outcome);

    if let Some(runtime) = runtime_weak.upgrade() {
        if task.grain.is_some() {
            scheduler::sync_grains(&runtime, &task);
        }
        if !task.is_detached() {
            scheduler::drain_completion_queue(&runtime, &task);
        }
    }

    Box::new(())
}
