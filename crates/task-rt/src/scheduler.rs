//! The scheduler core: the worker loop (`run_next`), the completion/grain bookkeeping
//! that runs after a task body returns (the rest of `task_wrapper`), and `enqueue_task`.
//!
//! Two pieces of per-worker state live in thread-locals here rather than being threaded
//! through every call: which task is currently executing on this worker (needed by the
//! public `yield`/`sync`/`wait` API, which take no explicit task argument) and this
//! worker's RNG/idle-streak bookkeeping (needed by the multi-queue's two-choice sampling
//! from call sites, like grain wakeup, that aren't holding a `&mut WorkerLocal` already).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::fiber::FiberResume;
use crate::runtime::Runtime;
use crate::task::{SharedValue, Task, TaskState};
use crate::worker_local::WorkerLocal;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    static CURRENT_WORKER: Cell<usize> = const { Cell::new(0) };
    static LOCAL: RefCell<Option<WorkerLocal>> = const { RefCell::new(None) };
}

pub(crate) fn init_worker_local(tid: usize, seed: u64) {
    CURRENT_WORKER.with(|c| c.set(tid));
    LOCAL.with(|c| *c.borrow_mut() = Some(WorkerLocal::new(tid, seed)));
}

pub fn current_worker() -> usize {
    CURRENT_WORKER.with(Cell::get)
}

/// The task currently running on this worker, if this is called from inside a task body
/// (directly or transitively through `sync`/`wait`/`yield_now`).
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Run `f` against this thread's `WorkerLocal`, lazily seeding one if this thread never
/// went through [`init_worker_local`] — i.e. it isn't one of the runtime's own workers,
/// but a driver thread calling `spawn`/`spawn_multi`/`sync` directly (as every scenario
/// test, property test, and the demo binary's `main` does). The lazy seed mixes the
/// runtime's `base_seed` with this thread's `ThreadId` so concurrent driver threads don't
/// all sample the same "random" heap.
fn with_local<R>(runtime: &Runtime, f: impl FnOnce(&mut WorkerLocal) -> R) -> R {
    LOCAL.with(|c| {
        let mut guard = c.borrow_mut();
        if guard.is_none() {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            let seed = runtime.base_seed().wrapping_add(hasher.finish());
            *guard = Some(WorkerLocal::new(current_worker(), seed));
        }
        let local = guard.as_mut().expect("just initialized above");
        f(local)
    })
}

/// Route `task` back into whichever queue it belongs in, using its already-assigned
/// priority. Sticky tasks already bound to a worker go to that worker's FIFO; everything
/// else (including not-yet-bound sticky tasks) goes through the multi-queue.
pub(crate) fn enqueue_task(runtime: &Runtime, task: Arc<Task>) {
    let prio = task.prio.load(Ordering::Relaxed);
    enqueue_task_with_prio(runtime, task, prio);
}

/// Like [`enqueue_task`] but assigns a new priority first (used for initial `spawn` and
/// for waking a grain family's parent at maximum urgency).
pub(crate) fn enqueue_task_with_prio(runtime: &Runtime, task: Arc<Task>, prio: u16) {
    if task.is_sticky() {
        if let Some(tid) = task.sticky_tid() {
            runtime.sticky().push(tid, task);
            return;
        }
    }
    task.prio.store(prio, Ordering::Relaxed);
    with_local(runtime, |local| {
        if let Err(e) = runtime.multiqueue().insert(Arc::clone(&task), prio, local) {
            log::warn!(target: "task_rt::scheduler", "dropped task {} on re-enqueue: {e}", task.id());
        }
    });
}

/// Detach every waiter queued on `task`'s completion queue and re-enqueue each, in the
/// order they arrived.
pub(crate) fn drain_completion_queue(runtime: &Runtime, task: &Arc<Task>) {
    let waiters: VecDeque<Arc<Task>> = std::mem::take(&mut *task.cq.lock());
    for waiter in waiters {
        enqueue_task(runtime, waiter);
    }
}

/// The rest of `task_wrapper` for a grain task: arrival/reduction bookkeeping, run after
/// the task's own body has already finished (`task.state()` is terminal). If this task is
/// a reducing family's non-last parent, it suspends here and only returns once the real
/// last arriver has woken it and filled in `red_result`.
pub(crate) fn sync_grains(runtime: &Runtime, task: &Arc<Task>) {
    let grain = task
        .grain
        .as_ref()
        .expect("sync_grains called on a task with no grain metadata");
    let is_parent = grain.grain_num == 0;

    let was_last = if let Some(red) = &grain.red {
        let value = task
            .result
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(Box::new(()) as crate::task::Value));
        // `reduce` wants an owned Value, not a SharedValue; grain bodies are never
        // observed by `sync()` individually, so unwrapping here is safe.
        let owned = Arc::try_unwrap(value).unwrap_or_else(|shared| {
            // Another reader (e.g. a racing `sync` on this individual grain, which the
            // public API does not expose, but defends here anyway) still holds a clone;
            // fall back to a debug placeholder rather than panicking.
            log::debug!(target: "task_rt::scheduler", "grain {} result had extra refs at reduce time", task.id());
            let _ = &shared;
            Box::new(())
        });
        match red.tree.reduce(grain.grain_num, owned, &*red.reducer) {
            Some(root) => {
                let parent_task = if is_parent { Arc::clone(task) } else { Arc::clone(task.parent.as_ref().unwrap()) };
                *parent_task.red_result.lock() = Some(Arc::new(root));
                // Must happen after the store above is visible, and before this parent
                // is re-enqueued/woken below, so any racing `sync()` either sees the raw
                // terminal state (not yet ready) or this flag plus `red_result` together.
                parent_task.reduction_ready.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    } else {
        grain
            .arr
            .as_ref()
            .expect("non-reducing grain always has an arrival tree")
            .last_arriver(grain.grain_num)
    };

    if was_last {
        if !is_parent {
            let parent = Arc::clone(task.parent.as_ref().expect("non-parent grain must have a parent"));
            enqueue_task_with_prio(runtime, parent, 0);
        }
        if let Some(arr) = &grain.arr {
            arr.free();
        }
        if let Some(red) = &grain.red {
            red.tree.free();
        }
    }

    if is_parent && !was_last {
        crate::fiber::yield_now();
        if let Some(v) = task.red_result.lock().clone() {
            *task.result.lock() = Some(v);
        }
    }
}

/// Suspend `current`, optionally re-enqueuing it first. Must be called from inside
/// `current`'s own running fiber.
pub(crate) fn yield_now(runtime: &Runtime, current: &Arc<Task>, requeue: bool) {
    current.set_current_tid(None);
    if requeue {
        enqueue_task(runtime, Arc::clone(current));
    }
    crate::fiber::yield_now();
    current.set_current_tid(Some(self::current_worker()));
    if self::current_worker() == 0 {
        runtime.host().event_loop_run_once();
    }
}

/// Block the caller until `target` reaches a terminal state, or return immediately if it
/// already has (or never will, because it's detached / hasn't started).
pub(crate) fn sync(runtime: &Runtime, current: &Arc<Task>, target: &Arc<Task>) -> Option<SharedValue> {
    if target.is_detached() || !target.has_started() {
        return None;
    }
    if target.sync_ready() {
        return target.sync_value();
    }
    {
        let mut cq = target.cq.lock();
        if target.sync_ready() {
            drop(cq);
            return target.sync_value();
        }
        cq.push_back(Arc::clone(current));
    }
    yield_now(runtime, current, false);
    target.sync_value()
}

/// Idle backoff ladder: spin, then yield to the OS, then short-sleep with increasing
/// duration, mirroring the engine's steal-failure backoff.
fn idle_backoff(streak: u32) {
    match streak {
        0..=64 => std::hint::spin_loop(),
        65..=512 => std::thread::yield_now(),
        513..=4096 => std::thread::sleep(Duration::from_micros(10)),
        _ => std::thread::sleep(Duration::from_micros(200)),
    }
}

/// One worker's entire lifetime: pop a task (sticky queue first, then the multi-queue),
/// run it to its next suspension or completion, repeat until the runtime shuts down.
///
/// Takes a `Weak<Runtime>` rather than an owned `Arc`: workers must not hold a permanent
/// strong reference, or dropping the caller's own `Arc<Runtime>` would never bring the
/// strong count to zero and `Runtime::drop` (which signals this very shutdown) could
/// never run. Each iteration upgrades just long enough to pop and run one task.
pub(crate) fn run_next(runtime: &Weak<Runtime>, tid: usize, seed: u64) {
    init_worker_local(tid, seed);
    loop {
        let runtime = match runtime.upgrade() {
            Some(rt) => rt,
            None => return,
        };
        if runtime.is_shutting_down() {
            return;
        }

        let task = runtime
            .sticky()
            .pop(tid)
            .or_else(|| with_local(&runtime, |local| runtime.multiqueue().delete_min(local)));

        let task = match task {
            Some(t) => t,
            None => {
                if tid == 0 {
                    runtime.host().event_loop_run_once();
                }
                with_local(&runtime, |local| local.on_idle());
                let streak = with_local(&runtime, |local| local.idle_streak);
                if runtime.idle_metrics_enabled() {
                    runtime.record_idle_tick();
                }
                idle_backoff(streak);
                continue;
            }
        };

        with_local(&runtime, |local| local.on_busy());
        if task.is_sticky() && task.sticky_tid().is_none() {
            task.bind_sticky(tid);
        }

        task.set_current_tid(Some(tid));
        CURRENT_TASK.with(|c| *c.borrow_mut() = Some(Arc::clone(&task)));
        let resume = task.fiber.lock().resume();
        CURRENT_TASK.with(|c| *c.borrow_mut() = None);
        task.set_current_tid(None);

        match resume {
            FiberResume::Yielded => {
                log::trace!(target: "task_rt::scheduler", "worker {tid} task {} yielded", task.id());
            }
            FiberResume::Finished(_) => {
                log::trace!(
                    target: "task_rt::scheduler",
                    "worker {tid} task {} finished state={:?}",
                    task.id(),
                    task.state()
                );
                debug_assert!(task.state() != TaskState::Runnable);
            }
        }
    }
}
