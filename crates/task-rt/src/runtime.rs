//! The process-wide scheduler singleton: owns the multi-queue, sticky queues, grain
//! synchronization pools, and the worker threads, and is the entry point for every public
//! operation (`spawn`, `new_multi`, `sync`, `wait`/`notify`, `yield_task`).
//!
//! Built once via [`Runtime::start`] (or [`Runtime::start_with_hooks`] to supply a host
//! event loop), torn down by dropping the last `Arc<Runtime>` — `Drop` signals every
//! worker to exit its loop and joins them, mirroring the engine's
//! `ThreadPool::new` / shutdown-and-join lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::condition::Condition;
use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::heap::MultiQueue;
use crate::host::{HostHooks, NoopHooks};
use crate::scheduler;
use crate::sticky::StickyQueues;
use crate::synctree::{Reducer, SyncTreePool};
use crate::task::{Body, GrainInfo, GrainReduction, SharedValue, Task, Value};

/// The head task plus every grain spawned by [`Runtime::new_multi`]. Kept together so
/// [`Runtime::spawn_multi`] can validate it received the whole family before inserting
/// anything (the Rust counterpart of the original's "walk exactly n linked tasks").
pub struct GrainFamily {
    grains: Vec<Arc<Task>>,
    expected: usize,
}

impl GrainFamily {
    /// The family's first grain (`grain_num == 0`), the one `sync` should be called on.
    pub fn head(&self) -> Arc<Task> {
        Arc::clone(&self.grains[0])
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    queues: MultiQueue,
    sticky: StickyQueues,
    synctree: Arc<SyncTreePool>,
    host: Box<dyn HostHooks>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    base_seed: u64,
    #[cfg(feature = "metrics")]
    idle_ticks: std::sync::atomic::AtomicU64,
}

impl Runtime {
    /// Start a runtime with a no-op host (no event loop pumped from worker 0).
    pub fn start(config: RuntimeConfig) -> Arc<Runtime> {
        Runtime::start_with_hooks(config, NoopHooks)
    }

    /// Start a runtime whose worker 0 pumps `hooks` whenever it finds no runnable task.
    pub fn start_with_hooks(config: RuntimeConfig, hooks: impl HostHooks) -> Arc<Runtime> {
        let workers_n = config.workers.max(1);
        let queues = MultiQueue::new(config.heap_count(), config.heap_d, config.tasks_per_heap);
        let sticky = StickyQueues::new(workers_n);
        let synctree =
            SyncTreePool::new(config.grains_per_split(), config.arriver_pool_size(), config.reducer_pool_size());
        let base_seed: u64 = rand::rng().random();

        log::info!(
            target: "task_rt::runtime",
            "starting runtime workers={workers_n} heap_count={} grains_per_split={}",
            config.heap_count(),
            config.grains_per_split(),
        );

        let runtime = Arc::new(Runtime {
            config,
            queues,
            sticky,
            synctree,
            host: Box::new(hooks),
            workers: Mutex::new(Vec::with_capacity(workers_n)),
            shutdown: AtomicBool::new(false),
            base_seed,
            #[cfg(feature = "metrics")]
            idle_ticks: std::sync::atomic::AtomicU64::new(0),
        });

        // Workers capture a `Weak`, not an `Arc`: if they held a strong reference for
        // their whole lifetime, dropping the caller's `Arc<Runtime>` would never bring
        // the strong count to zero, and `Drop` (which signals this very shutdown) would
        // never run. `run_next` upgrades transiently, once per dispatch.
        let handles: Vec<JoinHandle<()>> = (0..workers_n)
            .map(|tid| {
                let rt: Weak<Runtime> = Arc::downgrade(&runtime);
                let seed = runtime.base_seed;
                std::thread::Builder::new()
                    .name(format!("task-rt-worker-{tid}"))
                    .spawn(move || scheduler::run_next(&rt, tid, seed))
                    .expect("failed to spawn task-rt worker thread")
            })
            .collect();
        *runtime.workers.lock() = handles;

        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn multiqueue(&self) -> &MultiQueue {
        &self.queues
    }

    pub(crate) fn sticky(&self) -> &StickyQueues {
        &self.sticky
    }

    pub(crate) fn host(&self) -> &dyn HostHooks {
        &*self.host
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// The runtime-wide seed mixed into every worker's RNG stream. Exposed so a thread
    /// that never went through `init_worker_local` (a driver thread calling `spawn`
    /// directly) can still derive an independent stream on first use.
    pub(crate) fn base_seed(&self) -> u64 {
        self.base_seed
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn idle_metrics_enabled(&self) -> bool {
        self.config.idle_metrics
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn idle_metrics_enabled(&self) -> bool {
        false
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn record_idle_tick(&self) {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(not(feature = "metrics"))]
    pub(crate) fn record_idle_tick(&self) {}

    /// Snapshot of opt-in counters, available only when built with `--features metrics`.
    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> RuntimeMetrics {
        RuntimeMetrics { idle_ticks: self.idle_ticks.load(Ordering::Relaxed) }
    }

    /// Allocate and insert an independent task. If the caller is itself a running,
    /// non-sticky task, yields with requeue afterward so the new task gets a chance to run.
    pub fn spawn(
        self: &Arc<Self>,
        body: impl FnOnce() -> Value + Send + 'static,
        sticky: bool,
        detach: bool,
    ) -> Result<Arc<Task>, TaskError> {
        let boxed: Body = Box::new(body);
        let task = Task::new(boxed, self.config.stack_size, Arc::downgrade(self), sticky, detach, None, None)?;
        let prio = scheduler::current_worker() as u16;
        scheduler::enqueue_task_with_prio(self, Arc::clone(&task), prio);
        self.yield_if_caller_non_sticky();
        Ok(task)
    }

    /// Split `count` into `grain_k * workers` contiguous sub-ranges and build one task per
    /// grain, each running `body(start, end)`. With `reducer`, grain results fold pairwise
    /// up a reduction tree and `sync(family.head())` returns the folded value.
    pub fn new_multi<F>(self: &Arc<Self>, count: usize, body: F, reducer: Option<Arc<Reducer>>) -> Result<GrainFamily, TaskError>
    where
        F: Fn(usize, usize) -> Value + Send + Sync + 'static,
    {
        let n = self.config.grains_per_split().max(1);
        // A reducing family detects its own last arriver inside `ReductionData::reduce`
        // (it owns its own internal arrival counters), so the separate top-level arrival
        // tree would sit allocated, unincremented, for the family's whole lifetime. Only
        // allocate it for non-reducing families, which have no other way to tell.
        let arr = match &reducer {
            Some(_) => None,
            None => Some(self.synctree.alloc_arriver()?),
        };
        let red_tree = match &reducer {
            Some(_) => Some(self.synctree.alloc_reducer()?),
            None => None,
        };
        let body = Arc::new(body);

        let base = count / n;
        let extra = count % n;
        let mut grains = Vec::with_capacity(n);
        let mut start = 0usize;
        let mut head: Option<Arc<Task>> = None;

        for i in 0..n {
            let len = base + usize::from(i < extra);
            let end = start + len;
            let grain = GrainInfo {
                grain_num: i,
                start,
                end,
                arr: arr.clone(),
                red: red_tree.as_ref().map(|tree| GrainReduction {
                    tree: tree.clone(),
                    reducer: Arc::clone(reducer.as_ref().expect("red_tree is Some only alongside reducer")),
                }),
            };
            let body = Arc::clone(&body);
            let (s, e) = (start, end);
            let task_body: Body = Box::new(move || body(s, e));
            let parent = head.as_ref().map(Arc::clone);
            let task = Task::new(task_body, self.config.stack_size, Arc::downgrade(self), false, false, parent, Some(grain))?;
            if head.is_none() {
                head = Some(Arc::clone(&task));
            }
            grains.push(task);
            start = end;
        }

        Ok(GrainFamily { grains, expected: n })
    }

    /// Insert every grain in `family` into the multi-queue. Errors (without inserting
    /// anything) if `family` doesn't cover the expected grain count.
    pub fn spawn_multi(self: &Arc<Self>, family: &GrainFamily) -> Result<Arc<Task>, TaskError> {
        if family.grains.len() != family.expected {
            return Err(TaskError::ChainTooShort { expected: family.expected, found: family.grains.len() });
        }
        let prio = scheduler::current_worker() as u16;
        for grain in &family.grains {
            scheduler::enqueue_task_with_prio(self, Arc::clone(grain), prio);
        }
        self.yield_if_caller_non_sticky();
        Ok(family.head())
    }

    fn yield_if_caller_non_sticky(self: &Arc<Self>) {
        if let Some(current) = scheduler::current_task() {
            if !current.is_sticky() {
                scheduler::yield_now(self, &current, true);
            }
        }
    }

    /// Wait for `target` to reach a terminal state and return its value. Returns `None`
    /// immediately if `target` is detached or hasn't started yet. Callable both from
    /// inside a running task (suspends via the scheduler) and from an external thread
    /// (falls back to a plain backoff loop, since there's no fiber to suspend).
    pub fn sync(&self, target: &Arc<Task>) -> Option<SharedValue> {
        if target.is_detached() || !target.has_started() {
            return None;
        }
        match scheduler::current_task() {
            Some(current) => scheduler::sync(self, &current, target),
            None => self.blocking_sync(target),
        }
    }

    fn blocking_sync(&self, target: &Arc<Task>) -> Option<SharedValue> {
        let mut spins = 0u32;
        loop {
            if target.sync_ready() {
                return target.sync_value();
            }
            spins = spins.saturating_add(1);
            if spins < 1_000 {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }

    /// Suspend the calling task, optionally requeuing it first. A no-op if called from a
    /// thread that isn't currently running a task.
    pub fn yield_task(&self, requeue: bool) {
        if let Some(current) = scheduler::current_task() {
            scheduler::yield_now(self, &current, requeue);
        }
    }

    pub fn condition_new(&self) -> Condition {
        Condition::new()
    }

    /// Block until `cond` is notified. From inside a task this suspends on the scheduler;
    /// from an external thread it backs off in a plain spin/sleep loop.
    pub fn wait(&self, cond: &Condition) {
        match scheduler::current_task() {
            Some(current) => cond.wait(self, &current),
            None => {
                while !cond.is_notified() {
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn notify(&self, cond: &Condition) {
        cond.notify(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.workers.lock());
        let me = std::thread::current().id();
        for handle in handles {
            // A worker can itself be the thread whose dropped, transiently-upgraded
            // `Arc` brings the strong count to zero (see `run_next`'s `Weak::upgrade`).
            // Joining its own handle here would deadlock; it's already on its way out
            // once it next checks `is_shutting_down`, so just let it finish on its own.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
        #[cfg(feature = "metrics")]
        if self.config.idle_metrics {
            log::info!(
                target: "task_rt::runtime",
                "shutdown idle_ticks={}",
                self.idle_ticks.load(Ordering::Relaxed)
            );
        }
    }
}

/// Opt-in counters surfaced only when compiled with `--features metrics`.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy)]
pub struct RuntimeMetrics {
    pub idle_ticks: u64,
}
