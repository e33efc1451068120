//! Runtime configuration and tunables.
//!
//! Defaults mirror the compile-time constants of the scheduler this crate is modeled on;
//! `RuntimeConfig::from_env` layers environment-variable overrides on top, in the same
//! style as the search engine's `SHOGI_WORKER_STACK_MB` / `SHOGI_THREADPOOL_BIASED` knobs.

use std::env;

/// Number of d-ary min-heaps per worker in the multi-queue (`heap_c` in the design doc).
const DEFAULT_HEAP_C: usize = 4;
/// Branching factor of each heap.
const DEFAULT_HEAP_D: usize = 8;
/// Capacity of each heap.
const DEFAULT_TASKS_PER_HEAP: usize = 129;
/// Grains produced per worker for a data-parallel split.
const DEFAULT_GRAIN_K: usize = 4;
/// Exponent controlling arrival-tree pool size: `(GRAIN_K * W)^ARRIVERS_P + 1`.
const DEFAULT_ARRIVERS_P: u32 = 1;
/// Reducers as a fraction of arrivers; 0 disables reduction-tree pooling entirely.
const DEFAULT_REDUCERS_FRAC: f64 = 1.0;
/// Default task stack size, rounded up to a page by the coroutine stack allocator.
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Tunable knobs for a [`crate::runtime::Runtime`].
///
/// Constructed with [`RuntimeConfig::default`] for compiled-in defaults, or
/// [`RuntimeConfig::from_env`] to additionally honor environment overrides.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker OS threads (`W`), all spawned by
    /// [`crate::runtime::Runtime::start`]. Worker 0 additionally pumps the host's event
    /// loop whenever it finds nothing runnable.
    pub workers: usize,
    pub heap_c: usize,
    pub heap_d: usize,
    pub tasks_per_heap: usize,
    pub grain_k: usize,
    pub arrivers_p: u32,
    pub reducers_frac: f64,
    pub stack_size: usize,
    /// Enables the idle/steal counters surfaced by `Runtime::metrics_snapshot`.
    pub idle_metrics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: default_worker_count(),
            heap_c: DEFAULT_HEAP_C,
            heap_d: DEFAULT_HEAP_D,
            tasks_per_heap: DEFAULT_TASKS_PER_HEAP,
            grain_k: DEFAULT_GRAIN_K,
            arrivers_p: DEFAULT_ARRIVERS_P,
            reducers_frac: DEFAULT_REDUCERS_FRAC,
            stack_size: DEFAULT_STACK_SIZE,
            idle_metrics: false,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RuntimeConfig {
    /// Start from [`RuntimeConfig::default`] and overlay the `TASK_RT_*` environment
    /// variables, logging each override at `info` level (mirrors the engine's habit of
    /// logging every env-derived tunable once at startup).
    pub fn from_env() -> Self {
        let mut cfg = RuntimeConfig::default();

        if let Some(v) = env_usize("TASK_RT_WORKERS") {
            log::info!(target: "task_rt::config", "workers override={v}");
            cfg.workers = v.max(1);
        }
        if let Some(v) = env_usize("TASK_RT_GRAIN_K") {
            log::info!(target: "task_rt::config", "grain_k override={v}");
            cfg.grain_k = v.max(1);
        }
        if let Some(v) = env_usize("TASK_RT_STACK_MB") {
            log::info!(target: "task_rt::config", "stack_size override={v}MiB");
            cfg.stack_size = v.max(1) * 1024 * 1024;
        }
        if let Ok(v) = env::var("TASK_RT_IDLE_METRICS") {
            cfg.idle_metrics = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }

    /// Total number of heaps in the multi-queue: `heap_c * workers`.
    pub fn heap_count(&self) -> usize {
        self.heap_c * self.workers.max(1)
    }

    /// Number of grains a `new_multi` split produces: `grain_k * workers`.
    pub fn grains_per_split(&self) -> usize {
        self.grain_k * self.workers.max(1)
    }

    /// Arrival-tree pool size: `(grains_per_split)^arrivers_p + 1`.
    pub fn arriver_pool_size(&self) -> usize {
        (self.grains_per_split() as u64).pow(self.arrivers_p) as usize + 1
    }

    /// Reduction-tree pool size, derived from the arriver pool size and `reducers_frac`.
    pub fn reducer_pool_size(&self) -> usize {
        ((self.arriver_pool_size() as f64) * self.reducers_frac).ceil() as usize
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}
