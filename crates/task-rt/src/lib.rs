//! A user-space, multi-queue task scheduler: lightweight stack-switched tasks spread
//! across a fixed pool of worker threads, with independent tasks, worker-sticky tasks,
//! and data-parallel "grain" splitting with tree-based reduction.
//!
//! The entry point is [`Runtime::start`]; see [`Runtime`] for the full public API
//! (`spawn`, `new_multi`/`spawn_multi`, `sync`, `yield_task`, `condition_new`/`wait`/`notify`).

mod condition;
mod config;
mod error;
mod fiber;
mod heap;
mod host;
mod runtime;
mod scheduler;
mod sticky;
mod synctree;
mod task;
mod worker_local;

pub use condition::Condition;
pub use config::RuntimeConfig;
pub use error::TaskError;
pub use host::{HostHooks, NoopHooks};
pub use runtime::{GrainFamily, Runtime};
pub use scheduler::current_task;
pub use synctree::Reducer;
pub use task::{SharedValue, Task, TaskState, Value};

#[cfg(feature = "metrics")]
pub use runtime::RuntimeMetrics;
