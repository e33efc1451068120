//! Error types returned by the scheduler's resource-management paths.
//!
//! Failures inside a task body never produce a `TaskError`; they are caught at the
//! task_wrapper boundary and stored on the task itself (see [`crate::task::Task::exception`]).
//! `TaskError` is reserved for the scheduler failing to accept or service a request.

use thiserror::Error;

/// Errors produced by the public scheduler API.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Every heap sampled by `MultiQueue::insert` during its retry budget was full.
    #[error("multi-queue heap full after {attempts} insert attempts")]
    HeapFull { attempts: u32 },

    /// The arrival-tree (or reduction-tree) pool had no free slot left.
    #[error("synctree pool exhausted (requested {kind})")]
    PoolExhausted { kind: &'static str },

    /// `spawn_multi` walked fewer linked grain tasks than `new_multi` produced.
    #[error("grain chain too short: expected {expected} tasks, found {found}")]
    ChainTooShort { expected: usize, found: usize },

    /// A task handle was used after the task had already been detached or consumed.
    #[error("task handle is detached or already synced")]
    AlreadyConsumed,

    /// The coroutine stack allocator failed (out of memory, or `mmap`/guard-page setup
    /// failed). Surfaced to `spawn`/`new_multi` callers instead of panicking.
    #[error("failed to allocate task stack: {0}")]
    StackAlloc(#[from] std::io::Error),
}
