//! The host capabilities this scheduler does not implement itself.
//!
//! Worker 0 doubles as the thread that pumps the embedding application's event loop
//! whenever it finds no runnable task. The scheduler core has no opinion on what that
//! loop does; it only needs *something* to call between idle spins so worker 0 doesn't
//! spin uselessly while I/O the embedder cares about is ready.

/// Hooks the runtime calls from worker 0 when it has nothing else to run.
///
/// The default [`NoopHooks`] never reports pending work, so a `Runtime` built without an
/// explicit host simply spins/backs off like any other worker.
pub trait HostHooks: Send + Sync + 'static {
    /// Run one iteration of the host's event loop. Called opportunistically from worker 0's
    /// idle loop and from `yield`'s resume path. Should not block.
    fn event_loop_run_once(&self) {}

    /// Best-effort hint of whether the host has pending work, used to decide whether to
    /// keep calling `event_loop_run_once` eagerly or fall back to the worker backoff ladder.
    fn has_pending_work(&self) -> bool {
        false
    }
}

/// The default host: no event loop, no pending work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl HostHooks for NoopHooks {}
