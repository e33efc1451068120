//! The stack-switched execution primitive a [`crate::task::Task`] runs on.
//!
//! This wraps `corosensei`'s stackful coroutines, which own an allocated stack with a
//! guard page and provide the save/restore context switch the scheduler core treats as
//! an opaque host capability. A coroutine here has no input or yield payload: `yield_now`
//! is a bare suspend point, and the only data that crosses the boundary is the task's
//! final [`crate::task::Value`] on return.

use std::cell::Cell;
use std::io;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::task::Value;

type Fib = Coroutine<(), (), Value>;

thread_local! {
    /// The yielder for whichever fiber is currently executing on this worker thread, if any.
    /// Set for the duration of the fiber body closure; cleared before it returns. Lets
    /// `yield_now` suspend without the task body needing to thread a `Yielder` through.
    static CURRENT_YIELDER: Cell<*const Yielder<(), ()>> = const { Cell::new(std::ptr::null()) };
}

/// Outcome of resuming a fiber once.
pub enum FiberResume {
    /// The task called `yield_now` and is still runnable.
    Yielded,
    /// The task body returned its final value; the fiber is now done.
    Finished(Value),
}

/// An owned, suspendable stack running a task body.
pub struct Fiber {
    co: Fib,
}

impl Fiber {
    /// Allocate a stack of `stack_size` bytes (rounded up to a page, plus one guard page by
    /// the stack allocator) and prepare `body` to run on it. The body does not start
    /// executing until the first [`Fiber::resume`].
    pub fn new(stack_size: usize, body: impl FnOnce() -> Value + 'static) -> io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let co = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            let prev = CURRENT_YIELDER.with(|c| c.replace(yielder as *const _));
            let result = body();
            CURRENT_YIELDER.with(|c| c.set(prev));
            result
        });
        Ok(Fiber { co })
    }

    /// Resume the fiber until it next suspends or finishes.
    pub fn resume(&mut self) -> FiberResume {
        match self.co.resume(()) {
            CoroutineResult::Yield(()) => FiberResume::Yielded,
            CoroutineResult::Return(value) => FiberResume::Finished(value),
        }
    }

    pub fn done(&self) -> bool {
        self.co.done()
    }
}

/// Suspend the currently running task, returning control to whatever worker resumed it.
/// A no-op if called outside of a fiber body (there is no ambient yielder to suspend on).
pub fn yield_now() {
    let ptr = CURRENT_YIELDER.with(Cell::get);
    if !ptr.is_null() {
        // SAFETY: `ptr` was set by `Fiber::new`'s body closure for the duration of the
        // call to `body()`, and cleared before that closure returns. It is only ever
        // read from the same thread that's currently executing inside that closure, so
        // the pointee outlives every dereference reachable from here.
        unsafe {
            (*ptr).suspend(());
        }
    }
}
