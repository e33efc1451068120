//! A one-shot, latching condition: a gate rather than a recurring semaphore. Once
//! notified it stays notified; every `wait` after that point returns immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::Runtime;
use crate::scheduler;
use crate::task::Task;

struct Inner {
    notified: AtomicBool,
    waiters: Mutex<VecDeque<Arc<Task>>>,
}

/// A condition variable scoped to one [`crate::runtime::Runtime`]. Cloning shares the
/// same underlying latch and waiter queue.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<Inner>,
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            inner: Arc::new(Inner { notified: AtomicBool::new(false), waiters: Mutex::new(VecDeque::new()) }),
        }
    }

    /// True once `notify` has been called; never resets.
    pub fn is_notified(&self) -> bool {
        self.inner.notified.load(Ordering::Acquire)
    }

    /// Suspend `current` until the condition is notified. Fast path returns immediately
    /// if the latch is already set; otherwise the caller's task is parked on the waitq
    /// and the scheduler yields it without requeuing (the eventual `notify` re-enqueues
    /// it). Must be called from inside a running task's fiber.
    pub(crate) fn wait(&self, runtime: &Runtime, current: &Arc<Task>) {
        if self.inner.notified.load(Ordering::Acquire) {
            return;
        }
        {
            let mut waiters = self.inner.waiters.lock();
            // Double-checked: notify() takes this same lock before flipping the flag, so
            // if we observe not-notified here we are guaranteed to be enqueued before it.
            if self.inner.notified.load(Ordering::Acquire) {
                return;
            }
            waiters.push_back(Arc::clone(current));
        }
        scheduler::yield_now(runtime, current, false);
    }

    /// Latch the condition and re-enqueue every waiter queued so far, in FIFO order.
    pub(crate) fn notify(&self, runtime: &Runtime) {
        let drained: VecDeque<Arc<Task>> = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.notified.store(true, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        for task in drained {
            scheduler::enqueue_task(runtime, task);
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::new()
    }
}
