//! The multi-queue: `heap_c * W` randomized d-ary min-heaps, giving two-choice
//! load-balanced priority scheduling without a single central lock.
//!
//! Each heap publishes its current root priority in a lock-free `AtomicU16` so deletemin
//! can sample many heaps cheaply before paying for a lock. The published value is
//! advisory: a racing insert can leave it briefly stale relative to the true root, and
//! deletemin re-validates under the heap's lock before trusting it (see DESIGN.md).

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::error::TaskError;
use crate::task::{Task, PRIO_EMPTY};
use crate::worker_local::WorkerLocal;

struct HeapInner {
    tasks: Vec<Arc<Task>>,
    capacity: usize,
    d: usize,
}

impl HeapInner {
    fn prio_at(&self, i: usize) -> u16 {
        self.tasks[i].prio.load(Ordering::Relaxed)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / self.d;
            if self.prio_at(i) < self.prio_at(parent) {
                self.tasks.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let first_child = i * self.d + 1;
            if first_child >= self.tasks.len() {
                break;
            }
            let last_child = (first_child + self.d).min(self.tasks.len());
            let mut best = first_child;
            for c in (first_child + 1)..last_child {
                if self.prio_at(c) < self.prio_at(best) {
                    best = c;
                }
            }
            if self.prio_at(best) < self.prio_at(i) {
                self.tasks.swap(i, best);
                i = best;
            } else {
                break;
            }
        }
    }

    fn root_prio(&self) -> u16 {
        self.tasks.first().map(|t| t.prio.load(Ordering::Relaxed)).unwrap_or(PRIO_EMPTY)
    }
}

/// One of the `heap_c * W` heaps backing the multi-queue.
struct Heap {
    inner: Mutex<HeapInner>,
    advisory_prio: CachePadded<AtomicU16>,
}

impl Heap {
    fn new(capacity: usize, d: usize) -> Self {
        Heap {
            inner: Mutex::new(HeapInner { tasks: Vec::with_capacity(capacity), capacity, d }),
            advisory_prio: CachePadded::new(AtomicU16::new(PRIO_EMPTY)),
        }
    }

    fn advisory(&self) -> u16 {
        self.advisory_prio.load(Ordering::Relaxed)
    }

    fn try_insert(&self, task: Arc<Task>) -> Option<Result<(), ()>> {
        let mut guard = match self.inner.try_lock() {
            Some(g) => g,
            None => return None,
        };
        if guard.tasks.len() >= guard.capacity {
            return Some(Err(()));
        }
        guard.tasks.push(task);
        let idx = guard.tasks.len() - 1;
        guard.sift_up(idx);
        let new_root = guard.root_prio();
        drop(guard);
        // Best-effort publish; advisory only, so a single attempt is enough.
        let _ = self.advisory_prio.compare_exchange(
            self.advisory_prio.load(Ordering::Relaxed),
            new_root,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        Some(Ok(()))
    }

    fn try_delete_min(&self, observed: u16) -> Option<Option<Arc<Task>>> {
        let mut guard = match self.inner.try_lock() {
            Some(g) => g,
            None => return None,
        };
        if guard.root_prio() != observed {
            // Stale advisory read; caller should retry elsewhere.
            return Some(None);
        }
        if guard.tasks.is_empty() {
            return Some(None);
        }
        let last = guard.tasks.len() - 1;
        guard.tasks.swap(0, last);
        let popped = guard.tasks.pop().unwrap();
        if !guard.tasks.is_empty() {
            guard.sift_down(0);
        }
        let new_root = guard.root_prio();
        drop(guard);
        self.advisory_prio.store(new_root, Ordering::Relaxed);
        Some(Some(popped))
    }
}

/// The randomized multi-queue: `heap_c * workers` heaps, two-choice insert and deletemin.
pub struct MultiQueue {
    heaps: Vec<Heap>,
}

impl MultiQueue {
    pub fn new(heap_count: usize, d: usize, capacity: usize) -> Self {
        let heaps = (0..heap_count.max(1)).map(|_| Heap::new(capacity, d)).collect();
        MultiQueue { heaps }
    }

    /// Insert `task` at priority `prio`, spinning across randomly sampled heaps until one
    /// accepts it. Returns `HeapFull` after a bounded number of attempts if every sampled
    /// heap was at capacity (as opposed to merely contended).
    pub fn insert(&self, task: Arc<Task>, prio: u16, local: &mut WorkerLocal) -> Result<(), TaskError> {
        task.prio.store(prio, Ordering::Relaxed);
        let max_attempts = self.heaps.len().max(1) * 8;
        let mut full_rejections = 0u32;
        for attempt in 0..max_attempts {
            let idx = local.uniform(self.heaps.len());
            match self.heaps[idx].try_insert(Arc::clone(&task)) {
                Some(Ok(())) => return Ok(()),
                Some(Err(())) => {
                    full_rejections += 1;
                    if full_rejections as usize >= self.heaps.len() {
                        return Err(TaskError::HeapFull { attempts: attempt + 1 });
                    }
                }
                None => std::hint::spin_loop(),
            }
        }
        Err(TaskError::HeapFull { attempts: max_attempts as u32 })
    }

    /// Sample two heaps, prefer the better-looking one, and try to pop its root. Returns
    /// `None` if every heap looked empty or every attempt lost the lock race.
    pub fn delete_min(&self, local: &mut WorkerLocal) -> Option<Arc<Task>> {
        let attempts = self.heaps.len().max(1).min(64);
        for _ in 0..attempts {
            let a = local.uniform(self.heaps.len());
            let b = local.uniform(self.heaps.len());
            let pa = self.heaps[a].advisory();
            let pb = self.heaps[b].advisory();
            if pa == PRIO_EMPTY && pb == PRIO_EMPTY {
                continue;
            }
            let (idx, observed) = if pa <= pb { (a, pa) } else { (b, pb) };
            match self.heaps[idx].try_delete_min(observed) {
                Some(Some(task)) => return Some(task),
                Some(None) => continue,
                None => std::hint::spin_loop(),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::any::Any;

    fn noop_task(prio: u16) -> Arc<Task> {
        let t = Task::new_detached(Box::new(|| Box::new(()) as Box<dyn Any + Send>), 1024 * 64).unwrap();
        t.prio.store(prio, Ordering::Relaxed);
        t
    }

    #[test]
    fn single_heap_deletemin_is_globally_sorted() {
        // With exactly one heap there is no load-balancing choice to make, so deletemin
        // degenerates to plain heap-sort order.
        let mq = MultiQueue::new(1, 8, 129);
        let mut local = WorkerLocal::new(0, 42);
        for p in [5u16, 1, 9, 3, 7, 2, 8, 0, 6, 4] {
            mq.insert(noop_task(p), p, &mut local).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(t) = mq.delete_min(&mut local) {
            seen.push(t.prio.load(Ordering::Relaxed));
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn multi_heap_deletemin_drains_every_task() {
        let mq = MultiQueue::new(4, 8, 129);
        let mut local = WorkerLocal::new(0, 7);
        let n = 40;
        for p in 0..n {
            mq.insert(noop_task(p as u16), p as u16, &mut local).unwrap();
        }
        let mut count = 0;
        while mq.delete_min(&mut local).is_some() {
            count += 1;
        }
        assert_eq!(count, n);
    }

    #[test]
    fn full_heap_reports_error() {
        let mq = MultiQueue::new(1, 8, 2);
        let mut local = WorkerLocal::new(0, 1);
        mq.insert(noop_task(1), 1, &mut local).unwrap();
        mq.insert(noop_task(2), 2, &mut local).unwrap();
        let err = mq.insert(noop_task(3), 3, &mut local);
        assert!(matches!(err, Err(TaskError::HeapFull { .. })));
    }
}
