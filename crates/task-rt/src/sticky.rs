//! Per-worker sticky FIFO queues. A task with the `STICKY` flag runs only on the worker
//! that first dispatches it; once bound, every subsequent re-enqueue of that task lands
//! here instead of in the multi-queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::Task;

pub struct StickyQueues {
    queues: Vec<Mutex<VecDeque<Arc<Task>>>>,
}

impl StickyQueues {
    pub fn new(workers: usize) -> Self {
        StickyQueues {
            queues: (0..workers.max(1)).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    pub fn push(&self, tid: usize, task: Arc<Task>) {
        self.queues[tid].lock().push_back(task);
    }

    pub fn pop(&self, tid: usize) -> Option<Arc<Task>> {
        self.queues[tid].lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Value;

    #[test]
    fn fifo_order_preserved_per_worker() {
        let q = StickyQueues::new(2);
        let t1 = Task::new_detached(Box::new(|| Box::new(1i32) as Value), 64 * 1024).unwrap();
        let t2 = Task::new_detached(Box::new(|| Box::new(2i32) as Value), 64 * 1024).unwrap();
        q.push(0, Arc::clone(&t1));
        q.push(0, Arc::clone(&t2));
        assert_eq!(q.pop(0).unwrap().id(), t1.id());
        assert_eq!(q.pop(0).unwrap().id(), t2.id());
        assert!(q.pop(0).is_none());
        assert!(q.pop(1).is_none());
    }
}
