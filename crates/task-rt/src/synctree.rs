//! Arrival and reduction trees: pre-allocated synchronization structures that let a
//! family of `n` sibling grains detect "I am the last one done" and fold their results
//! together with O(log n) contention instead of all hammering one shared counter.
//!
//! Both trees are addressed with the classic iterative segment-tree indexing: leaves
//! live at conceptual positions `[n, 2n)`, every other index `p` in `[1, n)` is an
//! internal node whose children are `2p` and `2p+1`. Each internal node gets exactly two
//! arrivals over the tree's lifetime — one from each child subtree's own "last arriver"
//! event — regardless of how many leaves that subtree covers, which is what keeps the
//! per-node counter a simple two-state latch instead of needing to know subtree size.

use std::sync::atomic::{AtomicU32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TaskError;
use crate::task::Value;

/// A pairwise-reduction step. Combines a "left" and "right" subtree result, in tree
/// order, so the result is reproducible even for non-associative reducers.
pub type Reducer = dyn Fn(Value, Value) -> Value + Send + Sync;

struct TreeShape {
    n: usize,
}

impl TreeShape {
    /// Ascend from `leaf_idx`'s position to the root, yielding `(parent, side)` for each
    /// internal node crossed, where `side` is 0 if we arrived from the left (even) child
    /// and 1 if from the right (odd) child.
    fn ascend(&self, leaf_idx: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut pos = self.n + leaf_idx;
        std::iter::from_fn(move || {
            if pos <= 1 {
                return None;
            }
            let parent = pos / 2;
            let side = pos % 2;
            pos = parent;
            Some((parent, side))
        })
    }
}

struct ArrivalData {
    shape: TreeShape,
    counters: Vec<AtomicU32>,
}

impl ArrivalData {
    fn new(n: usize) -> Self {
        let counters = (0..n.max(1)).map(|_| AtomicU32::new(0)).collect();
        ArrivalData { shape: TreeShape { n }, counters }
    }

    fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Returns `true` iff this call is the one that observes both children of the root
    /// having arrived, i.e. the caller is the last of the `n` leaves to finish.
    fn last_arriver(&self, leaf_idx: usize) -> bool {
        if self.shape.n <= 1 {
            return true;
        }
        for (parent, _side) in self.shape.ascend(leaf_idx) {
            let prev = self.counters[parent].fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                return false;
            }
            if parent == 1 {
                return true;
            }
        }
        true
    }
}

struct ReductionData {
    arr: ArrivalData,
    // One pending-value slot per side, per internal node.
    slots: Vec<(Mutex<Option<Value>>, Mutex<Option<Value>>)>,
}

impl ReductionData {
    fn new(n: usize) -> Self {
        let arr = ArrivalData::new(n);
        let slots = (0..n.max(1)).map(|_| (Mutex::new(None), Mutex::new(None))).collect();
        ReductionData { arr, slots }
    }

    fn reset(&self) {
        self.arr.reset();
        for (a, b) in &self.slots {
            *a.lock() = None;
            *b.lock() = None;
        }
    }

    fn slot(&self, node: usize, side: usize) -> &Mutex<Option<Value>> {
        if side == 0 {
            &self.slots[node].0
        } else {
            &self.slots[node].1
        }
    }

    /// Publish `val` up the tree from `leaf_idx`. Returns `Some(root value)` only for the
    /// call that turns out to be the last arriver; every other caller gets `None` once
    /// its value has been handed off to whichever sibling call completes the reduction.
    fn reduce(&self, leaf_idx: usize, val: Value, reducer: &Reducer) -> Option<Value> {
        if self.arr.shape.n <= 1 {
            return Some(val);
        }
        let mut val = val;
        for (parent, side) in self.arr.shape.ascend(leaf_idx) {
            *self.slot(parent, side).lock() = Some(val);
            let prev = self.arr.counters[parent].fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                return None;
            }
            let other = 1 - side;
            let sibling = self
                .slot(parent, other)
                .lock()
                .take()
                .expect("sibling must have published before becoming the last arriver");
            let mine = self.slot(parent, side).lock().take().unwrap();
            let (left, right) = if side == 0 { (mine, sibling) } else { (sibling, mine) };
            val = reducer(left, right);
            if parent == 1 {
                return Some(val);
            }
        }
        Some(val)
    }
}

/// Shared handle to one pooled arrival tree. All grains in a family hold a clone.
#[derive(Clone)]
pub struct ArrivalTreeHandle {
    pool: Arc<SyncTreePool>,
    index: usize,
}

impl ArrivalTreeHandle {
    /// See [`ArrivalData::last_arriver`].
    pub fn last_arriver(&self, leaf_idx: usize) -> bool {
        self.pool.arrivers[self.index].last_arriver(leaf_idx)
    }

    pub(crate) fn free(&self) {
        self.pool.free_arriver(self.index);
    }
}

/// Shared handle to one pooled reduction tree.
#[derive(Clone)]
pub struct ReductionTreeHandle {
    pool: Arc<SyncTreePool>,
    index: usize,
}

impl ReductionTreeHandle {
    pub fn reduce(&self, leaf_idx: usize, val: Value, reducer: &Reducer) -> Option<Value> {
        self.pool.reducers[self.index].reduce(leaf_idx, val, reducer)
    }

    pub(crate) fn free(&self) {
        self.pool.free_reducer(self.index);
    }
}

/// Intrusive lock-free freelist stack over a fixed-size `Vec`: each slot holds its own
/// `next` pointer (as an index, -1 = nil), and a single atomic head drives push/pop via
/// CAS. This is the same encoding the scheduler's index-based arenas use throughout —
/// allocation never touches the global allocator after startup.
struct Freelist {
    next: Vec<AtomicI64>,
    head: AtomicI64,
}

impl Freelist {
    fn new(len: usize) -> Self {
        let next: Vec<AtomicI64> = (0..len)
            .map(|i| AtomicI64::new(if i + 1 < len { i as i64 + 1 } else { -1 }))
            .collect();
        Freelist { next, head: AtomicI64::new(if len > 0 { 0 } else { -1 }) }
    }

    fn alloc(&self) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head < 0 {
                return None;
            }
            let next = self.next[head as usize].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head as usize);
            }
        }
    }

    fn free(&self, idx: usize) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            self.next[idx].store(head, Ordering::Release);
            if self
                .head
                .compare_exchange_weak(head, idx as i64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Pools of pre-allocated arrival and reduction trees, sized once at runtime startup.
pub struct SyncTreePool {
    arrivers: Vec<ArrivalData>,
    arriver_free: Freelist,
    reducers: Vec<ReductionData>,
    reducer_free: Freelist,
}

impl SyncTreePool {
    pub(crate) fn new(grains_per_split: usize, num_arrivers: usize, num_reducers: usize) -> Arc<Self> {
        let arrivers = (0..num_arrivers).map(|_| ArrivalData::new(grains_per_split)).collect();
        let reducers = (0..num_reducers).map(|_| ReductionData::new(grains_per_split)).collect();
        Arc::new(SyncTreePool {
            arrivers,
            arriver_free: Freelist::new(num_arrivers),
            reducers,
            reducer_free: Freelist::new(num_reducers),
        })
    }

    pub(crate) fn alloc_arriver(self: &Arc<Self>) -> Result<ArrivalTreeHandle, TaskError> {
        let index = self
            .arriver_free
            .alloc()
            .ok_or(TaskError::PoolExhausted { kind: "arrival tree" })?;
        self.arrivers[index].reset();
        Ok(ArrivalTreeHandle { pool: Arc::clone(self), index })
    }

    pub(crate) fn alloc_reducer(self: &Arc<Self>) -> Result<ReductionTreeHandle, TaskError> {
        let index = self
            .reducer_free
            .alloc()
            .ok_or(TaskError::PoolExhausted { kind: "reduction tree" })?;
        self.reducers[index].reset();
        Ok(ReductionTreeHandle { pool: Arc::clone(self), index })
    }

    fn free_arriver(&self, index: usize) {
        self.arriver_free.free(index);
    }

    fn free_reducer(&self, index: usize) {
        self.reducer_free.free(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn exactly_one_caller_is_last_arriver() {
        let pool = SyncTreePool::new(8, 4, 4);
        let handle = pool.alloc_arriver().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let last_count = Arc::new(AtomicU32::new(0));
        thread::scope(|s| {
            for i in 0..8 {
                let handle = handle.clone();
                let barrier = Arc::clone(&barrier);
                let last_count = Arc::clone(&last_count);
                s.spawn(move || {
                    barrier.wait();
                    if handle.last_arriver(i) {
                        last_count.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(last_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reduction_sums_all_leaves() {
        let pool = SyncTreePool::new(6, 2, 2);
        let handle = pool.alloc_reducer().unwrap();
        let sum = |a: Value, b: Value| -> Value {
            let a = *a.downcast::<i64>().unwrap();
            let b = *b.downcast::<i64>().unwrap();
            Box::new(a + b)
        };
        let results: Vec<Option<i64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|i| {
                    let handle = handle.clone();
                    s.spawn(move || {
                        handle
                            .reduce(i, Box::new(i as i64), &sum)
                            .map(|v| *v.downcast::<i64>().unwrap())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let roots: Vec<i64> = results.into_iter().flatten().collect();
        assert_eq!(roots, vec![0 + 1 + 2 + 3 + 4 + 5]);
    }

    #[test]
    fn pool_conservation_after_alloc_free_cycle() {
        let pool = SyncTreePool::new(4, 2, 2);
        let a = pool.alloc_arriver().unwrap();
        let b = pool.alloc_arriver().unwrap();
        assert!(pool.alloc_arriver().is_err());
        a.free();
        b.free();
        assert!(pool.alloc_arriver().is_ok());
        assert!(pool.alloc_arriver().is_ok());
    }
}
