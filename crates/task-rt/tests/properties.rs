//! Property tests for the invariants listed in the design doc: no task is lost or run
//! twice, grain reduction always sums to the closed-form total, and a notified condition
//! never leaves a waiter stuck.
//!
//! Each case starts its own small `Runtime` (real OS threads), so case counts are kept
//! low relative to typical `proptest` defaults to keep the suite fast.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use task_rt::{Reducer, Runtime, RuntimeConfig, Value};

fn small_runtime(workers: usize) -> Arc<Runtime> {
    let mut cfg = RuntimeConfig::default();
    cfg.workers = workers;
    Runtime::start(cfg)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Invariant 1: no duplication, no loss — every spawned task is synced exactly once
    /// and returns exactly the value it was given.
    #[test]
    fn no_task_is_lost_or_duplicated(n in 1u32..200, workers in 1usize..5) {
        let runtime = small_runtime(workers);
        let tasks: Vec<_> = (0..n)
            .map(|i| runtime.spawn(move || Box::new(i) as Value, false, false).unwrap())
            .collect();
        for (i, task) in tasks.iter().enumerate() {
            let value = runtime.sync(task).expect("every non-detached task yields a value exactly once");
            prop_assert_eq!(*value.downcast_ref::<u32>().unwrap(), i as u32);
        }
    }

    /// Invariant 4 (commutative/associative case): grain reduction always sums to the
    /// closed-form total, regardless of worker count or grain granularity.
    #[test]
    fn grain_reduction_matches_closed_form_sum(count in 0usize..5000, workers in 1usize..4, grain_k in 1usize..6) {
        let mut cfg = RuntimeConfig::default();
        cfg.workers = workers;
        cfg.grain_k = grain_k;
        let runtime = Runtime::start(cfg);

        let reducer: Arc<Reducer> = Arc::new(|a, b| {
            let a = *a.downcast::<u64>().unwrap();
            let b = *b.downcast::<u64>().unwrap();
            Box::new(a + b)
        });
        let family = runtime
            .new_multi(
                count,
                |start, end| {
                    let partial: u64 = (start..end).map(|i| i as u64).sum();
                    Box::new(partial)
                },
                Some(reducer),
            )
            .unwrap();
        let head = runtime.spawn_multi(&family).unwrap();
        let value = runtime.sync(&head).expect("grain head always yields the reduced value");
        let got = *value.downcast_ref::<u64>().unwrap();
        prop_assert_eq!(got, (0..count as u64).sum::<u64>());
    }

    /// Invariant 5: condition latch monotonicity — the set of tasks that suspended in
    /// `wait` before `notify` is exactly the set re-enqueued by it; none are lost.
    #[test]
    fn notify_wakes_exactly_the_tasks_that_waited(n in 0u32..30) {
        let runtime = small_runtime(3);
        let cond = runtime.condition_new();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let waiters: Vec<_> = (0..n)
            .map(|id| {
                let cond = cond.clone();
                let sink = Arc::clone(&sink);
                let runtime = Arc::clone(&runtime);
                runtime
                    .spawn(
                        move || {
                            runtime.wait(&cond);
                            sink.lock().unwrap().push(id);
                            Box::new(()) as Value
                        },
                        false,
                        false,
                    )
                    .unwrap()
            })
            .collect();

        // Give every waiter a chance to actually reach `wait` before notifying, so this
        // exercises the "suspended before notify" half of the invariant rather than the
        // (trivially true) "arrived after" half.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let notifier = {
            let cond = cond.clone();
            let runtime = Arc::clone(&runtime);
            runtime
                .spawn(
                    move || {
                        runtime.notify(&cond);
                        Box::new(()) as Value
                    },
                    false,
                    false,
                )
                .unwrap()
        };
        runtime.sync(&notifier);
        for w in &waiters {
            runtime.sync(w);
        }

        let mut ids = sink.lock().unwrap().clone();
        ids.sort_unstable();
        let expected: Vec<u32> = (0..n).collect();
        prop_assert_eq!(ids, expected);
    }
}
