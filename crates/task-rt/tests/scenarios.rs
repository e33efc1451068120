//! End-to-end scenarios exercising the scheduler through its public API: independent
//! tasks, grain reduction, condition wait/notify, detached tasks, resource exhaustion,
//! and (in a subprocess) the fatal guard-page trap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_rt::{Reducer, Runtime, RuntimeConfig, TaskError, Value};

fn config(workers: usize) -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.workers = workers;
    cfg
}

/// S1: many independent tasks, synced in submission order, each returns its own index.
#[test]
fn s1_many_independent_tasks_complete_and_match_their_index() {
    let runtime = Runtime::start(config(4));
    let n = 1000u32;
    let tasks: Vec<_> = (0..n)
        .map(|i| runtime.spawn(move || Box::new(i) as Value, false, false).unwrap())
        .collect();

    for (i, task) in tasks.iter().enumerate() {
        let value = runtime.sync(task).expect("non-detached task yields a value");
        assert_eq!(*value.downcast_ref::<u32>().unwrap(), i as u32);
    }
}

/// S2: a `count`-element range split into grains and summed via tree reduction.
#[test]
fn s2_grain_reduction_sums_the_whole_range() {
    let mut cfg = config(2);
    cfg.grain_k = 4;
    let runtime = Runtime::start(cfg);

    let count = 100usize;
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

    let value = runtime.sync(&head).expect("grain head yields the reduced value");
    let got = *value.downcast_ref::<u64>().unwrap();
    assert_eq!(got, (0..count as u64).sum::<u64>());
}

/// S3: five tasks wait on a condition, a sixth notifies it; every waiter's id lands in
/// the shared sink exactly once.
#[test]
fn s3_condition_wakes_every_waiter_exactly_once() {
    let runtime = Runtime::start(config(3));
    let cond = runtime.condition_new();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let waiters: Vec<_> = (0..5u32)
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

    let ids = sink.lock().unwrap().clone();
    assert_eq!(ids.len(), 5);
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
}

/// S4: a detached task's `sync` returns `None` immediately, but the task still runs.
#[test]
fn s4_detached_task_sync_returns_none_but_task_still_runs() {
    let runtime = Runtime::start(config(2));
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_task = Arc::clone(&ran);

    let task = runtime
        .spawn(
            move || {
                ran_in_task.store(true, Ordering::SeqCst);
                Box::new(()) as Value
            },
            false,
            true,
        )
        .unwrap();

    assert!(runtime.sync(&task).is_none());

    for _ in 0..200 {
        if ran.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(ran.load(Ordering::SeqCst), "detached task should still run to completion");
}

/// S6: occupy the scheduler's sole worker with a long-running task and overflow the
/// (deliberately tiny) multi-queue; expect a resource-exhaustion error, not a panic or
/// a dropped/duplicated task.
#[test]
fn s6_full_heap_reports_resource_exhaustion() {
    let mut cfg = config(1);
    cfg.heap_c = 1;
    cfg.tasks_per_heap = 2;
    let runtime = Runtime::start(cfg);

    let _hog = runtime
        .spawn(
            || {
                std::thread::sleep(Duration::from_millis(200));
                Box::new(()) as Value
            },
            false,
            true,
        )
        .unwrap();
    // Give the sole worker a chance to dequeue and start the hog before we fill the
    // now-empty heap behind it.
    std::thread::sleep(Duration::from_millis(20));

    let results: Vec<_> = (0..6).map(|_| runtime.spawn(|| Box::new(()) as Value, false, true)).collect();
    assert!(
        results.iter().any(|r| matches!(r, Err(TaskError::HeapFull { .. }))),
        "expected at least one HeapFull while the sole worker was occupied"
    );
}

/// S5: a task whose recursion exceeds its stack triggers the coroutine stack's guard
/// page, which is a fatal trap, not a catchable panic — the process aborts. Exercised
/// out-of-process so the trap doesn't take the test harness down with it.
#[test]
#[ignore = "spawns a subprocess that deliberately overflows its stack and aborts"]
fn s5_stack_overflow_traps_the_process() {
    let exe = std::env::current_exe().expect("test binary path");
    let status = std::process::Command::new(exe)
        .args(["s5_child_overflow", "--exact", "--ignored", "--nocapture"])
        .env("TASK_RT_S5_CHILD", "1")
        .status()
        .expect("failed to spawn child process");
    assert!(!status.success(), "child process should have aborted on stack overflow, not exited cleanly");
}

#[test]
#[ignore = "only meant to be run directly by s5_stack_overflow_traps_the_process"]
fn s5_child_overflow() {
    if std::env::var("TASK_RT_S5_CHILD").is_err() {
        return;
    }
    let mut cfg = config(1);
    cfg.stack_size = 64 * 1024;
    let runtime = Runtime::start(cfg);

    fn blow_the_stack(depth: u64) -> u64 {
        let guard = [0u8; 4096];
        std::hint::black_box(&guard);
        if depth == 0 {
            0
        } else {
            1 + blow_the_stack(depth - 1)
        }
    }

    let task = runtime.spawn(|| Box::new(blow_the_stack(10_000_000)) as Value, false, false).unwrap();
    runtime.sync(&task);
}
