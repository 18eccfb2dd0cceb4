//! Integration tests for the work-stealing scheduler

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use weft::{PanicHandler, Scheduler, TaskMode};

/// Poll `condition` until it holds or `deadline` elapses
fn wait_for(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn test_two_threads_one_core() {
    let scheduler = Scheduler::with_pool_sizes(1, 1).expect("valid sizes");
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let counter = counter.clone();
        scheduler.dispatch(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(wait_for(Duration::from_secs(5), || {
        counter.load(Ordering::Relaxed) == 1000
    }));
    assert_eq!(scheduler.created_workers(), 1);
    scheduler.close();
}

#[test]
fn test_blocking_tasks_expand_the_pool() {
    let scheduler = Scheduler::with_pool_sizes(2, 16).expect("valid sizes");
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let completed = completed.clone();
        scheduler.dispatch_with(
            move || {
                thread::sleep(Duration::from_millis(200));
                completed.fetch_add(1, Ordering::Relaxed);
            },
            TaskMode::ProbablyBlocking,
            false,
        );
    }
    for _ in 0..10 {
        let completed = completed.clone();
        scheduler.dispatch(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    // With the pool expanding past the blocked workers, all 20 tasks finish
    // in roughly one sleep period, not ten.
    assert!(wait_for(Duration::from_secs(2), || {
        completed.load(Ordering::Relaxed) == 20
    }));
    assert!(
        scheduler.created_workers() >= 3,
        "pool did not grow past its blocked workers: {scheduler}"
    );
    scheduler.close();
}

#[test]
fn test_pool_capped_at_max_still_runs_blocking_tasks() {
    let scheduler = Scheduler::with_pool_sizes(1, 1).expect("valid sizes");
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let completed = completed.clone();
        scheduler.dispatch_with(
            move || {
                thread::sleep(Duration::from_millis(30));
                completed.fetch_add(1, Ordering::Relaxed);
            },
            TaskMode::ProbablyBlocking,
            false,
        );
    }

    assert!(wait_for(Duration::from_secs(5), || {
        completed.load(Ordering::Relaxed) == 3
    }));
    assert_eq!(scheduler.created_workers(), 1);
    scheduler.close();
}

#[test]
fn test_worker_dispatch_is_semi_fifo() {
    let scheduler = Arc::new(Scheduler::with_pool_sizes(1, 1).expect("valid sizes"));
    let order = Arc::new(Mutex::new(Vec::new()));

    let inner_scheduler = scheduler.clone();
    let inner_order = order.clone();
    scheduler.dispatch(move || {
        let order = inner_order.clone();
        inner_scheduler.dispatch(move || order.lock().push("a"));
        let order = inner_order.clone();
        inner_scheduler.dispatch(move || order.lock().push("b"));
    });

    assert!(wait_for(Duration::from_secs(2), || order.lock().len() == 2));
    // The later dispatch took the head slot and runs first.
    assert_eq!(*order.lock(), vec!["b", "a"]);
    scheduler.close();
}

#[test]
fn test_worker_dispatch_fair_is_fifo() {
    let scheduler = Arc::new(Scheduler::with_pool_sizes(1, 1).expect("valid sizes"));
    let order = Arc::new(Mutex::new(Vec::new()));

    let inner_scheduler = scheduler.clone();
    let inner_order = order.clone();
    scheduler.dispatch(move || {
        let order = inner_order.clone();
        inner_scheduler.dispatch_with(move || order.lock().push("a"), TaskMode::NonBlocking, true);
        let order = inner_order.clone();
        inner_scheduler.dispatch_with(move || order.lock().push("b"), TaskMode::NonBlocking, true);
    });

    assert!(wait_for(Duration::from_secs(2), || order.lock().len() == 2));
    assert_eq!(*order.lock(), vec!["a", "b"]);
    scheduler.close();
}

#[test]
fn test_global_queue_polled_before_local_queue() {
    let scheduler = Arc::new(Scheduler::with_pool_sizes(1, 1).expect("valid sizes"));
    let order = Arc::new(Mutex::new(Vec::new()));
    let worker_loaded = Arc::new(AtomicBool::new(false));
    let external_submitted = Arc::new(AtomicBool::new(false));

    let inner_scheduler = scheduler.clone();
    let inner_order = order.clone();
    let loaded = worker_loaded.clone();
    let submitted = external_submitted.clone();
    scheduler.dispatch(move || {
        for id in 0..5 {
            let order = inner_order.clone();
            inner_scheduler.dispatch(move || order.lock().push(format!("local-{id}")));
        }
        loaded.store(true, Ordering::Release);
        // Hold the worker until the external task is in the global queue.
        while !submitted.load(Ordering::Acquire) {
            thread::yield_now();
        }
    });

    assert!(wait_for(Duration::from_secs(2), || {
        worker_loaded.load(Ordering::Acquire)
    }));
    let external_order = order.clone();
    scheduler.dispatch(move || external_order.lock().push("external".to_string()));
    external_submitted.store(true, Ordering::Release);

    assert!(wait_for(Duration::from_secs(2), || order.lock().len() == 6));
    // The externally submitted task outranks the loaded local queue.
    assert_eq!(order.lock()[0], "external");
    scheduler.close();
}

#[test]
fn test_every_task_runs_exactly_once_under_contention() {
    let scheduler = Arc::new(Scheduler::with_pool_sizes(4, 64).expect("valid sizes"));
    let counter = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..2500 {
                    let counter = counter.clone();
                    scheduler.dispatch(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counter.load(Ordering::Relaxed) == 10_000
    }));
    assert_eq!(counter.load(Ordering::Relaxed), 10_000);
    scheduler.close();
}

struct CountingPanicHandler {
    panics: AtomicUsize,
}

impl PanicHandler for CountingPanicHandler {
    fn handle(&self, _payload: Box<dyn std::any::Any + Send>) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_task_panics_are_contained() {
    let handler = Arc::new(CountingPanicHandler {
        panics: AtomicUsize::new(0),
    });
    let scheduler =
        Scheduler::with_panic_handler(2, 8, handler.clone()).expect("valid sizes");
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let completed = completed.clone();
        scheduler.dispatch(move || {
            if i % 2 == 0 {
                panic!("task {i} failed");
            }
            completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(wait_for(Duration::from_secs(5), || {
        completed.load(Ordering::Relaxed) == 5 && handler.panics.load(Ordering::Relaxed) == 5
    }));

    // Workers survive the panics and keep executing.
    let completed_after = completed.clone();
    scheduler.dispatch(move || {
        completed_after.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wait_for(Duration::from_secs(2), || {
        completed.load(Ordering::Relaxed) == 6
    }));
    scheduler.close();
}

#[test]
fn test_close_finishes_every_worker() {
    let scheduler = Scheduler::with_pool_sizes(2, 8).expect("valid sizes");
    for _ in 0..100 {
        scheduler.dispatch(|| {});
    }
    scheduler.close();

    let report = scheduler.to_string();
    assert!(report.contains("CPU workers = 0"), "{report}");
    assert!(report.contains("blocking workers = 0"), "{report}");
    assert!(report.contains("parked workers = 0"), "{report}");
    assert!(report.contains("retired workers = 0"), "{report}");
    assert!(
        report.contains(&format!(
            "finished workers = {}",
            scheduler.created_workers()
        )),
        "{report}"
    );
}

#[test]
fn test_close_twice_behaves_as_once() {
    let scheduler = Scheduler::with_pool_sizes(2, 4).expect("valid sizes");
    let counter = Arc::new(AtomicUsize::new(0));

    let task_counter = counter.clone();
    scheduler.dispatch(move || {
        task_counter.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wait_for(Duration::from_secs(2), || {
        counter.load(Ordering::Relaxed) == 1
    }));

    scheduler.close();
    scheduler.close();
    assert!(scheduler.is_terminated());
}

#[test]
fn test_mixed_modes_drain_completely() {
    let scheduler = Scheduler::with_pool_sizes(2, 16).expect("valid sizes");
    let counter = Arc::new(AtomicUsize::new(0));

    for i in 0..200 {
        let counter = counter.clone();
        let mode = if i % 10 == 0 {
            TaskMode::ProbablyBlocking
        } else {
            TaskMode::NonBlocking
        };
        scheduler.dispatch_with(
            move || {
                if mode == TaskMode::ProbablyBlocking {
                    thread::sleep(Duration::from_millis(1));
                }
                counter.fetch_add(1, Ordering::Relaxed);
            },
            mode,
            false,
        );
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counter.load(Ordering::Relaxed) == 200
    }));
    scheduler.close();
}
