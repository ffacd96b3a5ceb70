//! Pool ordering and barrier behaviour.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use roost::pool::{thread_index, Pool, WorkClass};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Log, event: &str) {
    log.lock().push(event.to_owned());
}

fn position(events: &[String], needle: &str) -> usize {
    events
        .iter()
        .position(|e| e == needle)
        .unwrap_or_else(|| panic!("event {needle:?} missing from {events:?}"))
}

#[test]
fn same_class_items_run_in_submission_order() {
    let (pool, mut completions) = Pool::new(4);
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..50u32 {
        let order = order.clone();
        pool.queue_ordered(1, 9, move || order.lock().push(i), |_| {});
    }
    completions.drain_until_idle();
    let order = order.lock();
    assert_eq!(*order, (0..50).collect::<Vec<_>>());
    pool.close();
}

#[test]
fn ordered_items_land_on_a_deterministic_worker() {
    let (pool, mut completions) = Pool::new(4);
    let workers = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..8 {
        let workers = workers.clone();
        pool.queue_ordered(2, 7, move || workers.lock().push(thread_index()), |_| {});
    }
    completions.drain_until_idle();
    // cookie 7 on 4 workers resolves to worker 3, every time
    assert!(workers.lock().iter().all(|w| *w == Some(3)));
    pool.close();
}

#[test]
fn barrier_separates_eras() {
    // ORD1, ORD1, BAR, ORD1, UNORD against an idle pool of four workers,
    // with every ordered item mapped to worker 0.
    let (pool, mut completions) = Pool::new(4);
    let work_log = log();
    let after_log = log();

    let w = work_log.clone();
    let a = after_log.clone();
    pool.queue_work(
        WorkClass::Ordered(1),
        0,
        move || record(&w, "work:a"),
        move |_| record(&a, "after:a"),
    );
    let w = work_log.clone();
    let a = after_log.clone();
    pool.queue_work(
        WorkClass::Ordered(1),
        0,
        move || record(&w, "work:b"),
        move |_| record(&a, "after:b"),
    );
    let a = after_log.clone();
    pool.queue_barrier(Some(Box::new(move || record(&a, "after:bar"))));
    let w = work_log.clone();
    let a = after_log.clone();
    pool.queue_work(
        WorkClass::Ordered(1),
        0,
        move || record(&w, "work:c"),
        move |_| record(&a, "after:c"),
    );
    let w = work_log.clone();
    let a = after_log.clone();
    pool.queue_work(
        WorkClass::Unordered,
        1,
        move || record(&w, "work:unord"),
        move |_| record(&a, "after:unord"),
    );

    completions.drain_until_idle();
    while !after_log.lock().iter().any(|e| e == "after:bar") {
        completions.run_pending_blocking();
    }

    let works = work_log.lock().clone();
    let afters = after_log.lock().clone();

    // the first two ordered items complete in order on worker 0
    assert!(position(&works, "work:a") < position(&works, "work:b"));
    assert!(position(&works, "work:b") < position(&works, "work:c"));
    assert!(works.iter().any(|e| e == "work:unord"));

    // completion order: both pre-barrier items, then the barrier, then the
    // item from the next era
    assert!(position(&afters, "after:a") < position(&afters, "after:b"));
    assert!(position(&afters, "after:b") < position(&afters, "after:bar"));
    assert!(position(&afters, "after:bar") < position(&afters, "after:c"));

    pool.close();
}

#[test]
fn class_switch_is_fenced_by_construction() {
    let (pool, mut completions) = Pool::new(2);
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4u32 {
        let order = order.clone();
        pool.queue_ordered(1, 0, move || order.lock().push(("one", i)), |_| {});
    }
    for i in 0..4u32 {
        let order = order.clone();
        pool.queue_ordered(2, 0, move || order.lock().push(("two", i)), |_| {});
    }
    completions.drain_until_idle();
    let order = order.lock();
    assert_eq!(order.len(), 8);
    // the interposed barrier keeps class one strictly before class two
    assert_eq!(order[..4].iter().map(|(_, i)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert!(order[..4].iter().all(|(c, _)| *c == "one"));
    assert!(order[4..].iter().all(|(c, _)| *c == "two"));
    pool.close();
}

#[test]
fn mixed_load_all_completes() {
    let (pool, mut completions) = Pool::new(4);
    let done = Arc::new(AtomicU32::new(0));
    for i in 0..100u32 {
        let d = done.clone();
        pool.queue_unordered(i, || {}, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let d = done.clone();
        pool.queue_ordered(5, 5, || {}, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
    }
    completions.drain_until_idle();
    assert_eq!(done.load(Ordering::SeqCst), 200);
    assert_eq!(pool.active(), 0);
    pool.close();
}

#[test]
fn pending_barrier_blocks_shutdown_until_workers_drain() {
    let (pool, mut completions) = Pool::new(2);
    pool.queue_ordered(1, 0, || std::thread::sleep(Duration::from_millis(80)), |_| {});
    pool.queue_barrier(None);
    // give the planner a moment to dispatch and park on the barrier
    std::thread::sleep(Duration::from_millis(10));
    let started = Instant::now();
    pool.close();
    assert!(started.elapsed() >= Duration::from_millis(40));
    completions.drain_until_idle();
}

#[test]
fn completions_fire_in_fifo_order_within_one_class() {
    let (pool, mut completions) = Pool::new(4);
    let afters = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20u32 {
        let afters = afters.clone();
        pool.queue_ordered(3, 1, move || i, move |v| afters.lock().push(v));
    }
    completions.drain_until_idle();
    assert_eq!(*afters.lock(), (0..20).collect::<Vec<_>>());
    pool.close();
}
