//! Cooperative thread pool with ordered, unordered and barrier work classes.
//!
//! # Architecture
//!
//! One planner thread moves submitted items from two producer queues
//! (ordered, unordered) into per-worker inboxes; N worker threads run the
//! work callbacks; completed items are pushed onto an output queue and an
//! async handle wakes the loop thread, which splices the queue and runs the
//! after-work callbacks in FIFO order.
//!
//! Ordered items of one class always land on the worker derived from their
//! cookie, so they execute in submission order. A barrier separates eras:
//! everything submitted before it completes before it resolves, and nothing
//! submitted after it starts until it has resolved.
//!
//! # Planner states
//!
//! ```text
//! signal() &&
//! empty(o) &&                     signal() && exiting
//! empty(u) &&     +-----> NOTHING ----------------> EXITED
//! !exiting        +-------  ^ |
//!                           | | signal()
//!               empty(o) && | | !empty(o) || !empty(u)
//!               empty(u)    | V
//!    !empty(o) && +-----> DRAINING
//!    !empty(u) && +-------  ^ |
//! head(o) != BAR            | | head(o) == BAR
//!            in_flight == 0 | V
//!                         BARRIER --------+ signal()
//!                           ^ |   <-------+
//!                  empty(u) | | !empty(u)
//!                           | V
//!                      DRAINING_UNORD
//! ```
//!
//! Invariant violations here are design-law breaches and abort the process.

use std::cell::Cell;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::clamp_pool_size;
use crate::queue::WorkQueue;
use crate::sm::{Sm, StateDesc, SM_FINAL, SM_INITIAL};
use crate::sm_bits;

/// Worker thread stack size.
const WORKER_STACK_SIZE: usize = 8 << 20;

/// Work class of a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkClass {
    /// No ordering guarantee beyond era boundaries.
    Unordered,
    /// Era separator; carries no work of its own.
    Barrier,
    /// Items of one class run in submission order on a deterministic worker.
    Ordered(u32),
}

impl WorkClass {
    /// Strictly ordered classes participate in `in_flight` accounting.
    fn is_strictly_ordered(self) -> bool {
        matches!(self, WorkClass::Ordered(_))
    }
}

/// A unit of work owned by the pool from submission until its after-work
/// callback has run on the loop thread.
struct WorkItem {
    class: WorkClass,
    worker: u32,
    work: Option<Box<dyn FnOnce() + Send>>,
    after: Option<Box<dyn FnOnce() + Send>>,
}

// Planner states.
const PS_NOTHING: usize = 0;
const PS_DRAINING: usize = 1;
const PS_BARRIER: usize = 2;
const PS_DRAINING_UNORD: usize = 3;
const PS_EXITED: usize = 4;

static PLANNER_STATES: [StateDesc; 5] = [
    StateDesc {
        name: "nothing",
        flags: SM_INITIAL,
        allowed: sm_bits!(PS_DRAINING, PS_EXITED),
    },
    StateDesc {
        name: "draining",
        flags: 0,
        allowed: sm_bits!(PS_DRAINING, PS_NOTHING, PS_BARRIER),
    },
    StateDesc {
        name: "barrier",
        flags: 0,
        allowed: sm_bits!(PS_DRAINING_UNORD, PS_DRAINING, PS_BARRIER),
    },
    StateDesc {
        name: "unord-draining",
        flags: 0,
        allowed: sm_bits!(PS_BARRIER),
    },
    StateDesc {
        name: "exited",
        flags: SM_FINAL,
        allowed: 0,
    },
];

fn sm_true(_: &Sm, _: usize) -> bool {
    true
}

struct PoolState {
    ordered: WorkQueue<WorkItem>,
    unordered: WorkQueue<WorkItem>,
    inboxes: Vec<WorkQueue<WorkItem>>,
    in_flight: u32,
    exiting: bool,
    qos: u32,
    o_prev: WorkClass,
}

struct PoolShared {
    state: Mutex<PoolState>,
    planner_cond: Condvar,
    worker_conds: Vec<Condvar>,
    out: Mutex<WorkQueue<WorkItem>>,
    wake: UnboundedSender<()>,
    nthreads: u32,
    /// Registered (non-barrier) items whose after-work has not yet run.
    active: AtomicU64,
}

/// The pool handle. Cloneable through `Arc`; `close` joins every thread.
pub struct Pool {
    shared: Arc<PoolShared>,
    threads: Mutex<Option<PoolThreads>>,
}

struct PoolThreads {
    planner: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Loop-thread side of the completion hand-off.
pub struct Completions {
    rx: UnboundedReceiver<()>,
    shared: Arc<PoolShared>,
}

thread_local! {
    static WORKER_INDEX: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Index of the current pool worker thread, if any. Carried in TLS for
/// debugging assertions.
pub fn thread_index() -> Option<u32> {
    WORKER_INDEX.with(|c| c.get())
}

fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    process::abort();
}

/// The planner's state invariant, re-checked on every transition.
fn planner_invariant(st: &PoolState, state: usize, prev: usize) -> bool {
    use crate::sm::ergo;
    let o_empty = st.ordered.is_empty();
    let u_empty = st.unordered.is_empty();
    let head_is_bar = st
        .ordered
        .head()
        .map(|w| w.class == WorkClass::Barrier)
        .unwrap_or(false);
    ergo(state == PS_NOTHING, o_empty && u_empty)
        && ergo(
            state == PS_DRAINING,
            ergo(prev == PS_BARRIER, st.in_flight == 0 && u_empty)
                && ergo(prev == PS_NOTHING, !u_empty || !o_empty),
        )
        && ergo(state == PS_EXITED, st.exiting && o_empty && u_empty)
        && ergo(
            state == PS_BARRIER,
            ergo(prev == PS_DRAINING, head_is_bar) && ergo(prev == PS_DRAINING_UNORD, u_empty),
        )
        && ergo(state == PS_DRAINING_UNORD, !u_empty)
}

fn planner_move(sm: &mut Sm, st: &PoolState, next: usize) {
    let prev = sm.state();
    sm.transition(next);
    if !planner_invariant(st, sm.state(), prev) {
        fatal("planner invariant violated");
    }
}

fn qos_pop(st: &mut PoolState) -> WorkItem {
    if st.ordered.is_empty() {
        st.unordered.pop().expect("qos_pop on two empty queues")
    } else if st.unordered.is_empty() {
        st.ordered.pop().expect("qos_pop on two empty queues")
    } else {
        let pick = st.qos;
        st.qos = st.qos.wrapping_add(1);
        if pick % 2 == 1 {
            st.ordered.pop().unwrap()
        } else {
            st.unordered.pop().unwrap()
        }
    }
}

fn planner_main(shared: Arc<PoolShared>) {
    let mut sm = Sm::init(&PLANNER_STATES, PS_NOTHING, sm_true);
    let mut st = shared.state.lock();
    loop {
        match sm.state() {
            PS_NOTHING => {
                while st.ordered.is_empty() && st.unordered.is_empty() && !st.exiting {
                    shared.planner_cond.wait(&mut st);
                }
                let next = if st.exiting { PS_EXITED } else { PS_DRAINING };
                planner_move(&mut sm, &st, next);
            }
            PS_DRAINING => {
                let mut at_barrier = false;
                while !(st.ordered.is_empty() && st.unordered.is_empty()) {
                    planner_move(&mut sm, &st, PS_DRAINING);
                    let head_is_bar = st
                        .ordered
                        .head()
                        .map(|w| w.class == WorkClass::Barrier)
                        .unwrap_or(false);
                    if head_is_bar {
                        planner_move(&mut sm, &st, PS_BARRIER);
                        at_barrier = true;
                        break;
                    }
                    let item = qos_pop(&mut st);
                    if item.class.is_strictly_ordered() {
                        st.in_flight += 1;
                    }
                    let widx = item.worker as usize;
                    st.inboxes[widx].push(item);
                    shared.worker_conds[widx].notify_one();
                }
                if !at_barrier {
                    planner_move(&mut sm, &st, PS_NOTHING);
                }
            }
            PS_BARRIER => {
                if !st.unordered.is_empty() {
                    planner_move(&mut sm, &st, PS_DRAINING_UNORD);
                    continue;
                }
                if st.in_flight == 0 {
                    let bar = st.ordered.pop().expect("barrier head vanished");
                    if bar.class != WorkClass::Barrier {
                        fatal("non-barrier at ordered head in barrier state");
                    }
                    // A barrier with an after-work callback resolves
                    // observably on the loop thread; a bare one is dropped.
                    if bar.after.is_some() {
                        let mut out = shared.out.lock();
                        out.push(bar);
                        drop(out);
                        let _ = shared.wake.send(());
                    }
                    planner_move(&mut sm, &st, PS_DRAINING);
                    continue;
                }
                shared.planner_cond.wait(&mut st);
                planner_move(&mut sm, &st, PS_BARRIER);
            }
            PS_DRAINING_UNORD => {
                while let Some(item) = st.unordered.pop() {
                    let widx = item.worker as usize;
                    st.inboxes[widx].push(item);
                    shared.worker_conds[widx].notify_one();
                }
                planner_move(&mut sm, &st, PS_BARRIER);
            }
            PS_EXITED => {
                if !sm.is_final() {
                    fatal("planner exited in a non-final state");
                }
                return;
            }
            _ => fatal("impossible planner state"),
        }
    }
}

fn worker_main(shared: Arc<PoolShared>, idx: u32) {
    WORKER_INDEX.with(|c| c.set(Some(idx)));
    let mut st = shared.state.lock();
    loop {
        while st.inboxes[idx as usize].is_empty() {
            if st.exiting {
                return;
            }
            shared.worker_conds[idx as usize].wait(&mut st);
        }
        let mut item = st.inboxes[idx as usize].pop().unwrap();
        drop(st);

        let class = item.class;
        if let Some(work) = item.work.take() {
            work();
        }

        {
            let mut out = shared.out.lock();
            out.push(item);
        }
        let _ = shared.wake.send(());

        st = shared.state.lock();
        if class.is_strictly_ordered() {
            if st.in_flight == 0 {
                fatal("in_flight underflow");
            }
            st.in_flight -= 1;
            if st.in_flight == 0 {
                shared.planner_cond.notify_one();
            }
        }
    }
}

impl Pool {
    /// Spawn the planner and `threads` workers (clamped to [1, 1024]).
    ///
    /// Returns the pool plus the loop-thread completion handle.
    pub fn new(threads: u32) -> (Arc<Pool>, Completions) {
        let nthreads = clamp_pool_size(threads);
        let (wake, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                ordered: WorkQueue::new(),
                unordered: WorkQueue::new(),
                inboxes: (0..nthreads).map(|_| WorkQueue::new()).collect(),
                in_flight: 0,
                exiting: false,
                qos: 0,
                o_prev: WorkClass::Barrier,
            }),
            planner_cond: Condvar::new(),
            worker_conds: (0..nthreads).map(|_| Condvar::new()).collect(),
            out: Mutex::new(WorkQueue::new()),
            wake,
            nthreads,
            active: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(nthreads as usize);
        for i in 0..nthreads {
            let s = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("roost-worker-{i}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_main(s, i))
                .expect("spawn worker thread");
            workers.push(handle);
        }
        let s = shared.clone();
        let planner = std::thread::Builder::new()
            .name("roost-planner".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || planner_main(s))
            .expect("spawn planner thread");

        let pool = Arc::new(Pool {
            shared: shared.clone(),
            threads: Mutex::new(Some(PoolThreads { planner, workers })),
        });
        let completions = Completions { rx, shared };
        (pool, completions)
    }

    pub fn thread_count(&self) -> u32 {
        self.shared.nthreads
    }

    /// Submit a non-barrier work item.
    ///
    /// `work` runs on the worker derived from `cookie`; `after` runs on the
    /// loop thread with `work`'s result once the item completes.
    pub fn queue_work<T, W, A>(&self, class: WorkClass, cookie: u32, work: W, after: A)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        let item = self.make_item(class, cookie, work, after);
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.state.lock();
        self.submit_locked(&mut st, item);
    }

    fn make_item<T, W, A>(&self, class: WorkClass, cookie: u32, work: W, after: A) -> WorkItem
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        if class == WorkClass::Barrier {
            fatal("barriers are submitted through queue_barrier");
        }
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        WorkItem {
            class,
            worker: cookie % self.shared.nthreads,
            work: Some(Box::new(move || {
                *slot.lock() = Some(work());
            })),
            after: Some(Box::new(move || {
                let value = slot2.lock().take().expect("work ran before after-work");
                after(value);
            })),
        }
    }

    /// Submit a barrier. `after` (if any) runs on the loop thread once every
    /// earlier item has completed; an empty barrier is a pure
    /// synchronization point.
    pub fn queue_barrier(&self, after: Option<Box<dyn FnOnce() + Send>>) {
        let item = WorkItem {
            class: WorkClass::Barrier,
            worker: 0,
            work: None,
            after,
        };
        let mut st = self.shared.state.lock();
        self.submit_locked(&mut st, item);
    }

    /// Submit ordered work, interposing a barrier when the ordered class
    /// changes so the one-class-at-a-time submission rule holds by
    /// construction.
    pub fn queue_ordered<T, W, A>(&self, class_index: u32, cookie: u32, work: W, after: A)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        let class = WorkClass::Ordered(class_index);
        let item = self.make_item(class, cookie, work, after);
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.state.lock();
        if st.o_prev != WorkClass::Barrier && st.o_prev != class {
            let bar = WorkItem {
                class: WorkClass::Barrier,
                worker: 0,
                work: None,
                after: None,
            };
            self.submit_locked(&mut st, bar);
        }
        self.submit_locked(&mut st, item);
    }

    /// Submit unordered work.
    pub fn queue_unordered<T, W, A>(&self, cookie: u32, work: W, after: A)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        self.queue_work(WorkClass::Unordered, cookie, work, after);
    }

    fn submit_locked(&self, st: &mut PoolState, item: WorkItem) {
        if st.exiting {
            fatal("work submitted to an exiting pool");
        }
        match item.class {
            WorkClass::Unordered => st.unordered.push(item),
            class => {
                // Ordered submissions must arrive contiguously per class;
                // interleaving two classes requires a barrier between them.
                if st.o_prev != WorkClass::Barrier
                    && class != WorkClass::Barrier
                    && st.o_prev != class
                {
                    fatal("ordered class interleaved without a barrier");
                }
                st.o_prev = class;
                st.ordered.push(item);
            }
        }
        self.shared.planner_cond.notify_one();
    }

    /// Number of registered items whose after-work has not yet run.
    pub fn active(&self) -> u64 {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Shut the pool down: signal every thread, join them, and assert that
    /// producers drained before shutdown.
    pub fn close(&self) {
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        {
            let mut st = self.shared.state.lock();
            st.exiting = true;
        }
        self.shared.planner_cond.notify_one();
        if threads.planner.join().is_err() {
            fatal("planner thread panicked");
        }
        {
            let st = self.shared.state.lock();
            if !(st.ordered.is_empty() && st.unordered.is_empty()) {
                fatal("pool closed with undrained producer queues");
            }
        }
        for (i, handle) in threads.workers.into_iter().enumerate() {
            self.shared.worker_conds[i].notify_one();
            if handle.join().is_err() {
                fatal("worker thread panicked");
            }
            let st = self.shared.state.lock();
            if !st.inboxes[i].is_empty() {
                fatal("worker exited with a non-empty inbox");
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl Completions {
    /// Splice the output queue and run every after-work callback, in FIFO
    /// order. Returns how many callbacks ran. No pool locks are held while
    /// the callbacks run.
    pub fn drain(&mut self) -> usize {
        let mut local = {
            let mut out = self.shared.out.lock();
            out.splice()
        };
        let mut count = 0;
        for mut item in local.drain() {
            let registered = item.class != WorkClass::Barrier;
            if let Some(after) = item.after.take() {
                after();
            }
            if registered {
                self.shared.active.fetch_sub(1, Ordering::Relaxed);
            }
            count += 1;
        }
        count
    }

    /// Await the next async wake-up, then drain. Returns `false` once the
    /// pool is gone and nothing is left.
    pub async fn run_pending(&mut self) -> bool {
        match self.rx.recv().await {
            Some(()) => {
                self.drain();
                true
            }
            None => self.drain() > 0,
        }
    }

    /// Blocking variant of [`run_pending`](Self::run_pending) for callers
    /// without a runtime.
    pub fn run_pending_blocking(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(()) => {
                self.drain();
                true
            }
            None => self.drain() > 0,
        }
    }

    /// Block until `pool.active()` reaches zero, draining as completions
    /// arrive.
    pub fn drain_until_idle(&mut self) {
        while self.shared.active.load(Ordering::Relaxed) > 0 {
            if !self.run_pending_blocking() {
                break;
            }
        }
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn clamps_thread_count() {
        let (pool, _c) = Pool::new(0);
        assert_eq!(pool.thread_count(), 1);
        pool.close();
        let (pool, _c) = Pool::new(10_000);
        assert_eq!(pool.thread_count(), 1024);
        pool.close();
    }

    #[test]
    fn work_and_after_work_both_run() {
        let (pool, mut completions) = Pool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();
        pool.queue_unordered(
            7,
            move || {
                c1.fetch_add(1, Ordering::SeqCst);
                41
            },
            move |v| {
                assert_eq!(v, 41);
                c2.fetch_add(1, Ordering::SeqCst);
            },
        );
        completions.drain_until_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
        pool.close();
    }

    #[test]
    fn worker_index_is_visible_from_work() {
        let (pool, mut completions) = Pool::new(4);
        pool.queue_ordered(
            1,
            2,
            || thread_index(),
            |idx| assert_eq!(idx, Some(2)),
        );
        completions.drain_until_idle();
        pool.close();
        assert_eq!(thread_index(), None);
    }

    #[test]
    fn empty_barrier_is_a_sync_point() {
        let (pool, mut completions) = Pool::new(2);
        let done = Arc::new(AtomicU32::new(0));
        let d = done.clone();
        pool.queue_barrier(None);
        pool.queue_barrier(Some(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })));
        // resolved barrier with a callback surfaces through completions
        while done.load(Ordering::SeqCst) == 0 {
            completions.run_pending_blocking();
        }
        pool.close();
    }
}
