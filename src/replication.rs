//! Replication hand-off between the intercepting VFS and the consensus log.
//!
//! On the leader, a commit's frames are wrapped into an entry, proposed, and
//! the calling worker suspends on a promise until the entry commits or the
//! proposal is rejected. On every node, committed entries arrive through the
//! consensus sink in index order: the leader resolves its own pending
//! proposal (the frames are already in its WAL), replicas decode the payload
//! and apply it through the VFS. After each commit a barrier is enqueued on
//! the pool so no unordered read observes a torn state across the boundary.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::consensus::{CommitSink, Consensus, ProposeError};
use crate::error::{Error, RoostResult};
use crate::frames::{EntryPayload, Frame};
use crate::pool::Pool;
use crate::sm::{Sm, StateDesc, SM_FINAL, SM_INITIAL};
use crate::sm_bits;
use crate::vfs::{CommitHook, Vfs};

// Proposal lifecycle states.
const RS_QUEUED: usize = 0;
const RS_PROPOSED: usize = 1;
const RS_COMMITTED: usize = 2;
const RS_ABORTED: usize = 3;

static PROPOSAL_STATES: [StateDesc; 4] = [
    StateDesc {
        name: "queued",
        flags: SM_INITIAL,
        allowed: sm_bits!(RS_PROPOSED),
    },
    StateDesc {
        name: "proposed",
        flags: 0,
        allowed: sm_bits!(RS_COMMITTED, RS_ABORTED),
    },
    StateDesc {
        name: "committed",
        flags: SM_FINAL,
        allowed: 0,
    },
    StateDesc {
        name: "aborted",
        flags: SM_FINAL,
        allowed: 0,
    },
];

fn proposal_invariant(sm: &Sm, prev: usize) -> bool {
    use crate::sm::ergo;
    ergo(sm.state() == RS_PROPOSED, prev == RS_QUEUED)
        && ergo(
            sm.state() == RS_COMMITTED || sm.state() == RS_ABORTED,
            prev == RS_PROPOSED,
        )
}

// ---------------------------------------------------------------------------
// promise / future
// ---------------------------------------------------------------------------

struct PromiseState<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

struct PromiseShared<T> {
    state: Mutex<PromiseState<T>>,
    cond: Condvar,
}

impl<T> PromiseShared<T> {
    fn complete(&self, value: T) {
        let waker = {
            let mut state = self.state.lock();
            state.result = Some(value);
            state.waker.take()
        };
        self.cond.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Resolver half of a one-shot result.
pub struct Promise<T> {
    shared: Arc<PromiseShared<T>>,
}

impl<T> Promise<T> {
    pub fn complete(&self, value: T) {
        self.shared.complete(value);
    }
}

/// Consumer half: waitable from a blocked worker, pollable from a task.
pub struct CommitFuture<T> {
    shared: Arc<PromiseShared<T>>,
}

impl<T> CommitFuture<T> {
    /// Block the calling thread until the promise resolves.
    pub fn wait(self) -> T {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.result.take() {
                return value;
            }
            self.shared.cond.wait(&mut state);
        }
    }
}

impl<T> Future for CommitFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(value) = state.result.take() {
            state.waker = None;
            Poll::Ready(value)
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> Unpin for CommitFuture<T> {}

/// Create a connected promise/future pair.
pub fn promise<T>() -> (Promise<T>, CommitFuture<T>) {
    let shared = Arc::new(PromiseShared {
        state: Mutex::new(PromiseState {
            result: None,
            waker: None,
        }),
        cond: Condvar::new(),
    });
    (
        Promise {
            shared: shared.clone(),
        },
        CommitFuture { shared },
    )
}

// ---------------------------------------------------------------------------
// hand-off
// ---------------------------------------------------------------------------

struct PendingProposal {
    promise: Promise<RoostResult<()>>,
    sm: Sm,
}

/// The hand-off itself; also the VFS commit hook and the consensus sink.
pub struct Replication {
    consensus: Arc<dyn Consensus>,
    vfs: Arc<Vfs>,
    pool: RwLock<Option<Arc<Pool>>>,
    pending: Mutex<HashMap<u64, PendingProposal>>,
    applied: AtomicU64,
}

impl Replication {
    pub fn new(consensus: Arc<dyn Consensus>, vfs: Arc<Vfs>) -> Arc<Replication> {
        Arc::new(Replication {
            consensus,
            vfs,
            pool: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
        })
    }

    /// Wire the pool used for post-commit barriers.
    pub fn attach_pool(&self, pool: Arc<Pool>) {
        *self.pool.write() = Some(pool);
    }

    /// Detach the pool ahead of shutdown so late commits stop submitting.
    pub fn detach_pool(&self) {
        *self.pool.write() = None;
    }

    /// Highest applied log index.
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Reject a pending proposal, e.g. on leadership loss or log truncation.
    pub fn reject(&self, index: u64, err: Error) {
        if let Some(mut p) = self.pending.lock().remove(&index) {
            p.sm.transition(RS_ABORTED);
            p.promise.complete(Err(err));
        }
    }

    /// Indexes with unresolved proposals, lowest first.
    pub fn pending_indexes(&self) -> Vec<u64> {
        let mut indexes: Vec<u64> = self.pending.lock().keys().copied().collect();
        indexes.sort_unstable();
        indexes
    }

    fn enqueue_barrier(&self) {
        let pool = self.pool.read().clone();
        if let Some(pool) = pool {
            pool.queue_barrier(None);
        }
    }
}

impl CommitHook for Replication {
    fn commit(&self, db: &str, page_size: u32, frames: Vec<Frame>) -> RoostResult<()> {
        // an empty frame set is a no-op commit and succeeds immediately
        if frames.is_empty() {
            return Ok(());
        }
        if !self.consensus.is_leader() {
            return Err(Error::NotLeader {
                leader: self.consensus.leader_address(),
            });
        }
        let payload = EntryPayload {
            db: db.to_owned(),
            page_size,
            frames,
        }
        .encode();

        // hold the pending table across propose() so the committer cannot
        // deliver the entry before its promise is registered
        let future = {
            let mut pending = self.pending.lock();
            let mut sm = Sm::init(&PROPOSAL_STATES, RS_QUEUED, proposal_invariant);
            let index = self.consensus.propose(payload).map_err(|e| match e {
                ProposeError::NotLeader { leader } => Error::NotLeader { leader },
                ProposeError::Shutdown => Error::Busy,
            })?;
            sm.transition(RS_PROPOSED);
            let (promise, future) = promise();
            tracing::trace!(db, index, "proposed commit frames");
            pending.insert(index, PendingProposal { promise, sm });
            future
        };
        future.wait()
    }
}

impl CommitSink for Replication {
    fn on_commit(&self, index: u64, payload: &[u8]) {
        let mut pending = self.pending.lock();
        // at-least-once delivery: ignore anything already applied
        if index <= self.applied.load(Ordering::SeqCst) {
            return;
        }
        self.applied.store(index, Ordering::SeqCst);
        let resolved = pending.remove(&index);
        drop(pending);
        match resolved {
            Some(mut p) => {
                // leader path: the frames are already in the local WAL.
                // The era barrier goes in before the proposer resumes so no
                // unordered read observes a torn state across the commit.
                self.enqueue_barrier();
                p.sm.transition(RS_COMMITTED);
                p.promise.complete(Ok(()));
            }
            None => {
                match EntryPayload::decode(payload) {
                    Ok(entry) => {
                        if let Err(err) = self.vfs.apply(&entry.db, entry.page_size, &entry.frames)
                        {
                            tracing::error!(index, %err, "failed to apply committed entry");
                        }
                    }
                    Err(err) => {
                        tracing::error!(index, %err, "undecodable committed entry");
                    }
                }
                self.enqueue_barrier();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::StandaloneNode;

    fn fixture(vfs_name: &str) -> (Arc<StandaloneNode>, Arc<Vfs>, Arc<Replication>) {
        let node = StandaloneNode::new("127.0.0.1:666", &["1.2.3.4:666", "5.6.7.8:666"]);
        let vfs = Vfs::register(vfs_name).unwrap();
        let repl = Replication::new(node.clone(), vfs.clone());
        node.register_sink(repl.clone());
        (node, vfs, repl)
    }

    fn frame(page: u32, commit: u32, fill: u8) -> Frame {
        Frame {
            page_number: page,
            commit,
            data: vec![fill; 512],
        }
    }

    #[test]
    fn empty_frame_set_commits_immediately() {
        let (node, _vfs, repl) = fixture("repl-empty");
        repl.commit("a.db", 512, vec![]).unwrap();
        assert!(node.committed_log().is_empty());
        node.shutdown();
    }

    #[test]
    fn leader_commit_resolves_without_reapply() {
        let (node, vfs, repl) = fixture("repl-leader");
        repl.commit("a.db", 512, vec![frame(1, 1, 0x11)]).unwrap();
        assert_eq!(repl.applied_index(), 1);
        assert_eq!(node.committed_log().len(), 1);
        // leader path resolves the promise; nothing was re-applied locally
        assert!(vfs.committed_frames("a.db").is_empty());
        assert!(repl.pending_indexes().is_empty());
        node.shutdown();
    }

    #[test]
    fn follower_commit_is_rejected() {
        let (node, _vfs, repl) = fixture("repl-follower");
        node.set_leader(false);
        let err = repl.commit("a.db", 512, vec![frame(1, 1, 0)]).unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader } if leader == "127.0.0.1:666"));
        node.shutdown();
    }

    #[test]
    fn foreign_entries_apply_through_the_vfs() {
        let (node, vfs, repl) = fixture("repl-apply");
        let entry = EntryPayload {
            db: "a.db".into(),
            page_size: 512,
            frames: vec![frame(1, 1, 0x42)],
        };
        repl.on_commit(1, &entry.encode());
        assert_eq!(repl.applied_index(), 1);
        let applied = vfs.committed_frames("a.db");
        assert_eq!(applied, entry.frames);
        node.shutdown();
    }

    #[test]
    fn redelivery_is_idempotent() {
        let (node, vfs, repl) = fixture("repl-idem");
        let entry = EntryPayload {
            db: "a.db".into(),
            page_size: 512,
            frames: vec![frame(1, 1, 0x42)],
        };
        let bytes = entry.encode();
        repl.on_commit(1, &bytes);
        repl.on_commit(1, &bytes);
        assert_eq!(vfs.committed_frames("a.db").len(), 1);
        node.shutdown();
    }

    #[test]
    fn rejection_unblocks_the_proposal() {
        let (node, vfs, _unused) = fixture("repl-reject");
        let repl = Replication::new(node.clone(), vfs.clone());
        // no sink registered: commits never arrive, proposals stay pending
        let repl2 = repl.clone();
        let waiter = std::thread::spawn(move || {
            repl2.commit("a.db", 512, vec![frame(1, 1, 0)]).unwrap_err()
        });
        let index = loop {
            let pending = repl.pending_indexes();
            if let Some(first) = pending.first() {
                break *first;
            }
            std::thread::yield_now();
        };
        repl.reject(index, Error::Busy);
        let err = waiter.join().unwrap();
        assert!(matches!(err, Error::Busy));
        node.shutdown();
    }
}
