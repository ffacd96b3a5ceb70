//! The consensus collaborator interface.
//!
//! The engine consumes consensus through a narrow trait: leadership
//! queries, a `propose` that assigns a log index, and a commit sink the
//! collaborator drives in strict index order on a thread of its choosing.
//! Delivery is at-least-once; the sink is idempotent.
//!
//! [`StandaloneNode`] is the in-process implementation used for single-node
//! operation and tests: always (by default) the leader, committing entries
//! on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

/// Receives committed entries, in index order.
pub trait CommitSink: Send + Sync {
    fn on_commit(&self, index: u64, payload: &[u8]);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProposeError {
    #[error("not leader, try {leader}")]
    NotLeader { leader: String },
    #[error("consensus is shutting down")]
    Shutdown,
}

/// Operations the engine requires from the consensus layer.
pub trait Consensus: Send + Sync {
    fn is_leader(&self) -> bool;
    fn leader_address(&self) -> String;
    fn peer_addresses(&self) -> Vec<String>;
    /// Submit a payload; returns the assigned log index. Commitment is
    /// reported later through the registered sink.
    fn propose(&self, payload: Vec<u8>) -> Result<u64, ProposeError>;
    /// Install the commit sink. Retained weakly: the caller owns the sink
    /// and keeps it alive for the node's lifetime.
    fn register_sink(&self, sink: Arc<dyn CommitSink>);
}

struct ProposeState {
    next_index: u64,
    tx: Option<Sender<(u64, Vec<u8>)>>,
}

/// Single-node in-process consensus: every proposal commits, delivered by a
/// dedicated commit thread.
pub struct StandaloneNode {
    address: String,
    peers: Vec<String>,
    leader: AtomicBool,
    sink: RwLock<Option<Weak<dyn CommitSink>>>,
    propose_state: Mutex<ProposeState>,
    log: Mutex<Vec<(u64, Vec<u8>)>>,
    committer: Mutex<Option<JoinHandle<()>>>,
}

impl StandaloneNode {
    pub fn new(address: &str, peers: &[&str]) -> Arc<StandaloneNode> {
        let (tx, rx) = mpsc::channel::<(u64, Vec<u8>)>();
        let node = Arc::new(StandaloneNode {
            address: address.to_owned(),
            peers: peers.iter().map(|p| (*p).to_owned()).collect(),
            leader: AtomicBool::new(true),
            sink: RwLock::new(None),
            propose_state: Mutex::new(ProposeState {
                next_index: 1,
                tx: Some(tx),
            }),
            log: Mutex::new(Vec::new()),
            committer: Mutex::new(None),
        });
        let weak = Arc::downgrade(&node);
        let handle = std::thread::Builder::new()
            .name("roost-committer".into())
            .spawn(move || {
                while let Ok((index, payload)) = rx.recv() {
                    let Some(node) = weak.upgrade() else {
                        return;
                    };
                    node.log.lock().push((index, payload.clone()));
                    let sink = node.sink.read().as_ref().and_then(Weak::upgrade);
                    if let Some(sink) = sink {
                        sink.on_commit(index, &payload);
                    }
                }
            })
            .expect("spawn committer thread");
        *node.committer.lock() = Some(handle);
        node
    }

    /// Flip leadership, for exercising the follower paths.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// The committed log so far, in index order.
    pub fn committed_log(&self) -> Vec<(u64, Vec<u8>)> {
        self.log.lock().clone()
    }

    /// Re-deliver an already committed entry, as an at-least-once consensus
    /// implementation may.
    pub fn redeliver(&self, index: u64) {
        let entry = self
            .log
            .lock()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, p)| p.clone());
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        if let (Some(payload), Some(sink)) = (entry, sink) {
            sink.on_commit(index, &payload);
        }
    }

    /// Stop accepting proposals and join the commit thread.
    pub fn shutdown(&self) {
        self.propose_state.lock().tx.take();
        if let Some(handle) = self.committer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StandaloneNode {
    fn drop(&mut self) {
        self.propose_state.lock().tx.take();
    }
}

impl Consensus for StandaloneNode {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_address(&self) -> String {
        self.address.clone()
    }

    fn peer_addresses(&self) -> Vec<String> {
        self.peers.clone()
    }

    fn propose(&self, payload: Vec<u8>) -> Result<u64, ProposeError> {
        if !self.is_leader() {
            return Err(ProposeError::NotLeader {
                leader: self.leader_address(),
            });
        }
        let mut state = self.propose_state.lock();
        let Some(tx) = state.tx.clone() else {
            return Err(ProposeError::Shutdown);
        };
        let index = state.next_index;
        state.next_index += 1;
        tx.send((index, payload)).map_err(|_| ProposeError::Shutdown)?;
        Ok(index)
    }

    fn register_sink(&self, sink: Arc<dyn CommitSink>) {
        *self.sink.write() = Some(Arc::downgrade(&sink));
    }
}
