//! Distributed, embeddable SQL engine serving SQLite semantics across a
//! replicated cluster.
//!
//! Clients connect to any node over a length-prefixed binary protocol; the
//! node's gateway executes requests against a local SQLite database whose
//! WAL write path is intercepted by an in-memory VFS and shipped through a
//! consensus log before being acknowledged. Reads skip the log.
//!
//! ## Key Components
//!
//! - [`pool::Pool`]: cooperative thread pool with ordered, unordered and
//!   barrier work classes, run by a planner thread
//! - [`vfs::Vfs`]: the intercepting "volatile" VFS that captures WAL frames
//!   at commit time
//! - [`replication::Replication`]: the hand-off converting captured frames
//!   into consensus proposals and applying committed entries
//! - [`gateway::Gateway`]: the per-connection request machine
//! - [`consensus::Consensus`]: the collaborator interface to the actual
//!   consensus implementation, with an in-process standalone node
//! - [`server::Node`] / [`server::Server`]: node assembly and the TCP
//!   front door
//!
//! ## Threading
//!
//! One loop thread (a tokio runtime) owns sockets and runs all after-work
//! callbacks; a planner thread schedules work onto N worker threads; the
//! consensus collaborator delivers commits on threads of its own. Workers
//! may suspend while a commit awaits quorum.

pub mod config;
pub mod consensus;
pub mod db;
pub mod error;
pub mod frames;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod replication;
pub mod server;
pub mod sm;
pub mod vfs;
pub mod wire;

pub use config::Config;
pub use consensus::{CommitSink, Consensus, StandaloneNode};
pub use error::{Error, RoostResult};
pub use gateway::Gateway;
pub use pool::{Completions, Pool, WorkClass};
pub use replication::Replication;
pub use server::{Node, Server};
pub use vfs::Vfs;
pub use wire::{Request, Response, Value};
