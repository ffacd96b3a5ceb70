//! Node assembly and the TCP front door.
//!
//! A [`Node`] wires the long-lived pieces together: the volatile VFS, the
//! thread pool, the replication hand-off and the consensus collaborator.
//! The [`Server`] owns the listener; each accepted connection gets its own
//! gateway and a task that reads framed requests, drives the gateway and
//! writes framed responses. The loop also runs the pool's completion drain,
//! so after-work callbacks fire on the runtime that owns the sockets.
//!
//! Protocol errors close the connection without a response; every other
//! gateway error is answered as a DB_ERROR message and the conversation
//! continues.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::consensus::Consensus;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::metrics::Metrics;
use crate::pool::{Completions, Pool};
use crate::replication::Replication;
use crate::vfs::Vfs;
use crate::wire::{Message, Request, Response, HEADER};

/// One node's long-lived machinery.
pub struct Node {
    vfs: Arc<Vfs>,
    pool: Arc<Pool>,
    replication: Arc<Replication>,
    consensus: Arc<dyn Consensus>,
    metrics: Arc<Metrics>,
    rows_budget: usize,
}

impl Node {
    /// Build a node: register the VFS under `vfs_name`, spawn the pool and
    /// wire replication between the VFS and `consensus`.
    ///
    /// Returns the node plus the completion handle the loop must drain.
    pub fn new(
        config: &Config,
        vfs_name: &str,
        consensus: Arc<dyn Consensus>,
    ) -> crate::error::RoostResult<(Arc<Node>, Completions)> {
        crate::config::maybe_enable_tracing(config.trace);
        let vfs = Vfs::register(vfs_name)?;
        let (pool, completions) = Pool::new(config.pool_threads);
        let replication = Replication::new(consensus.clone(), vfs.clone());
        replication.attach_pool(pool.clone());
        vfs.set_commit_hook(replication.clone());
        consensus.register_sink(replication.clone());
        let node = Arc::new(Node {
            vfs,
            pool,
            replication,
            consensus,
            metrics: Arc::new(Metrics::new()),
            rows_budget: config.rows_buffer_words,
        });
        Ok((node, completions))
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn replication(&self) -> &Arc<Replication> {
        &self.replication
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// A gateway for one client connection.
    pub fn gateway(&self) -> Gateway {
        let mut gateway = Gateway::new(self.consensus.clone(), self.pool.clone())
            .with_metrics(self.metrics.clone());
        gateway.set_rows_budget(self.rows_budget);
        gateway
    }

    /// Tear the node down: stop post-commit barrier submission, then join
    /// the pool. Producers must have drained first.
    pub fn shutdown(&self) {
        self.replication.detach_pool();
        self.pool.close();
    }
}

/// TCP server for one node.
pub struct Server {
    node: Arc<Node>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(node: Arc<Node>, addr: &str) -> io::Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = %listener.local_addr()?, "listening");
        Ok(Server { node, listener })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, draining pool completions alongside.
    pub async fn serve(self, mut completions: Completions) -> io::Result<()> {
        tokio::spawn(async move { while completions.run_pending().await {} });
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!(%peer, "connection accepted");
            let node = self.node.clone();
            tokio::spawn(async move {
                // the node (and with it the VFS registration) must outlive
                // every open connection
                let gateway = node.gateway();
                if let Err(err) = serve_connection(gateway, stream).await {
                    tracing::debug!(%peer, %err, "connection closed");
                }
                drop(node);
            });
        }
    }
}

/// Read one framed message; `None` on clean EOF at a frame boundary.
pub async fn read_message(stream: &mut TcpStream) -> io::Result<Option<Message>> {
    let mut hdr = [0u8; HEADER];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let (len, mtype, flags) = Message::decode_header(&hdr)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Message::from_parts(mtype, flags, body)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

pub async fn write_message(stream: &mut TcpStream, message: &Message) -> io::Result<()> {
    stream.write_all(&message.encode()).await?;
    stream.flush().await
}

async fn serve_connection(mut gateway: Gateway, mut stream: TcpStream) -> io::Result<()> {
    loop {
        let Some(message) = read_message(&mut stream).await? else {
            return Ok(());
        };
        let request = match Request::decode(message) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(%err, "malformed request");
                return Ok(());
            }
        };
        let response = match gateway.handle(request).await {
            Ok(response) => response,
            Err(Error::Protocol(reason)) => {
                tracing::debug!(reason = %reason, "protocol error");
                return Ok(());
            }
            Err(err) => Response::DbError {
                code: err.wire_code(),
                extended: err.wire_code(),
                description: err.to_string(),
            },
        };
        write_message(&mut stream, &response.encode()).await?;
    }
}
