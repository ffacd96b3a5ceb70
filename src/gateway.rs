//! Per-connection request gateway.
//!
//! A gateway owns one client conversation: its database registry, the
//! statement registries hanging off each database, and a single in-flight
//! request slot. HELO, HEARTBEAT, OPEN, PREPARE and FINALIZE are answered
//! directly on the loop thread; EXEC and QUERY ship an ordered work item
//! (class and cookie both the database id) to the pool, so all stepping for
//! one database lands on one deterministic worker, and writes flow from
//! SQLite through the intercepting VFS into replication before the response
//! is produced.
//!
//! At most one request may be outstanding; a second arrival while busy is a
//! protocol error and the connection must be closed. SQLite failures are
//! answered with a DB_ERROR response; unknown ids are errors carrying a
//! gateway error string like `failed to handle exec: no stmt with id 666`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::config::DEFAULT_ROWS_BUFFER_WORDS;
use crate::consensus::Consensus;
use crate::db::{Database, Stmt};
use crate::error::{Error, RoostResult};
use crate::metrics::Metrics;
use crate::pool::Pool;
use crate::registry::Registry;
use crate::wire::{Request, Response, RowsWriter, Value, TYPE_BLOB, TYPE_FLOAT, TYPE_INTEGER, TYPE_TEXT};

/// A query yielded mid-stream, waiting for its continuation.
struct ActiveQuery {
    db_id: u64,
    stmt_id: u64,
}

pub struct Gateway {
    cluster: Arc<dyn Consensus>,
    pool: Arc<Pool>,
    metrics: Arc<Metrics>,
    dbs: Registry<Database>,
    in_flight: bool,
    error: Option<String>,
    rows_budget: usize,
    active_query: Option<ActiveQuery>,
}

impl Gateway {
    pub fn new(cluster: Arc<dyn Consensus>, pool: Arc<Pool>) -> Gateway {
        Gateway {
            cluster,
            pool,
            metrics: Arc::new(Metrics::new()),
            dbs: Registry::new(),
            in_flight: false,
            error: None,
            rows_budget: DEFAULT_ROWS_BUFFER_WORDS,
            active_query: None,
        }
    }

    /// Share a node-wide metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Gateway {
        self.metrics = metrics;
        self
    }

    /// Override the ROWS chunk budget, in words.
    pub fn set_rows_budget(&mut self, words: usize) {
        self.rows_budget = words.max(2);
    }

    /// The last request failure, formatted for diagnostics.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handle one request to completion.
    ///
    /// SQLite failures come back as `Ok(Response::DbError { .. })`; other
    /// kinds are `Err` and the caller decides how to surface them. The
    /// in-flight slot is taken for the whole call: a second request while
    /// one is unresolved is a protocol error.
    pub async fn handle(&mut self, request: Request) -> RoostResult<Response> {
        if self.in_flight {
            let err = Error::protocol("request received while another is in flight");
            self.error = Some(format!("failed to handle {}: {}", request.name(), err));
            return Err(err);
        }
        self.in_flight = true;
        let started = Instant::now();
        let name = request.name();
        let result = self.dispatch(request).await;
        self.in_flight = false;
        self.metrics.record(started.elapsed());
        match result {
            Ok(response) => {
                self.error = None;
                Ok(response)
            }
            Err(Error::Db {
                code,
                extended,
                description,
            }) => {
                // statement stays finalizable; the failure is the answer
                self.error = None;
                Ok(Response::DbError {
                    code,
                    extended,
                    description,
                })
            }
            Err(err) => {
                self.error = Some(format!("failed to handle {name}: {err}"));
                Err(err)
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> RoostResult<Response> {
        if let Some(active) = &self.active_query {
            // a parked result set only accepts its continuation or a
            // finalize of the same statement
            let allowed = match &request {
                Request::Query {
                    db_id,
                    stmt_id,
                    params,
                } => *db_id == active.db_id && *stmt_id == active.stmt_id && params.is_empty(),
                Request::Finalize { db_id, stmt_id } => {
                    *db_id == active.db_id && *stmt_id == active.stmt_id
                }
                _ => false,
            };
            if !allowed {
                return Err(Error::protocol("rows still pending for an earlier query"));
            }
        }
        match request {
            Request::Helo { client_id } => {
                tracing::debug!(client_id, "client introduced itself");
                Ok(Response::Welcome {
                    leader: self.cluster.leader_address(),
                })
            }
            Request::Heartbeat { timestamp } => {
                tracing::trace!(timestamp, "heartbeat");
                Ok(Response::Servers {
                    addresses: self.cluster.peer_addresses(),
                })
            }
            Request::Open { name, flags, vfs } => {
                let db = Database::open(&name, flags, &vfs)?;
                let id = self.dbs.add(Arc::new(db));
                tracing::debug!(name = %name, id, "opened database");
                Ok(Response::Db { id: id as u32 })
            }
            Request::Prepare { db_id, sql } => {
                let db = self.lookup_db(db_id)?;
                let stmt = db.prepare(&sql)?;
                let id = db.stmts().lock().add(Arc::new(stmt));
                Ok(Response::Stmt {
                    db_id: db_id as u32,
                    id: id as u32,
                })
            }
            Request::Exec {
                db_id,
                stmt_id,
                params,
            } => self.exec(db_id, stmt_id, params).await,
            Request::Query {
                db_id,
                stmt_id,
                params,
            } => self.query(db_id, stmt_id, params).await,
            Request::Finalize { db_id, stmt_id } => {
                let db = self.lookup_db(db_id)?;
                db.stmts()
                    .lock()
                    .remove(stmt_id)
                    .ok_or_else(|| Error::not_found(format!("no stmt with id {stmt_id}")))?;
                if let Some(active) = &self.active_query {
                    if active.db_id == db_id && active.stmt_id == stmt_id {
                        self.active_query = None;
                    }
                }
                Ok(Response::Empty)
            }
        }
    }

    fn lookup_db(&self, db_id: u64) -> RoostResult<Arc<Database>> {
        self.dbs
            .get(db_id)
            .ok_or_else(|| Error::not_found(format!("no db with id {db_id}")))
    }

    fn lookup_stmt(&self, db: &Database, stmt_id: u64) -> RoostResult<Arc<Stmt>> {
        db.stmts()
            .lock()
            .get(stmt_id)
            .ok_or_else(|| Error::not_found(format!("no stmt with id {stmt_id}")))
    }

    async fn exec(&mut self, db_id: u64, stmt_id: u64, params: Vec<Value>) -> RoostResult<Response> {
        let db = self.lookup_db(db_id)?;
        let stmt = self.lookup_stmt(&db, stmt_id)?;
        if !stmt.is_readonly() && !self.cluster.is_leader() {
            return Err(Error::NotLeader {
                leader: self.cluster.leader_address(),
            });
        }
        let (tx, rx) = oneshot::channel();
        let worker_db = db.clone();
        self.pool.queue_ordered(
            db_id as u32,
            db_id as u32,
            move || {
                // the database handle must outlive the step
                let _db = worker_db;
                stmt.bind(&params).and_then(|_| stmt.exec())
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        let result = rx
            .await
            .map_err(|_| Error::Io("pool completion dropped".to_owned()))??;
        Ok(Response::Result {
            last_insert_id: result.last_insert_id,
            rows_affected: result.rows_affected,
        })
    }

    async fn query(
        &mut self,
        db_id: u64,
        stmt_id: u64,
        params: Vec<Value>,
    ) -> RoostResult<Response> {
        let db = self.lookup_db(db_id)?;
        let stmt = self.lookup_stmt(&db, stmt_id)?;
        let continuation = self.active_query.is_some();
        let budget = self.rows_budget;
        let (tx, rx) = oneshot::channel();
        let worker_db = db.clone();
        self.pool.queue_ordered(
            db_id as u32,
            db_id as u32,
            move || {
                let _db = worker_db;
                step_rows(&stmt, if continuation { None } else { Some(&params) }, budget)
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        let result = rx
            .await
            .map_err(|_| Error::Io("pool completion dropped".to_owned()))?;
        match result {
            Ok((payload, more)) => {
                self.active_query = if more {
                    Some(ActiveQuery { db_id, stmt_id })
                } else {
                    None
                };
                Ok(Response::Rows { payload, more })
            }
            Err(err) => {
                self.active_query = None;
                Err(err)
            }
        }
    }
}

/// Serialise rows until the budget fills or the statement is done. Runs on
/// a pool worker.
fn step_rows(
    stmt: &Stmt,
    params: Option<&[Value]>,
    budget_words: usize,
) -> RoostResult<(Vec<u8>, bool)> {
    if let Some(params) = params {
        stmt.bind(params)?;
    }
    let mut writer = RowsWriter::new(budget_words);
    loop {
        match stmt.step_row()? {
            Some(()) => {
                let columns = stmt.column_count();
                let types: Vec<u8> = (0..columns).map(|i| stmt.column_type(i)).collect();
                writer.row_header(&types);
                for (i, t) in types.iter().enumerate() {
                    match *t {
                        TYPE_INTEGER => writer.col_i64(stmt.column_i64(i)),
                        TYPE_FLOAT => writer.col_f64(stmt.column_f64(i)),
                        TYPE_TEXT => writer.col_text(&stmt.column_text(i)),
                        TYPE_BLOB => writer.col_blob(&stmt.column_blob(i)),
                        _ => writer.col_null(),
                    }
                }
                if writer.is_full() {
                    // yield a partial chunk; the statement keeps its cursor
                    return Ok((writer.into_payload(), true));
                }
            }
            None => {
                stmt.reset();
                return Ok((writer.into_payload(), false));
            }
        }
    }
}
