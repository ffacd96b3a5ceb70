//! SQLite connection and prepared-statement handles.
//!
//! Connections are opened against a registered VFS and switched to WAL
//! journaling immediately. Statements are prepared through the raw C API so
//! they can live in a registry next to their connection and be stepped on a
//! pool worker.
//!
//! Thread discipline: the gateway prepares and finalizes on the loop thread
//! while no request is in flight, and all stepping for one database happens
//! on the worker its ordered class maps to. The bundled SQLite is built in
//! serialized threading mode, so the handoff between those threads is safe.

use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{ffi, Connection, OpenFlags};

use crate::error::{Error, RoostResult};
use crate::registry::Registry;
use crate::wire::Value;

/// Human-readable description of a SQLite result code.
pub fn errstr(code: u64) -> String {
    unsafe { CStr::from_ptr(ffi::sqlite3_errstr(code as c_int)) }
        .to_string_lossy()
        .into_owned()
}

fn misuse() -> Error {
    let code = ffi::SQLITE_MISUSE as u64;
    Error::Db {
        code,
        extended: code,
        description: errstr(code),
    }
}

/// Outcome of executing a statement to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: u64,
    pub rows_affected: u64,
}

/// An open database: connection, raw handle and its statement registry.
///
/// Field order matters: statements must be finalized before the connection
/// closes.
#[derive(Debug)]
pub struct Database {
    stmts: Mutex<Registry<Stmt>>,
    conn: Connection,
    handle: *mut ffi::sqlite3,
    name: String,
    vfs_name: String,
}

// All SQLite access is serialized: the loop thread only touches the handle
// while no request is in flight, stepping is confined to the database's
// ordered pool class, and the engine itself runs in serialized mode.
unsafe impl Send for Database {}
unsafe impl Sync for Database {}

impl Database {
    /// Open `name` against the VFS registered as `vfs_name`, with raw
    /// SQLite open flags, and switch it to WAL journaling.
    pub fn open(name: &str, flags: u64, vfs_name: &str) -> RoostResult<Database> {
        let Some(flags) = i32::try_from(flags).ok().and_then(OpenFlags::from_bits) else {
            return Err(misuse());
        };
        let conn = Connection::open_with_flags_and_vfs(name, flags, vfs_name).map_err(
            |err| match err {
                rusqlite::Error::SqliteFailure(e, _) => {
                    let code = (e.extended_code & 0xff) as u64;
                    Error::Db {
                        code,
                        extended: e.extended_code as u64,
                        description: errstr(code),
                    }
                }
                other => other.into(),
            },
        )?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(Error::from)?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(Error::from)?;
        if mode != "wal" {
            return Err(Error::Io(format!(
                "{name}: journal mode is {mode:?}, wanted wal"
            )));
        }
        conn.execute_batch("PRAGMA synchronous=OFF")
            .map_err(Error::from)?;
        let handle = unsafe { conn.handle() };
        Ok(Database {
            stmts: Mutex::new(Registry::new()),
            conn,
            handle,
            name: name.to_owned(),
            vfs_name: vfs_name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vfs_name(&self) -> &str {
        &self.vfs_name
    }

    /// The owning rusqlite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn stmts(&self) -> &Mutex<Registry<Stmt>> {
        &self.stmts
    }

    /// Last error recorded on this connection, paired with the result code
    /// that triggered it.
    fn last_error(&self, rc: c_int) -> Error {
        let extended = unsafe { ffi::sqlite3_extended_errcode(self.handle) };
        let description = unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(self.handle)) }
            .to_string_lossy()
            .into_owned();
        Error::Db {
            code: (rc & 0xff) as u64,
            extended: extended as u64,
            description,
        }
    }

    /// Prepare one statement. Parse failures surface as database errors.
    pub fn prepare(&self, sql: &str) -> RoostResult<Stmt> {
        let c_sql = CString::new(sql).map_err(|_| misuse())?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(self.handle, c_sql.as_ptr(), -1, &mut raw, ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.last_error(rc));
        }
        if raw.is_null() {
            let code = ffi::SQLITE_ERROR as u64;
            return Err(Error::Db {
                code,
                extended: code,
                description: "empty statement".to_owned(),
            });
        }
        Ok(Stmt {
            raw,
            db: self.handle,
            sql: sql.to_owned(),
        })
    }
}

/// A prepared statement, steppable on a pool worker.
#[derive(Debug)]
pub struct Stmt {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    sql: String,
}

// See the thread discipline note on `Database`.
unsafe impl Send for Stmt {}
unsafe impl Sync for Stmt {}

impl Stmt {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether this statement can write the database.
    pub fn is_readonly(&self) -> bool {
        unsafe { ffi::sqlite3_stmt_readonly(self.raw) != 0 }
    }

    fn error(&self, rc: c_int) -> Error {
        let extended = unsafe { ffi::sqlite3_extended_errcode(self.db) };
        let description = unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(self.db)) }
            .to_string_lossy()
            .into_owned();
        Error::Db {
            code: (rc & 0xff) as u64,
            extended: extended as u64,
            description,
        }
    }

    /// Reset and bind `params` left to right.
    pub fn bind(&self, params: &[Value]) -> RoostResult<()> {
        unsafe {
            ffi::sqlite3_reset(self.raw);
            ffi::sqlite3_clear_bindings(self.raw);
        }
        for (i, value) in params.iter().enumerate() {
            let idx = (i + 1) as c_int;
            let rc = unsafe {
                match value {
                    Value::Integer(v) => ffi::sqlite3_bind_int64(self.raw, idx, *v),
                    Value::Float(v) => ffi::sqlite3_bind_double(self.raw, idx, *v),
                    Value::Text(v) => ffi::sqlite3_bind_text(
                        self.raw,
                        idx,
                        v.as_ptr() as *const _,
                        v.len() as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                    Value::Blob(v) => ffi::sqlite3_bind_blob(
                        self.raw,
                        idx,
                        v.as_ptr() as *const _,
                        v.len() as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                    Value::Null => ffi::sqlite3_bind_null(self.raw, idx),
                }
            };
            if rc != ffi::SQLITE_OK {
                return Err(self.error(rc));
            }
        }
        Ok(())
    }

    /// Step the statement to completion and report the write outcome.
    pub fn exec(&self) -> RoostResult<ExecResult> {
        loop {
            let rc = unsafe { ffi::sqlite3_step(self.raw) };
            match rc {
                ffi::SQLITE_ROW => continue,
                ffi::SQLITE_DONE => break,
                _ => {
                    let err = self.error(rc);
                    unsafe { ffi::sqlite3_reset(self.raw) };
                    return Err(err);
                }
            }
        }
        let result = ExecResult {
            last_insert_id: unsafe { ffi::sqlite3_last_insert_rowid(self.db) } as u64,
            rows_affected: unsafe { ffi::sqlite3_changes(self.db) } as u64,
        };
        unsafe { ffi::sqlite3_reset(self.raw) };
        Ok(result)
    }

    /// Step once: `Some(())` on a row, `None` when done.
    pub fn step_row(&self) -> RoostResult<Option<()>> {
        let rc = unsafe { ffi::sqlite3_step(self.raw) };
        match rc {
            ffi::SQLITE_ROW => Ok(Some(())),
            ffi::SQLITE_DONE => Ok(None),
            _ => {
                let err = self.error(rc);
                unsafe { ffi::sqlite3_reset(self.raw) };
                Err(err)
            }
        }
    }

    pub fn reset(&self) {
        unsafe { ffi::sqlite3_reset(self.raw) };
    }

    pub fn column_count(&self) -> usize {
        unsafe { ffi::sqlite3_column_count(self.raw) as usize }
    }

    /// SQLite fundamental type code of column `i` in the current row.
    pub fn column_type(&self, i: usize) -> u8 {
        unsafe { ffi::sqlite3_column_type(self.raw, i as c_int) as u8 }
    }

    pub fn column_i64(&self, i: usize) -> i64 {
        unsafe { ffi::sqlite3_column_int64(self.raw, i as c_int) }
    }

    pub fn column_f64(&self, i: usize) -> f64 {
        unsafe { ffi::sqlite3_column_double(self.raw, i as c_int) }
    }

    pub fn column_text(&self, i: usize) -> String {
        unsafe {
            let ptr = ffi::sqlite3_column_text(self.raw, i as c_int);
            if ptr.is_null() {
                return String::new();
            }
            let len = ffi::sqlite3_column_bytes(self.raw, i as c_int) as usize;
            let bytes = std::slice::from_raw_parts(ptr, len);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    pub fn column_blob(&self, i: usize) -> Vec<u8> {
        unsafe {
            let ptr = ffi::sqlite3_column_blob(self.raw, i as c_int);
            if ptr.is_null() {
                return Vec::new();
            }
            let len = ffi::sqlite3_column_bytes(self.raw, i as c_int) as usize;
            std::slice::from_raw_parts(ptr as *const u8, len).to_vec()
        }
    }
}

impl Drop for Stmt {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_finalize(self.raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Vfs;
    use std::sync::{Arc, OnceLock};

    fn test_vfs() -> &'static Arc<Vfs> {
        static VFS: OnceLock<Arc<Vfs>> = OnceLock::new();
        VFS.get_or_init(|| Vfs::register("volatile-db-test").unwrap())
    }

    fn open(name: &str) -> Database {
        let flags = (ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE) as u64;
        Database::open(name, flags, test_vfs().name()).unwrap()
    }

    #[test]
    fn open_with_create_only_flags_is_misuse() {
        test_vfs();
        let err = Database::open("m.db", ffi::SQLITE_OPEN_CREATE as u64, "volatile-db-test")
            .unwrap_err();
        match err {
            Error::Db {
                code, description, ..
            } => {
                assert_eq!(code, ffi::SQLITE_MISUSE as u64);
                assert_eq!(description, "bad parameter or other API misuse");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn open_unknown_vfs_fails() {
        let flags = (ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE) as u64;
        assert!(Database::open("u.db", flags, "no-such-vfs").is_err());
    }

    #[test]
    fn create_insert_and_read_back() {
        let db = open("crud.db");
        let create = db.prepare("CREATE TABLE foo (n INT)").unwrap();
        let res = create.exec().unwrap();
        assert_eq!(res.rows_affected, 0);

        let insert = db.prepare("INSERT INTO foo(n) VALUES(?)").unwrap();
        insert.bind(&[Value::Integer(-12)]).unwrap();
        let res = insert.exec().unwrap();
        assert_eq!(res.rows_affected, 1);
        assert_eq!(res.last_insert_id, 1);

        let select = db.prepare("SELECT n FROM foo").unwrap();
        assert!(select.is_readonly());
        assert!(!insert.is_readonly());
        select.bind(&[]).unwrap();
        assert!(select.step_row().unwrap().is_some());
        assert_eq!(select.column_count(), 1);
        assert_eq!(select.column_type(0), crate::wire::TYPE_INTEGER);
        assert_eq!(select.column_i64(0), -12);
        assert!(select.step_row().unwrap().is_none());
    }

    #[test]
    fn prepare_garbage_reports_parse_error() {
        let db = open("parse.db");
        let err = db.prepare("garbage").unwrap_err();
        match err {
            Error::Db { code, extended, .. } => {
                assert_eq!(code, ffi::SQLITE_ERROR as u64);
                assert_eq!(extended, ffi::SQLITE_ERROR as u64);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn commits_surface_in_the_wal() {
        let db = open("walcap.db");
        db.prepare("CREATE TABLE t (x)").unwrap().exec().unwrap();
        let frames = test_vfs().committed_frames("walcap.db");
        assert!(!frames.is_empty());
        assert!(frames.last().unwrap().is_commit());
    }
}
