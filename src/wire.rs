//! Binary wire protocol between clients and the gateway.
//!
//! ## Framing
//!
//! Messages are length-prefixed with an 8-byte header:
//!
//! ```text
//! +----------------+--------+--------+------------------+
//! |     words      |  type  | flags  |    reserved      |
//! |   (4 bytes)    | (1 b)  | (1 b)  |    (2 bytes)     |
//! +----------------+--------+--------+------------------+
//! ```
//!
//! - **words**: u32 (little-endian) — body length in 8-byte units.
//! - **type**: u8 — request or response kind.
//! - **flags**: u8 — bit 0 set on a ROWS response means more chunks follow.
//!
//! ## Body encoding
//!
//! Little-endian throughout. Integers are u64/i64 words, floats IEEE-754
//! doubles, strings and blobs a u64 length prefix followed by the bytes,
//! zero-padded to an 8-byte boundary. Ids travel as u32 pairs packed into
//! one word. Row results encode column types as 4-bit nibbles packed into
//! u64 header words (column 0 in the low nibble of byte 0), followed by the
//! column payloads.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;

/// Size of one body word in bytes.
pub const WORD: usize = 8;
/// Size of the message header in bytes.
pub const HEADER: usize = 8;

pub const REQUEST_HELO: u8 = 1;
pub const REQUEST_HEARTBEAT: u8 = 2;
pub const REQUEST_OPEN: u8 = 3;
pub const REQUEST_PREPARE: u8 = 4;
pub const REQUEST_EXEC: u8 = 5;
pub const REQUEST_QUERY: u8 = 6;
pub const REQUEST_FINALIZE: u8 = 7;

pub const RESPONSE_WELCOME: u8 = 1;
pub const RESPONSE_SERVERS: u8 = 2;
pub const RESPONSE_DB: u8 = 3;
pub const RESPONSE_STMT: u8 = 4;
pub const RESPONSE_RESULT: u8 = 5;
pub const RESPONSE_ROWS: u8 = 6;
pub const RESPONSE_EMPTY: u8 = 7;
pub const RESPONSE_DB_ERROR: u8 = 8;

/// Flag bit on ROWS responses: the result set continues in a later chunk.
pub const FLAG_MORE: u8 = 1 << 0;

/// SQLite fundamental type codes, reused as column and parameter tags.
pub const TYPE_INTEGER: u8 = 1;
pub const TYPE_FLOAT: u8 = 2;
pub const TYPE_TEXT: u8 = 3;
pub const TYPE_BLOB: u8 = 4;
pub const TYPE_NULL: u8 = 5;

/// Custom error for wire serialization and deserialization.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("short body: wanted {wanted} more bytes, {left} left")]
    ShortBody { wanted: usize, left: usize },
    #[error("body length {0} is not a multiple of {WORD}")]
    Unaligned(usize),
    #[error("invalid utf-8 in text field")]
    Utf8,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unknown value type tag {0}")]
    UnknownValueType(u8),
    #[error("message too large: {0} words")]
    TooLarge(u64),
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// One framed message: type, flags and an 8-byte-aligned body with a read
/// cursor.
#[derive(Debug, Clone)]
pub struct Message {
    mtype: u8,
    flags: u8,
    body: Vec<u8>,
    offset: usize,
}

impl Message {
    pub fn new(mtype: u8) -> Self {
        Self {
            mtype,
            flags: 0,
            body: Vec::new(),
            offset: 0,
        }
    }

    pub fn from_parts(mtype: u8, flags: u8, body: Vec<u8>) -> Result<Self, WireError> {
        if body.len() % WORD != 0 {
            return Err(WireError::Unaligned(body.len()));
        }
        Ok(Self {
            mtype,
            flags,
            body,
            offset: 0,
        })
    }

    pub fn mtype(&self) -> u8 {
        self.mtype
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    /// Body length in words.
    pub fn words(&self) -> u32 {
        (self.body.len() / WORD) as u32
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// True once the read cursor has consumed the whole body.
    pub fn eom(&self) -> bool {
        self.offset >= self.body.len()
    }

    /// Serialize header and body into one buffer ready for the socket.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.body.len() % WORD, 0);
        let mut out = Vec::with_capacity(HEADER + self.body.len());
        let mut hdr = [0u8; HEADER];
        LittleEndian::write_u32(&mut hdr[0..4], self.words());
        hdr[4] = self.mtype;
        hdr[5] = self.flags;
        out.extend_from_slice(&hdr);
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse a header, returning (body length in bytes, type, flags).
    pub fn decode_header(hdr: &[u8; HEADER]) -> Result<(usize, u8, u8), WireError> {
        let words = LittleEndian::read_u32(&hdr[0..4]) as u64;
        if words > (1 << 24) {
            return Err(WireError::TooLarge(words));
        }
        Ok((words as usize * WORD, hdr[4], hdr[5]))
    }

    // -- writers ---------------------------------------------------------

    pub fn put_u64(&mut self, v: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, v);
        self.body.extend_from_slice(&buf);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    /// Two u32 values packed into one word (used for id pairs).
    pub fn put_u32_pair(&mut self, a: u32, b: u32) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], a);
        LittleEndian::write_u32(&mut buf[4..8], b);
        self.body.extend_from_slice(&buf);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.body.push(v);
    }

    /// Zero-pad the body up to the next word boundary.
    pub fn pad(&mut self) {
        while self.body.len() % WORD != 0 {
            self.body.push(0);
        }
    }

    pub fn put_text(&mut self, s: &str) {
        self.put_u64(s.len() as u64);
        self.body.extend_from_slice(s.as_bytes());
        self.pad();
    }

    pub fn put_blob(&mut self, b: &[u8]) {
        self.put_u64(b.len() as u64);
        self.body.extend_from_slice(b);
        self.pad();
    }

    /// Append a pre-encoded, word-aligned payload.
    pub fn put_raw(&mut self, payload: &[u8]) {
        debug_assert_eq!(payload.len() % WORD, 0);
        self.body.extend_from_slice(payload);
    }

    // -- readers ---------------------------------------------------------

    fn take(&mut self, n: usize) -> Result<&[u8], WireError> {
        let left = self.body.len() - self.offset;
        if left < n {
            return Err(WireError::ShortBody { wanted: n, left });
        }
        let slice = &self.body[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    pub fn get_u32_pair(&mut self) -> Result<(u32, u32), WireError> {
        let buf = self.take(8)?;
        Ok((
            LittleEndian::read_u32(&buf[0..4]),
            LittleEndian::read_u32(&buf[4..8]),
        ))
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Advance the read cursor to the next word boundary.
    pub fn align(&mut self) {
        let rem = self.offset % WORD;
        if rem != 0 {
            self.offset += WORD - rem;
        }
    }

    pub fn get_text(&mut self) -> Result<String, WireError> {
        let len = self.get_u64()? as usize;
        let bytes = self.take(len)?.to_vec();
        self.align();
        String::from_utf8(bytes).map_err(|_| WireError::Utf8)
    }

    pub fn get_blob(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u64()? as usize;
        let bytes = self.take(len)?.to_vec();
        self.align();
        Ok(bytes)
    }

    /// Remaining unread body bytes.
    pub fn rest(&mut self) -> Vec<u8> {
        let out = self.body[self.offset..].to_vec();
        self.offset = self.body.len();
        out
    }
}

/// A dynamically typed SQLite value, used for parameters and columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl Value {
    pub fn type_code(&self) -> u8 {
        match self {
            Value::Integer(_) => TYPE_INTEGER,
            Value::Float(_) => TYPE_FLOAT,
            Value::Text(_) => TYPE_TEXT,
            Value::Blob(_) => TYPE_BLOB,
            Value::Null => TYPE_NULL,
        }
    }
}

fn put_params(msg: &mut Message, params: &[Value]) {
    if params.is_empty() {
        return;
    }
    msg.put_u8(params.len() as u8);
    for p in params {
        msg.put_u8(p.type_code());
    }
    msg.pad();
    for p in params {
        match p {
            Value::Integer(v) => msg.put_i64(*v),
            Value::Float(v) => msg.put_f64(*v),
            Value::Text(v) => msg.put_text(v),
            Value::Blob(v) => msg.put_blob(v),
            Value::Null => msg.put_u64(0),
        }
    }
}

fn get_params(msg: &mut Message) -> Result<Vec<Value>, WireError> {
    if msg.eom() {
        return Ok(Vec::new());
    }
    let count = msg.get_u8()? as usize;
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        types.push(msg.get_u8()?);
    }
    msg.align();
    let mut params = Vec::with_capacity(count);
    for t in types {
        params.push(match t {
            TYPE_INTEGER => Value::Integer(msg.get_i64()?),
            TYPE_FLOAT => Value::Float(msg.get_f64()?),
            TYPE_TEXT => Value::Text(msg.get_text()?),
            TYPE_BLOB => Value::Blob(msg.get_blob()?),
            TYPE_NULL => {
                msg.get_u64()?;
                Value::Null
            }
            other => return Err(WireError::UnknownValueType(other)),
        });
    }
    Ok(params)
}

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Helo {
        client_id: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    Open {
        name: String,
        flags: u64,
        vfs: String,
    },
    Prepare {
        db_id: u64,
        sql: String,
    },
    Exec {
        db_id: u64,
        stmt_id: u64,
        params: Vec<Value>,
    },
    Query {
        db_id: u64,
        stmt_id: u64,
        params: Vec<Value>,
    },
    Finalize {
        db_id: u64,
        stmt_id: u64,
    },
}

impl Request {
    /// Request name used in gateway error strings.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Helo { .. } => "helo",
            Request::Heartbeat { .. } => "heartbeat",
            Request::Open { .. } => "open",
            Request::Prepare { .. } => "prepare",
            Request::Exec { .. } => "exec",
            Request::Query { .. } => "query",
            Request::Finalize { .. } => "finalize",
        }
    }

    pub fn encode(&self) -> Message {
        match self {
            Request::Helo { client_id } => {
                let mut m = Message::new(REQUEST_HELO);
                m.put_u64(*client_id);
                m
            }
            Request::Heartbeat { timestamp } => {
                let mut m = Message::new(REQUEST_HEARTBEAT);
                m.put_u64(*timestamp);
                m
            }
            Request::Open { name, flags, vfs } => {
                let mut m = Message::new(REQUEST_OPEN);
                m.put_text(name);
                m.put_u64(*flags);
                m.put_text(vfs);
                m
            }
            Request::Prepare { db_id, sql } => {
                let mut m = Message::new(REQUEST_PREPARE);
                m.put_u64(*db_id);
                m.put_text(sql);
                m
            }
            Request::Exec {
                db_id,
                stmt_id,
                params,
            } => {
                let mut m = Message::new(REQUEST_EXEC);
                m.put_u32_pair(*db_id as u32, *stmt_id as u32);
                put_params(&mut m, params);
                m
            }
            Request::Query {
                db_id,
                stmt_id,
                params,
            } => {
                let mut m = Message::new(REQUEST_QUERY);
                m.put_u32_pair(*db_id as u32, *stmt_id as u32);
                put_params(&mut m, params);
                m
            }
            Request::Finalize { db_id, stmt_id } => {
                let mut m = Message::new(REQUEST_FINALIZE);
                m.put_u32_pair(*db_id as u32, *stmt_id as u32);
                m
            }
        }
    }

    pub fn decode(mut msg: Message) -> Result<Self, WireError> {
        match msg.mtype() {
            REQUEST_HELO => Ok(Request::Helo {
                client_id: msg.get_u64()?,
            }),
            REQUEST_HEARTBEAT => Ok(Request::Heartbeat {
                timestamp: msg.get_u64()?,
            }),
            REQUEST_OPEN => Ok(Request::Open {
                name: msg.get_text()?,
                flags: msg.get_u64()?,
                vfs: msg.get_text()?,
            }),
            REQUEST_PREPARE => Ok(Request::Prepare {
                db_id: msg.get_u64()?,
                sql: msg.get_text()?,
            }),
            REQUEST_EXEC => {
                let (db_id, stmt_id) = msg.get_u32_pair()?;
                Ok(Request::Exec {
                    db_id: db_id as u64,
                    stmt_id: stmt_id as u64,
                    params: get_params(&mut msg)?,
                })
            }
            REQUEST_QUERY => {
                let (db_id, stmt_id) = msg.get_u32_pair()?;
                Ok(Request::Query {
                    db_id: db_id as u64,
                    stmt_id: stmt_id as u64,
                    params: get_params(&mut msg)?,
                })
            }
            REQUEST_FINALIZE => {
                let (db_id, stmt_id) = msg.get_u32_pair()?;
                Ok(Request::Finalize {
                    db_id: db_id as u64,
                    stmt_id: stmt_id as u64,
                })
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// A gateway response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Welcome {
        leader: String,
    },
    Servers {
        addresses: Vec<String>,
    },
    Db {
        id: u32,
    },
    Stmt {
        db_id: u32,
        id: u32,
    },
    Result {
        last_insert_id: u64,
        rows_affected: u64,
    },
    Rows {
        payload: Vec<u8>,
        more: bool,
    },
    Empty,
    DbError {
        code: u64,
        extended: u64,
        description: String,
    },
}

impl Response {
    pub fn encode(&self) -> Message {
        match self {
            Response::Welcome { leader } => {
                let mut m = Message::new(RESPONSE_WELCOME);
                m.put_text(leader);
                m
            }
            Response::Servers { addresses } => {
                let mut m = Message::new(RESPONSE_SERVERS);
                for addr in addresses {
                    m.put_text(addr);
                }
                m.put_u64(0);
                m
            }
            Response::Db { id } => {
                let mut m = Message::new(RESPONSE_DB);
                m.put_u32_pair(*id, 0);
                m
            }
            Response::Stmt { db_id, id } => {
                let mut m = Message::new(RESPONSE_STMT);
                m.put_u32_pair(*db_id, *id);
                m
            }
            Response::Result {
                last_insert_id,
                rows_affected,
            } => {
                let mut m = Message::new(RESPONSE_RESULT);
                m.put_u64(*last_insert_id);
                m.put_u64(*rows_affected);
                m
            }
            Response::Rows { payload, more } => {
                let mut m = Message::new(RESPONSE_ROWS);
                m.put_raw(payload);
                if *more {
                    m.set_flags(FLAG_MORE);
                }
                m
            }
            Response::Empty => Message::new(RESPONSE_EMPTY),
            Response::DbError {
                code,
                extended,
                description,
            } => {
                let mut m = Message::new(RESPONSE_DB_ERROR);
                m.put_u64(*code);
                m.put_u64(*extended);
                m.put_text(description);
                m
            }
        }
    }

    pub fn decode(mut msg: Message) -> Result<Self, WireError> {
        match msg.mtype() {
            RESPONSE_WELCOME => Ok(Response::Welcome {
                leader: msg.get_text()?,
            }),
            RESPONSE_SERVERS => {
                let mut addresses = Vec::new();
                loop {
                    let len = msg.get_u64()?;
                    if len == 0 {
                        break;
                    }
                    // re-read the string from its length prefix
                    let bytes = msg.take(len as usize)?.to_vec();
                    msg.align();
                    addresses.push(String::from_utf8(bytes).map_err(|_| WireError::Utf8)?);
                }
                Ok(Response::Servers { addresses })
            }
            RESPONSE_DB => {
                let (id, _) = msg.get_u32_pair()?;
                Ok(Response::Db { id })
            }
            RESPONSE_STMT => {
                let (db_id, id) = msg.get_u32_pair()?;
                Ok(Response::Stmt { db_id, id })
            }
            RESPONSE_RESULT => Ok(Response::Result {
                last_insert_id: msg.get_u64()?,
                rows_affected: msg.get_u64()?,
            }),
            RESPONSE_ROWS => {
                let more = msg.flags() & FLAG_MORE != 0;
                Ok(Response::Rows {
                    payload: msg.rest(),
                    more,
                })
            }
            RESPONSE_EMPTY => Ok(Response::Empty),
            RESPONSE_DB_ERROR => Ok(Response::DbError {
                code: msg.get_u64()?,
                extended: msg.get_u64()?,
                description: msg.get_text()?,
            }),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Serialises query result rows into a ROWS payload under a word budget.
pub struct RowsWriter {
    msg: Message,
    budget_bytes: usize,
}

impl RowsWriter {
    pub fn new(budget_words: usize) -> Self {
        Self {
            msg: Message::new(RESPONSE_ROWS),
            budget_bytes: budget_words * WORD,
        }
    }

    /// Write one row's type header: 4-bit codes packed into u64 words,
    /// column 0 in the low nibble of byte 0.
    pub fn row_header(&mut self, types: &[u8]) {
        let words = types.len().div_ceil(16).max(1);
        let mut buf = vec![0u8; words * WORD];
        for (i, t) in types.iter().enumerate() {
            let byte = i / 2;
            if i % 2 == 0 {
                buf[byte] |= t & 0x0f;
            } else {
                buf[byte] |= (t & 0x0f) << 4;
            }
        }
        self.msg.put_raw(&buf);
    }

    pub fn col_i64(&mut self, v: i64) {
        self.msg.put_i64(v);
    }

    pub fn col_f64(&mut self, v: f64) {
        self.msg.put_f64(v);
    }

    pub fn col_text(&mut self, v: &str) {
        self.msg.put_text(v);
    }

    pub fn col_blob(&mut self, v: &[u8]) {
        self.msg.put_blob(v);
    }

    pub fn col_null(&mut self) {
        self.msg.put_u64(0);
    }

    /// True once the budget is consumed; the current row is always written
    /// in full before this is consulted.
    pub fn is_full(&self) -> bool {
        self.msg.body().len() >= self.budget_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.msg.body().is_empty()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.msg.into_body()
    }
}

/// Reads rows back out of a ROWS payload, given the column count.
pub struct RowsReader {
    msg: Message,
    columns: usize,
}

impl RowsReader {
    pub fn new(payload: Vec<u8>, columns: usize) -> Result<Self, WireError> {
        Ok(Self {
            msg: Message::from_parts(RESPONSE_ROWS, 0, payload)?,
            columns,
        })
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>, WireError> {
        if self.msg.eom() {
            return Ok(None);
        }
        let header_words = self.columns.div_ceil(16).max(1);
        let mut types = Vec::with_capacity(self.columns);
        for w in 0..header_words {
            let word = self.msg.get_u64()?;
            for i in 0..16 {
                let col = w * 16 + i;
                if col >= self.columns {
                    break;
                }
                types.push(((word >> (i * 4)) & 0x0f) as u8);
            }
        }
        let mut row = Vec::with_capacity(self.columns);
        for t in types {
            row.push(match t {
                TYPE_INTEGER => Value::Integer(self.msg.get_i64()?),
                TYPE_FLOAT => Value::Float(self.msg.get_f64()?),
                TYPE_TEXT => Value::Text(self.msg.get_text()?),
                TYPE_BLOB => Value::Blob(self.msg.get_blob()?),
                TYPE_NULL => {
                    self.msg.get_u64()?;
                    Value::Null
                }
                other => return Err(WireError::UnknownValueType(other)),
            });
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: Request) {
        let msg = req.encode();
        assert_eq!(msg.body().len() % WORD, 0);
        let bytes = msg.encode();
        let mut hdr = [0u8; HEADER];
        hdr.copy_from_slice(&bytes[..HEADER]);
        let (len, mtype, flags) = Message::decode_header(&hdr).unwrap();
        assert_eq!(len, bytes.len() - HEADER);
        let decoded =
            Request::decode(Message::from_parts(mtype, flags, bytes[HEADER..].to_vec()).unwrap())
                .unwrap();
        assert_eq!(decoded, req);
    }

    fn roundtrip_response(resp: Response) {
        let msg = resp.encode();
        assert_eq!(msg.body().len() % WORD, 0);
        let bytes = msg.encode();
        let mut hdr = [0u8; HEADER];
        hdr.copy_from_slice(&bytes[..HEADER]);
        let (len, mtype, flags) = Message::decode_header(&hdr).unwrap();
        assert_eq!(len, bytes.len() - HEADER);
        let decoded =
            Response::decode(Message::from_parts(mtype, flags, bytes[HEADER..].to_vec()).unwrap())
                .unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn request_roundtrips() {
        roundtrip_request(Request::Helo { client_id: 123 });
        roundtrip_request(Request::Heartbeat { timestamp: 12345 });
        roundtrip_request(Request::Open {
            name: "test.db".into(),
            flags: 6,
            vfs: "volatile".into(),
        });
        roundtrip_request(Request::Prepare {
            db_id: 0,
            sql: "CREATE TABLE foo (n INT)".into(),
        });
        roundtrip_request(Request::Exec {
            db_id: 0,
            stmt_id: 1,
            params: vec![],
        });
        roundtrip_request(Request::Exec {
            db_id: 0,
            stmt_id: 1,
            params: vec![
                Value::Integer(1),
                Value::Text("hello".into()),
                Value::Null,
                Value::Float(3.25),
                Value::Blob(vec![1, 2, 3]),
            ],
        });
        roundtrip_request(Request::Query {
            db_id: 2,
            stmt_id: 7,
            params: vec![Value::Integer(-1)],
        });
        roundtrip_request(Request::Finalize {
            db_id: 0,
            stmt_id: 0,
        });
    }

    #[test]
    fn response_roundtrips() {
        roundtrip_response(Response::Welcome {
            leader: "127.0.0.1:666".into(),
        });
        roundtrip_response(Response::Servers {
            addresses: vec!["1.2.3.4:666".into(), "5.6.7.8:666".into()],
        });
        roundtrip_response(Response::Db { id: 0 });
        roundtrip_response(Response::Stmt { db_id: 0, id: 1 });
        roundtrip_response(Response::Result {
            last_insert_id: 1,
            rows_affected: 1,
        });
        roundtrip_response(Response::Empty);
        roundtrip_response(Response::DbError {
            code: 21,
            extended: 21,
            description: "bad parameter or other API misuse".into(),
        });
        let mut w = RowsWriter::new(4096);
        w.row_header(&[TYPE_INTEGER]);
        w.col_i64(-12);
        roundtrip_response(Response::Rows {
            payload: w.into_payload(),
            more: false,
        });
    }

    #[test]
    fn header_layout() {
        let mut m = Message::new(REQUEST_HELO);
        m.put_u64(7);
        let bytes = m.encode();
        // one body word, little-endian
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(bytes[4], REQUEST_HELO);
        assert_eq!(bytes[5], 0);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn single_integer_row_layout() {
        // One INTEGER column holding -12: a header word whose low byte is
        // the INTEGER code, then the value, 16 bytes in total.
        let mut w = RowsWriter::new(4096);
        w.row_header(&[TYPE_INTEGER]);
        w.col_i64(-12);
        let payload = w.into_payload();
        assert_eq!(payload.len(), 16);
        assert_eq!(payload[0], TYPE_INTEGER);
        assert_eq!(LittleEndian::read_u64(&payload[0..8]) & 0x0f, 1);
        assert_eq!(LittleEndian::read_i64(&payload[8..16]), -12);
    }

    #[test]
    fn multi_column_header_nibbles() {
        let mut w = RowsWriter::new(4096);
        w.row_header(&[TYPE_INTEGER, TYPE_TEXT, TYPE_NULL]);
        w.col_i64(8);
        w.col_text("hello");
        w.col_null();
        let payload = w.into_payload();
        assert_eq!(payload[0] & 0x0f, TYPE_INTEGER);
        assert_eq!(payload[0] >> 4, TYPE_TEXT);
        assert_eq!(payload[1] & 0x0f, TYPE_NULL);

        let mut r = RowsReader::new(payload, 3).unwrap();
        let row = r.next_row().unwrap().unwrap();
        assert_eq!(
            row,
            vec![
                Value::Integer(8),
                Value::Text("hello".into()),
                Value::Null
            ]
        );
        assert!(r.next_row().unwrap().is_none());
    }

    #[test]
    fn text_padding_is_zeroed() {
        let mut m = Message::new(REQUEST_OPEN);
        m.put_text("abc");
        // length word + 3 bytes padded to 8
        assert_eq!(m.body().len(), 16);
        assert_eq!(&m.body()[8..11], b"abc");
        assert_eq!(&m.body()[11..16], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_body_is_detected() {
        let mut m = Message::from_parts(REQUEST_HELO, 0, vec![0u8; 8]).unwrap();
        m.get_u64().unwrap();
        assert!(m.eom());
        assert!(matches!(
            m.get_u64(),
            Err(WireError::ShortBody { .. })
        ));
    }

    #[test]
    fn unaligned_body_rejected() {
        assert!(matches!(
            Message::from_parts(REQUEST_HELO, 0, vec![0u8; 7]),
            Err(WireError::Unaligned(7))
        ));
    }
}
