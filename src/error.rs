use std::fmt::Display;

/// Wire error codes for failure kinds that do not originate in SQLite.
///
/// SQLite failures travel as DB_ERROR responses carrying the engine's own
/// result code; everything else is mapped onto these so a single response
/// shape covers the whole taxonomy.
pub const CODE_NOT_LEADER: u64 = 1;
pub const CODE_BUSY: u64 = 5;
pub const CODE_IO: u64 = 10;
pub const CODE_NOT_FOUND: u64 = 12;

/// A specialized error type for engine operations.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-sequence request. Closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Unknown database or statement id.
    #[error("{0}")]
    NotFound(String),
    /// SQLite failure, left finalizable.
    #[error("database error {code}: {description}")]
    Db {
        code: u64,
        extended: u64,
        description: String,
    },
    /// Write attempted on a node that is not the leader.
    #[error("not leader, try {leader}")]
    NotLeader { leader: String },
    /// Local disk or VFS failure.
    #[error("io error: {0}")]
    Io(String),
    /// Replication in flight, retry later.
    #[error("busy")]
    Busy,
}

impl Error {
    /// Create a not-found error from a displayable value.
    pub fn not_found<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::NotFound(msg.to_string())
    }

    /// Create a protocol error from a displayable value.
    pub fn protocol<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Protocol(msg.to_string())
    }

    /// Wire code carried by the DB_ERROR response for this kind.
    pub fn wire_code(&self) -> u64 {
        match self {
            Error::Protocol(_) => CODE_NOT_FOUND,
            Error::NotFound(_) => CODE_NOT_FOUND,
            Error::Db { code, .. } => *code,
            Error::NotLeader { .. } => CODE_NOT_LEADER,
            Error::Io(_) => CODE_IO,
            Error::Busy => CODE_BUSY,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                let extended = e.extended_code as u64;
                let description = match msg {
                    Some(m) => m,
                    None => e.to_string(),
                };
                Error::Db {
                    code: extended & 0xff,
                    extended,
                    description,
                }
            }
            other => Error::Db {
                code: rusqlite::ffi::SQLITE_ERROR as u64,
                extended: rusqlite::ffi::SQLITE_ERROR as u64,
                description: other.to_string(),
            },
        }
    }
}

/// A Result type alias for engine operations.
pub type RoostResult<T> = Result<T, Error>;
