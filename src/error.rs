use thiserror::Error;

/// Control-flow signals from [`crate::dict::Dict`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DictError {
    #[error("key exists")]
    KeyExists,

    #[error("key does not exist")]
    NotFound,

    /// Already rehashing, or the requested size does not grow the table.
    #[error("expand error: requested {requested} buckets, current {current}")]
    Expand { requested: usize, current: usize },
}

/// Malformed or oversized client input. Always fatal to the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("too big inline cmd")]
    TooLongInline,

    #[error("too big bulk: {0} bytes")]
    TooBigBulk(usize),

    #[error("expect $ for bulk length")]
    ExpectedBulkLength,

    #[error("invalid length: {0}")]
    InvalidLength(String),

    #[error("expect CRLF for bulk end")]
    MissingCrlf,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("poller error: {0}")]
    Poller(#[from] nix::Error),
}
