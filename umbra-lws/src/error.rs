//! Error types for the light-wallet server.

/// Top level error enumerating any failure the server may report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cooperative cancellation fired while scanning or waiting on the daemon.
    #[error("scan aborted")]
    AbortScan,
    /// Tried to create an account that already exists.
    #[error("account already exists")]
    AccountExists,
    /// Invalid base58 public address.
    #[error("invalid base58 address")]
    BadAddress,
    /// Account has an address/viewkey mismatch.
    #[error("address and view key do not match")]
    BadViewKey,
    /// Local chain is invalid or belongs to a different network.
    #[error("blockchain is invalid or wrong network type")]
    BadBlockchain,
    /// Chain reorg detected after fetching/scanning block(s).
    #[error("blockchain reorg detected during commit")]
    BlockchainReorg,
    /// Reached the maximum number of pending account requests.
    #[error("pending account creation queue is full")]
    CreateQueueMax,
    /// Daemon request timed out or the connection was lost.
    #[error("daemon connection failure")]
    DaemonConnectionFailure,
    /// Account already has a pending request of this type.
    #[error("account already has a pending request of this type")]
    DuplicateRequest,
    /// Account address is not in the database, or is hidden.
    #[error("no such account")]
    NoSuchAccount,
    /// System clock is out of range for the storage format.
    #[error("system clock is out of range for storage format")]
    SystemClockInvalidRange,
    /// Transport error.
    #[error("transport error. {0}")]
    Transport(#[from] TransportError),
    /// Storage error.
    #[error("storage error. {0}")]
    Storage(#[from] StorageError),
    /// Scan error.
    #[error("scan error. {0}")]
    Scan(#[from] ScanError),
}

/// Errors from the daemon transport below the request/response layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket I/O failure.
    #[error("socket error. {0}")]
    Io(#[from] std::io::Error),
    /// Frame could not be decoded as a JSON message.
    #[error("invalid message frame. {0}")]
    Json(#[from] serde_json::Error),
    /// Daemon closed the connection.
    #[error("daemon closed the connection")]
    ConnectionClosed,
    /// Daemon replied to a different method than the one requested.
    #[error("daemon replied to \"{got}\", expected \"{expected}\"")]
    UnexpectedResponse {
        /// Method name the reply carried.
        got: String,
        /// Method name that was requested.
        expected: &'static str,
    },
    /// Daemon reported an error for the request.
    #[error("daemon error reply: {0}")]
    ErrorReply(String),
}

/// Errors from the durable account store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Backend database failure.
    #[error("database error. {0}")]
    Backend(#[from] rocksdb::Error),
    /// A stored record did not decode; the database is corrupt.
    #[error("corrupt record in table {0}")]
    CorruptRecord(&'static str),
    /// A required column family is missing; the database is corrupt.
    #[error("missing column family {0}")]
    MissingTable(&'static str),
    /// A required key is missing; the database is corrupt.
    #[error("missing {0}")]
    MissingRecord(&'static str),
}

/// Errors raised while scanning transactions. Fatal for the worker.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Transaction version is newer than this server understands.
    #[error("unsupported transaction version {0}")]
    UnsupportedTxVersion(u64),
    /// Daemon response did not pair every transaction with its output ids.
    #[error("daemon response missing output indices for a transaction")]
    MissingOutputIndices,
    /// Daemon response block/transaction counts disagree.
    #[error("bad daemon response. {0}")]
    BadDaemonResponse(&'static str),
}
