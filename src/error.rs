use std::io;
use thiserror::Error;

use crate::protocol::TableId;

/// type alias for all operations in this crate that could fail with a [`CacheError`]
pub type Result<T> = std::result::Result<T, CacheError>;

/// The error variants returned by the connector, the cached tables and the master server.
///
/// Lower level errors from `std::io` and `serde_json` are wrapped, everything else carries a
/// description of what went wrong.
#[derive(Error, Debug)]
pub enum CacheError {
    /// variant for errors caused by socket or file IO
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// variant for configuration files that could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// the peer sent bytes that do not follow the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// the master server could not complete a request and reported why
    #[error("server error: {0}")]
    Server(String),

    /// the handshake was refused by the master server
    #[error("handshake refused: {0}")]
    Handshake(String),

    /// a row addressed by key does not exist
    #[error("row not found in table {0}")]
    RowNotFound(TableId),

    /// a unique column lookup found more than one row with the same value
    #[error("duplicate value in unique column {column} of table {table}")]
    NotUnique {
        /// the table holding the duplicates
        table: TableId,
        /// the column expected to be unique
        column: usize,
    },

    /// a column index beyond the columns a row type exposes
    #[error("table {table} has no column {column}")]
    NoSuchColumn {
        /// the table that was queried
        table: TableId,
        /// the requested column
        column: usize,
    },

    /// two different row types were registered under the same table id
    #[error("table {0} is already registered with a different row type")]
    TableTypeMismatch(TableId),

    /// no connection became available within the checkout timeout
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// the configuration could not be used
    #[error("configuration error: {0}")]
    Config(String),

    /// a value could not be parsed from a command line or a file
    #[error("parsing error: {0}")]
    Parsing(String),
}
