//! Server-side storage for the reference master server.
//!
//! The master stores rows as opaque bytes keyed by opaque key bytes: only clients know what a
//! row means. Every mutation reports the tables it made stale as an [`InvalidateList`], which
//! the server returns to the caller and pushes to every listening client.
use crate::protocol::{InvalidateList, TableId};
use crate::Result;

/// A trait for the storage behind a master server
pub trait TableStore: Clone + Send + 'static {
    /// every row of `table`, ordered by key bytes
    ///
    /// A table nothing was ever written to is empty.
    fn rows(&self, table: TableId) -> Result<Vec<Vec<u8>>>;

    /// the row of `table` with the given key
    ///
    /// Returns `None` if there is no such row.
    fn row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// the number of rows in `table`
    fn count(&self, table: TableId) -> Result<usize>;

    /// adds a row, replacing any row with the same key
    fn put(&self, table: TableId, key: Vec<u8>, row: Vec<u8>) -> Result<InvalidateList>;

    /// removes the row with the given key
    ///
    /// # Errors
    ///
    /// Returns `CacheError::RowNotFound` if there is no such row.
    fn remove(&self, table: TableId, key: &[u8]) -> Result<InvalidateList>;

    /// reports `table` as changed without changing it
    fn invalidate(&self, table: TableId) -> Result<InvalidateList>;
}

mod memory;

pub use self::memory::MemoryStore;
