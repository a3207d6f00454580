use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};

use super::TableStore;
use crate::error::{CacheError, Result};
use crate::protocol::{InvalidateList, TableId};

/// An in-memory [`TableStore`], cheap to clone and shared by every connection thread.
///
/// Each table is a `BTreeMap` from key bytes to row bytes inside a concurrent `DashMap`, so
/// writers to different tables do not contend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: DashMap<TableId, BTreeMap<Vec<u8>, Vec<u8>>>,

    // table -> tables derived from it, which go stale whenever it changes
    dependents: HashMap<TableId, Vec<TableId>>,
}

impl MemoryStore {
    /// creates an empty store with no table dependencies
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// creates an empty store where a change to a table also invalidates its dependents,
    /// and their dependents in turn
    pub fn with_dependents(dependents: HashMap<TableId, Vec<TableId>>) -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                tables: DashMap::new(),
                dependents,
            }),
        }
    }

    /// `table` plus everything that transitively depends on it
    fn invalidations_for(&self, table: TableId) -> InvalidateList {
        let mut list = InvalidateList::new();
        let mut pending = VecDeque::from(vec![table]);
        while let Some(next) = pending.pop_front() {
            if list.add(next) {
                if let Some(dependents) = self.inner.dependents.get(&next) {
                    pending.extend(dependents.iter().copied());
                }
            }
        }
        list
    }
}

impl TableStore for MemoryStore {
    fn rows(&self, table: TableId) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .inner
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn row(&self, table: TableId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .tables
            .get(&table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn count(&self, table: TableId) -> Result<usize> {
        Ok(self.inner.tables.get(&table).map_or(0, |rows| rows.len()))
    }

    #[instrument(skip(self, key, row), fields(key_len = key.len(), row_len = row.len()))]
    fn put(&self, table: TableId, key: Vec<u8>, row: Vec<u8>) -> Result<InvalidateList> {
        let replaced = self
            .inner
            .tables
            .entry(table)
            .or_default()
            .insert(key, row)
            .is_some();
        debug!(replaced, "stored row");
        Ok(self.invalidations_for(table))
    }

    #[instrument(skip(self, key))]
    fn remove(&self, table: TableId, key: &[u8]) -> Result<InvalidateList> {
        let removed = self
            .inner
            .tables
            .get_mut(&table)
            .and_then(|mut rows| rows.remove(key));
        match removed {
            Some(_) => Ok(self.invalidations_for(table)),
            None => Err(CacheError::RowNotFound(table)),
        }
    }

    fn invalidate(&self, table: TableId) -> Result<InvalidateList> {
        Ok(self.invalidations_for(table))
    }
}
