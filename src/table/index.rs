use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{CacheError, Result};
use crate::row::{Row, Value};

/// One point-in-time copy of a table, together with every index built over it.
///
/// The indexes live inside the snapshot so that dropping the snapshot drops them too: a lookup
/// through any index can only ever see the rows the primary key map sees.
pub(crate) struct Snapshot<R: Row> {
    // every row, in `Row::compare` order
    rows: Arc<[Arc<R>]>,

    // primary key lookups
    by_key: HashMap<R::Key, Arc<R>>,

    // column number -> (value -> the only row holding it), built on first use
    unique: DashMap<usize, Arc<HashMap<Value, Arc<R>>>>,

    // column number -> (value -> rows holding it, in table order), built on first use
    indexed: DashMap<usize, Arc<HashMap<Value, Vec<Arc<R>>>>>,
}

impl<R: Row> Snapshot<R> {
    /// sorts `rows` and builds the primary key map
    ///
    /// # Errors
    /// returns [`CacheError::Protocol`] if two rows share a primary key
    pub(crate) fn build(rows: Vec<R>) -> Result<Self> {
        let mut rows: Vec<Arc<R>> = rows.into_iter().map(Arc::new).collect();
        rows.sort_by(|a, b| a.compare(b));

        let mut by_key = HashMap::with_capacity(rows.len());
        for row in &rows {
            if by_key.insert(row.key(), Arc::clone(row)).is_some() {
                return Err(CacheError::Protocol(format!(
                    "duplicate primary key {:?} in table {}",
                    row.key(),
                    R::TABLE_NAME
                )));
            }
        }

        Ok(Snapshot {
            rows: rows.into(),
            by_key,
            unique: DashMap::new(),
            indexed: DashMap::new(),
        })
    }

    pub(crate) fn rows(&self) -> Arc<[Arc<R>]> {
        Arc::clone(&self.rows)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn get(&self, key: &R::Key) -> Option<Arc<R>> {
        self.by_key.get(key).cloned()
    }

    /// the unique index over `column`, building it if this is the first lookup
    ///
    /// # Errors
    /// returns [`CacheError::NotUnique`] if two rows share a non-null value in `column`
    pub(crate) fn unique_index(&self, column: usize) -> Result<Arc<HashMap<Value, Arc<R>>>> {
        check_column::<R>(column)?;
        if let Some(index) = self.unique.get(&column) {
            return Ok(Arc::clone(index.value()));
        }

        let mut index = HashMap::with_capacity(self.rows.len());
        for row in self.rows.iter() {
            let value = column_value::<R>(row, column)?;
            if value.is_null() {
                continue;
            }
            if index.insert(value, Arc::clone(row)).is_some() {
                return Err(CacheError::NotUnique {
                    table: R::TABLE_ID,
                    column,
                });
            }
        }

        let index = self.unique.entry(column).or_insert_with(|| Arc::new(index));
        Ok(Arc::clone(index.value()))
    }

    /// the non-unique index over `column`, building it if this is the first lookup
    pub(crate) fn column_index(&self, column: usize) -> Result<Arc<HashMap<Value, Vec<Arc<R>>>>> {
        check_column::<R>(column)?;
        if let Some(index) = self.indexed.get(&column) {
            return Ok(Arc::clone(index.value()));
        }

        let mut index: HashMap<Value, Vec<Arc<R>>> = HashMap::new();
        for row in self.rows.iter() {
            let value = column_value::<R>(row, column)?;
            if value.is_null() {
                continue;
            }
            index.entry(value).or_default().push(Arc::clone(row));
        }

        let index = self.indexed.entry(column).or_insert_with(|| Arc::new(index));
        Ok(Arc::clone(index.value()))
    }
}

fn check_column<R: Row>(column: usize) -> Result<()> {
    if column < R::COLUMN_COUNT {
        Ok(())
    } else {
        Err(CacheError::NoSuchColumn {
            table: R::TABLE_ID,
            column,
        })
    }
}

// a row that refuses a column below COLUMN_COUNT is reported the same way as a bad column number
fn column_value<R: Row>(row: &R, column: usize) -> Result<Value> {
    row.column(column).ok_or(CacheError::NoSuchColumn {
        table: R::TABLE_ID,
        column,
    })
}
