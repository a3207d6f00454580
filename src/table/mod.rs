//! Client-side caching tables.
//!
//! A [`CachedTable`] holds every row of one entity type. The first access loads the whole table
//! from a [`RowSource`] and every later access is answered from memory, through the primary key,
//! a unique column, an indexed column or ordered iteration, until the table is invalidated.
//! Invalidation throws the snapshot and all of its indexes away at once; the next access loads a
//! fresh copy.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::protocol::{ProtocolVersion, TableId};
use crate::row::{Row, Value};

mod index;
mod listener;

use self::index::Snapshot;
use self::listener::Listeners;
pub use self::listener::{ListenerId, TableListener};

/// The raw contents of a table as sent by the master server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRows {
    /// the protocol version the rows are encoded in
    pub version: ProtocolVersion,
    /// one encoded row per element
    pub rows: Vec<Vec<u8>>,
}

/// Where a [`CachedTable`] loads its rows from.
///
/// The [`MasterConnector`] is the real source; tests substitute their own.
///
/// [`MasterConnector`]: ../struct.MasterConnector.html
pub trait RowSource: Send + Sync {
    /// fetches every row of `table`
    fn fetch_table(&self, table: TableId) -> Result<TableRows>;
}

/// The type-erased face of a cached table, used to invalidate tables by id.
pub trait CacheControl: Send + Sync {
    /// the id of the table
    fn table_id(&self) -> TableId;

    /// the human readable name of the table
    fn table_name(&self) -> &'static str;

    /// drops the cached snapshot together with every index built over it
    fn clear_cache(&self);

    /// returns true if a snapshot is currently cached
    fn is_loaded(&self) -> bool;
}

/// A read-through cache of every row of the entity type `R`.
pub struct CachedTable<R: Row> {
    source: Arc<dyn RowSource>,

    // the current snapshot, `None` until loaded and after each invalidation
    snapshot: RwLock<Option<Arc<Snapshot<R>>>>,

    // held while loading so concurrent first accesses share one round trip
    load_lock: Mutex<()>,

    // bumped on every invalidation; a load only installs its snapshot if this did not move
    generation: AtomicU64,

    listeners: Listeners,
}

impl<R: Row> CachedTable<R> {
    /// creates an empty table that will load from `source` on first use
    pub fn new(source: Arc<dyn RowSource>) -> Self {
        CachedTable {
            source,
            snapshot: RwLock::new(None),
            load_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            listeners: Listeners::new(R::TABLE_ID),
        }
    }

    /// every row, in [`Row::compare`] order
    pub fn rows(&self) -> Result<Arc<[Arc<R>]>> {
        Ok(self.snapshot()?.rows())
    }

    /// the row with primary key `key`
    pub fn get(&self, key: &R::Key) -> Result<Option<Arc<R>>> {
        Ok(self.snapshot()?.get(key))
    }

    /// the row whose `column` holds `value`, for columns that are unique across the table.
    ///
    /// A null `value` never matches.
    ///
    /// # Errors
    /// returns [`CacheError::NotUnique`] if more than one row holds the same non-null value in
    /// `column`, and [`CacheError::NoSuchColumn`] for a column `R` does not have.
    ///
    /// [`CacheError::NotUnique`]: ../enum.CacheError.html
    /// [`CacheError::NoSuchColumn`]: ../enum.CacheError.html
    pub fn get_unique(&self, column: usize, value: &Value) -> Result<Option<Arc<R>>> {
        let index = self.snapshot()?.unique_index(column)?;
        Ok(index.get(value).cloned())
    }

    /// every row whose `column` holds `value`, in [`Row::compare`] order.
    ///
    /// A null `value` never matches.
    pub fn get_indexed(&self, column: usize, value: &Value) -> Result<Vec<Arc<R>>> {
        let index = self.snapshot()?.column_index(column)?;
        Ok(index.get(value).cloned().unwrap_or_default())
    }

    /// the number of rows, loading the table if needed
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// returns true if the table has no rows, loading the table if needed
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// calls `listener` after every invalidation of this table; invalidations within `delay` of
    /// each other produce a single call
    pub fn add_listener<L: TableListener>(&self, listener: L, delay: Duration) -> Result<ListenerId> {
        self.listeners.add(Arc::new(listener), delay)
    }

    /// stops calling a listener, returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// the number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn cached(&self) -> Option<Arc<Snapshot<R>>> {
        self.snapshot.read().clone()
    }

    /// returns the cached snapshot, loading one from the source if there is none
    fn snapshot(&self) -> Result<Arc<Snapshot<R>>> {
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }

        let _loading = self.load_lock.lock();
        // another thread may have finished loading while we waited
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }
        self.load()
    }

    #[instrument(skip(self), fields(table = R::TABLE_NAME))]
    fn load(&self) -> Result<Arc<Snapshot<R>>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let TableRows { version, rows } = self.source.fetch_table(R::TABLE_ID)?;
        let rows = rows
            .iter()
            .map(|bytes| R::from_bytes(bytes, version))
            .collect::<Result<Vec<R>>>()?;
        let snapshot = Arc::new(Snapshot::build(rows)?);
        debug!(rows = snapshot.len(), %version, "loaded table");

        let mut slot = self.snapshot.write();
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&snapshot));
        } else {
            // invalidated mid-load: the rows may predate the change, so only this caller sees them
            debug!("table invalidated while loading, snapshot not cached");
        }
        Ok(snapshot)
    }
}

impl<R: Row> CacheControl for CachedTable<R> {
    fn table_id(&self) -> TableId {
        R::TABLE_ID
    }

    fn table_name(&self) -> &'static str {
        R::TABLE_NAME
    }

    fn clear_cache(&self) {
        {
            let mut slot = self.snapshot.write();
            self.generation.fetch_add(1, Ordering::SeqCst);
            *slot = None;
        }
        debug!(table = R::TABLE_NAME, "cleared cache");
        self.listeners.notify();
    }

    fn is_loaded(&self) -> bool {
        self.snapshot.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::protocol::stream::{ReadExt, WriteExt};
    use crossbeam::channel;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct Mailbox {
        id: i32,
        domain: i32,
        address: String,
        forward: Option<String>,
    }

    impl Row for Mailbox {
        type Key = i32;
        const TABLE_ID: TableId = TableId(21);
        const TABLE_NAME: &'static str = "mailboxes";
        const COLUMN_COUNT: usize = 4;

        fn key(&self) -> i32 {
            self.id
        }

        fn column(&self, index: usize) -> Option<Value> {
            match index {
                0 => Some(self.id.into()),
                1 => Some(self.domain.into()),
                2 => Some(self.address.as_str().into()),
                3 => Some(self.forward.clone().into()),
                _ => None,
            }
        }

        fn read_from<R: Read + ?Sized>(reader: &mut R, _version: ProtocolVersion) -> Result<Self> {
            Ok(Mailbox {
                id: reader.read_compressed_int()?,
                domain: reader.read_compressed_int()?,
                address: reader.read_utf()?,
                forward: reader.read_nullable_utf()?,
            })
        }

        fn write_to<W: Write + ?Sized>(&self, writer: &mut W, _version: ProtocolVersion) -> Result<()> {
            writer.write_compressed_int(self.id)?;
            writer.write_compressed_int(self.domain)?;
            writer.write_utf(&self.address)?;
            writer.write_nullable_utf(self.forward.as_deref())
        }
    }

    fn mailbox(id: i32, domain: i32, address: &str, forward: Option<&str>) -> Mailbox {
        Mailbox {
            id,
            domain,
            address: address.to_string(),
            forward: forward.map(String::from),
        }
    }

    /// serves a fixed set of rows and counts fetches
    struct FixedSource {
        rows: Mutex<Vec<Mailbox>>,
        fetches: AtomicUsize,
    }

    impl FixedSource {
        fn new(rows: Vec<Mailbox>) -> Arc<Self> {
            Arc::new(FixedSource {
                rows: Mutex::new(rows),
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl RowSource for FixedSource {
        fn fetch_table(&self, table: TableId) -> Result<TableRows> {
            assert_eq!(table, Mailbox::TABLE_ID);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let rows = self
                .rows
                .lock()
                .iter()
                .map(|row| row.to_bytes(ProtocolVersion::CURRENT))
                .collect::<Result<Vec<_>>>()?;
            Ok(TableRows {
                version: ProtocolVersion::CURRENT,
                rows,
            })
        }
    }

    fn sample() -> Vec<Mailbox> {
        vec![
            mailbox(3, 10, "sales@example.com", None),
            mailbox(1, 10, "info@example.com", Some("ops@example.net")),
            mailbox(2, 11, "info@example.org", Some("ops@example.net")),
        ]
    }

    #[test]
    fn loads_once_and_answers_from_memory() {
        let source = FixedSource::new(sample());
        let table: CachedTable<Mailbox> = CachedTable::new(source.clone());
        assert!(!table.is_loaded());

        assert_eq!(table.len().unwrap(), 3);
        assert_eq!(table.get(&2).unwrap().unwrap().address, "info@example.org");
        assert!(table.get(&99).unwrap().is_none());
        assert_eq!(table.get_indexed(1, &Value::Int(10)).unwrap().len(), 2);
        assert!(table.is_loaded());
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn rows_iterate_in_key_order() {
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(sample()));
        let ids: Vec<i32> = table.rows().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let in_domain: Vec<i32> = table
            .get_indexed(1, &Value::Int(10))
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(in_domain, vec![1, 3]);
    }

    #[test]
    fn unique_lookup_skips_nulls_and_rejects_duplicates() {
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(sample()));
        let found = table
            .get_unique(2, &Value::from("sales@example.com"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, 3);
        assert!(table.get_unique(2, &Value::Null).unwrap().is_none());

        let err = table
            .get_unique(3, &Value::from("ops@example.net"))
            .unwrap_err();
        assert!(matches!(err, CacheError::NotUnique { column: 3, .. }));
    }

    #[test]
    fn unknown_column_is_an_error() {
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(sample()));
        let err = table.get_indexed(4, &Value::Int(1)).unwrap_err();
        assert!(matches!(err, CacheError::NoSuchColumn { column: 4, .. }));
    }

    #[test]
    fn clear_cache_drops_rows_and_indexes_together() {
        let source = FixedSource::new(sample());
        let table: CachedTable<Mailbox> = CachedTable::new(source.clone());
        assert_eq!(table.get_indexed(1, &Value::Int(11)).unwrap().len(), 1);

        source.rows.lock().push(mailbox(4, 11, "abuse@example.org", None));
        // still the old snapshot until invalidated
        assert_eq!(table.get_indexed(1, &Value::Int(11)).unwrap().len(), 1);

        table.clear_cache();
        assert!(!table.is_loaded());
        assert_eq!(table.get_indexed(1, &Value::Int(11)).unwrap().len(), 2);
        assert!(table.get(&4).unwrap().is_some());
        assert_eq!(source.fetches(), 2);
    }

    #[test]
    fn duplicate_primary_keys_are_rejected() {
        let mut rows = sample();
        rows.push(mailbox(1, 12, "dup@example.com", None));
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(rows));
        assert!(matches!(table.len().unwrap_err(), CacheError::Protocol(_)));
        assert!(!table.is_loaded());
    }

    /// invalidates the table while it is being fetched
    struct RacingSource {
        inner: Arc<FixedSource>,
        table: Mutex<Option<Arc<CachedTable<Mailbox>>>>,
    }

    impl RowSource for RacingSource {
        fn fetch_table(&self, table: TableId) -> Result<TableRows> {
            let rows = self.inner.fetch_table(table)?;
            if let Some(cached) = self.table.lock().take() {
                cached.clear_cache();
            }
            Ok(rows)
        }
    }

    #[test]
    fn load_racing_an_invalidation_is_not_cached() {
        let source = Arc::new(RacingSource {
            inner: FixedSource::new(sample()),
            table: Mutex::new(None),
        });
        let table = Arc::new(CachedTable::<Mailbox>::new(source.clone()));
        *source.table.lock() = Some(Arc::clone(&table));

        // the caller still gets the rows it asked for
        assert_eq!(table.len().unwrap(), 3);
        assert!(!table.is_loaded());

        assert_eq!(table.len().unwrap(), 3);
        assert!(table.is_loaded());
        assert_eq!(source.inner.fetches(), 2);
    }

    #[test]
    fn listeners_hear_about_invalidations() {
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(sample()));
        let (tx, rx) = channel::unbounded();
        let id = table
            .add_listener(move |t: TableId| tx.send(t).unwrap(), Duration::from_millis(0))
            .unwrap();

        table.clear_cache();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Mailbox::TABLE_ID
        );

        assert!(table.remove_listener(id));
        assert!(!table.remove_listener(id));
        assert_eq!(table.listener_count(), 0);
    }

    #[test]
    fn invalidations_within_the_delay_are_coalesced() {
        let table: CachedTable<Mailbox> = CachedTable::new(FixedSource::new(sample()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (tx, rx) = channel::unbounded();
        table
            .add_listener(
                move |_t: TableId| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                },
                Duration::from_millis(200),
            )
            .unwrap();

        for _ in 0..5 {
            table.clear_cache();
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // give a wrongly-delivered second call time to show up
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
