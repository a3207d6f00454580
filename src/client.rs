use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::command::{CommandId, Push, Request, Response};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{CacheError, Result};
use crate::monitor::InvalidationMonitor;
use crate::pool::ConnectionPool;
use crate::protocol::{InvalidateList, ProtocolVersion, TableId};
use crate::row::{Row, RowKey};
use crate::table::{CacheControl, CachedTable, RowSource, TableRows};

// read-only requests are retried once on a fresh connection if a pooled one turned out dead
const READ_ATTEMPTS: usize = 2;

/// `MasterConnector` is the entry point of the client side: it owns the connection pool, the
/// cached tables and the invalidation monitor.
///
/// Cloning a connector is cheap, and clones share everything.
///
/// # Example
/// ```rust,ignore
/// let config = ClientConfig::builder()
///     .addr("master.example.com:4580")
///     .credentials("noc", "secret")
///     .build()?;
/// let conn = MasterConnector::connect(config)?;
/// let businesses = conn.table::<Business>()?;
/// for business in businesses.rows()?.iter() {
///     println!("{}", business.name);
/// }
/// ```
#[derive(Clone)]
pub struct MasterConnector {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    transport: Arc<Transport>,
    tables: DashMap<TableId, RegisteredTable>,
    monitor: Mutex<Option<InvalidationMonitor>>,
}

struct RegisteredTable {
    control: Arc<dyn CacheControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl MasterConnector {
    /// creates the connection pool and checks the server answers a ping.
    ///
    /// Starts the invalidation monitor unless the configuration turns it off.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let monitor = config.monitor_invalidations;
        let connector = MasterConnector {
            inner: Arc::new(Inner {
                transport: Arc::new(Transport {
                    pool: ConnectionPool::new(config),
                }),
                tables: DashMap::new(),
                monitor: Mutex::new(None),
            }),
        };
        let rtt = connector.ping()?;
        info!(addr = connector.config().addr(), ?rtt, "connected to master");

        if monitor {
            connector.start_invalidation_monitor()?;
        }
        Ok(connector)
    }

    /// the configuration this connector was created with
    pub fn config(&self) -> &ClientConfig {
        self.inner.transport.pool.config()
    }

    /// the connection pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.transport.pool
    }

    /// the cached table for the row type `R`, created on first use.
    ///
    /// Every call for the same `R` returns the same table.
    ///
    /// # Errors
    /// returns [`CacheError::TableTypeMismatch`] if a different row type was already registered
    /// under `R::TABLE_ID`
    pub fn table<R: Row>(&self) -> Result<Arc<CachedTable<R>>> {
        let entry = self.inner.tables.entry(R::TABLE_ID).or_insert_with(|| {
            debug!(table = R::TABLE_NAME, id = %R::TABLE_ID, "registering table");
            let source: Arc<dyn RowSource> = self.inner.transport.clone();
            let table = Arc::new(CachedTable::<R>::new(source));
            RegisteredTable {
                control: table.clone(),
                typed: table,
            }
        });
        Arc::clone(&entry.typed)
            .downcast::<CachedTable<R>>()
            .map_err(|_| CacheError::TableTypeMismatch(R::TABLE_ID))
    }

    /// ids of the tables currently holding a snapshot
    pub fn loaded_tables(&self) -> Vec<TableId> {
        let mut loaded: Vec<TableId> = self
            .inner
            .tables
            .iter()
            .filter(|entry| entry.control.is_loaded())
            .map(|entry| *entry.key())
            .collect();
        loaded.sort();
        loaded
    }

    /// measures one round trip to the server
    pub fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        match self.inner.transport.call(|_| Ok(Request::Ping))?.0 {
            Response::Pong => Ok(start.elapsed()),
            other => Err(unexpected(CommandId::Ping, other)),
        }
    }

    /// counts the rows of `table` on the server, bypassing the cache
    pub fn row_count(&self, table: TableId) -> Result<usize> {
        match self.inner.transport.call(|_| Ok(Request::GetRowCount { table }))?.0 {
            Response::Count(count) => Ok(count),
            other => Err(unexpected(CommandId::GetRowCount, other)),
        }
    }

    /// fetches one row from the server, bypassing the cache
    pub fn fetch_row<R: Row>(&self, key: &R::Key) -> Result<Option<R>> {
        let key = key.to_key_bytes()?;
        let (resp, version) = self.inner.transport.call(|_| {
            Ok(Request::GetRow {
                table: R::TABLE_ID,
                key,
            })
        })?;
        match resp {
            Response::Row(Some(bytes)) => Ok(Some(R::from_bytes(&bytes, version)?)),
            Response::Row(None) => Ok(None),
            other => Err(unexpected(CommandId::GetRow, other)),
        }
    }

    /// adds `row`, or replaces the row with the same key.
    ///
    /// The tables the server reports stale are cleared before this returns, so the next read
    /// sees the change.
    #[instrument(skip(self, row), fields(table = R::TABLE_NAME))]
    pub fn put_row<R: Row>(&self, row: &R) -> Result<InvalidateList> {
        let key = row.key().to_key_bytes()?;
        let (resp, _) = self.inner.transport.call(|version| {
            Ok(Request::PutRow {
                table: R::TABLE_ID,
                key,
                row: row.to_bytes(version)?,
            })
        })?;
        self.updated(CommandId::PutRow, resp)
    }

    /// removes the row with `key`
    ///
    /// # Errors
    /// returns [`CacheError::Server`] if the server has no such row
    #[instrument(skip(self), fields(table = R::TABLE_NAME))]
    pub fn remove_row<R: Row>(&self, key: &R::Key) -> Result<InvalidateList> {
        let key = key.to_key_bytes()?;
        let (resp, _) = self.inner.transport.call(|_| {
            Ok(Request::RemoveRow {
                table: R::TABLE_ID,
                key,
            })
        })?;
        self.updated(CommandId::RemoveRow, resp)
    }

    /// asks the server to invalidate `table` in every client
    pub fn invalidate_table(&self, table: TableId) -> Result<InvalidateList> {
        let (resp, _) = self
            .inner
            .transport
            .call(|_| Ok(Request::InvalidateTable { table }))?;
        self.updated(CommandId::InvalidateTable, resp)
    }

    fn updated(&self, command: CommandId, resp: Response) -> Result<InvalidateList> {
        match resp {
            Response::Updated(list) => {
                self.apply_invalidations(&list);
                Ok(list)
            }
            other => Err(unexpected(command, other)),
        }
    }

    /// clears the cache of every listed table this connector holds
    pub fn apply_invalidations(&self, list: &InvalidateList) {
        self.inner.apply_invalidations(list)
    }

    /// clears the cache of every table
    pub fn clear_caches(&self) {
        self.inner.clear_caches()
    }

    /// starts the thread that applies server-pushed invalidations; does nothing if it is
    /// already running
    pub fn start_invalidation_monitor(&self) -> Result<()> {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(InvalidationMonitor::start(
                self.config().clone(),
                Arc::downgrade(&self.inner),
            )?);
        }
        Ok(())
    }

    /// stops the invalidation monitor, returns false if it was not running
    pub fn stop_invalidation_monitor(&self) -> bool {
        self.inner.monitor.lock().take().is_some()
    }

    /// returns true once the monitor is subscribed on the server
    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .as_ref()
            .map_or(false, InvalidationMonitor::is_subscribed)
    }

    /// opens a dedicated connection and calls `on_invalidate` for every list the server
    /// pushes, until it returns false.
    ///
    /// This blocks the calling thread and does not touch the caches.
    pub fn listen_invalidations<F>(&self, mut on_invalidate: F) -> Result<()>
    where
        F: FnMut(&InvalidateList) -> bool,
    {
        let mut subscription = Connection::open(self.config())?.subscribe(self.config())?;
        loop {
            match subscription.next_push()? {
                Push::Invalidate(list) => {
                    if !on_invalidate(&list) {
                        return Ok(());
                    }
                }
                Push::Keepalive => trace!("keepalive from master"),
            }
        }
    }
}

impl Inner {
    pub(crate) fn apply_invalidations(&self, list: &InvalidateList) {
        for table in list.iter() {
            let control = self.tables.get(&table).map(|entry| Arc::clone(&entry.control));
            if let Some(control) = control {
                control.clear_cache();
            }
        }
    }

    pub(crate) fn clear_caches(&self) {
        let controls: Vec<Arc<dyn CacheControl>> = self
            .tables
            .iter()
            .map(|entry| Arc::clone(&entry.control))
            .collect();
        for control in controls {
            control.clear_cache();
        }
    }
}

fn unexpected(command: CommandId, resp: Response) -> CacheError {
    CacheError::Protocol(format!("unexpected response to {:?}: {:?}", command, resp))
}

/// Sends requests over pooled connections. This is what cached tables load from.
struct Transport {
    pool: ConnectionPool,
}

impl Transport {
    /// checks out a connection, builds the request for its protocol version and sends it.
    ///
    /// A server-side error becomes [`CacheError::Server`]. Read-only requests that fail on a
    /// dead connection are retried on another one.
    fn call<F>(&self, build: F) -> Result<(Response, ProtocolVersion)>
    where
        F: FnOnce(ProtocolVersion) -> Result<Request>,
    {
        let mut conn = self.pool.get()?;
        let version = conn.version();
        let request = build(version)?;

        let mut attempt = 1;
        let resp = loop {
            match conn.request(&request) {
                Ok(resp) => break resp,
                Err(CacheError::Io(e))
                    if attempt < READ_ATTEMPTS && !request.command_id().is_mutation() =>
                {
                    debug!(error = %e, "retrying request on a new connection");
                    attempt += 1;
                    drop(conn);
                    conn = self.pool.get()?;
                    if conn.version() != version {
                        return Err(CacheError::Protocol(
                            "protocol version changed between connections".to_string(),
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        };

        match resp {
            Response::Err(msg) => Err(CacheError::Server(msg)),
            resp => Ok((resp, version)),
        }
    }
}

impl RowSource for Transport {
    fn fetch_table(&self, table: TableId) -> Result<TableRows> {
        match self.call(|_| Ok(Request::GetTable { table }))? {
            (Response::Rows(rows), version) => Ok(TableRows { version, rows }),
            (other, _) => Err(unexpected(CommandId::GetTable, other)),
        }
    }
}
