use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{CacheError, Result};

// how often a waiting checkout re-checks whether a broken connection freed up a slot
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A bounded pool of [`Connection`]s to the master server.
///
/// Idle connections wait in a crossbeam channel. A checkout takes an idle connection if there is
/// one, opens a new one while fewer than `max_connections` are open, and otherwise waits for a
/// connection to be returned.
pub struct ConnectionPool {
    config: ClientConfig,
    idle_tx: Sender<Connection>,
    idle_rx: Receiver<Connection>,
    // connections that exist, idle or checked out
    open: AtomicUsize,
}

impl ConnectionPool {
    /// creates an empty pool; connections are opened on demand
    pub fn new(config: ClientConfig) -> Self {
        let (idle_tx, idle_rx) = channel::bounded(config.max_connections);
        ConnectionPool {
            config,
            idle_tx,
            idle_rx,
            open: AtomicUsize::new(0),
        }
    }

    /// the configuration connections are opened with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// the number of open connections, idle or checked out
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// the number of connections waiting to be checked out
    pub fn idle_count(&self) -> usize {
        self.idle_rx.len()
    }

    /// checks out a connection for exclusive use until the guard is dropped
    ///
    /// # Errors
    /// returns [`CacheError::PoolTimeout`] if every connection stayed busy for the checkout
    /// timeout, or the error from opening a new connection
    pub fn get(&self) -> Result<PooledConnection<'_>> {
        let deadline = Instant::now() + self.config.checkout_timeout;
        loop {
            if let Ok(conn) = self.idle_rx.try_recv() {
                return Ok(self.guard(conn));
            }

            if let Some(conn) = self.try_open()? {
                return Ok(self.guard(conn));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(open = self.open_count(), "connection checkout timed out");
                return Err(CacheError::PoolTimeout);
            }
            match self.idle_rx.recv_timeout(WAIT_SLICE.min(deadline - now)) {
                Ok(conn) => return Ok(self.guard(conn)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(CacheError::PoolTimeout),
            }
        }
    }

    /// opens a new connection if the pool is below its limit
    fn try_open(&self) -> Result<Option<Connection>> {
        let mut open = self.open.load(Ordering::SeqCst);
        loop {
            if open >= self.config.max_connections {
                return Ok(None);
            }
            match self
                .open
                .compare_exchange(open, open + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => open = current,
            }
        }

        match Connection::open(&self.config) {
            Ok(conn) => {
                debug!(open = open + 1, "opened pooled connection");
                Ok(Some(conn))
            }
            Err(e) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn guard(&self, conn: Connection) -> PooledConnection<'_> {
        PooledConnection {
            pool: self,
            conn: Some(conn),
        }
    }

    fn release(&self, conn: Connection) {
        if conn.is_broken() {
            self.open.fetch_sub(1, Ordering::SeqCst);
            debug!("discarded broken connection");
            return;
        }
        match self.idle_tx.try_send(conn) {
            Ok(()) => trace!("connection returned to pool"),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// closes every idle connection; checked out connections are closed when returned broken
    pub fn close_idle(&self) {
        while let Ok(conn) = self.idle_rx.try_recv() {
            drop(conn);
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A connection checked out of a [`ConnectionPool`]. It goes back to the pool when dropped,
/// unless it broke while in use.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
