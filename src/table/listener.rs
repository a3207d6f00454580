use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::protocol::TableId;

/// Something that wants to know when a cached table has been invalidated.
///
/// Any `Fn(TableId)` closure is a listener.
pub trait TableListener: Send + Sync + 'static {
    /// called on a listener thread after the table's cache was cleared
    fn table_invalidated(&self, table: TableId);
}

impl<F> TableListener for F
where
    F: Fn(TableId) + Send + Sync + 'static,
{
    fn table_invalidated(&self, table: TableId) {
        self(table)
    }
}

/// Handle returned when a listener is added, used to remove it again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    // a full channel means a notification is already pending
    tx: Sender<()>,
}

/// The listeners of one table. Each listener owns a thread that waits for notifications, so a
/// slow listener never delays the thread clearing the cache.
pub(crate) struct Listeners {
    table: TableId,
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
}

impl Listeners {
    pub(crate) fn new(table: TableId) -> Self {
        Listeners {
            table,
            next_id: AtomicU64::new(0),
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// starts a thread delivering notifications to `listener`.
    ///
    /// Invalidations arriving within `delay` of the first one are folded into a single call.
    pub(crate) fn add(&self, listener: Arc<dyn TableListener>, delay: Duration) -> Result<ListenerId> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel::bounded(1);
        let table = self.table;
        thread::Builder::new()
            .name(format!("table-listener-{}-{}", table.0, id.0))
            .spawn(move || deliver(table, listener, delay, rx))?;
        self.registrations.lock().push(Registration { id, tx });
        debug!(%table, ?id, ?delay, "added table listener");
        Ok(id)
    }

    /// removes a listener, returns false if it was not registered
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        // dropping the sender ends the delivery thread
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    /// tells every listener the table was invalidated
    pub(crate) fn notify(&self) {
        self.registrations.lock().retain(|r| match r.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        });
    }
}

fn deliver(table: TableId, listener: Arc<dyn TableListener>, delay: Duration, rx: Receiver<()>) {
    while rx.recv().is_ok() {
        if !delay.is_zero() {
            let deadline = Instant::now() + delay;
            loop {
                match rx.recv_deadline(deadline) {
                    Ok(()) => continue,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| listener.table_invalidated(table)));
        if result.is_err() {
            error!(%table, "table listener panicked");
        }
    }
    debug!(%table, "table listener removed");
}
