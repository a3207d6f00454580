use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::client::Inner;
use crate::command::Push;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Result;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
// granularity at which a sleeping monitor notices it was stopped
const STOP_POLL: Duration = Duration::from_millis(50);

/// Keeps one listening connection open and applies every pushed [`InvalidateList`] to the
/// connector's tables.
///
/// Notices sent while the subscription is down are lost, so every cache is cleared whenever a
/// subscription is lost or (re)established. The monitor stops when dropped or when the
/// connector it serves is gone.
///
/// [`InvalidateList`]: ./protocol/struct.InvalidateList.html
pub(crate) struct InvalidationMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    stop: AtomicBool,
    subscribed: AtomicBool,
    // the live subscription's socket, shut down to unblock the monitor on stop
    socket: Mutex<Option<TcpStream>>,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl InvalidationMonitor {
    pub(crate) fn start(config: ClientConfig, inner: Weak<Inner>) -> Result<Self> {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            socket: Mutex::new(None),
        });
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("invalidation-monitor".to_string())
            .spawn(move || run(config, inner, thread_shared))?;
        Ok(InvalidationMonitor { shared })
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }
}

impl Drop for InvalidationMonitor {
    // never joins: the last connector handle may be dropped on the monitor thread itself
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(socket) = self.shared.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

fn run(config: ClientConfig, inner: Weak<Inner>, shared: Arc<Shared>) {
    let mut backoff = INITIAL_BACKOFF;
    while !shared.stopped() {
        match subscribe_and_apply(&config, &inner, &shared) {
            Ok(Subscribed::ConnectorGone) => break,
            Ok(Subscribed::Lost) => backoff = INITIAL_BACKOFF,
            Err(e) => warn!(error = %e, ?backoff, "could not subscribe to invalidations"),
        }
        if shared.stopped() {
            break;
        }
        match inner.upgrade() {
            Some(inner) => inner.clear_caches(),
            None => break,
        }
        sleep_unless_stopped(&shared, backoff);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    debug!("invalidation monitor stopped");
}

enum Subscribed {
    // the subscription was established and later lost
    Lost,
    // every connector handle was dropped
    ConnectorGone,
}

fn subscribe_and_apply(config: &ClientConfig, inner: &Weak<Inner>, shared: &Shared) -> Result<Subscribed> {
    let mut subscription = Connection::open(config)?.subscribe(config)?;
    *shared.socket.lock() = Some(subscription.shutdown_handle()?);
    if shared.stopped() {
        return Ok(Subscribed::Lost);
    }

    // anything cached before this point may have missed a notice
    match inner.upgrade() {
        Some(inner) => inner.clear_caches(),
        None => return Ok(Subscribed::ConnectorGone),
    }
    shared.subscribed.store(true, Ordering::SeqCst);
    info!("subscribed to invalidations");

    let result = loop {
        match subscription.next_push() {
            Ok(Push::Invalidate(list)) => match inner.upgrade() {
                Some(inner) => {
                    debug!(tables = list.len(), "applying pushed invalidations");
                    inner.apply_invalidations(&list);
                }
                None => break Ok(Subscribed::ConnectorGone),
            },
            Ok(Push::Keepalive) => trace!("keepalive from master"),
            Err(e) => {
                if !shared.stopped() {
                    warn!(error = %e, "invalidation subscription lost, clearing caches");
                }
                break Ok(Subscribed::Lost);
            }
        }
    };

    shared.subscribed.store(false, Ordering::SeqCst);
    shared.socket.lock().take();
    result
}

fn sleep_unless_stopped(shared: &Shared, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shared.stopped() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}
