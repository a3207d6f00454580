use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::{Hello, HelloReply, Push, Request, Response};
use crate::engine::TableStore;
use crate::error::{CacheError, Result};
use crate::protocol::{InvalidateList, ProtocolVersion};
use crate::thread_pool::ThreadPool;

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// A TCP master server over a [`TableStore`].
///
/// It listens for incoming connections on a [`SocketAddr`], authenticates each one, and then
/// serves its [`Request`]s on a thread of the pool. Each thread receives a handle to the store.
///
/// Every mutation's [`InvalidateList`] is returned to the caller and also pushed to every
/// connection that sent [`Request::Listen`]. Listening connections are moved off the pool onto
/// their own thread, since they live as long as the client does.
///
/// # Example
/// Create a server on "127.0.0.1:4580", with 4 threads on a shared queue pool, over an
/// in-memory store
/// ```rust,no_run
/// use mastercache::{MasterServer, MemoryStore};
/// use mastercache::thread_pool::{SharedQueueThreadPool, ThreadPool};
/// # fn main() -> mastercache::Result<()> {
/// let pool = SharedQueueThreadPool::new(4)?;
/// let server = MasterServer::new(MemoryStore::new(), pool);
/// server.run("127.0.0.1:4580")?;
/// # Ok(())
/// # }
/// ```
///
/// [`SocketAddr`]: https://doc.rust-lang.org/std/net/enum.SocketAddr.html
pub struct MasterServer<S: TableStore, P: ThreadPool> {
    /// the table store to use
    store: S,
    /// a pool of threads that will serve connections using a handle to the store
    pool: P,
    /// username -> password, an empty map accepts anyone
    users: Arc<HashMap<String, String>>,
    hub: InvalidationHub,
    keepalive: Duration,
}

impl<S: TableStore, P: ThreadPool> MasterServer<S, P> {
    /// Create a new `MasterServer` using the given [`TableStore`] and [`ThreadPool`].
    pub fn new(store: S, pool: P) -> Self {
        MasterServer {
            store,
            pool,
            users: Arc::new(HashMap::new()),
            hub: InvalidationHub::default(),
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    /// only accept handshakes with one of these username/password pairs
    pub fn with_users(mut self, users: HashMap<String, String>) -> Self {
        self.users = Arc::new(users);
        self
    }

    /// how often an idle listening connection is sent a keepalive frame
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// the hub invalidations are published on
    pub fn hub(&self) -> InvalidationHub {
        self.hub.clone()
    }

    /// binds to `addr` and serves connections until the listener fails
    ///
    /// # Errors
    /// returns [`CacheError::Io`] if the address could not be bound
    pub fn run<A: ToSocketAddrs>(self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)
    }

    /// serves connections accepted by an already bound `listener`
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        info!("master listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let session = Session {
                        store: self.store.clone(),
                        users: Arc::clone(&self.users),
                        hub: self.hub.clone(),
                        keepalive: self.keepalive,
                    };
                    self.pool.spawn(move || {
                        if let Err(e) = session.serve(stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Fans invalidation notices out to every listening connection.
#[derive(Clone, Default)]
pub struct InvalidationHub {
    subscribers: Arc<Mutex<Vec<Sender<InvalidateList>>>>,
}

impl InvalidationHub {
    /// registers a new listener
    pub fn subscribe(&self) -> Receiver<InvalidateList> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// sends `list` to every listener, dropping listeners that went away
    pub fn publish(&self, list: &InvalidateList) {
        if list.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(list.clone()).is_ok());
        debug!(tables = list.len(), listeners = subscribers.len(), "published invalidations");
    }

    /// the number of registered listeners
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// the state one connection thread needs
struct Session<S: TableStore> {
    store: S,
    users: Arc<HashMap<String, String>>,
    hub: InvalidationHub,
    keepalive: Duration,
}

impl<S: TableStore> Session<S> {
    /// Authenticates the client on the `tcp` stream, then listens for and processes its
    /// [`Request`]s until it quits, disconnects or asks to listen for invalidations.
    fn serve(self, tcp: TcpStream) -> Result<()> {
        let peer_addr = tcp.peer_addr()?;
        let mut reader = BufReader::new(&tcp);
        let mut writer = BufWriter::new(&tcp);

        let hello = Hello::read_from(&mut reader)?;
        let reply = self.handshake(&hello);
        reply.write_to(&mut writer)?;
        writer.flush()?;
        let version = match reply {
            HelloReply::Accepted(version) => version,
            HelloReply::Refused(reason) => {
                warn!("Refused {} ({}): {}", peer_addr, hello.username, reason);
                return Ok(());
            }
        };
        debug!("Accepted {} as {} using {}", peer_addr, hello.username, version);

        loop {
            let req = match Request::read_from(&mut reader) {
                Ok(req) => req,
                Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Client {} disconnected", peer_addr);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            debug!("Receive request from {}: {:?}", peer_addr, req.command_id());

            let resp = match req {
                Request::Quit => {
                    debug!("Client {} quit", peer_addr);
                    return Ok(());
                }
                Request::Listen => {
                    // registered before the ack, so nothing published after the client sees
                    // `Listening` can be missed
                    let rx = self.hub.subscribe();
                    Response::Listening.write_to(&mut writer)?;
                    writer.flush()?;
                    drop(writer);
                    return self.start_push(tcp.try_clone()?, peer_addr, rx);
                }
                Request::Ping => Response::Pong,
                Request::GetTable { table } => reply_with(self.store.rows(table), Response::Rows),
                Request::GetRow { table, key } => reply_with(self.store.row(table, &key), Response::Row),
                Request::GetRowCount { table } => reply_with(self.store.count(table), Response::Count),
                Request::PutRow { table, key, row } => self.mutated(self.store.put(table, key, row)),
                Request::RemoveRow { table, key } => self.mutated(self.store.remove(table, &key)),
                Request::InvalidateTable { table } => self.mutated(self.store.invalidate(table)),
            };

            resp.write_to(&mut writer)?;
            writer.flush()?;
        }
    }

    fn handshake(&self, hello: &Hello) -> HelloReply {
        if hello.version < ProtocolVersion::MIN_SUPPORTED {
            return HelloReply::Refused(format!(
                "protocol version {} is no longer supported, {} or newer is required",
                hello.version,
                ProtocolVersion::MIN_SUPPORTED
            ));
        }
        if !self.users.is_empty()
            && self.users.get(&hello.username).map(String::as_str) != Some(hello.password.as_str())
        {
            return HelloReply::Refused("authentication failed".to_string());
        }
        HelloReply::Accepted(ProtocolVersion::CURRENT.negotiate(hello.version))
    }

    fn mutated(&self, result: Result<InvalidateList>) -> Response {
        match result {
            Ok(list) => {
                self.hub.publish(&list);
                Response::Updated(list)
            }
            Err(e) => Response::Err(format!("{}", e)),
        }
    }

    /// moves a listening connection onto its own thread
    fn start_push(
        self,
        tcp: TcpStream,
        peer_addr: SocketAddr,
        rx: Receiver<InvalidateList>,
    ) -> Result<()> {
        let keepalive = self.keepalive;
        thread::Builder::new()
            .name(format!("invalidation-push-{}", peer_addr))
            .spawn(move || {
                if let Err(e) = push_invalidations(tcp, rx, keepalive) {
                    debug!("Listener {} went away: {}", peer_addr, e);
                }
            })?;
        Ok(())
    }
}

fn reply_with<T>(result: Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => Response::Err(format!("{}", e)),
    }
}

/// writes every published list, or a keepalive when idle, until the client goes away
fn push_invalidations(
    tcp: TcpStream,
    rx: Receiver<InvalidateList>,
    keepalive: Duration,
) -> Result<()> {
    let mut writer = BufWriter::new(&tcp);
    loop {
        let push = match rx.recv_timeout(keepalive) {
            Ok(list) => Push::Invalidate(list),
            Err(RecvTimeoutError::Timeout) => Push::Keepalive,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        push.write_to(&mut writer)?;
        writer.flush()?;
    }
}
