#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use mastercache::protocol::stream::{ReadExt, WriteExt};
use mastercache::thread_pool::{SharedQueueThreadPool, ThreadPool};
use mastercache::{
    ClientConfig, MasterServer, MemoryStore, ProtocolVersion, Result, Row, TableId, Value,
};

pub const BUSINESS: TableId = TableId(10);
pub const SERVER: TableId = TableId(11);

/// a customer account, with a contact address only known to protocol v2
#[derive(Debug, Clone, PartialEq)]
pub struct Business {
    pub id: i32,
    pub name: String,
    pub parent: Option<i32>,
    pub contact: Option<String>,
}

impl Business {
    pub fn new(id: i32, name: &str) -> Self {
        Business {
            id,
            name: name.to_string(),
            parent: None,
            contact: None,
        }
    }
}

impl Row for Business {
    type Key = i32;
    const TABLE_ID: TableId = BUSINESS;
    const TABLE_NAME: &'static str = "business";
    const COLUMN_COUNT: usize = 4;

    fn key(&self) -> i32 {
        self.id
    }

    fn column(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(self.id.into()),
            1 => Some(self.name.as_str().into()),
            2 => Some(self.parent.into()),
            3 => Some(self.contact.clone().into()),
            _ => None,
        }
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R, version: ProtocolVersion) -> Result<Self> {
        let id = reader.read_compressed_int()?;
        let name = reader.read_utf()?;
        let parent = if reader.read_bool()? {
            Some(reader.read_compressed_int()?)
        } else {
            None
        };
        let contact = if version >= ProtocolVersion::V2 {
            reader.read_nullable_utf()?
        } else {
            None
        };
        Ok(Business {
            id,
            name,
            parent,
            contact,
        })
    }

    fn write_to<W: Write + ?Sized>(&self, writer: &mut W, version: ProtocolVersion) -> Result<()> {
        writer.write_compressed_int(self.id)?;
        writer.write_utf(&self.name)?;
        writer.write_bool(self.parent.is_some())?;
        if let Some(parent) = self.parent {
            writer.write_compressed_int(parent)?;
        }
        if version >= ProtocolVersion::V2 {
            writer.write_nullable_utf(self.contact.as_deref())?;
        }
        Ok(())
    }
}

/// a hosted machine, indexed by the business that owns it
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub hostname: String,
    pub business: i32,
}

impl Row for Server {
    type Key = String;
    const TABLE_ID: TableId = SERVER;
    const TABLE_NAME: &'static str = "server";
    const COLUMN_COUNT: usize = 2;

    fn key(&self) -> String {
        self.hostname.clone()
    }

    fn column(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(self.hostname.as_str().into()),
            1 => Some(self.business.into()),
            _ => None,
        }
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R, _version: ProtocolVersion) -> Result<Self> {
        Ok(Server {
            hostname: reader.read_utf()?,
            business: reader.read_compressed_int()?,
        })
    }

    fn write_to<W: Write + ?Sized>(&self, writer: &mut W, _version: ProtocolVersion) -> Result<()> {
        writer.write_utf(&self.hostname)?;
        writer.write_compressed_int(self.business)
    }
}

/// claims the business table id with an incompatible layout
#[derive(Debug)]
pub struct Impostor(pub i32);

impl Row for Impostor {
    type Key = i32;
    const TABLE_ID: TableId = BUSINESS;
    const TABLE_NAME: &'static str = "impostor";
    const COLUMN_COUNT: usize = 1;

    fn key(&self) -> i32 {
        self.0
    }

    fn column(&self, index: usize) -> Option<Value> {
        (index == 0).then(|| self.0.into())
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R, _version: ProtocolVersion) -> Result<Self> {
        Ok(Impostor(reader.read_compressed_int()?))
    }

    fn write_to<W: Write + ?Sized>(&self, writer: &mut W, _version: ProtocolVersion) -> Result<()> {
        writer.write_compressed_int(self.0)
    }
}

/// starts a master on an ephemeral port and returns its address.
///
/// Every pooled client connection holds a worker for its lifetime, so the pool is sized well
/// above what a single test opens.
pub fn start_server(store: MemoryStore, users: HashMap<String, String>) -> SocketAddr {
    start_server_with_threads(store, users, 32)
}

pub fn start_server_with_threads(
    store: MemoryStore,
    users: HashMap<String, String>,
    threads: u32,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = SharedQueueThreadPool::new(threads).unwrap();
    let server = MasterServer::new(store, pool)
        .with_users(users)
        .with_keepalive(Duration::from_millis(200));
    thread::spawn(move || server.serve(listener));
    addr
}

pub fn open_server() -> SocketAddr {
    start_server(MemoryStore::new(), HashMap::new())
}

pub fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::builder()
        .addr(addr.to_string())
        .credentials("noc", "secret")
        .max_connections(4)
        .checkout_timeout(Duration::from_secs(5))
        .monitor_invalidations(false)
        .build()
        .unwrap()
}

/// polls `condition` until it holds or five seconds pass
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Forwards connections to a master and can cut every connection it carries at once, the
/// way a network failure would. New connections are still accepted afterwards.
pub struct Proxy {
    addr: SocketAddr,
    sockets: Arc<Mutex<Vec<TcpStream>>>,
}

impl Proxy {
    pub fn start(upstream: SocketAddr) -> Proxy {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sockets = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&sockets);
        thread::spawn(move || {
            for client in listener.incoming() {
                let client = match client {
                    Ok(client) => client,
                    Err(_) => continue,
                };
                let server = match TcpStream::connect(upstream) {
                    Ok(server) => server,
                    Err(_) => continue,
                };
                {
                    let mut sockets = accepted.lock();
                    sockets.push(client.try_clone().unwrap());
                    sockets.push(server.try_clone().unwrap());
                }
                pipe(client.try_clone().unwrap(), server.try_clone().unwrap());
                pipe(server, client);
            }
        });
        Proxy { addr, sockets }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// shuts down every connection accepted so far, on both sides
    pub fn cut(&self) {
        for socket in self.sockets.lock().drain(..) {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

fn pipe(mut from: TcpStream, mut to: TcpStream) {
    thread::spawn(move || {
        let _ = io::copy(&mut from, &mut to);
        let _ = to.shutdown(Shutdown::Both);
        let _ = from.shutdown(Shutdown::Both);
    });
}
