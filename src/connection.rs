use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use tracing::{debug, warn};

use crate::command::{Hello, HelloReply, Push, Request, Response};
use crate::config::ClientConfig;
use crate::error::{CacheError, Result};
use crate::protocol::ProtocolVersion;

/// One authenticated socket to the master server.
///
/// A connection carries one request at a time. Any IO or protocol failure marks it broken, and
/// a broken connection is never reused.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
    version: ProtocolVersion,
    broken: bool,
}

impl Connection {
    /// connects to the server named in `config` and performs the handshake
    ///
    /// # Errors
    /// returns [`CacheError::Handshake`] if the server refuses the credentials or the protocol
    /// version or does not answer within the connect timeout, and [`CacheError::Io`] if no
    /// address could be reached
    pub fn open(config: &ClientConfig) -> Result<Connection> {
        let stream = connect_any(&config.addr, config)?;
        stream.set_nodelay(true)?;
        // a server with no free worker never answers the hello
        stream.set_read_timeout(Some(config.connect_timeout))?;
        let peer = stream.peer_addr()?;
        let mut conn = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            peer,
            version: ProtocolVersion::CURRENT,
            broken: false,
        };

        let hello = Hello {
            version: ProtocolVersion::CURRENT,
            username: config.username.clone(),
            password: config.password.clone(),
        };
        hello.write_to(&mut conn.writer)?;
        conn.writer.flush()?;

        let reply = match HelloReply::read_from(&mut conn.reader) {
            Ok(reply) => reply,
            Err(CacheError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                conn.broken = true;
                return Err(CacheError::Handshake(format!(
                    "{} did not answer within {:?}, it may have no free worker",
                    peer, config.connect_timeout
                )));
            }
            Err(e) => {
                conn.broken = true;
                return Err(e);
            }
        };
        match reply {
            HelloReply::Accepted(version) if version.is_supported() => {
                debug!(%peer, %version, "connected to master");
                conn.reader.get_ref().set_read_timeout(None)?;
                conn.version = version;
                Ok(conn)
            }
            HelloReply::Accepted(version) => Err(CacheError::Protocol(format!(
                "server chose unsupported protocol version {}",
                version
            ))),
            HelloReply::Refused(reason) => Err(CacheError::Handshake(reason)),
        }
    }

    /// the protocol version negotiated for this connection
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// the address of the server
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// returns true once a request on this connection has failed
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// sends `request` and reads its response.
    ///
    /// An error the server reports is returned as `Ok(Response::Err(..))` and leaves the
    /// connection usable.
    pub fn request(&mut self, request: &Request) -> Result<Response> {
        let result = self.exchange(request);
        if let Err(e) = &result {
            warn!(peer = %self.peer, error = %e, "connection broken");
            self.broken = true;
        }
        result
    }

    fn exchange(&mut self, request: &Request) -> Result<Response> {
        request.write_to(&mut self.writer)?;
        self.writer.flush()?;
        Response::read_from(&mut self.reader, request.command_id())
    }

    /// turns this connection into a stream of invalidation notices.
    ///
    /// Reads on the returned [`Subscription`] time out after the configured listen timeout, so
    /// a server that stops sending keepalives is reported as an error.
    pub fn subscribe(mut self, config: &ClientConfig) -> Result<Subscription> {
        match self.request(&Request::Listen)? {
            Response::Listening => {}
            Response::Err(msg) => return Err(CacheError::Server(msg)),
            other => {
                return Err(CacheError::Protocol(format!(
                    "unexpected response to Listen: {:?}",
                    other
                )))
            }
        }
        self.reader.get_ref().set_read_timeout(Some(config.listen_timeout))?;
        debug!(peer = %self.peer, "listening for invalidations");
        Ok(Subscription { conn: self })
    }
}

/// A connection that receives invalidation notices pushed by the server.
pub struct Subscription {
    conn: Connection,
}

impl Subscription {
    /// blocks until the next frame arrives
    pub fn next_push(&mut self) -> Result<Push> {
        let result = Push::read_from(&mut self.conn.reader);
        if result.is_err() {
            self.conn.broken = true;
        }
        result
    }

    /// a handle to the socket that can shut it down from another thread, unblocking
    /// [`Subscription::next_push`]
    pub fn shutdown_handle(&self) -> Result<TcpStream> {
        Ok(self.conn.writer.get_ref().try_clone()?)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.broken {
            // best effort, the server also handles a plain disconnect
            let _ = Request::Quit.write_to(&mut self.writer);
            let _ = self.writer.flush();
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

fn connect_any(addr: &str, config: &ClientConfig) -> Result<TcpStream> {
    let mut last_error = None;
    for socket_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%socket_addr, error = %e, "connect failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", addr),
            )
        })
        .into())
}
