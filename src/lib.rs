#![deny(missing_docs)]
//! A client-side data-access library for a hosting platform's master server: accounts,
//! servers, DNS, email, billing, tickets and the rest of the business entities.
//!
//! Every entity type is a [`Row`] stored in a [`CachedTable`]. A table is fetched from the
//! master once, kept in memory, and answered from memory until the master says it changed.
//! This crate also provides a reference [`MasterServer`] and the `mastercache-client` /
//! `mastercache-server` executables that can be used to exercise it.
//!
//! ## Cached tables
//! [`CachedTable`] is the brains of this entire operation. It is responsible for:
//! - loading all rows of a table on first use, with concurrent first uses sharing one load
//! - answering primary key lookups, unique column lookups, indexed column lookups and ordered
//! iteration from one in-memory snapshot
//! - throwing the snapshot away, indexes included, when the table is invalidated
//! - notifying [`TableListener`]s, coalescing bursts of invalidations
//!
//! ## Invalidation
//! The master answers every mutating request with an [`InvalidateList`]: the ids of the tables
//! that are now stale. The [`MasterConnector`] clears those tables before the call returns. The
//! master also pushes every list to connections that asked to listen, and the connector keeps
//! one such connection open on a monitor thread so changes made by other clients are seen too.
//!
//! ## Client / Server
//! [`MasterConnector`] checks [`Connection`]s out of a bounded [`ConnectionPool`], one request
//! per connection at a time. [`MasterServer`] serves connections on a [`ThreadPool`] over a
//! [`TableStore`] that holds rows as opaque bytes.
//!
//! ## Custom Protocol
//! Requests and responses are binary frames built from the primitives in
//! [`protocol::stream`]: small integers are "compressed" into 1 to 4 bytes, strings and byte
//! arrays are length-prefixed. A connection starts with a [`Hello`] carrying the client's
//! protocol version and credentials; the lower of the two versions is used for the session and
//! handed to every row encoding.
//!
//! [`ThreadPool`]: ./thread_pool/trait.ThreadPool.html

pub use client::MasterConnector;
pub use command::{CommandId, Hello, HelloReply, Push, Request, Response, ResponseCode};
pub use config::{ClientConfig, ClientConfigBuilder, PoolKind, ServerConfig, DEFAULT_ADDRESS};
pub use connection::{Connection, Subscription};
pub use engine::{MemoryStore, TableStore};
pub use error::{CacheError, Result};
pub use pool::{ConnectionPool, PooledConnection};
pub use protocol::{InvalidateList, ProtocolVersion, TableId};
pub use row::{Row, RowKey, Value};
pub use server::{InvalidationHub, MasterServer};
pub use table::{CacheControl, CachedTable, ListenerId, RowSource, TableListener, TableRows};

mod client;
mod command;
mod config;
mod connection;
mod engine;
mod error;
mod monitor;
mod pool;
pub mod protocol;
mod row;
mod server;
mod table;
pub mod thread_pool;
