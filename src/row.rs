//! The contract between the caching tables and the entity types they hold.
//!
//! A cached table never knows what a row means. It only needs a row's primary key, the value of
//! a column by position (to build secondary indexes), an ordering for iteration and a way to move
//! the row on and off the wire.
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::io::{Read, Write};

use crate::error::Result;
use crate::protocol::stream::{ReadExt, WriteExt};
use crate::protocol::{ProtocolVersion, TableId};

/// The value held by one column of a row, as seen by the secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// the column is empty; null values are never indexed
    Null,
    /// a boolean column
    Bool(bool),
    /// any integer column, including foreign keys
    Int(i64),
    /// any textual column
    Text(String),
}

impl Value {
    /// returns true for [`Value::Null`]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A primary key type, with the encoding it travels in.
///
/// The server compares encoded keys byte-wise, so two equal keys must always encode to the same
/// bytes.
pub trait RowKey: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// writes the key
    fn write_key<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()>;

    /// reads a key written by [`RowKey::write_key`]
    fn read_key<R: Read + ?Sized>(reader: &mut R) -> Result<Self>;

    /// the key as a standalone byte string
    fn to_key_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_key(&mut buf)?;
        Ok(buf)
    }
}

impl RowKey for i32 {
    fn write_key<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_be_bytes())?;
        Ok(())
    }

    fn read_key<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }
}

impl RowKey for i64 {
    fn write_key<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_long(*self)
    }

    fn read_key<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        reader.read_long()
    }
}

impl RowKey for String {
    fn write_key<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_utf(self)
    }

    fn read_key<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        reader.read_utf()
    }
}

// composite keys, e.g. (server, username)
impl<A: RowKey, B: RowKey> RowKey for (A, B) {
    fn write_key<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.0.write_key(writer)?;
        self.1.write_key(writer)
    }

    fn read_key<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok((A::read_key(reader)?, B::read_key(reader)?))
    }
}

/// One entity type (Business, Server, EmailAddress, ...) as stored by a [`CachedTable`].
///
/// Rows are immutable once read. A new version of a row arrives as a whole new table snapshot
/// after the table is invalidated.
///
/// [`CachedTable`]: ./struct.CachedTable.html
pub trait Row: Send + Sync + Sized + 'static {
    /// the type of the primary key
    type Key: RowKey;

    /// the table this entity type is stored in
    const TABLE_ID: TableId;

    /// a human readable table name used in logs
    const TABLE_NAME: &'static str;

    /// the number of columns [`Row::column`] answers for
    const COLUMN_COUNT: usize;

    /// the primary key of this row
    fn key(&self) -> Self::Key;

    /// the value of the column at `index`, or `None` if `index >= COLUMN_COUNT`
    fn column(&self, index: usize) -> Option<Value>;

    /// reads a row in the encoding of `version`
    fn read_from<R: Read + ?Sized>(reader: &mut R, version: ProtocolVersion) -> Result<Self>;

    /// writes this row in the encoding of `version`
    fn write_to<W: Write + ?Sized>(&self, writer: &mut W, version: ProtocolVersion) -> Result<()>;

    /// the iteration order of the table, primary key order unless overridden
    fn compare(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }

    /// decodes a row from a standalone byte string
    fn from_bytes(bytes: &[u8], version: ProtocolVersion) -> Result<Self> {
        let mut reader = bytes;
        Self::read_from(&mut reader, version)
    }

    /// encodes this row as a standalone byte string
    fn to_bytes(&self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf, version)?;
        Ok(buf)
    }
}
