use std::io::{Read, Write};

use crate::error::{CacheError, Result};
use crate::protocol::stream::{ReadExt, WriteExt, MAX_COMPRESSED_INT};
use crate::protocol::{InvalidateList, ProtocolVersion, TableId};

/// Opcodes of the requests a client can make of the master server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// round trip check
    Ping = 0,
    /// stream every row of a table
    GetTable = 1,
    /// fetch one row by key
    GetRow = 2,
    /// count the rows of a table
    GetRowCount = 3,
    /// add or replace a row
    PutRow = 4,
    /// delete a row by key
    RemoveRow = 5,
    /// ask the server to invalidate a table everywhere
    InvalidateTable = 6,
    /// turn this connection into a stream of invalidation notices
    Listen = 7,
    /// close the connection
    Quit = 8,
}

impl CommandId {
    /// returns true if the command changes server state and is answered with an
    /// [`InvalidateList`]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            CommandId::PutRow | CommandId::RemoveRow | CommandId::InvalidateTable
        )
    }
}

impl TryFrom<i32> for CommandId {
    type Error = CacheError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => CommandId::Ping,
            1 => CommandId::GetTable,
            2 => CommandId::GetRow,
            3 => CommandId::GetRowCount,
            4 => CommandId::PutRow,
            5 => CommandId::RemoveRow,
            6 => CommandId::InvalidateTable,
            7 => CommandId::Listen,
            8 => CommandId::Quit,
            other => return Err(CacheError::Protocol(format!("unknown command id: {}", other))),
        })
    }
}

/// The first byte of every response frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// the request succeeded, a payload may follow
    Done = 0,
    /// one more row of a table follows
    Next = 1,
    /// the end of a table stream
    End = 2,
    /// the request failed, a message follows
    Error = 3,
    /// an invalidation notice follows (listening connections only)
    Invalidate = 4,
    /// nothing follows, the listening connection is still alive
    Keepalive = 5,
}

impl ResponseCode {
    /// decodes the first byte of a frame
    pub fn from_byte(value: u8) -> Result<ResponseCode> {
        Ok(match value {
            0 => ResponseCode::Done,
            1 => ResponseCode::Next,
            2 => ResponseCode::End,
            3 => ResponseCode::Error,
            4 => ResponseCode::Invalidate,
            5 => ResponseCode::Keepalive,
            other => {
                return Err(CacheError::Protocol(format!(
                    "unknown response code: {}",
                    other
                )))
            }
        })
    }
}

fn read_code<R: Read + ?Sized>(reader: &mut R) -> Result<ResponseCode> {
    ResponseCode::from_byte(reader.read_u8()?)
}

/// These are the request "commands" that can be made to the master server.
///
/// Keys and rows travel as opaque bytes, encoded by the [`Row`] implementation on the client.
/// The server never looks inside them.
///
/// [`Row`]: ./trait.Row.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// check the server is alive
    Ping,
    /// get every row of a table
    GetTable {
        /// the table to read
        table: TableId,
    },
    /// get one row of a table
    GetRow {
        /// the table to read
        table: TableId,
        /// the encoded primary key
        key: Vec<u8>,
    },
    /// count the rows of a table
    GetRowCount {
        /// the table to count
        table: TableId,
    },
    /// add a row or replace the row with the same key
    PutRow {
        /// the table to write
        table: TableId,
        /// the encoded primary key
        key: Vec<u8>,
        /// the encoded row
        row: Vec<u8>,
    },
    /// remove a row by key
    RemoveRow {
        /// the table to write
        table: TableId,
        /// the encoded primary key
        key: Vec<u8>,
    },
    /// invalidate a table in every client without changing it
    InvalidateTable {
        /// the table to invalidate
        table: TableId,
    },
    /// receive invalidation notices on this connection from now on
    Listen,
    /// close the connection
    Quit,
}

impl Request {
    /// the opcode of this request
    pub fn command_id(&self) -> CommandId {
        match self {
            Request::Ping => CommandId::Ping,
            Request::GetTable { .. } => CommandId::GetTable,
            Request::GetRow { .. } => CommandId::GetRow,
            Request::GetRowCount { .. } => CommandId::GetRowCount,
            Request::PutRow { .. } => CommandId::PutRow,
            Request::RemoveRow { .. } => CommandId::RemoveRow,
            Request::InvalidateTable { .. } => CommandId::InvalidateTable,
            Request::Listen => CommandId::Listen,
            Request::Quit => CommandId::Quit,
        }
    }

    /// writes the opcode followed by the parameters of the request
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_compressed_int(self.command_id() as i32)?;
        match self {
            Request::Ping | Request::Listen | Request::Quit => {}
            Request::GetTable { table }
            | Request::GetRowCount { table }
            | Request::InvalidateTable { table } => table.write_to(writer)?,
            Request::GetRow { table, key } | Request::RemoveRow { table, key } => {
                table.write_to(writer)?;
                writer.write_byte_array(key)?;
            }
            Request::PutRow { table, key, row } => {
                table.write_to(writer)?;
                writer.write_byte_array(key)?;
                writer.write_byte_array(row)?;
            }
        }
        Ok(())
    }

    /// reads a request written by [`Request::write_to`]
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Request> {
        let command = CommandId::try_from(reader.read_compressed_int()?)?;
        Ok(match command {
            CommandId::Ping => Request::Ping,
            CommandId::Listen => Request::Listen,
            CommandId::Quit => Request::Quit,
            CommandId::GetTable => Request::GetTable {
                table: TableId::read_from(reader)?,
            },
            CommandId::GetRowCount => Request::GetRowCount {
                table: TableId::read_from(reader)?,
            },
            CommandId::InvalidateTable => Request::InvalidateTable {
                table: TableId::read_from(reader)?,
            },
            CommandId::GetRow => Request::GetRow {
                table: TableId::read_from(reader)?,
                key: reader.read_byte_array()?,
            },
            CommandId::RemoveRow => Request::RemoveRow {
                table: TableId::read_from(reader)?,
                key: reader.read_byte_array()?,
            },
            CommandId::PutRow => Request::PutRow {
                table: TableId::read_from(reader)?,
                key: reader.read_byte_array()?,
                row: reader.read_byte_array()?,
            },
        })
    }
}

/// The response types that can be returned for a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// answer to [`Request::Ping`]
    Pong,
    /// every row of a table, in the server's order
    Rows(Vec<Vec<u8>>),
    /// a single row, or `None` if there is no row with the key
    Row(Option<Vec<u8>>),
    /// a row count
    Count(usize),
    /// the mutation succeeded and these tables are now stale
    Updated(InvalidateList),
    /// the connection will carry invalidation notices from now on
    Listening,
    /// this variant is returned if an error occurs while processing the request
    Err(String),
}

impl Response {
    /// writes the response frame(s)
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        match self {
            Response::Pong | Response::Listening => writer.write_u8(ResponseCode::Done as u8)?,
            Response::Rows(rows) => {
                for row in rows {
                    writer.write_u8(ResponseCode::Next as u8)?;
                    writer.write_byte_array(row)?;
                }
                writer.write_u8(ResponseCode::End as u8)?;
            }
            Response::Row(row) => {
                writer.write_u8(ResponseCode::Done as u8)?;
                writer.write_bool(row.is_some())?;
                if let Some(row) = row {
                    writer.write_byte_array(row)?;
                }
            }
            Response::Count(count) => {
                writer.write_u8(ResponseCode::Done as u8)?;
                writer.write_length(*count)?;
            }
            Response::Updated(list) => {
                writer.write_u8(ResponseCode::Done as u8)?;
                list.write_to(writer)?;
            }
            Response::Err(message) => {
                writer.write_u8(ResponseCode::Error as u8)?;
                writer.write_utf(message)?;
            }
        }
        Ok(())
    }

    /// reads the response to a request with opcode `command`
    ///
    /// # Errors
    /// returns [`CacheError::Protocol`] if the frames do not match what `command` is answered
    /// with. An error reported by the server is returned as `Ok(Response::Err(..))`.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, command: CommandId) -> Result<Response> {
        if command == CommandId::GetTable {
            let mut rows = Vec::new();
            loop {
                match read_code(reader)? {
                    ResponseCode::Next => rows.push(reader.read_byte_array()?),
                    ResponseCode::End => return Ok(Response::Rows(rows)),
                    ResponseCode::Error => return Ok(Response::Err(reader.read_utf()?)),
                    other => {
                        return Err(CacheError::Protocol(format!(
                            "unexpected {:?} while reading a table",
                            other
                        )))
                    }
                }
            }
        }

        match read_code(reader)? {
            ResponseCode::Done => {}
            ResponseCode::Error => return Ok(Response::Err(reader.read_utf()?)),
            other => {
                return Err(CacheError::Protocol(format!(
                    "unexpected {:?} in response to {:?}",
                    other, command
                )))
            }
        }

        Ok(match command {
            CommandId::Ping => Response::Pong,
            CommandId::Listen => Response::Listening,
            CommandId::GetRow => {
                if reader.read_bool()? {
                    Response::Row(Some(reader.read_byte_array()?))
                } else {
                    Response::Row(None)
                }
            }
            CommandId::GetRowCount => {
                Response::Count(reader.read_length(MAX_COMPRESSED_INT as usize)?)
            }
            CommandId::PutRow | CommandId::RemoveRow | CommandId::InvalidateTable => {
                Response::Updated(InvalidateList::read_from(reader)?)
            }
            CommandId::GetTable | CommandId::Quit => {
                return Err(CacheError::Protocol(format!(
                    "{:?} has no single-frame response",
                    command
                )))
            }
        })
    }
}

/// A frame received on a connection after it sent [`Request::Listen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// these tables changed on the server
    Invalidate(InvalidateList),
    /// nothing changed, the server is still there
    Keepalive,
}

impl Push {
    /// writes the push frame
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        match self {
            Push::Invalidate(list) => {
                writer.write_u8(ResponseCode::Invalidate as u8)?;
                list.write_to(writer)
            }
            Push::Keepalive => writer.write_u8(ResponseCode::Keepalive as u8),
        }
    }

    /// reads the next push frame
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Push> {
        match read_code(reader)? {
            ResponseCode::Invalidate => Ok(Push::Invalidate(InvalidateList::read_from(reader)?)),
            ResponseCode::Keepalive => Ok(Push::Keepalive),
            ResponseCode::Error => Err(CacheError::Server(reader.read_utf()?)),
            other => Err(CacheError::Protocol(format!(
                "unexpected {:?} on a listening connection",
                other
            ))),
        }
    }
}

/// The first message a client sends on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// the newest protocol version the client speaks
    pub version: ProtocolVersion,
    /// the account to authenticate as
    pub username: String,
    /// the account's password
    pub password: String,
}

impl Hello {
    /// writes the handshake
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_compressed_int(self.version.0 as i32)?;
        writer.write_utf(&self.username)?;
        writer.write_utf(&self.password)
    }

    /// reads a handshake; the version is not checked here
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Hello> {
        let raw = reader.read_compressed_int()?;
        let version = u16::try_from(raw)
            .map(ProtocolVersion)
            .map_err(|_| CacheError::Protocol(format!("invalid protocol version: {}", raw)))?;
        Ok(Hello {
            version,
            username: reader.read_utf()?,
            password: reader.read_utf()?,
        })
    }
}

/// The server's answer to a [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloReply {
    /// the session will use this version
    Accepted(ProtocolVersion),
    /// the connection is refused, and will be closed
    Refused(String),
}

impl HelloReply {
    /// writes the reply
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        match self {
            HelloReply::Accepted(version) => {
                writer.write_u8(ResponseCode::Done as u8)?;
                writer.write_compressed_int(version.0 as i32)
            }
            HelloReply::Refused(reason) => {
                writer.write_u8(ResponseCode::Error as u8)?;
                writer.write_utf(reason)
            }
        }
    }

    /// reads a reply
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<HelloReply> {
        match read_code(reader)? {
            ResponseCode::Done => {
                let raw = reader.read_compressed_int()?;
                let version = u16::try_from(raw).map(ProtocolVersion).map_err(|_| {
                    CacheError::Protocol(format!("invalid protocol version: {}", raw))
                })?;
                Ok(HelloReply::Accepted(version))
            }
            ResponseCode::Error => Ok(HelloReply::Refused(reader.read_utf()?)),
            other => Err(CacheError::Protocol(format!(
                "unexpected {:?} in handshake reply",
                other
            ))),
        }
    }
}
