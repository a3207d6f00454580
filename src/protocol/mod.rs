//! The pieces of the wire protocol spoken between a [`MasterConnector`] and the master server.
//!
//! Every message is built from the primitives in [`stream`]. Requests and responses
//! themselves live in the crate's `command` module, the server's invalidation notices in
//! [`invalidate`].
//!
//! [`MasterConnector`]: ../struct.MasterConnector.html
use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub mod invalidate;
pub mod stream;

pub use self::invalidate::InvalidateList;
use self::stream::{ReadExt, WriteExt};

/// Identifies one table (one entity type) in the protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u16);

impl TableId {
    /// writes this id as a compressed int
    pub fn write_to<W: Write + ?Sized>(self, writer: &mut W) -> Result<()> {
        writer.write_compressed_int(self.0 as i32)
    }

    /// reads an id, rejecting values that are not a valid `u16`
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<TableId> {
        let raw = reader.read_compressed_int()?;
        u16::try_from(raw)
            .map(TableId)
            .map_err(|_| CacheError::Protocol(format!("invalid table id: {}", raw)))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for TableId {
    fn from(id: u16) -> Self {
        TableId(id)
    }
}

/// The version of the row encodings spoken on a connection.
///
/// The client and the server each announce the newest version they speak during the handshake,
/// and the lower of the two is used for the rest of the session. Rows receive it when they are
/// read or written so newer columns can be skipped when talking to an older peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    /// the first released version
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    /// adds row versioning to every table
    pub const V2: ProtocolVersion = ProtocolVersion(2);
    /// the newest version this crate speaks
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V2;
    /// the oldest version this crate still accepts
    pub const MIN_SUPPORTED: ProtocolVersion = ProtocolVersion::V1;

    /// returns true if this version can be spoken by this crate
    pub fn is_supported(self) -> bool {
        (ProtocolVersion::MIN_SUPPORTED..=ProtocolVersion::CURRENT).contains(&self)
    }

    /// picks the version a session between `self` and `peer` will use
    pub fn negotiate(self, peer: ProtocolVersion) -> ProtocolVersion {
        self.min(peer)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn table_id_rejects_values_outside_u16() {
        let mut buf = Vec::new();
        buf.write_compressed_int(70_000).unwrap();
        assert!(TableId::read_from(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn negotiated_version_is_the_older_one() {
        let old = ProtocolVersion::V1;
        assert_eq!(ProtocolVersion::CURRENT.negotiate(old), old);
        assert_eq!(old.negotiate(ProtocolVersion::CURRENT), old);
        assert!(!ProtocolVersion(0).is_supported());
        assert!(!ProtocolVersion(99).is_supported());
    }
}
