//! The notice telling clients which cached tables went stale.
use std::collections::BTreeSet;
use std::io::{Read, Write};

use super::stream::{ReadExt, WriteExt};
use super::TableId;
use crate::error::Result;

/// upper bound on the number of table ids in one list
const MAX_INVALIDATE_TABLES: usize = u16::MAX as usize + 1;

/// The set of tables whose client-side caches must be dropped.
///
/// The master server answers every mutating command with one of these, and also pushes them to
/// every connection that asked to listen for invalidations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidateList {
    tables: BTreeSet<TableId>,
}

impl InvalidateList {
    /// creates an empty list
    pub fn new() -> Self {
        InvalidateList::default()
    }

    /// adds `table` to the list, returns false if it was already present
    pub fn add(&mut self, table: TableId) -> bool {
        self.tables.insert(table)
    }

    /// returns true if `table` is in the list
    pub fn contains(&self, table: TableId) -> bool {
        self.tables.contains(&table)
    }

    /// adds every table of `other` to this list
    pub fn merge(&mut self, other: &InvalidateList) {
        self.tables.extend(other.tables.iter().copied());
    }

    /// returns true if no tables are listed
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// the number of tables listed
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// iterates the listed tables in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.iter().copied()
    }

    /// writes the table count followed by each table id
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_length(self.tables.len())?;
        for table in &self.tables {
            table.write_to(writer)?;
        }
        Ok(())
    }

    /// reads a list written by [`InvalidateList::write_to`]
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<InvalidateList> {
        let count = reader.read_length(MAX_INVALIDATE_TABLES)?;
        let mut list = InvalidateList::new();
        for _ in 0..count {
            list.add(TableId::read_from(reader)?);
        }
        Ok(list)
    }
}

impl FromIterator<TableId> for InvalidateList {
    fn from_iter<I: IntoIterator<Item = TableId>>(iter: I) -> Self {
        InvalidateList {
            tables: iter.into_iter().collect(),
        }
    }
}

impl Extend<TableId> for InvalidateList {
    fn extend<I: IntoIterator<Item = TableId>>(&mut self, iter: I) {
        self.tables.extend(iter)
    }
}
