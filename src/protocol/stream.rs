//! Primitive encodings shared by every message on the wire.
//!
//! Integers that are usually small (lengths, table ids, command ids) are written as
//! "compressed ints": the top two bits of the first byte hold the number of bytes that follow,
//! and the remaining bits hold a two's-complement value. That gives 1 byte for `-32..32`,
//! 2 bytes for 14 bit values, 3 bytes for 22 bit values and 4 bytes for 30 bit values.
//! Everything else is big-endian.
use std::io::{Read, Write};

use crate::error::{CacheError, Result};

/// smallest value that fits in a compressed int
pub const MIN_COMPRESSED_INT: i32 = -(1 << 29);
/// largest value that fits in a compressed int
pub const MAX_COMPRESSED_INT: i32 = (1 << 29) - 1;

/// upper bound on the encoded length of a string
pub const MAX_UTF_LEN: usize = 64 * 1024;
/// upper bound on the length of a byte array, i.e. one encoded row
pub const MAX_BYTE_ARRAY_LEN: usize = 16 * 1024 * 1024;

/// Writes the primitive wire types. Implemented for every [`Write`].
pub trait WriteExt: Write {
    /// writes `value` in 1 to 4 bytes
    ///
    /// # Errors
    /// returns [`CacheError::Protocol`] if `value` is outside
    /// `MIN_COMPRESSED_INT..=MAX_COMPRESSED_INT`
    fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        if !(MIN_COMPRESSED_INT..=MAX_COMPRESSED_INT).contains(&value) {
            return Err(CacheError::Protocol(format!(
                "{} does not fit in a compressed int",
                value
            )));
        }
        let bits = value as u32;
        if (-32..32).contains(&value) {
            self.write_all(&[(bits & 0x3f) as u8])?;
        } else if (-(1 << 13)..(1 << 13)).contains(&value) {
            let encoded = 0x4000 | (bits & 0x3fff) as u16;
            self.write_all(&encoded.to_be_bytes())?;
        } else if (-(1 << 21)..(1 << 21)).contains(&value) {
            let encoded = 0x80_0000 | (bits & 0x3f_ffff);
            self.write_all(&encoded.to_be_bytes()[1..])?;
        } else {
            let encoded = 0xc000_0000 | (bits & 0x3fff_ffff);
            self.write_all(&encoded.to_be_bytes())?;
        }
        Ok(())
    }

    /// writes a non-negative length as a compressed int
    fn write_length(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_COMPRESSED_INT)
            .ok_or_else(|| CacheError::Protocol(format!("length {} is too large", len)))?;
        self.write_compressed_int(len)
    }

    /// writes a single byte
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])?;
        Ok(())
    }

    /// writes `true` as 1 and `false` as 0
    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// writes an 8 byte big-endian integer
    fn write_long(&mut self, value: i64) -> Result<()> {
        self.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// writes the compressed length of `value` followed by its UTF-8 bytes
    fn write_utf(&mut self, value: &str) -> Result<()> {
        if value.len() > MAX_UTF_LEN {
            return Err(CacheError::Protocol(format!(
                "string of {} bytes exceeds the {} byte limit",
                value.len(),
                MAX_UTF_LEN
            )));
        }
        self.write_length(value.len())?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }

    /// writes a presence flag, then the string if there is one
    fn write_nullable_utf(&mut self, value: Option<&str>) -> Result<()> {
        self.write_bool(value.is_some())?;
        match value {
            Some(value) => self.write_utf(value),
            None => Ok(()),
        }
    }

    /// writes the compressed length of `value` followed by the bytes themselves
    fn write_byte_array(&mut self, value: &[u8]) -> Result<()> {
        if value.len() > MAX_BYTE_ARRAY_LEN {
            return Err(CacheError::Protocol(format!(
                "byte array of {} bytes exceeds the {} byte limit",
                value.len(),
                MAX_BYTE_ARRAY_LEN
            )));
        }
        self.write_length(value.len())?;
        self.write_all(value)?;
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

/// Reads the primitive wire types. Implemented for every [`Read`].
pub trait ReadExt: Read {
    /// reads a single byte
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// reads a value written by [`WriteExt::write_compressed_int`]
    fn read_compressed_int(&mut self) -> Result<i32> {
        let first = self.read_u8()?;
        let extra = (first >> 6) as u32;
        let mut raw = (first & 0x3f) as u32;
        for _ in 0..extra {
            raw = (raw << 8) | self.read_u8()? as u32;
        }
        // sign extend from the number of value bits that were present
        let shift = 32 - (6 + 8 * extra);
        Ok(((raw << shift) as i32) >> shift)
    }

    /// reads a compressed int that must be a length no larger than `max`
    fn read_length(&mut self, max: usize) -> Result<usize> {
        let len = self.read_compressed_int()?;
        if len < 0 {
            return Err(CacheError::Protocol(format!("negative length: {}", len)));
        }
        let len = len as usize;
        if len > max {
            return Err(CacheError::Protocol(format!(
                "length {} exceeds the limit of {}",
                len, max
            )));
        }
        Ok(len)
    }

    /// reads a boolean, rejecting anything but 0 or 1
    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CacheError::Protocol(format!("invalid boolean byte: {}", other))),
        }
    }

    /// reads an 8 byte big-endian integer
    fn read_long(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// reads a string written by [`WriteExt::write_utf`]
    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_length(MAX_UTF_LEN)?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| CacheError::Protocol(format!("invalid UTF-8: {}", e)))
    }

    /// reads a string written by [`WriteExt::write_nullable_utf`]
    fn read_nullable_utf(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_utf()?))
        } else {
            Ok(None)
        }
    }

    /// reads a byte array written by [`WriteExt::write_byte_array`]
    fn read_byte_array(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length(MAX_BYTE_ARRAY_LEN)?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {}
