//! Purpose: Centralize on-disk format versioning and little-endian field helpers.
//! Exports: file magics/versions, `format_version_error`, `ByteReader`, `put_*` writers.
//! Role: Shared policy for the WAL, table files, and the record codec.
//! Invariants: Version lists are additive; bump only for incompatible on-disk changes.
//! Invariants: All multi-byte integers are little endian.

use crate::core::error::{Error, ErrorKind};

pub const WAL_MAGIC: [u8; 4] = *b"VWAL";
pub const WAL_FORMAT_VERSION: u32 = 1;
pub const TABLE_MAGIC: [u8; 4] = *b"VTBL";
pub const TABLE_FORMAT_VERSION: u32 = 1;
pub const RECORD_FORMAT_VERSION: u8 = 1;

pub fn format_version_error(what: &str, detected: u32, supported: u32) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "unsupported {what} format version {detected} (supported: {supported})"
        ))
        .with_hint("The file was written by an incompatible vaultdb build.")
}

/// Bounds-checked cursor over a byte slice. Every read returns `None` once the
/// input is exhausted so callers can classify truncation themselves.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array::<2>().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array::<4>().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array::<8>().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array::<8>().map(i64::from_le_bytes)
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }
}

pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}
