//! Purpose: Append-only write-ahead log of row changes and transaction markers.
//! Exports: `Wal`, `WalRecord`, `WalOp`, `WalScan`, `WalDamage`, `Durability`.
//! Role: Every mutation is logged here before it touches any in-memory state.
//! Invariants: Sequence numbers are contiguous from the header's `base_seq`.
//! Invariants: Reading stops at the first damaged record; nothing after it is trusted.
//! Invariants: `Durability::Flush` syncs each record before `append` returns.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::dir::write_atomic;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    ByteReader, WAL_FORMAT_VERSION, WAL_MAGIC, format_version_error, put_u8, put_u16, put_u32,
    put_u64,
};

pub const WAL_HEADER_LEN: usize = 32;
const ABSENT: u32 = u32::MAX;
// seq + txn + op + table_len + rid + before_len + after_len + crc
const RECORD_FIXED_LEN: usize = 8 + 8 + 1 + 2 + 8 + 4 + 4 + 4;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// `fdatasync` after every record.
    #[default]
    Flush,
    /// Leave records in the OS page cache; a power loss may drop recent commits.
    Buffered,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalOp {
    Begin = 1,
    Insert = 2,
    Update = 3,
    Delete = 4,
    Commit = 5,
    Abort = 6,
}

impl WalOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalOp::Begin),
            2 => Some(WalOp::Insert),
            3 => Some(WalOp::Update),
            4 => Some(WalOp::Delete),
            5 => Some(WalOp::Commit),
            6 => Some(WalOp::Abort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WalOp::Begin => "begin",
            WalOp::Insert => "insert",
            WalOp::Update => "update",
            WalOp::Delete => "delete",
            WalOp::Commit => "commit",
            WalOp::Abort => "abort",
        }
    }

    pub fn is_row_change(&self) -> bool {
        matches!(self, WalOp::Insert | WalOp::Update | WalOp::Delete)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    pub seq: u64,
    pub txn: u64,
    pub op: WalOp,
    pub table: String,
    pub rid: u64,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
    /// Byte offset of the record in the file it was read from.
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WalHeader {
    pub base_seq: u64,
    pub next_txn: u64,
}

impl WalHeader {
    fn encode(&self) -> [u8; WAL_HEADER_LEN] {
        let mut buf = Vec::with_capacity(WAL_HEADER_LEN);
        buf.extend_from_slice(&WAL_MAGIC);
        put_u32(&mut buf, WAL_FORMAT_VERSION);
        put_u64(&mut buf, self.base_seq);
        put_u64(&mut buf, self.next_txn);
        put_u32(&mut buf, 0);
        let crc = crc32fast::hash(&buf);
        put_u32(&mut buf, crc);
        let mut out = [0u8; WAL_HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    fn decode(buf: &[u8], path: &Path) -> Result<Self, Error> {
        let corrupt = |message: &str| {
            Error::new(ErrorKind::WalCorrupt)
                .with_message(message.to_string())
                .with_path(path)
                .with_offset(0)
        };
        if buf.len() < WAL_HEADER_LEN {
            return Err(corrupt("log header truncated"));
        }
        let mut reader = ByteReader::new(&buf[..WAL_HEADER_LEN]);
        let magic = reader.array::<4>().ok_or_else(|| corrupt("log header truncated"))?;
        if magic != WAL_MAGIC {
            return Err(corrupt("not a vaultdb write-ahead log"));
        }
        let version = reader.u32().ok_or_else(|| corrupt("log header truncated"))?;
        let base_seq = reader.u64().ok_or_else(|| corrupt("log header truncated"))?;
        let next_txn = reader.u64().ok_or_else(|| corrupt("log header truncated"))?;
        let _reserved = reader.u32();
        let stored_crc = reader.u32().ok_or_else(|| corrupt("log header truncated"))?;
        if crc32fast::hash(&buf[..WAL_HEADER_LEN - 4]) != stored_crc {
            return Err(corrupt("log header checksum mismatch"));
        }
        if version != WAL_FORMAT_VERSION {
            return Err(format_version_error("write-ahead log", version, WAL_FORMAT_VERSION)
                .with_path(path));
        }
        Ok(Self { base_seq, next_txn })
    }
}

/// Where and why a log scan stopped early.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalDamage {
    pub offset: u64,
    pub reason: String,
}

/// Result of reading a log from the start.
#[derive(Clone, Debug)]
pub struct WalScan {
    pub header: WalHeader,
    pub records: Vec<WalRecord>,
    /// Length of the trustworthy prefix (header plus intact records).
    pub valid_len: u64,
    pub damage: Option<WalDamage>,
}

impl WalScan {
    pub fn next_seq(&self) -> u64 {
        self.records
            .last()
            .map(|record| record.seq + 1)
            .unwrap_or(self.header.base_seq)
    }
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    durability: Durability,
    header: WalHeader,
    next_seq: u64,
    len: u64,
}

impl Wal {
    /// Opens (creating if absent) the log and reads every intact record. The
    /// damaged tail, if any, is reported but left on disk until
    /// `truncate_damaged_tail`.
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> Result<(Self, WalScan), Error> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let header = WalHeader {
                base_seq: 1,
                next_txn: 1,
            };
            write_atomic(&path, &header.encode(), false)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(&path, err))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|err| Error::io(&path, err))?;
        let scan = parse(&bytes, &path)?;
        let wal = Self {
            path,
            file,
            durability,
            header: scan.header,
            next_seq: scan.next_seq(),
            len: scan.valid_len,
        };
        Ok((wal, scan))
    }

    /// Reads a log without opening it for writing.
    pub fn read_all(path: impl AsRef<Path>) -> Result<WalScan, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| Error::io(path, err))?;
        parse(&bytes, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> WalHeader {
        self.header
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Sequence number of the last record, or `base_seq - 1` when empty.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn records_since_reset(&self) -> u64 {
        self.next_seq - self.header.base_seq
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.records_since_reset() == 0
    }

    pub fn append(
        &mut self,
        txn: u64,
        op: WalOp,
        table: &str,
        rid: u64,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<u64, Error> {
        let seq = self.next_seq;
        let buf = encode_record(seq, txn, op, table, rid, before, after)?;
        if let Err(err) = self.write_at_end(&buf) {
            // Drop whatever part of the record reached the file.
            let _ = self.file.set_len(self.len);
            return Err(err.with_seq(seq));
        }
        self.len += buf.len() as u64;
        self.next_seq += 1;
        Ok(seq)
    }

    fn write_at_end(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(self.len))
            .map_err(|err| Error::io(&self.path, err))?;
        self.file
            .write_all(buf)
            .map_err(|err| Error::io(&self.path, err).with_message("failed to append log record"))?;
        if self.durability == Durability::Flush {
            self.file
                .sync_data()
                .map_err(|err| Error::io(&self.path, err).with_message("failed to sync log"))?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_data().map_err(|err| Error::io(&self.path, err))
    }

    /// Cuts the file back to the intact prefix found by the last scan.
    pub fn truncate_damaged_tail(&mut self, scan: &WalScan) -> Result<(), Error> {
        if scan.damage.is_none() {
            return Ok(());
        }
        self.file
            .set_len(scan.valid_len)
            .map_err(|err| Error::io(&self.path, err).with_message("failed to truncate log"))?;
        self.file
            .sync_all()
            .map_err(|err| Error::io(&self.path, err))?;
        self.len = scan.valid_len;
        Ok(())
    }

    /// Replaces the log with an empty one whose first record will be `base_seq`.
    pub fn reset(&mut self, base_seq: u64, next_txn: u64) -> Result<(), Error> {
        let header = WalHeader { base_seq, next_txn };
        write_atomic(&self.path, &header.encode(), false)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| Error::io(&self.path, err))?;
        self.file = file;
        self.header = header;
        self.next_seq = base_seq;
        self.len = WAL_HEADER_LEN as u64;
        tracing::debug!(base_seq, next_txn, "write-ahead log reset");
        Ok(())
    }
}

fn encode_record(
    seq: u64,
    txn: u64,
    op: WalOp,
    table: &str,
    rid: u64,
    before: Option<&[u8]>,
    after: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    let table_len = u16::try_from(table.len())
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("table name too long for log"))?;
    let image_len = |image: Option<&[u8]>| -> Result<u32, Error> {
        match image {
            None => Ok(ABSENT),
            Some(bytes) => u32::try_from(bytes.len())
                .ok()
                .filter(|len| *len != ABSENT)
                .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("row image too large")),
        }
    };
    let before_len = image_len(before)?;
    let after_len = image_len(after)?;

    let mut buf = Vec::with_capacity(
        RECORD_FIXED_LEN
            + table.len()
            + before.map_or(0, <[u8]>::len)
            + after.map_or(0, <[u8]>::len),
    );
    put_u64(&mut buf, seq);
    put_u64(&mut buf, txn);
    put_u8(&mut buf, op as u8);
    put_u16(&mut buf, table_len);
    buf.extend_from_slice(table.as_bytes());
    put_u64(&mut buf, rid);
    put_u32(&mut buf, before_len);
    if let Some(bytes) = before {
        buf.extend_from_slice(bytes);
    }
    put_u32(&mut buf, after_len);
    if let Some(bytes) = after {
        buf.extend_from_slice(bytes);
    }
    let crc = crc32fast::hash(&buf);
    put_u32(&mut buf, crc);
    Ok(buf)
}

fn parse(bytes: &[u8], path: &Path) -> Result<WalScan, Error> {
    let header = WalHeader::decode(bytes, path)?;
    let mut records = Vec::new();
    let mut offset = WAL_HEADER_LEN;
    let mut expected_seq = header.base_seq;
    let mut damage = None;
    while offset < bytes.len() {
        match decode_record(&bytes[offset..], offset as u64) {
            Ok((record, used)) if record.seq == expected_seq => {
                offset += used;
                expected_seq += 1;
                records.push(record);
            }
            Ok((record, _)) => {
                damage = Some(WalDamage {
                    offset: offset as u64,
                    reason: format!("sequence gap: expected {expected_seq}, found {}", record.seq),
                });
                break;
            }
            Err(reason) => {
                damage = Some(WalDamage {
                    offset: offset as u64,
                    reason,
                });
                break;
            }
        }
    }
    Ok(WalScan {
        header,
        records,
        valid_len: offset as u64,
        damage,
    })
}

fn decode_record(buf: &[u8], offset: u64) -> Result<(WalRecord, usize), String> {
    let truncated = || "record truncated".to_string();
    let mut reader = ByteReader::new(buf);
    let seq = reader.u64().ok_or_else(truncated)?;
    let txn = reader.u64().ok_or_else(truncated)?;
    let op_byte = reader.u8().ok_or_else(truncated)?;
    let table_len = reader.u16().ok_or_else(truncated)?;
    let table = reader.take(usize::from(table_len)).ok_or_else(truncated)?;
    let rid = reader.u64().ok_or_else(truncated)?;
    let before = read_image(&mut reader)?;
    let after = read_image(&mut reader)?;
    let body_len = reader.position();
    let stored_crc = reader.u32().ok_or_else(truncated)?;
    if crc32fast::hash(&buf[..body_len]) != stored_crc {
        return Err("record checksum mismatch".to_string());
    }
    let op = WalOp::from_u8(op_byte).ok_or_else(|| format!("unknown opcode {op_byte}"))?;
    let table = std::str::from_utf8(table)
        .map_err(|_| "table name is not UTF-8".to_string())?
        .to_string();
    let record = WalRecord {
        seq,
        txn,
        op,
        table,
        rid,
        before,
        after,
        offset,
    };
    Ok((record, reader.position()))
}

fn read_image(reader: &mut ByteReader<'_>) -> Result<Option<Vec<u8>>, String> {
    let len = reader.u32().ok_or_else(|| "record truncated".to_string())?;
    if len == ABSENT {
        return Ok(None);
    }
    if len as usize > reader.remaining() {
        return Err(match reader.remaining() {
            0 => "record truncated".to_string(),
            _ => format!("implausible image length {len}"),
        });
    }
    let bytes = reader
        .take(len as usize)
        .ok_or_else(|| "record truncated".to_string())?;
    Ok(Some(bytes.to_vec()))
}
