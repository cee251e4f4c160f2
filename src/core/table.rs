// Per-table row store: RID-addressed slots held in memory, written out at checkpoints.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::dir::write_atomic;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    ByteReader, TABLE_FORMAT_VERSION, TABLE_MAGIC, format_version_error, put_u8, put_u32, put_u64,
};
use crate::core::wal::WalOp;

pub type Rid = u64;

const HEADER_LEN: usize = 36;
const FLAG_TOMBSTONE: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    Live(Vec<u8>),
    Tombstone,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    pub live_rows: u64,
    pub tombstones: u64,
    pub next_rid: Rid,
    pub checkpoint_seq: u64,
    pub payload_bytes: u64,
}

#[derive(Debug)]
pub struct TableStore {
    table: String,
    path: PathBuf,
    next_rid: Rid,
    checkpoint_seq: u64,
    slots: BTreeMap<Rid, Slot>,
    dirty: bool,
}

impl TableStore {
    /// Creates an empty store and writes its file immediately.
    pub fn create(table: &str, path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut store = Self {
            table: table.to_string(),
            path: path.as_ref().to_path_buf(),
            next_rid: 1,
            checkpoint_seq: 0,
            slots: BTreeMap::new(),
            dirty: true,
        };
        store.flush(0)?;
        Ok(store)
    }

    pub fn load(table: &str, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path).map_err(|err| Error::io(&path, err).with_table(table))?;
        let corrupt = |message: String| {
            Error::new(ErrorKind::Corrupt)
                .with_message(message)
                .with_table(table)
                .with_path(&path)
        };
        if bytes.len() < HEADER_LEN {
            return Err(corrupt("table file header truncated".to_string()));
        }
        let mut reader = ByteReader::new(&bytes);
        let magic = reader.array::<4>().unwrap_or_default();
        if magic != TABLE_MAGIC {
            return Err(corrupt("not a vaultdb table file".to_string()));
        }
        let version = reader.u32().unwrap_or_default();
        let next_rid = reader.u64().unwrap_or_default();
        let checkpoint_seq = reader.u64().unwrap_or_default();
        let slot_count = reader.u64().unwrap_or_default();
        let stored_crc = reader.u32().unwrap_or_default();
        if crc32fast::hash(&bytes[..HEADER_LEN - 4]) != stored_crc {
            return Err(corrupt("table file header checksum mismatch".to_string()));
        }
        if version != TABLE_FORMAT_VERSION {
            return Err(format_version_error("table file", version, TABLE_FORMAT_VERSION)
                .with_table(table)
                .with_path(&path));
        }

        let mut slots = BTreeMap::new();
        for index in 0..slot_count {
            let offset = reader.position() as u64;
            let start = reader.position();
            let truncated = || corrupt(format!("slot {index} truncated")).with_offset(offset);
            let rid = reader.u64().ok_or_else(truncated)?;
            let flags = reader.u8().ok_or_else(truncated)?;
            let len = reader.u32().ok_or_else(truncated)?;
            let payload = reader.take(len as usize).ok_or_else(truncated)?;
            let body_end = reader.position();
            let crc = reader.u32().ok_or_else(truncated)?;
            if crc32fast::hash(&bytes[start..body_end]) != crc {
                return Err(corrupt(format!("slot {index} checksum mismatch")).with_offset(offset));
            }
            if rid == 0 || rid >= next_rid {
                return Err(corrupt(format!("slot rid {rid} outside allocated range"))
                    .with_offset(offset));
            }
            let slot = if flags & FLAG_TOMBSTONE != 0 {
                Slot::Tombstone
            } else {
                Slot::Live(payload.to_vec())
            };
            if slots.insert(rid, slot).is_some() {
                return Err(corrupt(format!("duplicate slot for rid {rid}")).with_offset(offset));
            }
        }
        if !reader.is_empty() {
            return Err(corrupt("trailing bytes after last slot".to_string()));
        }
        Ok(Self {
            table: table.to_string(),
            path,
            next_rid: next_rid.max(1),
            checkpoint_seq,
            slots,
            dirty: false,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_rid(&self) -> Rid {
        self.next_rid
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.checkpoint_seq
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Hands out a fresh RID. RIDs are never reused, even if the transaction
    /// that took one rolls back.
    pub fn allocate_rid(&mut self) -> Rid {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.dirty = true;
        rid
    }

    /// Keeps the allocator ahead of a RID seen in the log.
    pub fn observe_rid(&mut self, rid: Rid) {
        if rid >= self.next_rid {
            self.next_rid = rid + 1;
            self.dirty = true;
        }
    }

    pub fn insert(&mut self, rid: Rid, bytes: Vec<u8>) -> Result<(), Error> {
        if matches!(self.slots.get(&rid), Some(Slot::Live(_))) {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("rid {rid} is already occupied"))
                .with_table(&self.table));
        }
        self.observe_rid(rid);
        self.slots.insert(rid, Slot::Live(bytes));
        self.dirty = true;
        Ok(())
    }

    pub fn update(&mut self, rid: Rid, bytes: Vec<u8>) -> Result<(), Error> {
        if self.read(rid).is_none() {
            return Err(self.missing(rid));
        }
        self.slots.insert(rid, Slot::Live(bytes));
        self.dirty = true;
        Ok(())
    }

    /// Tombstones the row and returns its last image.
    pub fn delete(&mut self, rid: Rid) -> Result<Vec<u8>, Error> {
        if self.read(rid).is_none() {
            return Err(self.missing(rid));
        }
        self.dirty = true;
        match self.slots.insert(rid, Slot::Tombstone) {
            Some(Slot::Live(bytes)) => Ok(bytes),
            _ => Err(Error::new(ErrorKind::Internal).with_message("slot changed during delete")),
        }
    }

    pub fn read(&self, rid: Rid) -> Option<&[u8]> {
        match self.slots.get(&rid) {
            Some(Slot::Live(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Live rows in ascending RID order.
    pub fn live(&self) -> impl Iterator<Item = (Rid, &[u8])> + '_ {
        self.slots.iter().filter_map(|(rid, slot)| match slot {
            Slot::Live(bytes) => Some((*rid, bytes.as_slice())),
            Slot::Tombstone => None,
        })
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Applies a logged row change, unconditionally; replaying the same record
    /// twice leaves the same state.
    pub fn redo(&mut self, op: WalOp, rid: Rid, after: Option<&[u8]>) -> Result<(), Error> {
        self.observe_rid(rid);
        let slot = match (op, after) {
            (WalOp::Insert | WalOp::Update, Some(bytes)) => Slot::Live(bytes.to_vec()),
            (WalOp::Delete, _) => Slot::Tombstone,
            _ => {
                return Err(Error::new(ErrorKind::WalCorrupt)
                    .with_message(format!("{} record for rid {rid} has no row image", op.as_str()))
                    .with_table(&self.table));
            }
        };
        self.slots.insert(rid, slot);
        self.dirty = true;
        Ok(())
    }

    /// Writes the whole store, stamped with the log position it reflects.
    pub fn flush(&mut self, checkpoint_seq: u64) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.slots.len() * 32);
        buf.extend_from_slice(&TABLE_MAGIC);
        put_u32(&mut buf, TABLE_FORMAT_VERSION);
        put_u64(&mut buf, self.next_rid);
        put_u64(&mut buf, checkpoint_seq);
        put_u64(&mut buf, self.slots.len() as u64);
        let crc = crc32fast::hash(&buf);
        put_u32(&mut buf, crc);

        for (rid, slot) in &self.slots {
            let start = buf.len();
            put_u64(&mut buf, *rid);
            let (flags, payload): (u8, &[u8]) = match slot {
                Slot::Live(bytes) => (0, bytes),
                Slot::Tombstone => (FLAG_TOMBSTONE, &[]),
            };
            put_u8(&mut buf, flags);
            put_u32(&mut buf, payload.len() as u32);
            buf.extend_from_slice(payload);
            let crc = crc32fast::hash(&buf[start..]);
            put_u32(&mut buf, crc);
        }

        write_atomic(&self.path, &buf, false).map_err(|err| err.with_table(&self.table))?;
        self.checkpoint_seq = checkpoint_seq;
        self.dirty = false;
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            next_rid: self.next_rid,
            checkpoint_seq: self.checkpoint_seq,
            ..StoreStats::default()
        };
        for slot in self.slots.values() {
            match slot {
                Slot::Live(bytes) => {
                    stats.live_rows += 1;
                    stats.payload_bytes += bytes.len() as u64;
                }
                Slot::Tombstone => stats.tombstones += 1,
            }
        }
        stats
    }

    fn missing(&self, rid: Rid) -> Error {
        Error::new(ErrorKind::NotFound)
            .with_message(format!("no live row with rid {rid}"))
            .with_table(&self.table)
    }
}
