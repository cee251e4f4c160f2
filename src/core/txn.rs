//! Purpose: Transaction state, write set, and the overlay of uncommitted rows.
//! Exports: `Transaction`, `TxnState`, `WriteEntry`, `OverlayRow`, `NetChange`.
//! Role: Bookkeeping for the single active transaction; performs no I/O.
//! Invariants: ACTIVE moves to COMMITTED or ABORTED exactly once.
//! Invariants: The overlay holds the latest image per (table, rid) written by the transaction.

use std::collections::BTreeMap;

use crate::core::error::{Error, ErrorKind};
use crate::core::table::Rid;
use crate::core::wal::WalOp;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

/// One logged row change, in log order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteEntry {
    pub table: String,
    pub rid: Rid,
    pub op: WalOp,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

/// What the transaction itself sees for a row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverlayRow<'a> {
    Untouched,
    Written(&'a [u8]),
    Deleted,
}

#[derive(Debug)]
pub struct Transaction {
    id: u64,
    state: TxnState,
    implicit: bool,
    // BEGIN has been written to the log.
    logged: bool,
    writes: Vec<WriteEntry>,
    // table -> rid -> latest image (None = deleted)
    overlay: BTreeMap<String, BTreeMap<Rid, Option<Vec<u8>>>>,
}

impl Transaction {
    pub fn new(id: u64, implicit: bool) -> Self {
        Self {
            id,
            state: TxnState::Active,
            implicit,
            logged: false,
            writes: Vec::new(),
            overlay: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// True for the single-statement transaction wrapped around a mutation issued
    /// without `begin`.
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn is_logged(&self) -> bool {
        self.logged
    }

    pub fn mark_logged(&mut self) {
        self.logged = true;
    }

    pub fn writes(&self) -> &[WriteEntry] {
        &self.writes
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Records a change that is already durable in the log.
    pub fn record(&mut self, entry: WriteEntry) -> Result<(), Error> {
        if self.state != TxnState::Active {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("transaction {} is {}", self.id, self.state.as_str())));
        }
        self.overlay
            .entry(entry.table.clone())
            .or_default()
            .insert(entry.rid, entry.after.clone());
        self.writes.push(entry);
        Ok(())
    }

    pub fn overlay_row(&self, table: &str, rid: Rid) -> OverlayRow<'_> {
        match self.overlay.get(table).and_then(|rows| rows.get(&rid)) {
            None => OverlayRow::Untouched,
            Some(Some(bytes)) => OverlayRow::Written(bytes),
            Some(None) => OverlayRow::Deleted,
        }
    }

    /// Rows of `table` touched by this transaction, ascending by rid.
    pub fn overlay_rows(&self, table: &str) -> impl Iterator<Item = (Rid, Option<&[u8]>)> + '_ {
        self.overlay
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(rid, image)| (*rid, image.as_deref())))
    }

    pub fn touches(&self, table: &str) -> bool {
        self.overlay.contains_key(table)
    }

    /// Final image per (table, rid) plus the committed image each replaces,
    /// in first-touch order.
    pub fn net_changes(&self) -> Vec<NetChange<'_>> {
        let mut order: Vec<(&str, Rid)> = Vec::new();
        let mut first_before: BTreeMap<(&str, Rid), Option<&[u8]>> = BTreeMap::new();
        for entry in &self.writes {
            let key = (entry.table.as_str(), entry.rid);
            if !first_before.contains_key(&key) {
                first_before.insert(key, entry.before.as_deref());
                order.push(key);
            }
        }
        order
            .into_iter()
            .map(|(table, rid)| NetChange {
                table,
                rid,
                before: first_before.get(&(table, rid)).copied().flatten(),
                after: self
                    .overlay
                    .get(table)
                    .and_then(|rows| rows.get(&rid))
                    .and_then(|image| image.as_deref()),
            })
            .collect()
    }

    pub fn finish(&mut self, state: TxnState) {
        self.state = state;
        self.overlay.clear();
    }
}

/// Net effect of a transaction on one row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetChange<'a> {
    pub table: &'a str,
    pub rid: Rid,
    /// Committed image before the transaction (`None` for rows it inserted).
    pub before: Option<&'a [u8]>,
    /// Image after the transaction (`None` when it ends deleted).
    pub after: Option<&'a [u8]>,
}
