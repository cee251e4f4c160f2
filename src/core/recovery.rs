//! Purpose: Rebuild committed table state from the write-ahead log at startup.
//! Exports: `replay`, `Replay`, `RecoveryReport`.
//! Role: Runs once inside `Engine::open`, before any transaction is accepted.
//! Invariants: Only transactions with a COMMIT record are redone, in log order.
//! Invariants: Redo is a full-image overwrite, so replaying twice is harmless.
//! Invariants: Records at or below a table's checkpoint seq are already in its file.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::Error;
use crate::core::table::TableStore;
use crate::core::wal::{WalDamage, WalOp, WalRecord, WalScan};

/// Summary of what startup recovery found and did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub committed: usize,
    pub aborted: usize,
    /// Transactions with neither COMMIT nor ABORT; discarded and marked aborted.
    pub rolled_back: Vec<u64>,
    pub rows_redone: usize,
    /// Row records skipped because their table file already contains them.
    pub rows_skipped: usize,
    pub damage: Option<WalDamage>,
    /// Log length after cutting off a damaged tail.
    pub truncated_to: Option<u64>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.damage.is_none() && self.rolled_back.is_empty()
    }
}

#[derive(Debug)]
pub struct Replay {
    pub report: RecoveryReport,
    /// Highest transaction id seen in the log.
    pub max_txn: Option<u64>,
}

pub fn replay(scan: &WalScan, stores: &mut BTreeMap<String, TableStore>) -> Result<Replay, Error> {
    let mut report = RecoveryReport {
        records_scanned: scan.records.len(),
        damage: scan.damage.clone(),
        ..RecoveryReport::default()
    };
    let mut pending: BTreeMap<u64, Vec<&WalRecord>> = BTreeMap::new();
    let mut open: BTreeSet<u64> = BTreeSet::new();
    let mut max_txn = None;

    for record in &scan.records {
        max_txn = max_txn.max(Some(record.txn));
        match record.op {
            WalOp::Begin => {
                open.insert(record.txn);
            }
            WalOp::Insert | WalOp::Update | WalOp::Delete => {
                // RIDs handed out by any transaction, committed or not, stay burned.
                if let Some(store) = stores.get_mut(&record.table) {
                    store.observe_rid(record.rid);
                }
                open.insert(record.txn);
                pending.entry(record.txn).or_default().push(record);
            }
            WalOp::Commit => {
                open.remove(&record.txn);
                report.committed += 1;
                for change in pending.remove(&record.txn).unwrap_or_default() {
                    let Some(store) = stores.get_mut(&change.table) else {
                        tracing::warn!(
                            table = %change.table,
                            seq = change.seq,
                            "log record for unknown table ignored"
                        );
                        continue;
                    };
                    if change.seq <= store.checkpoint_seq() {
                        report.rows_skipped += 1;
                        continue;
                    }
                    store
                        .redo(change.op, change.rid, change.after.as_deref())
                        .map_err(|err| err.with_seq(change.seq))?;
                    report.rows_redone += 1;
                }
            }
            WalOp::Abort => {
                open.remove(&record.txn);
                pending.remove(&record.txn);
                report.aborted += 1;
            }
        }
    }

    report.rolled_back = open.into_iter().collect();
    Ok(Replay { report, max_txn })
}

#[cfg(test)]
mod tests {
    use super::replay;
    use crate::core::table::TableStore;
    use crate::core::wal::{Durability, Wal, WalOp};
    use std::collections::BTreeMap;

    fn stores(dir: &std::path::Path) -> BTreeMap<String, TableStore> {
        let mut stores = BTreeMap::new();
        let store = TableStore::create("t", dir.join("t.tbl")).expect("store");
        stores.insert("t".to_string(), store);
        stores
    }

    #[test]
    fn redoes_only_committed_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut wal, _) = Wal::open(dir.path().join("wal.log"), Durability::Buffered).expect("wal");
        wal.append(1, WalOp::Begin, "", 0, None, None).expect("append");
        wal.append(1, WalOp::Insert, "t", 1, None, Some(b"one")).expect("append");
        wal.append(1, WalOp::Commit, "", 0, None, None).expect("append");
        wal.append(2, WalOp::Begin, "", 0, None, None).expect("append");
        wal.append(2, WalOp::Insert, "t", 2, None, Some(b"two")).expect("append");
        wal.append(2, WalOp::Abort, "", 0, None, None).expect("append");
        wal.append(3, WalOp::Begin, "", 0, None, None).expect("append");
        wal.append(3, WalOp::Delete, "t", 1, Some(b"one"), None).expect("append");
        wal.append(3, WalOp::Insert, "t", 3, None, Some(b"three")).expect("append");
        drop(wal);

        let scan = Wal::read_all(dir.path().join("wal.log")).expect("scan");
        let mut stores = stores(dir.path());
        let first = replay(&scan, &mut stores).expect("replay");
        assert_eq!(first.report.committed, 1);
        assert_eq!(first.report.aborted, 1);
        assert_eq!(first.report.rolled_back, vec![3]);
        assert_eq!(first.max_txn, Some(3));

        let store = &stores["t"];
        assert_eq!(store.read(1), Some(&b"one"[..]));
        assert_eq!(store.read(2), None);
        assert_eq!(store.read(3), None);
        // Aborted and in-flight inserts still consume their RIDs.
        assert_eq!(store.next_rid(), 4);

        // Running replay again over the same state changes nothing.
        replay(&scan, &mut stores).expect("second replay");
        assert_eq!(stores["t"].live().count(), 1);
    }

    #[test]
    fn skips_records_already_checkpointed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut wal, _) = Wal::open(dir.path().join("wal.log"), Durability::Buffered).expect("wal");
        wal.append(1, WalOp::Begin, "", 0, None, None).expect("append");
        wal.append(1, WalOp::Insert, "t", 1, None, Some(b"old")).expect("append");
        wal.append(1, WalOp::Commit, "", 0, None, None).expect("append");
        drop(wal);

        let scan = Wal::read_all(dir.path().join("wal.log")).expect("scan");
        let mut stores = stores(dir.path());
        if let Some(store) = stores.get_mut("t") {
            store.redo(WalOp::Insert, 1, Some(b"newer")).expect("seed");
            store.flush(3).expect("flush");
        }
        let outcome = replay(&scan, &mut stores).expect("replay");
        assert_eq!(outcome.report.rows_skipped, 1);
        assert_eq!(outcome.report.rows_redone, 0);
        assert_eq!(stores["t"].read(1), Some(&b"newer"[..]));
    }
}
