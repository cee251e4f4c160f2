//! Purpose: The storage engine: tables, indexes, log, keys, and the active transaction.
//! Exports: `Engine`, `DatabaseOptions`, `TableStats`, `IndexStats`, `ScanSnapshot`.
//! Role: Single owner of all mutable database state; `api::Database` serializes access.
//! Invariants: Every row change is in the log before it becomes visible to other statements.
//! Invariants: Committed state (stores and indexes) changes only after COMMIT is logged.
//! Invariants: At most one transaction is active; statements outside one run in their own.
//! Notes: Open order is catalog, table files, log, keystore, replay, index rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::btree::DEFAULT_ORDER;
use crate::core::catalog::Catalog;
use crate::core::codec::RecordCodec;
use crate::core::dir::DataDir;
use crate::core::error::{Error, ErrorKind};
use crate::core::index::TableIndexes;
use crate::core::keys::KeyManager;
use crate::core::predicate::{Access, Assignment, Filter, Predicate, Projection, plan_access};
use crate::core::recovery::{RecoveryReport, Replay, replay};
use crate::core::schema::Schema;
use crate::core::table::{Rid, TableStore};
use crate::core::txn::{NetChange, OverlayRow, Transaction, TxnState, WriteEntry};
use crate::core::value::Value;
use crate::core::verify::{ValidationReport, verify_table};
use crate::core::wal::{Durability, Wal, WalOp, WalScan};

pub const DEFAULT_CHECKPOINT_AFTER: u64 = 4096;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseOptions {
    pub durability: Durability,
    pub btree_order: usize,
    /// Checkpoint automatically once the log holds this many records.
    pub checkpoint_after: Option<u64>,
    /// Keystore location; defaults to `keystore.json` inside the data directory.
    pub keystore_path: Option<PathBuf>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            durability: Durability::default(),
            btree_order: DEFAULT_ORDER,
            checkpoint_after: Some(DEFAULT_CHECKPOINT_AFTER),
            keystore_path: None,
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    pub fn with_checkpoint_after(mut self, records: Option<u64>) -> Self {
        self.checkpoint_after = records;
        self
    }

    pub fn with_keystore_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.keystore_path = Some(path.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexStats {
    pub column: String,
    pub unique: bool,
    pub distinct_keys: usize,
    pub entries: usize,
    pub height: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableStats {
    pub table: String,
    pub columns: usize,
    pub live_rows: u64,
    pub tombstones: u64,
    pub next_rid: Rid,
    pub checkpoint_seq: u64,
    pub payload_bytes: u64,
    pub indexes: Vec<IndexStats>,
}

/// Encoded rows matched by a scan, captured at the time of the call.
#[derive(Debug)]
pub struct ScanSnapshot {
    pub schema: Arc<Schema>,
    /// Projected column positions, in output order.
    pub positions: Vec<usize>,
    pub rows: Vec<(Rid, Vec<u8>)>,
}

#[derive(Debug)]
struct TableState {
    schema: Arc<Schema>,
    store: TableStore,
    indexes: TableIndexes,
}

// Net row change plus the index keys it removes and adds.
struct RowDelta<'a> {
    change: NetChange<'a>,
    old_keys: Option<Vec<Value>>,
    new_keys: Option<Vec<Value>>,
}

#[derive(Debug)]
pub struct Engine {
    dir: DataDir,
    options: DatabaseOptions,
    keys: Arc<KeyManager>,
    catalog: Catalog,
    tables: BTreeMap<String, TableState>,
    wal: Wal,
    next_txn: u64,
    active: Option<Transaction>,
    report: RecoveryReport,
}

impl Engine {
    pub fn open(root: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self, Error> {
        let dir = DataDir::open(root)?;
        let catalog = Catalog::load(&dir)?;

        let mut stores = BTreeMap::new();
        for (name, _) in catalog.iter() {
            let path = dir.table_path(name);
            if !path.exists() {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("table file is missing")
                    .with_table(name)
                    .with_path(&path));
            }
            stores.insert(name.clone(), TableStore::load(name, &path)?);
        }

        let (mut wal, scan) = Wal::open(dir.wal_path(), options.durability)?;

        let encrypted_data_present = catalog.iter().any(|(name, schema)| {
            if !schema.has_encrypted_columns() {
                return false;
            }
            let stored = stores.get(name).is_some_and(|store: &TableStore| {
                let stats = store.stats();
                stats.live_rows + stats.tombstones > 0
            });
            stored
                || scan
                    .records
                    .iter()
                    .any(|record| record.op.is_row_change() && &record.table == name)
        });
        let keystore = options
            .keystore_path
            .clone()
            .unwrap_or_else(|| dir.default_keystore_path());
        let keys = Arc::new(KeyManager::initialize(&keystore, encrypted_data_present)?);

        let Replay {
            mut report,
            max_txn,
        } = replay(&scan, &mut stores)?;
        if let Some(damage) = &scan.damage {
            tracing::warn!(
                offset = damage.offset,
                reason = %damage.reason,
                "write-ahead log has a damaged tail; truncating"
            );
            wal.truncate_damaged_tail(&scan)?;
            report.truncated_to = Some(scan.valid_len);
        }
        for txn in &report.rolled_back {
            tracing::warn!(txn, "rolling back transaction interrupted before commit");
            wal.append(*txn, WalOp::Abort, "", 0, None, None)?;
        }
        let next_txn = wal
            .header()
            .next_txn
            .max(max_txn.map_or(1, |txn| txn + 1));

        let mut tables = BTreeMap::new();
        for (name, store) in stores {
            let schema = Arc::clone(catalog.get(&name)?);
            let codec = RecordCodec::new(&schema, &keys);
            let indexes = TableIndexes::rebuild(&schema, &store, &codec, options.btree_order)?;
            tables.insert(
                name,
                TableState {
                    schema,
                    store,
                    indexes,
                },
            );
        }

        tracing::info!(
            path = %dir.root().display(),
            tables = tables.len(),
            replayed = report.rows_redone,
            rolled_back = report.rolled_back.len(),
            "database opened"
        );

        Ok(Self {
            dir,
            options,
            keys,
            catalog,
            tables,
            wal,
            next_txn,
            active: None,
            report,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.root()
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn schema(&self, table: &str) -> Result<Arc<Schema>, Error> {
        self.catalog.get(table).map(Arc::clone)
    }

    /// Id of the explicit or implicit transaction in progress, if any.
    pub fn active_txn(&self) -> Option<u64> {
        self.active.as_ref().map(Transaction::id)
    }

    pub fn create_table(&mut self, schema: Schema) -> Result<Arc<Schema>, Error> {
        self.ensure_idle("create a table")?;
        schema.check()?;
        if self.catalog.contains(&schema.table) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("table '{}' already exists", schema.table))
                .with_table(&schema.table));
        }
        let path = self.dir.table_path(&schema.table);
        let store = TableStore::create(&schema.table, &path)?;
        let schema = match self.catalog.create(&self.dir, schema) {
            Ok(schema) => schema,
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };
        let indexes = TableIndexes::for_schema(&schema, self.options.btree_order);
        self.tables.insert(
            schema.table.clone(),
            TableState {
                schema: Arc::clone(&schema),
                store,
                indexes,
            },
        );
        tracing::info!(table = %schema.table, columns = schema.len(), "table created");
        Ok(schema)
    }

    pub fn drop_table(&mut self, table: &str) -> Result<(), Error> {
        self.ensure_idle("drop a table")?;
        self.catalog.get(table)?;
        // Pending log records for the table must not outlive it.
        self.checkpoint()?;
        self.catalog.drop_table(&self.dir, table)?;
        let path = self.dir.table_path(table);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(&path, err).with_table(table)),
        }
        self.tables.remove(table);
        tracing::info!(table, "table dropped");
        Ok(())
    }

    pub fn begin(&mut self) -> Result<u64, Error> {
        if let Some(txn) = &self.active {
            return Err(Error::new(ErrorKind::Busy)
                .with_message(format!("transaction {} is already active", txn.id())));
        }
        let id = self.allocate_txn();
        self.wal.append(id, WalOp::Begin, "", 0, None, None)?;
        let mut txn = Transaction::new(id, false);
        txn.mark_logged();
        self.active = Some(txn);
        tracing::debug!(txn = id, "transaction started");
        Ok(id)
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        let mut txn = self.active.take().ok_or_else(no_active)?;
        if !txn.is_logged() {
            txn.finish(TxnState::Committed);
            return Ok(());
        }
        let deltas = match self.index_deltas(&txn) {
            Ok(deltas) => deltas,
            Err(err) => {
                self.discard(txn, true);
                return Err(err);
            }
        };
        if let Err(err) = self.wal.append(txn.id(), WalOp::Commit, "", 0, None, None) {
            drop(deltas);
            self.discard(txn, true);
            return Err(err);
        }
        let rows = deltas.len();
        self.apply(deltas)?;
        let id = txn.id();
        txn.finish(TxnState::Committed);
        tracing::debug!(txn = id, rows, "transaction committed");
        self.maybe_checkpoint()
    }

    pub fn rollback(&mut self) -> Result<(), Error> {
        let txn = self.active.take().ok_or_else(no_active)?;
        let id = txn.id();
        let result = self.discard(txn, false);
        tracing::debug!(txn = id, "transaction rolled back");
        result
    }

    pub fn insert(&mut self, table: &str, values: Vec<Value>) -> Result<Rid, Error> {
        self.with_txn(|engine| engine.insert_row(table, values))
    }

    /// Applies `assignments` to every row matching `predicate`; returns the count.
    pub fn update(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize, Error> {
        self.with_txn(|engine| engine.update_rows(table, predicate, assignments))
    }

    pub fn delete(&mut self, table: &str, predicate: &Predicate) -> Result<usize, Error> {
        self.with_txn(|engine| engine.delete_rows(table, predicate))
    }

    /// Matching rows as seen by the active transaction, ascending by rid.
    pub fn scan(
        &self,
        table: &str,
        predicate: &Predicate,
        projection: &Projection,
    ) -> Result<ScanSnapshot, Error> {
        let schema = Arc::clone(&self.state(table)?.schema);
        let filter = predicate.bind(&schema)?;
        let positions = projection.resolve(&schema)?;
        let rows = self.matching_rows(table, &filter)?;
        Ok(ScanSnapshot {
            schema,
            positions,
            rows,
        })
    }

    /// Writes every dirty table file and starts a fresh log.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        self.ensure_idle("checkpoint")?;
        let seq = self.wal.last_seq();
        let mut flushed = 0usize;
        for state in self.tables.values_mut() {
            if state.store.is_dirty() {
                state.store.flush(seq)?;
                flushed += 1;
            }
        }
        let base_seq = self.wal.next_seq();
        self.wal.reset(base_seq, self.next_txn)?;
        tracing::debug!(seq, flushed, "checkpoint complete");
        Ok(())
    }

    /// Rolls back any open transaction and checkpoints.
    pub fn close(mut self) -> Result<(), Error> {
        if let Some(id) = self.active_txn() {
            tracing::warn!(txn = id, "rolling back transaction left open at close");
            self.rollback()?;
        }
        self.checkpoint()?;
        tracing::info!(path = %self.dir.root().display(), "database closed");
        Ok(())
    }

    pub fn table_stats(&self, table: &str) -> Result<TableStats, Error> {
        let state = self.state(table)?;
        let stats = state.store.stats();
        Ok(TableStats {
            table: table.to_string(),
            columns: state.schema.len(),
            live_rows: stats.live_rows,
            tombstones: stats.tombstones,
            next_rid: stats.next_rid,
            checkpoint_seq: stats.checkpoint_seq,
            payload_bytes: stats.payload_bytes,
            indexes: state
                .indexes
                .iter()
                .map(|index| IndexStats {
                    column: index.column().to_string(),
                    unique: index.is_unique(),
                    distinct_keys: index.distinct_keys(),
                    entries: index.entries(),
                    height: index.height(),
                })
                .collect(),
        })
    }

    /// Checks committed rows and indexes of every table.
    pub fn verify(&self) -> ValidationReport {
        let mut report = ValidationReport::ok(self.dir.root().to_path_buf());
        for state in self.tables.values() {
            let codec = RecordCodec::new(&state.schema, &self.keys);
            let (rows, issues) = verify_table(&state.schema, &state.store, &state.indexes, &codec);
            report.add_table(rows, issues);
        }
        report
    }

    /// Re-reads the log file as it currently stands on disk.
    pub fn wal_scan(&self) -> Result<WalScan, Error> {
        Wal::read_all(self.wal.path())
    }

    fn with_txn<T>(
        &mut self,
        statement: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.active.is_some() {
            let result = statement(self);
            if let Err(err) = &result {
                // The log may now hold a partial statement; end the transaction.
                if err.kind() == ErrorKind::Io {
                    if let Some(txn) = self.active.take() {
                        tracing::warn!(txn = txn.id(), "aborting transaction after write failure");
                        let _ = self.discard(txn, true);
                    }
                }
            }
            return result;
        }

        let id = self.allocate_txn();
        self.active = Some(Transaction::new(id, true));
        match statement(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Some(txn) = self.active.take() {
                    let _ = self.discard(txn, true);
                }
                Err(err)
            }
        }
    }

    fn insert_row(&mut self, table: &str, values: Vec<Value>) -> Result<Rid, Error> {
        let schema = Arc::clone(&self.state(table)?.schema);
        let values = schema.validate_row(values)?;
        let unique: Vec<usize> = (0..schema.len())
            .filter(|&position| schema.columns[position].is_unique())
            .collect();
        self.check_unique(&schema, &unique, &[(None, values.as_slice())])?;

        let keys = Arc::clone(&self.keys);
        let bytes = RecordCodec::new(&schema, &keys).encode(&values)?;
        let rid = self.state_mut(table)?.store.allocate_rid();
        self.log_write(table, rid, WalOp::Insert, None, Some(bytes))?;
        Ok(rid)
    }

    fn update_rows(
        &mut self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> Result<usize, Error> {
        let schema = Arc::clone(&self.state(table)?.schema);
        if assignments.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("update needs at least one assignment")
                .with_table(table));
        }
        let filter = predicate.bind(&schema)?;
        let mut resolved = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let position = schema.column_index(&assignment.column)?;
            let value = schema.columns[position]
                .validate(assignment.value.clone())
                .map_err(|err| err.with_table(table))?;
            resolved.push((position, value));
        }

        let matches = self.matching_rows(table, &filter)?;
        let keys = Arc::clone(&self.keys);
        let codec = RecordCodec::new(&schema, &keys);
        let mut updates = Vec::with_capacity(matches.len());
        for (rid, before) in matches {
            let mut values = codec.decode(&before)?;
            for (position, value) in &resolved {
                values[*position] = value.clone();
            }
            let after = codec.encode(&values)?;
            updates.push((rid, before, after, values));
        }

        let unique: Vec<usize> = resolved
            .iter()
            .map(|(position, _)| *position)
            .filter(|&position| schema.columns[position].is_unique())
            .collect();
        let rows: Vec<(Option<Rid>, &[Value])> = updates
            .iter()
            .map(|(rid, _, _, values)| (Some(*rid), values.as_slice()))
            .collect();
        self.check_unique(&schema, &unique, &rows)?;
        drop(rows);

        let count = updates.len();
        for (rid, before, after, _) in updates {
            self.log_write(table, rid, WalOp::Update, Some(before), Some(after))?;
        }
        Ok(count)
    }

    fn delete_rows(&mut self, table: &str, predicate: &Predicate) -> Result<usize, Error> {
        let schema = Arc::clone(&self.state(table)?.schema);
        let filter = predicate.bind(&schema)?;
        let matches = self.matching_rows(table, &filter)?;
        let count = matches.len();
        for (rid, before) in matches {
            self.log_write(table, rid, WalOp::Delete, Some(before), None)?;
        }
        Ok(count)
    }

    // Visible rows of `table` that satisfy `filter`, ascending by rid.
    fn matching_rows(&self, table: &str, filter: &Filter) -> Result<Vec<(Rid, Vec<u8>)>, Error> {
        let state = self.state(table)?;
        let codec = RecordCodec::new(&state.schema, &self.keys);
        let positions = filter.positions();

        let full_scan = || state.store.live().map(|(rid, _)| rid).collect::<BTreeSet<Rid>>();
        let mut candidates = match plan_access(filter, &state.indexes.positions()) {
            Access::FullScan => full_scan(),
            Access::Index {
                position,
                lower,
                upper,
            } => match state.indexes.get(position) {
                Some(index) => index
                    .scan_bounds(lower.as_ref(), upper.as_ref())
                    .into_iter()
                    .collect(),
                None => full_scan(),
            },
        };
        if let Some(txn) = &self.active {
            candidates.extend(txn.overlay_rows(table).map(|(rid, _)| rid));
        }

        let mut rows = Vec::new();
        for rid in candidates {
            let overlay = self
                .active
                .as_ref()
                .map_or(OverlayRow::Untouched, |txn| txn.overlay_row(table, rid));
            let bytes = match overlay {
                OverlayRow::Written(bytes) => bytes,
                OverlayRow::Deleted => continue,
                OverlayRow::Untouched => match state.store.read(rid) {
                    Some(bytes) => bytes,
                    None => continue,
                },
            };
            let values = codec.decode_projected(bytes, &positions)?;
            if filter.matches(&positions, &values) {
                rows.push((rid, bytes.to_vec()));
            }
        }
        Ok(rows)
    }

    // Rows other than those being written that would collide on a unique column.
    fn check_unique(
        &self,
        schema: &Schema,
        positions: &[usize],
        rows: &[(Option<Rid>, &[Value])],
    ) -> Result<(), Error> {
        let writing: BTreeSet<Rid> = rows.iter().filter_map(|(rid, _)| *rid).collect();
        for &position in positions {
            let column = &schema.columns[position].name;
            let mut seen = BTreeSet::new();
            for (_, values) in rows {
                let key = &values[position];
                if key.is_null() {
                    continue;
                }
                if !seen.insert(key) {
                    return Err(duplicate_key(schema, column, key));
                }
                let holders = self.visible_holders(schema, position, key)?;
                if holders.iter().any(|holder| !writing.contains(holder)) {
                    return Err(duplicate_key(schema, column, key));
                }
            }
        }
        Ok(())
    }

    // Rids whose visible value at `position` equals `key`.
    fn visible_holders(&self, schema: &Schema, position: usize, key: &Value) -> Result<Vec<Rid>, Error> {
        let table = schema.table.as_str();
        let state = self.state(table)?;
        let codec = RecordCodec::new(schema, &self.keys);
        let committed: Vec<Rid> = match state.indexes.get(position) {
            Some(index) => index.point_lookup(key),
            None => {
                let mut found = Vec::new();
                for (rid, bytes) in state.store.live() {
                    if &codec.decode_column(bytes, position)? == key {
                        found.push(rid);
                    }
                }
                found
            }
        };

        let Some(txn) = &self.active else {
            return Ok(committed);
        };
        let mut holders = Vec::new();
        for rid in &committed {
            match txn.overlay_row(table, *rid) {
                OverlayRow::Untouched => holders.push(*rid),
                OverlayRow::Written(bytes) => {
                    if &codec.decode_column(bytes, position)? == key {
                        holders.push(*rid);
                    }
                }
                OverlayRow::Deleted => {}
            }
        }
        for (rid, image) in txn.overlay_rows(table) {
            if committed.contains(&rid) {
                continue;
            }
            if let Some(bytes) = image {
                if &codec.decode_column(bytes, position)? == key {
                    holders.push(rid);
                }
            }
        }
        Ok(holders)
    }

    fn log_write(
        &mut self,
        table: &str,
        rid: Rid,
        op: WalOp,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let Some(txn) = self.active.as_mut() else {
            return Err(no_active());
        };
        if !txn.is_logged() {
            self.wal.append(txn.id(), WalOp::Begin, "", 0, None, None)?;
            txn.mark_logged();
        }
        self.wal
            .append(txn.id(), op, table, rid, before.as_deref(), after.as_deref())
            .map_err(|err| err.with_table(table))?;
        txn.record(WriteEntry {
            table: table.to_string(),
            rid,
            op,
            before,
            after,
        })
    }

    // Decodes index keys for every net change and checks that the committed
    // indexes can take them.
    fn index_deltas<'t>(&self, txn: &'t Transaction) -> Result<Vec<RowDelta<'t>>, Error> {
        let mut deltas = Vec::new();
        for change in txn.net_changes() {
            let state = self.state(change.table)?;
            let positions = state.indexes.positions();
            let codec = RecordCodec::new(&state.schema, &self.keys);
            let old_keys = match change.before {
                Some(bytes) if !positions.is_empty() => Some(codec.decode_projected(bytes, &positions)?),
                _ => None,
            };
            let new_keys = match change.after {
                Some(bytes) if !positions.is_empty() => Some(codec.decode_projected(bytes, &positions)?),
                _ => None,
            };
            deltas.push(RowDelta {
                change,
                old_keys,
                new_keys,
            });
        }

        let changed: BTreeSet<(&str, Rid)> = deltas
            .iter()
            .map(|delta| (delta.change.table, delta.change.rid))
            .collect();
        let mut claimed: BTreeSet<(&str, usize, &Value)> = BTreeSet::new();
        for delta in &deltas {
            let Some(keys) = &delta.new_keys else {
                continue;
            };
            let state = self.state(delta.change.table)?;
            for (index, key) in state.indexes.iter().zip(keys) {
                if !index.is_unique() || key.is_null() {
                    continue;
                }
                let taken_by_other = index
                    .holder(key)
                    .is_some_and(|holder| !changed.contains(&(delta.change.table, holder)));
                if taken_by_other || !claimed.insert((delta.change.table, index.position(), key)) {
                    return Err(duplicate_key(&state.schema, index.column(), key));
                }
            }
        }
        Ok(deltas)
    }

    fn apply(&mut self, deltas: Vec<RowDelta<'_>>) -> Result<(), Error> {
        for delta in &deltas {
            let change = &delta.change;
            let state = self.state_mut(change.table)?;
            match (change.before, change.after) {
                (None, Some(after)) => state.store.insert(change.rid, after.to_vec())?,
                (Some(_), Some(after)) => state.store.update(change.rid, after.to_vec())?,
                (Some(_), None) => {
                    state.store.delete(change.rid)?;
                }
                (None, None) => {}
            }
        }
        for delta in &deltas {
            if let Some(keys) = &delta.old_keys {
                self.state_mut(delta.change.table)?
                    .indexes
                    .delete_row(delta.change.rid, keys);
            }
        }
        for delta in &deltas {
            if let Some(keys) = &delta.new_keys {
                self.state_mut(delta.change.table)?
                    .indexes
                    .insert_row(delta.change.rid, keys)
                    .map_err(|err| {
                        Error::new(ErrorKind::Internal)
                            .with_message(format!(
                                "index update failed after commit: {}",
                                err.message().unwrap_or("constraint violated")
                            ))
                            .with_table(delta.change.table)
                    })?;
            }
        }
        Ok(())
    }

    // Ends `txn` as aborted; logs ABORT when BEGIN reached the log.
    fn discard(&mut self, mut txn: Transaction, quiet: bool) -> Result<(), Error> {
        let result = if txn.is_logged() {
            self.wal
                .append(txn.id(), WalOp::Abort, "", 0, None, None)
                .map(|_| ())
        } else {
            Ok(())
        };
        txn.finish(TxnState::Aborted);
        match result {
            Err(err) if quiet => {
                tracing::warn!(txn = txn.id(), error = %err, "failed to log abort");
                Ok(())
            }
            other => other,
        }
    }

    fn maybe_checkpoint(&mut self) -> Result<(), Error> {
        let due = self
            .options
            .checkpoint_after
            .is_some_and(|limit| self.wal.records_since_reset() >= limit);
        if due && self.active.is_none() {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn allocate_txn(&mut self) -> u64 {
        let id = self.next_txn;
        self.next_txn += 1;
        id
    }

    fn ensure_idle(&self, action: &str) -> Result<(), Error> {
        match &self.active {
            Some(txn) => Err(Error::new(ErrorKind::Busy).with_message(format!(
                "cannot {action} while transaction {} is active",
                txn.id()
            ))),
            None => Ok(()),
        }
    }

    fn state(&self, table: &str) -> Result<&TableState, Error> {
        self.catalog.get(table)?;
        self.tables.get(table).ok_or_else(|| missing_state(table))
    }

    fn state_mut(&mut self, table: &str) -> Result<&mut TableState, Error> {
        self.catalog.get(table)?;
        self.tables.get_mut(table).ok_or_else(|| missing_state(table))
    }
}

fn no_active() -> Error {
    Error::new(ErrorKind::Usage).with_message("no transaction is active")
}

fn missing_state(table: &str) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message(format!("table '{table}' is in the catalog but not loaded"))
        .with_table(table)
}

fn duplicate_key(schema: &Schema, column: &str, key: &Value) -> Error {
    Error::new(ErrorKind::Constraint)
        .with_message(format!("duplicate value {key} for unique column '{column}'"))
        .with_table(&schema.table)
}

#[cfg(test)]
mod tests {
    use super::{DatabaseOptions, Engine};
    use crate::core::error::ErrorKind;
    use crate::core::predicate::{Assignment, Predicate, Projection};
    use crate::core::schema::{Column, ColumnType, Schema};
    use crate::core::value::Value;
    use crate::core::wal::Durability;

    fn accounts() -> Schema {
        Schema::new(
            "accounts",
            vec![
                Column::new("id", ColumnType::Int).primary_key(),
                Column::new("email", ColumnType::Text).unique(),
                Column::new("balance", ColumnType::Int),
            ],
        )
        .expect("schema")
    }

    fn options() -> DatabaseOptions {
        DatabaseOptions::new()
            .with_durability(Durability::Buffered)
            .with_btree_order(4)
    }

    fn row(id: i64, email: &str, balance: i64) -> Vec<Value> {
        vec![Value::Int(id), Value::from(email), Value::Int(balance)]
    }

    fn count(engine: &Engine, predicate: &Predicate) -> usize {
        engine
            .scan("accounts", predicate, &Projection::All)
            .expect("scan")
            .rows
            .len()
    }

    #[test]
    fn transaction_sees_its_own_writes_and_rollback_discards_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::open(dir.path(), options()).expect("open");
        engine.create_table(accounts()).expect("create");
        engine.insert("accounts", row(1, "a@x", 10)).expect("insert");

        engine.begin().expect("begin");
        engine.insert("accounts", row(2, "b@x", 20)).expect("insert");
        engine
            .delete("accounts", &Predicate::eq("id", 1))
            .expect("delete");
        assert_eq!(count(&engine, &Predicate::All), 1);
        assert_eq!(count(&engine, &Predicate::eq("id", 2)), 1);
        engine.rollback().expect("rollback");

        assert_eq!(count(&engine, &Predicate::All), 1);
        assert_eq!(count(&engine, &Predicate::eq("id", 1)), 1);
        assert!(engine.active_txn().is_none());
    }

    #[test]
    fn unique_violations_leave_state_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::open(dir.path(), options()).expect("open");
        engine.create_table(accounts()).expect("create");
        engine.insert("accounts", row(1, "a@x", 10)).expect("insert");
        engine.insert("accounts", row(2, "b@x", 20)).expect("insert");

        let err = engine
            .insert("accounts", row(1, "c@x", 30))
            .expect_err("duplicate id");
        assert_eq!(err.kind(), ErrorKind::Constraint);

        let err = engine
            .update(
                "accounts",
                &Predicate::eq("id", 2),
                &[Assignment::new("email", "a@x")],
            )
            .expect_err("duplicate email");
        assert_eq!(err.kind(), ErrorKind::Constraint);

        // Swapping a key within one transaction is fine once the old holder moves.
        engine.begin().expect("begin");
        engine
            .update("accounts", &Predicate::eq("id", 1), &[Assignment::new("email", "z@x")])
            .expect("move");
        engine
            .update("accounts", &Predicate::eq("id", 2), &[Assignment::new("email", "a@x")])
            .expect("take");
        engine.commit().expect("commit");

        assert_eq!(count(&engine, &Predicate::eq("email", "a@x")), 1);
        assert_eq!(count(&engine, &Predicate::All), 2);
        assert!(engine.verify().is_ok());
    }

    #[test]
    fn update_rewrites_matching_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::open(dir.path(), options()).expect("open");
        engine.create_table(accounts()).expect("create");
        for id in 1..=5 {
            engine
                .insert("accounts", row(id, &format!("{id}@x"), id * 10))
                .expect("insert");
        }
        let changed = engine
            .update(
                "accounts",
                &Predicate::ge("balance", 30),
                &[Assignment::new("balance", 0)],
            )
            .expect("update");
        assert_eq!(changed, 3);
        assert_eq!(count(&engine, &Predicate::eq("balance", 0)), 3);

        let err = engine
            .update("accounts", &Predicate::All, &[Assignment::new("missing", 1)])
            .expect_err("unknown column");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn ddl_is_refused_inside_a_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::open(dir.path(), options()).expect("open");
        engine.begin().expect("begin");
        let err = engine.create_table(accounts()).expect_err("busy");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(engine.begin().expect_err("nested").kind(), ErrorKind::Busy);
        engine.commit().expect("commit");
        assert_eq!(engine.commit().expect_err("none").kind(), ErrorKind::Usage);

        engine.create_table(accounts()).expect("create");
        let err = engine.create_table(accounts()).expect_err("exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        engine.drop_table("accounts").expect("drop");
        assert_eq!(
            engine.scan("accounts", &Predicate::All, &Projection::All).expect_err("gone").kind(),
            ErrorKind::Schema
        );
    }

    #[test]
    fn automatic_checkpoint_resets_the_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = options().with_checkpoint_after(Some(6));
        let mut engine = Engine::open(dir.path(), opts.clone()).expect("open");
        engine.create_table(accounts()).expect("create");
        for id in 1..=4 {
            engine
                .insert("accounts", row(id, &format!("{id}@x"), 0))
                .expect("insert");
        }
        // Each implicit insert logs BEGIN, INSERT, COMMIT.
        assert!(engine.wal_scan().expect("scan").records.len() < 6);
        drop(engine);

        let engine = Engine::open(dir.path(), opts).expect("reopen");
        assert_eq!(count(&engine, &Predicate::All), 4);
        assert_eq!(engine.table_stats("accounts").expect("stats").next_rid, 5);
    }
}
