//! Purpose: Column indexes mapping values to row ids, and the per-table index set.
//! Exports: `ColumnIndex`, `TableIndexes`.
//! Role: Answers point and range lookups; enforces PRIMARY KEY / UNIQUE.
//! Invariants: NULL keys are never indexed.
//! Invariants: A unique index never maps one key to more than one row id.
//! Invariants: A failed insert leaves the index unchanged.
//! Notes: Indexes are never persisted; `TableIndexes::rebuild` recreates them from
//! the table store at every open.

use std::ops::Bound;

use crate::core::btree::BTree;
use crate::core::codec::RecordCodec;
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Schema;
use crate::core::table::{Rid, TableStore};
use crate::core::value::Value;

#[derive(Debug)]
pub struct ColumnIndex {
    table: String,
    column: String,
    position: usize,
    unique: bool,
    tree: BTree<Value, Vec<Rid>>,
    entries: usize,
}

impl ColumnIndex {
    pub fn new(table: &str, column: &str, position: usize, unique: bool, order: usize) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            position,
            unique,
            tree: BTree::new(order),
            entries: 0,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn distinct_keys(&self) -> usize {
        self.tree.len()
    }

    /// Number of (key, rid) pairs.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn height(&self) -> usize {
        self.tree.height()
    }

    pub fn insert(&mut self, key: &Value, rid: Rid) -> Result<(), Error> {
        if key.is_null() {
            return Ok(());
        }
        if let Some(rids) = self.tree.get_mut(key) {
            if self.unique {
                return match rids.first() {
                    Some(&existing) if existing != rid => Err(Error::new(ErrorKind::Constraint)
                        .with_message(format!(
                            "duplicate value {key} for unique column '{}'",
                            self.column
                        ))
                        .with_table(&self.table)),
                    _ => Ok(()),
                };
            }
            if let Err(pos) = rids.binary_search(&rid) {
                rids.insert(pos, rid);
                self.entries += 1;
            }
            return Ok(());
        }
        self.tree.insert(key.clone(), vec![rid]);
        self.entries += 1;
        Ok(())
    }

    /// Removes `rid` under `key`; returns whether it was present.
    pub fn delete(&mut self, key: &Value, rid: Rid) -> bool {
        let Some(rids) = self.tree.get_mut(key) else {
            return false;
        };
        let Ok(pos) = rids.binary_search(&rid) else {
            return false;
        };
        rids.remove(pos);
        let now_empty = rids.is_empty();
        self.entries -= 1;
        if now_empty {
            self.tree.remove(key);
        }
        true
    }

    pub fn point_lookup(&self, key: &Value) -> Vec<Rid> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    /// Row ids whose key lies in `[low, high]`, ascending by key, then by rid.
    /// `None` leaves that end open.
    pub fn range_scan(&self, low: Option<&Value>, high: Option<&Value>) -> Vec<Rid> {
        let lower = low.map_or(Bound::Unbounded, Bound::Included);
        let upper = high.map_or(Bound::Unbounded, Bound::Included);
        self.scan_bounds(lower, upper)
    }

    pub fn scan_bounds(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<Rid> {
        if is_empty_range(lower, upper) {
            return Vec::new();
        }
        self.tree
            .range(lower, upper)
            .flat_map(|(_, rids)| rids.iter().copied())
            .collect()
    }

    /// The row already holding `key`, for unique indexes.
    pub fn holder(&self, key: &Value) -> Option<Rid> {
        if !self.unique || key.is_null() {
            return None;
        }
        self.tree.get(key).and_then(|rids| rids.first().copied())
    }

    /// Every (key, rid) pair in key order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Value, Rid)> + '_ {
        self.tree
            .iter()
            .flat_map(|(key, rids)| rids.iter().map(move |rid| (key, *rid)))
    }

    pub fn check_structure(&self) -> Result<(), String> {
        self.tree.check_invariants()
    }
}

fn is_empty_range(lower: Bound<&Value>, upper: Bound<&Value>) -> bool {
    match (lower, upper) {
        (Bound::Included(low), Bound::Included(high)) => low > high,
        (Bound::Included(low), Bound::Excluded(high))
        | (Bound::Excluded(low), Bound::Included(high))
        | (Bound::Excluded(low), Bound::Excluded(high)) => low >= high,
        _ => false,
    }
}

/// All indexes of one table, in column order.
#[derive(Debug, Default)]
pub struct TableIndexes {
    indexes: Vec<ColumnIndex>,
}

impl TableIndexes {
    pub fn for_schema(schema: &Schema, order: usize) -> Self {
        let indexes = schema
            .indexed_positions()
            .into_iter()
            .map(|position| {
                let column = &schema.columns[position];
                ColumnIndex::new(&schema.table, &column.name, position, column.is_unique(), order)
            })
            .collect();
        Self { indexes }
    }

    /// Builds the indexes from the live rows of `store`. Only indexed columns are
    /// decoded. A uniqueness violation here means the store itself is damaged.
    pub fn rebuild(
        schema: &Schema,
        store: &TableStore,
        codec: &RecordCodec<'_>,
        order: usize,
    ) -> Result<Self, Error> {
        let mut indexes = Self::for_schema(schema, order);
        let positions = indexes.positions();
        if positions.is_empty() {
            return Ok(indexes);
        }
        for (rid, bytes) in store.live() {
            let keys = codec.decode_projected(bytes, &positions)?;
            indexes.insert_row(rid, &keys).map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "index rebuild failed at rid {rid}: {}",
                        err.message().unwrap_or("constraint violated")
                    ))
                    .with_table(&schema.table)
            })?;
        }
        Ok(indexes)
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnIndex> {
        self.indexes.iter()
    }

    /// Column positions that carry an index, ascending.
    pub fn positions(&self) -> Vec<usize> {
        self.indexes.iter().map(ColumnIndex::position).collect()
    }

    pub fn get(&self, position: usize) -> Option<&ColumnIndex> {
        self.indexes.iter().find(|index| index.position == position)
    }

    /// Adds one row; `keys` follows `positions()`. All-or-nothing.
    pub fn insert_row(&mut self, rid: Rid, keys: &[Value]) -> Result<(), Error> {
        for done in 0..self.indexes.len().min(keys.len()) {
            if let Err(err) = self.indexes[done].insert(&keys[done], rid) {
                for (undo, key) in self.indexes[..done].iter_mut().zip(keys) {
                    undo.delete(key, rid);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn delete_row(&mut self, rid: Rid, keys: &[Value]) {
        for (index, key) in self.indexes.iter_mut().zip(keys) {
            index.delete(key, rid);
        }
    }
}
