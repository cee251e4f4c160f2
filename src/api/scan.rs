// Lazy row iteration over a scan snapshot.
use std::sync::Arc;

use crate::core::codec::RecordCodec;
use crate::core::engine::ScanSnapshot;
use crate::core::error::Error;
use crate::core::keys::KeyManager;
use crate::core::table::Rid;
use crate::core::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub rid: Rid,
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Value of a projected column by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Finite, single-pass iterator over matched rows in ascending rid order.
///
/// Each row is decoded (and its projected encrypted columns decrypted) when
/// `next` reaches it, so a damaged row fails only its own item.
#[derive(Debug)]
pub struct Scan {
    snapshot: ScanSnapshot,
    keys: Arc<KeyManager>,
    columns: Arc<[String]>,
    next: usize,
}

impl Scan {
    pub(crate) fn new(snapshot: ScanSnapshot, keys: Arc<KeyManager>) -> Self {
        let columns: Arc<[String]> = snapshot
            .positions
            .iter()
            .map(|&position| snapshot.schema.columns[position].name.clone())
            .collect();
        Self {
            snapshot,
            keys,
            columns,
            next: 0,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet yielded.
    pub fn remaining(&self) -> usize {
        self.snapshot.rows.len() - self.next
    }
}

impl Iterator for Scan {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let (rid, bytes) = self.snapshot.rows.get(self.next)?;
        self.next += 1;
        let codec = RecordCodec::new(&self.snapshot.schema, &self.keys);
        Some(
            codec
                .decode_projected(bytes, &self.snapshot.positions)
                .map(|values| Row {
                    rid: *rid,
                    columns: Arc::clone(&self.columns),
                    values,
                }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
