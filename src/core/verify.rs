//! Purpose: Offline consistency checks over tables, rows, and indexes.
//! Exports: `ValidationReport`, `ValidationStatus`, `ValidationIssue`, `verify_table`.
//! Role: Backs `Database::verify` and the `doctor` command; never mutates state.
//! Invariants: Every live row must decode (and decrypt) cleanly.
//! Invariants: Each index must hold exactly the (key, rid) pairs of the live rows.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::core::codec::RecordCodec;
use crate::core::error::ErrorKind;
use crate::core::index::TableIndexes;
use crate::core::schema::Schema;
use crate::core::table::{Rid, TableStore};
use crate::core::value::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Ok => "ok",
            ValidationStatus::Corrupt => "corrupt",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub table: Option<String>,
    pub rid: Option<Rid>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub status: ValidationStatus,
    pub tables_checked: usize,
    pub rows_checked: u64,
    pub issues: Vec<ValidationIssue>,
    pub issue_count: usize,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    pub fn ok(path: PathBuf) -> Self {
        Self {
            path,
            status: ValidationStatus::Ok,
            tables_checked: 0,
            rows_checked: 0,
            issues: Vec::new(),
            issue_count: 0,
            remediation_hints: Vec::new(),
        }
    }

    pub fn add_table(&mut self, rows: u64, issues: Vec<ValidationIssue>) {
        self.tables_checked += 1;
        self.rows_checked += rows;
        self.issues.extend(issues);
        self.issue_count = self.issues.len();
        if self.issue_count == 0 {
            return;
        }
        self.status = ValidationStatus::Corrupt;
        if self.remediation_hints.is_empty() {
            self.remediation_hints.push(
                "Rows that fail to decrypt were written under a different key or tampered with."
                    .to_string(),
            );
            self.remediation_hints.push(
                "Index mismatches clear on reopen, since indexes are rebuilt from the table files."
                    .to_string(),
            );
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ValidationStatus::Ok
    }
}

fn issue(code: &str, message: String, table: &str, rid: Option<Rid>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message,
        table: Some(table.to_string()),
        rid,
    }
}

/// Checks one table; returns the number of live rows examined and the issues found.
pub fn verify_table(
    schema: &Schema,
    store: &TableStore,
    indexes: &TableIndexes,
    codec: &RecordCodec<'_>,
) -> (u64, Vec<ValidationIssue>) {
    let table = schema.table.as_str();
    let positions = indexes.positions();
    let mut issues = Vec::new();
    let mut expected: Vec<BTreeSet<(Value, Rid)>> = vec![BTreeSet::new(); positions.len()];
    let mut rows = 0u64;

    for (rid, bytes) in store.live() {
        rows += 1;
        let values = match codec.decode(bytes) {
            Ok(values) => values,
            Err(err) => {
                let code = match err.kind() {
                    ErrorKind::Integrity => "integrity",
                    _ => "corrupt_row",
                };
                issues.push(issue(code, err.to_string(), table, Some(rid)));
                continue;
            }
        };
        for (slot, &position) in positions.iter().enumerate() {
            let key = &values[position];
            if !key.is_null() {
                expected[slot].insert((key.clone(), rid));
            }
        }
    }

    for (slot, index) in indexes.iter().enumerate() {
        if let Err(message) = index.check_structure() {
            issues.push(issue(
                "index_structure",
                format!("index on '{}': {message}", index.column()),
                table,
                None,
            ));
        }
        let actual: BTreeSet<(Value, Rid)> =
            index.pairs().map(|(key, rid)| (key.clone(), rid)).collect();
        for (key, rid) in expected[slot].difference(&actual) {
            issues.push(issue(
                "index_missing_entry",
                format!("index on '{}' lacks key {key}", index.column()),
                table,
                Some(*rid),
            ));
        }
        for (key, rid) in actual.difference(&expected[slot]) {
            issues.push(issue(
                "index_stale_entry",
                format!("index on '{}' has stray key {key}", index.column()),
                table,
                Some(*rid),
            ));
        }
    }
    (rows, issues)
}

#[cfg(test)]
mod tests {
    use super::{ValidationReport, ValidationStatus, verify_table};
    use crate::core::codec::RecordCodec;
    use crate::core::index::TableIndexes;
    use crate::core::keys::KeyManager;
    use crate::core::schema::{Column, ColumnType, Schema};
    use crate::core::table::TableStore;
    use crate::core::value::Value;

    #[test]
    fn detects_index_drift_and_tampered_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyManager::initialize(dir.path().join("keystore.json"), false).expect("keys");
        let schema = Schema::new(
            "users",
            vec![
                Column::new("id", ColumnType::Int).primary_key(),
                Column::new("secret", ColumnType::Text).encrypted(),
            ],
        )
        .expect("schema");
        let codec = RecordCodec::new(&schema, &keys);
        let mut store = TableStore::create("users", dir.path().join("users.tbl")).expect("store");
        for id in 1..=3i64 {
            let rid = store.allocate_rid();
            let bytes = codec.encode(&[Value::Int(id), Value::from("s")]).expect("encode");
            store.insert(rid, bytes).expect("insert");
        }
        let mut indexes = TableIndexes::rebuild(&schema, &store, &codec, 4).expect("rebuild");

        let (rows, issues) = verify_table(&schema, &store, &indexes, &codec);
        assert_eq!(rows, 3);
        assert!(issues.is_empty(), "{issues:?}");

        indexes.delete_row(2, &[Value::Int(2)]);
        let mut tampered = store.read(3).expect("row").to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        store.update(3, tampered).expect("update");

        let (_, issues) = verify_table(&schema, &store, &indexes, &codec);
        let codes: Vec<&str> = issues.iter().map(|issue| issue.code.as_str()).collect();
        assert!(codes.contains(&"index_missing_entry"), "{codes:?}");
        assert!(codes.contains(&"integrity"), "{codes:?}");

        let mut report = ValidationReport::ok(dir.path().to_path_buf());
        report.add_table(3, issues);
        assert_eq!(report.status, ValidationStatus::Corrupt);
        assert!(!report.remediation_hints.is_empty());
    }
}
