//! Purpose: Define the public Rust API boundary for vaultdb.
//! Exports: `Database`, `Scan`, `Row`, and the value, schema, predicate, and report types.
//! Role: Stable surface for query executors and the CLI; hides engine internals.
//! Invariants: Callers reach storage only through `Database`.

mod database;
mod scan;

pub use crate::core::engine::{DatabaseOptions, IndexStats, TableStats};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::predicate::{Assignment, Predicate, Projection};
pub use crate::core::recovery::RecoveryReport;
pub use crate::core::schema::{Column, ColumnType, Schema};
pub use crate::core::table::Rid;
pub use crate::core::value::{Decimal, Value};
pub use crate::core::verify::{ValidationIssue, ValidationReport, ValidationStatus};
pub use crate::core::wal::{Durability, WalDamage, WalOp, WalRecord, WalScan};
pub use database::{ApiResult, Database};
pub use scan::{Row, Scan};
