//! Purpose: The `Database` handle used by query executors, the CLI, and tests.
//! Exports: `Database`, `ApiResult`.
//! Role: Thread-safe facade over `core::engine::Engine`; one mutex guards all storage work.
//! Invariants: Every method holds the engine lock only for its storage work.
//! Invariants: Scans snapshot encoded rows under the lock and decode after releasing it.
#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::scan::Scan;
use crate::core::engine::{DatabaseOptions, Engine, TableStats};
use crate::core::error::Error;
use crate::core::predicate::{Assignment, Predicate, Projection};
use crate::core::recovery::RecoveryReport;
use crate::core::schema::Schema;
use crate::core::table::Rid;
use crate::core::value::Value;
use crate::core::verify::ValidationReport;
use crate::core::wal::WalScan;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    engine: Mutex<Engine>,
}

impl Database {
    /// Opens (creating if needed) the database in `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::open_with(path, DatabaseOptions::default())
    }

    /// Opens the database, replaying the write-ahead log before returning.
    pub fn open_with(path: impl AsRef<Path>, options: DatabaseOptions) -> ApiResult<Self> {
        let engine = Engine::open(path.as_ref(), options)?;
        Ok(Self {
            path: engine.root().to_path_buf(),
            engine: Mutex::new(engine),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_table(&self, schema: Schema) -> ApiResult<Arc<Schema>> {
        self.engine.lock().create_table(schema)
    }

    pub fn drop_table(&self, table: &str) -> ApiResult<()> {
        self.engine.lock().drop_table(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.engine.lock().table_names()
    }

    pub fn schema(&self, table: &str) -> ApiResult<Arc<Schema>> {
        self.engine.lock().schema(table)
    }

    /// Starts an explicit transaction and returns its id.
    pub fn begin(&self) -> ApiResult<u64> {
        self.engine.lock().begin()
    }

    pub fn commit(&self) -> ApiResult<()> {
        self.engine.lock().commit()
    }

    pub fn rollback(&self) -> ApiResult<()> {
        self.engine.lock().rollback()
    }

    /// Runs `body` inside a transaction: commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(&self, body: impl FnOnce(&Self) -> ApiResult<T>) -> ApiResult<T> {
        self.begin()?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                let mut engine = self.engine.lock();
                if engine.active_txn().is_some() {
                    if let Err(rollback_err) = engine.rollback() {
                        tracing::warn!(error = %rollback_err, "rollback after failed transaction body failed");
                    }
                }
                Err(err)
            }
        }
    }

    pub fn insert(&self, table: &str, values: Vec<Value>) -> ApiResult<Rid> {
        self.engine.lock().insert(table, values)
    }

    pub fn update(
        &self,
        table: &str,
        predicate: &Predicate,
        assignments: &[Assignment],
    ) -> ApiResult<usize> {
        self.engine.lock().update(table, predicate, assignments)
    }

    pub fn delete(&self, table: &str, predicate: &Predicate) -> ApiResult<usize> {
        self.engine.lock().delete(table, predicate)
    }

    /// Rows matching `predicate`, ascending by rid. Decoding and decryption of the
    /// projected columns happen as the returned iterator advances.
    pub fn scan(
        &self,
        table: &str,
        predicate: &Predicate,
        projection: Projection,
    ) -> ApiResult<Scan> {
        let engine = self.engine.lock();
        let snapshot = engine.scan(table, predicate, &projection)?;
        let keys = Arc::clone(engine.keys());
        drop(engine);
        Ok(Scan::new(snapshot, keys))
    }

    pub fn checkpoint(&self) -> ApiResult<()> {
        self.engine.lock().checkpoint()
    }

    /// Rolls back any open transaction, checkpoints, and releases the directory lock.
    pub fn close(self) -> ApiResult<()> {
        self.engine.into_inner().close()
    }

    pub fn table_stats(&self, table: &str) -> ApiResult<TableStats> {
        self.engine.lock().table_stats(table)
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.engine.lock().recovery_report().clone()
    }

    pub fn verify(&self) -> ValidationReport {
        self.engine.lock().verify()
    }

    pub fn wal_scan(&self) -> ApiResult<WalScan> {
        self.engine.lock().wal_scan()
    }

    pub fn key_id(&self) -> String {
        self.engine.lock().keys().key_id().to_string()
    }

    pub fn active_txn(&self) -> Option<u64> {
        self.engine.lock().active_txn()
    }
}
