// Database directory layout, the single-process lock, and atomic file replacement.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const KEYSTORE_FILE: &str = "keystore.json";
const TABLES_DIR: &str = "tables";
const SCHEMA_SUFFIX: &str = ".schema.json";
const TABLE_SUFFIX: &str = ".tbl";

/// An opened database directory. Holding the value holds the exclusive lock;
/// dropping it releases the lock.
#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
    lock: File,
}

impl DataDir {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        let tables = root.join(TABLES_DIR);
        fs::create_dir_all(&tables).map_err(|err| {
            Error::io(&tables, err).with_message("failed to create database directory")
        })?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|err| Error::io(&lock_path, err))?;
        lock.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("database directory is locked by another process")
                .with_path(&lock_path)
                .with_source(err)
        })?;

        Ok(Self { root, lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    pub fn default_keystore_path(&self) -> PathBuf {
        self.root.join(KEYSTORE_FILE)
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.root.join(TABLES_DIR)
    }

    pub fn schema_path(&self, table: &str) -> PathBuf {
        self.tables_dir().join(format!("{table}{SCHEMA_SUFFIX}"))
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.tables_dir().join(format!("{table}{TABLE_SUFFIX}"))
    }

    /// Table names that have a schema file, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>, Error> {
        let dir = self.tables_dir();
        let entries = fs::read_dir(&dir).map_err(|err| Error::io(&dir, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&dir, err))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(table) = name.strip_suffix(SCHEMA_SUFFIX) {
                names.push(table.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

/// Replaces `path` with `bytes` via a synced temp file and rename, then syncs the
/// parent directory so the rename itself is durable.
pub fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;
    let mut file = options.open(&tmp).map_err(|err| Error::io(&tmp, err))?;
    file.write_all(bytes).map_err(|err| Error::io(&tmp, err))?;
    file.sync_all().map_err(|err| Error::io(&tmp, err))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|err| Error::io(path, err))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

pub fn sync_dir(dir: &Path) -> Result<(), Error> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|err| Error::io(dir, err))?;
        handle.sync_all().map_err(|err| Error::io(dir, err))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
