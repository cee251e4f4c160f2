//! Purpose: `vaultdb` CLI entry point for operating on a database directory.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Successful commands print exactly one JSON document on stdout.
//! Invariants: Errors are emitted on stderr (JSON when stderr is not a terminal).
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All storage access goes through `api::Database` (directory lock + recovery).
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod value_json;

use vaultdb::api::{Database, DatabaseOptions, Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

// Diagnostics go to stderr; stdout carries only command output.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `vaultdb --help`."));
            }
        },
    };

    let mut options = DatabaseOptions::default();
    if let Some(keystore) = cli.keystore {
        options = options.with_keystore_path(keystore);
    }

    command_dispatch::dispatch_command(cli.command, cli.dir, options)
        .map_err(add_key_hint)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "vaultdb",
    version,
    about = "Inspect and operate an embedded vaultdb database directory",
    long_about = None,
    after_help = r#"EXAMPLES
  $ vaultdb --dir ./data init
  $ vaultdb --dir ./data create-table '{"table":"users","columns":[{"name":"id","type":"INT","primary_key":true},{"name":"password","type":"TEXT","encrypted":true}]}'
  $ vaultdb --dir ./data insert users '[1, "secret123"]'
  $ vaultdb --dir ./data scan users --eq id=1
  $ vaultdb --dir ./data doctor

NOTES
  - Output is JSON on stdout; set RUST_LOG=info for recovery logs on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = "VAULTDB_DIR",
        default_value = ".",
        help = "Database directory",
        value_hint = ValueHint::DirPath
    )]
    dir: PathBuf,
    #[arg(
        long,
        env = "VAULTDB_KEYSTORE",
        help = "Key store file (default: <dir>/keystore.json)",
        value_hint = ValueHint::FilePath
    )]
    keystore: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create the database directory and key store if missing")]
    Init,
    #[command(
        name = "create-table",
        about = "Create a table from a JSON schema",
        after_help = r#"Column types: INT, TEXT, VARCHAR(n), DECIMAL, BOOLEAN.
Column flags: primary_key, unique, not_null, indexed, encrypted."#
    )]
    CreateTable {
        #[arg(help = "Schema JSON: {\"table\": ..., \"columns\": [...]}")]
        schema: String,
    },
    #[command(name = "drop-table", about = "Drop a table and its data")]
    DropTable { table: String },
    #[command(about = "List tables with row statistics")]
    Tables,
    #[command(about = "Print a table schema")]
    Schema { table: String },
    #[command(about = "Insert one row given as a JSON array in column order")]
    Insert {
        table: String,
        #[arg(help = "Row values, e.g. '[1, \"alice\", null]'")]
        values: String,
    },
    #[command(about = "Print matching rows")]
    Scan {
        table: String,
        #[arg(long, value_delimiter = ',', help = "Columns to project (default: all)")]
        columns: Vec<String>,
        #[arg(long, help = "Equality filter col=<json>; repeat to AND")]
        eq: Vec<String>,
    },
    #[command(about = "Delete matching rows")]
    Delete {
        table: String,
        #[arg(long, required = true, help = "Equality filter col=<json>; repeat to AND")]
        eq: Vec<String>,
    },
    #[command(about = "Flush tables and reset the write-ahead log")]
    Checkpoint,
    #[command(about = "Dump write-ahead log records (images omitted)")]
    Wal,
    #[command(about = "Report recovery results and check table/index consistency")]
    Doctor,
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn open_database(dir: &Path, options: DatabaseOptions) -> Result<Database, Error> {
    Database::open_with(dir, options)
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::Busy => "resource is busy",
        ErrorKind::Permission => "permission denied",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
        ErrorKind::Schema => "schema error",
        ErrorKind::Constraint => "constraint violation",
        ErrorKind::Integrity => "integrity check failed",
        ErrorKind::KeyUnavailable => "encryption key unavailable",
        ErrorKind::WalCorrupt => "write-ahead log is corrupt",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(seq) = err.seq() {
        inner.insert("seq".to_string(), json!(seq));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(table) = err.table() {
        lines.push(format!("table: {table}"));
    }
    if let Some(seq) = err.seq() {
        lines.push(format!("seq: {seq}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_key_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::KeyUnavailable || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Encrypted data cannot be read without its key store. Restore keystore.json from backup or pass --keystore.",
    )
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => {
            err.with_hint("Database is busy (another process holds the lock). Retry later.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if !matches!(err.kind(), ErrorKind::Corrupt | ErrorKind::WalCorrupt) || err.hint().is_some() {
        return err;
    }
    err.with_hint("Database files appear corrupt. Restore from backup or inspect with `vaultdb doctor`.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, add_corrupt_hint, add_key_hint, error_json, error_text};
    use clap::CommandFactory;
    use vaultdb::api::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn error_json_carries_kind_and_context() {
        let err = Error::new(ErrorKind::Constraint)
            .with_message("duplicate value 1 for unique column 'id'")
            .with_table("users");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Constraint");
        assert_eq!(value["error"]["table"], "users");
        assert!(error_text(&err).contains("table: users"));
    }

    #[test]
    fn hints_are_added_once() {
        let err = add_key_hint(Error::new(ErrorKind::KeyUnavailable));
        assert!(err.hint().is_some_and(|hint| hint.contains("keystore")));
        let err = add_corrupt_hint(Error::new(ErrorKind::WalCorrupt).with_hint("keep"));
        assert_eq!(err.hint(), Some("keep"));
    }
}
