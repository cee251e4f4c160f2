//! Purpose: Hold top-level CLI command dispatch for `vaultdb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Mutating commands close the database (checkpoint) before returning.
//! Invariants: `wal` inspects the log without checkpointing it away.

use super::*;
use super::value_json::{
    parse_eq, recovery_json, row_from_json, row_json, schema_json, table_stats_json,
    validation_json, wal_scan_json,
};
use vaultdb::api::{Predicate, Projection, Schema};

pub(super) fn dispatch_command(
    command: Command,
    dir: PathBuf,
    options: DatabaseOptions,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "vaultdb", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Init => {
            let db = open_database(&dir, options)?;
            let value = json!({
                "path": db.path().display().to_string(),
                "key_id": db.key_id(),
                "tables": db.table_names(),
                "recovery": recovery_json(&db.recovery_report()),
            });
            db.close()?;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::CreateTable { schema } => {
            let schema: Schema = serde_json::from_str(&schema).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("schema is not valid JSON")
                    .with_hint("Expected {\"table\": \"name\", \"columns\": [{\"name\": ..., \"type\": ...}]}")
                    .with_source(err)
            })?;
            let db = open_database(&dir, options)?;
            let created = db.create_table(schema)?;
            db.close()?;
            emit_json(json!({ "created": schema_json(&created) }));
            Ok(RunOutcome::ok())
        }
        Command::DropTable { table } => {
            let db = open_database(&dir, options)?;
            db.drop_table(&table)?;
            db.close()?;
            emit_json(json!({ "dropped": table }));
            Ok(RunOutcome::ok())
        }
        Command::Tables => {
            let db = open_database(&dir, options)?;
            let mut tables = Vec::new();
            for name in db.table_names() {
                tables.push(table_stats_json(&db.table_stats(&name)?));
            }
            db.close()?;
            emit_json(json!({ "tables": tables }));
            Ok(RunOutcome::ok())
        }
        Command::Schema { table } => {
            let db = open_database(&dir, options)?;
            let schema = db.schema(&table)?;
            db.close()?;
            emit_json(schema_json(&schema));
            Ok(RunOutcome::ok())
        }
        Command::Insert { table, values } => {
            let db = open_database(&dir, options)?;
            let schema = db.schema(&table)?;
            let row = row_from_json(&schema, &values)?;
            let rid = db.insert(&table, row)?;
            db.close()?;
            emit_json(json!({ "table": table, "rid": rid }));
            Ok(RunOutcome::ok())
        }
        Command::Scan { table, columns, eq } => {
            let db = open_database(&dir, options)?;
            let schema = db.schema(&table)?;
            let predicate = eq_predicate(&schema, &eq)?;
            let projection = if columns.is_empty() {
                Projection::All
            } else {
                Projection::columns(columns)
            };
            let mut rows = Vec::new();
            for row in db.scan(&table, &predicate, projection)? {
                rows.push(row_json(&row?));
            }
            db.close()?;
            emit_json(json!({ "table": table, "count": rows.len(), "rows": rows }));
            Ok(RunOutcome::ok())
        }
        Command::Delete { table, eq } => {
            let db = open_database(&dir, options)?;
            let schema = db.schema(&table)?;
            let predicate = eq_predicate(&schema, &eq)?;
            let deleted = db.delete(&table, &predicate)?;
            db.close()?;
            emit_json(json!({ "table": table, "deleted": deleted }));
            Ok(RunOutcome::ok())
        }
        Command::Checkpoint => {
            let db = open_database(&dir, options)?;
            db.checkpoint()?;
            db.close()?;
            emit_json(json!({ "checkpoint": "ok" }));
            Ok(RunOutcome::ok())
        }
        Command::Wal => {
            // Dropped without `close` so the log is left as found (after recovery).
            let db = open_database(&dir, options)?;
            let scan = db.wal_scan()?;
            emit_json(wal_scan_json(&scan));
            Ok(RunOutcome::ok())
        }
        Command::Doctor => {
            let db = open_database(&dir, options)?;
            let recovery = db.recovery_report();
            let report = db.verify();
            let exit_code = if report.is_ok() {
                0
            } else {
                to_exit_code(ErrorKind::Corrupt)
            };
            emit_json(json!({
                "recovery": recovery_json(&recovery),
                "report": validation_json(&report),
            }));
            Ok(RunOutcome::with_code(exit_code))
        }
    }
}

fn eq_predicate(schema: &Schema, filters: &[String]) -> Result<Predicate, Error> {
    let mut predicate = Predicate::All;
    for filter in filters {
        let (column, value) = parse_eq(schema, filter)?;
        let term = Predicate::eq(column, value);
        predicate = match predicate {
            Predicate::All => term,
            other => other.and(term),
        };
    }
    Ok(predicate)
}
