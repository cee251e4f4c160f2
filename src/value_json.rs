//! Purpose: Convert engine values, rows, and reports to and from CLI JSON.
//! Exports: JSON helpers used by command dispatch.
//! Role: Keeps JSON shapes in one place so command output stays consistent.
//! Invariants: DECIMAL values travel as strings so no precision is lost.
use serde_json::{Map, Value as Json, json};
use vaultdb::api::{
    ColumnType, Decimal, Error, ErrorKind, RecoveryReport, Row, Schema, TableStats,
    ValidationReport, Value, WalRecord, WalScan,
};

/// Converts a JSON literal into a value for a column of type `column_type`.
pub(super) fn value_from_json(json: &Json, column_type: ColumnType) -> Result<Value, Error> {
    let mismatch = || {
        Error::new(ErrorKind::Schema)
            .with_message(format!("cannot use JSON {json} as {column_type}"))
    };
    match (json, column_type) {
        (Json::Null, _) => Ok(Value::Null),
        (Json::Bool(flag), ColumnType::Boolean) => Ok(Value::Boolean(*flag)),
        (Json::Number(number), ColumnType::Int) => {
            number.as_i64().map(Value::Int).ok_or_else(mismatch)
        }
        (Json::Number(number), ColumnType::Decimal) => {
            Ok(Value::Decimal(number.to_string().parse::<Decimal>()?))
        }
        (Json::String(text), ColumnType::Decimal) => Ok(Value::Decimal(text.parse::<Decimal>()?)),
        (Json::String(text), ColumnType::Text | ColumnType::Varchar(_)) => {
            Ok(Value::Text(text.clone()))
        }
        _ => Err(mismatch()),
    }
}

pub(super) fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Int(n) => json!(n),
        Value::Text(text) => json!(text),
        Value::Decimal(decimal) => json!(decimal.to_string()),
        Value::Boolean(flag) => json!(flag),
    }
}

/// Parses a JSON array into a full row for `schema`.
pub(super) fn row_from_json(schema: &Schema, input: &str) -> Result<Vec<Value>, Error> {
    let parsed: Json = serde_json::from_str(input).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("row values must be a JSON array")
            .with_source(err)
    })?;
    let Json::Array(items) = parsed else {
        return Err(Error::new(ErrorKind::Usage).with_message("row values must be a JSON array"));
    };
    if items.len() != schema.len() {
        return Err(Error::new(ErrorKind::Schema)
            .with_message(format!("expected {} values, got {}", schema.len(), items.len()))
            .with_table(&schema.table));
    }
    schema
        .columns
        .iter()
        .zip(&items)
        .map(|(column, item)| {
            value_from_json(item, column.column_type).map_err(|err| err.with_table(&schema.table))
        })
        .collect()
}

/// Splits `col=<json>`; a right-hand side that is not valid JSON is taken as a string.
pub(super) fn parse_eq(schema: &Schema, input: &str) -> Result<(String, Value), Error> {
    let Some((column, literal)) = input.split_once('=') else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("expected col=value, got '{input}'"))
            .with_hint("Example: --eq id=1 or --eq name='\"alice\"'"));
    };
    let column = column.trim();
    let position = schema.column_index(column)?;
    let json = serde_json::from_str::<Json>(literal).unwrap_or_else(|_| json!(literal));
    let value = value_from_json(&json, schema.columns[position].column_type)?;
    Ok((column.to_string(), value))
}

pub(super) fn row_json(row: &Row) -> Json {
    let mut values = Map::new();
    for (column, value) in row.columns().iter().zip(row.values()) {
        values.insert(column.clone(), value_to_json(value));
    }
    json!({ "rid": row.rid, "values": values })
}

pub(super) fn schema_json(schema: &Schema) -> Json {
    serde_json::to_value(schema).unwrap_or_else(|_| json!({ "table": schema.table }))
}

pub(super) fn table_stats_json(stats: &TableStats) -> Json {
    let indexes: Vec<Json> = stats
        .indexes
        .iter()
        .map(|index| {
            json!({
                "column": index.column,
                "unique": index.unique,
                "distinct_keys": index.distinct_keys,
                "entries": index.entries,
                "height": index.height,
            })
        })
        .collect();
    json!({
        "table": stats.table,
        "columns": stats.columns,
        "live_rows": stats.live_rows,
        "tombstones": stats.tombstones,
        "next_rid": stats.next_rid,
        "checkpoint_seq": stats.checkpoint_seq,
        "payload_bytes": stats.payload_bytes,
        "indexes": indexes,
    })
}

pub(super) fn recovery_json(report: &RecoveryReport) -> Json {
    json!({
        "clean": report.is_clean(),
        "records_scanned": report.records_scanned,
        "committed": report.committed,
        "aborted": report.aborted,
        "rolled_back": report.rolled_back,
        "rows_redone": report.rows_redone,
        "rows_skipped": report.rows_skipped,
        "damage": report.damage.as_ref().map(|damage| json!({
            "offset": damage.offset,
            "reason": damage.reason,
        })),
        "truncated_to": report.truncated_to,
    })
}

pub(super) fn validation_json(report: &ValidationReport) -> Json {
    let issues: Vec<Json> = report
        .issues
        .iter()
        .map(|issue| {
            json!({
                "code": issue.code,
                "message": issue.message,
                "table": issue.table,
                "rid": issue.rid,
            })
        })
        .collect();
    json!({
        "path": report.path.display().to_string(),
        "status": report.status.as_str(),
        "tables_checked": report.tables_checked,
        "rows_checked": report.rows_checked,
        "issue_count": report.issue_count,
        "issues": issues,
        "remediation_hints": report.remediation_hints,
    })
}

fn wal_record_json(record: &WalRecord) -> Json {
    let row_change = record.op.is_row_change();
    let table = row_change.then_some(record.table.as_str());
    let rid = row_change.then_some(record.rid);
    json!({
        "seq": record.seq,
        "txn": record.txn,
        "op": record.op.as_str(),
        "table": table,
        "rid": rid,
        "before_len": record.before.as_ref().map(Vec::len),
        "after_len": record.after.as_ref().map(Vec::len),
        "offset": record.offset,
    })
}

pub(super) fn wal_scan_json(scan: &WalScan) -> Json {
    let records: Vec<Json> = scan.records.iter().map(wal_record_json).collect();
    json!({
        "base_seq": scan.header.base_seq,
        "next_txn": scan.header.next_txn,
        "valid_len": scan.valid_len,
        "damage": scan.damage.as_ref().map(|damage| json!({
            "offset": damage.offset,
            "reason": damage.reason,
        })),
        "records": records,
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_eq, row_from_json, value_from_json, value_to_json};
    use serde_json::json;
    use vaultdb::api::{Column, ColumnType, ErrorKind, Schema, Value};

    fn schema() -> Schema {
        Schema::new(
            "items",
            vec![
                Column::new("id", ColumnType::Int).primary_key(),
                Column::new("name", ColumnType::Varchar(8)),
                Column::new("price", ColumnType::Decimal),
                Column::new("active", ColumnType::Boolean),
            ],
        )
        .expect("schema")
    }

    #[test]
    fn decimals_keep_their_digits() {
        let value = value_from_json(&json!("10.25"), ColumnType::Decimal).expect("decimal");
        assert_eq!(value_to_json(&value), json!("10.25"));
        let value = value_from_json(&json!(3), ColumnType::Decimal).expect("int as decimal");
        assert_eq!(value_to_json(&value), json!("3"));
    }

    #[test]
    fn rows_follow_column_types() {
        let row = row_from_json(&schema(), r#"[1, "pen", "2.25", true]"#).expect("row");
        assert_eq!(row[0], Value::Int(1));
        assert_eq!(row[3], Value::Boolean(true));

        let err = row_from_json(&schema(), r#"["one", "pen", "2.25", true]"#).expect_err("type");
        assert_eq!(err.kind(), ErrorKind::Schema);
        let err = row_from_json(&schema(), r#"{"id": 1}"#).expect_err("shape");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn eq_filters_accept_bare_strings() {
        let (column, value) = parse_eq(&schema(), "name=pen").expect("bare");
        assert_eq!((column.as_str(), value), ("name", Value::from("pen")));
        let (_, value) = parse_eq(&schema(), "id=7").expect("json");
        assert_eq!(value, Value::Int(7));
        assert_eq!(
            parse_eq(&schema(), "missing=1").expect_err("column").kind(),
            ErrorKind::Schema
        );
    }
}
