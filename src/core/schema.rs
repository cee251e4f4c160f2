//! Purpose: Table schemas and row validation against them.
//! Exports: `ColumnType`, `Column`, `Schema`.
//! Role: Read-only description of a table consumed by the codec, indexes, and txn layer.
//! Invariants: Identifiers are `[A-Za-z_][A-Za-z0-9_]*`; column names are unique.
//! Invariants: At most one primary key; a primary key is NOT NULL and uniquely indexed.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::{Decimal, Value};

pub const DEFAULT_VARCHAR_LEN: u32 = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Int,
    Varchar(u32),
    Text,
    Decimal,
    Boolean,
}

impl ColumnType {
    /// Checks `value` against this type, widening INT literals into DECIMAL columns.
    pub fn coerce(&self, value: Value) -> Result<Value, Error> {
        let mismatch = |value: &Value| {
            Error::new(ErrorKind::Schema)
                .with_message(format!("expected {self}, got {}", value.type_name()))
        };
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Int, value @ Value::Int(_)) => Ok(value),
            (ColumnType::Boolean, value @ Value::Boolean(_)) => Ok(value),
            (ColumnType::Decimal, value @ Value::Decimal(_)) => Ok(value),
            (ColumnType::Decimal, Value::Int(n)) => Ok(Value::Decimal(Decimal::from_i64(n))),
            (ColumnType::Text, value @ Value::Text(_)) => Ok(value),
            (ColumnType::Varchar(max), Value::Text(text)) => {
                let len = text.chars().count();
                if len > *max as usize {
                    return Err(Error::new(ErrorKind::Schema)
                        .with_message(format!("string of length {len} exceeds VARCHAR({max})")));
                }
                Ok(Value::Text(text))
            }
            (_, value) => Err(mismatch(&value)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::Varchar(len) => write!(f, "VARCHAR({len})"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Decimal => write!(f, "DECIMAL"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let unknown =
            || Error::new(ErrorKind::Schema).with_message(format!("unknown column type '{input}'"));
        let upper = input.trim().to_ascii_uppercase();
        let (name, arg) = match upper.split_once('(') {
            Some((name, rest)) => {
                let arg = rest.strip_suffix(')').ok_or_else(unknown)?;
                (name.trim().to_string(), Some(arg.trim().to_string()))
            }
            None => (upper.clone(), None),
        };
        match (name.as_str(), arg) {
            ("INT" | "INTEGER", None) => Ok(ColumnType::Int),
            ("TEXT", None) => Ok(ColumnType::Text),
            ("DECIMAL" | "NUMERIC", None) => Ok(ColumnType::Decimal),
            ("BOOLEAN" | "BOOL", None) => Ok(ColumnType::Boolean),
            ("VARCHAR" | "STRING", None) => Ok(ColumnType::Varchar(DEFAULT_VARCHAR_LEN)),
            ("VARCHAR", Some(arg)) => {
                let len: u32 = arg.parse().map_err(|_| unknown())?;
                if len == 0 {
                    return Err(Error::new(ErrorKind::Schema)
                        .with_message("VARCHAR length must be positive"));
                }
                Ok(ColumnType::Varchar(len))
            }
            _ => Err(unknown()),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub indexed: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            encrypted: false,
            primary_key: false,
            unique: false,
            not_null: false,
            indexed: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn is_unique(&self) -> bool {
        self.primary_key || self.unique
    }

    pub fn has_index(&self) -> bool {
        self.is_unique() || self.indexed
    }

    pub fn rejects_null(&self) -> bool {
        self.primary_key || self.not_null
    }

    pub fn validate(&self, value: Value) -> Result<Value, Error> {
        if value.is_null() {
            if self.rejects_null() {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("column '{}' cannot be NULL", self.name)));
            }
            return Ok(Value::Null);
        }
        self.column_type.coerce(value).map_err(|err| {
            let detail = err.message().unwrap_or("type mismatch").to_string();
            Error::new(ErrorKind::Schema).with_message(format!("column '{}': {detail}", self.name))
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub table: String,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Result<Self, Error> {
        let schema = Self {
            table: table.into(),
            columns,
        };
        schema.check()?;
        Ok(schema)
    }

    /// Structural checks applied at table creation and when loading from disk.
    pub fn check(&self) -> Result<(), Error> {
        if !is_identifier(&self.table) {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!("invalid table name '{}'", self.table)));
        }
        if self.columns.is_empty() {
            return Err(Error::new(ErrorKind::Schema)
                .with_message("a table needs at least one column")
                .with_table(&self.table));
        }
        if self.columns.len() > usize::from(u16::MAX) {
            return Err(Error::new(ErrorKind::Schema)
                .with_message("too many columns")
                .with_table(&self.table));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("invalid column name '{}'", column.name))
                    .with_table(&self.table));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("duplicate column name '{}'", column.name))
                    .with_table(&self.table));
            }
        }
        if self.columns.iter().filter(|column| column.primary_key).count() > 1 {
            return Err(Error::new(ErrorKind::Schema)
                .with_message("only one PRIMARY KEY allowed per table")
                .with_table(&self.table));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, Error> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::Schema)
                    .with_message(format!("unknown column '{name}'"))
                    .with_table(&self.table)
            })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn has_encrypted_columns(&self) -> bool {
        self.columns.iter().any(|column| column.encrypted)
    }

    pub fn primary_key(&self) -> Option<usize> {
        self.columns.iter().position(|column| column.primary_key)
    }

    pub fn indexed_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.has_index())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Validates a full row in column order.
    pub fn validate_row(&self, values: Vec<Value>) -> Result<Vec<Value>, Error> {
        if values.len() != self.columns.len() {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    values.len()
                ))
                .with_table(&self.table));
        }
        self.columns
            .iter()
            .zip(values)
            .map(|(column, value)| column.validate(value).map_err(|err| err.with_table(&self.table)))
            .collect()
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::{Column, ColumnType, Schema};
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;

    fn users() -> Schema {
        Schema::new(
            "users",
            vec![
                Column::new("id", ColumnType::Int).primary_key(),
                Column::new("name", ColumnType::Varchar(5)),
                Column::new("password", ColumnType::Text).encrypted(),
            ],
        )
        .expect("schema")
    }

    #[test]
    fn column_types_parse_with_aliases() {
        assert_eq!("int".parse::<ColumnType>().unwrap(), ColumnType::Int);
        assert_eq!("INTEGER".parse::<ColumnType>().unwrap(), ColumnType::Int);
        assert_eq!("varchar( 50 )".parse::<ColumnType>().unwrap(), ColumnType::Varchar(50));
        assert_eq!("STRING".parse::<ColumnType>().unwrap(), ColumnType::Varchar(255));
        assert_eq!("bool".parse::<ColumnType>().unwrap(), ColumnType::Boolean);
        assert_eq!("DECIMAL".parse::<ColumnType>().unwrap(), ColumnType::Decimal);
        assert!("VARCHAR(0)".parse::<ColumnType>().is_err());
        assert!("BLOB".parse::<ColumnType>().is_err());
    }

    #[test]
    fn schema_round_trips_through_json() {
        let schema = users();
        let text = serde_json::to_string(&schema).expect("json");
        assert!(text.contains("\"type\":\"VARCHAR(5)\""));
        let back: Schema = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, schema);
    }

    #[test]
    fn schema_rejects_two_primary_keys_and_duplicates() {
        let err = Schema::new(
            "t",
            vec![
                Column::new("a", ColumnType::Int).primary_key(),
                Column::new("b", ColumnType::Int).primary_key(),
            ],
        )
        .expect_err("two pks");
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err = Schema::new(
            "t",
            vec![Column::new("a", ColumnType::Int), Column::new("a", ColumnType::Text)],
        )
        .expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::Schema);

        assert!(Schema::new("1bad", vec![Column::new("a", ColumnType::Int)]).is_err());
    }

    #[test]
    fn validate_row_enforces_types_lengths_and_nulls() {
        let schema = users();
        let ok = schema
            .validate_row(vec![Value::Int(1), "Alice".into(), Value::Null])
            .expect("valid");
        assert_eq!(ok[1], Value::Text("Alice".into()));

        let too_long = schema
            .validate_row(vec![Value::Int(1), "Alicia".into(), Value::Null])
            .expect_err("too long");
        assert_eq!(too_long.kind(), ErrorKind::Schema);

        let null_pk = schema
            .validate_row(vec![Value::Null, "Al".into(), Value::Null])
            .expect_err("null pk");
        assert_eq!(null_pk.kind(), ErrorKind::Schema);

        let wrong_type = schema
            .validate_row(vec!["1".into(), "Al".into(), Value::Null])
            .expect_err("wrong type");
        assert_eq!(wrong_type.kind(), ErrorKind::Schema);

        let short = schema.validate_row(vec![Value::Int(1)]).expect_err("arity");
        assert_eq!(short.kind(), ErrorKind::Schema);
    }

    #[test]
    fn int_widens_into_decimal_columns() {
        let column = Column::new("price", ColumnType::Decimal);
        let value = column.validate(Value::Int(3)).expect("widen");
        assert_eq!(value.to_string(), "3");
        assert!(matches!(value, Value::Decimal(_)));
    }
}
