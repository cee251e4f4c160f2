//! Purpose: Encode and decode rows against their schema, sealing encrypted columns.
//! Exports: `RecordCodec`.
//! Role: Sole translator between `Value` rows and the bytes stored in the WAL and table files.
//! Invariants: A record decodes completely or fails; partially typed output is never returned.
//! Invariants: Unrequested encrypted fields are structurally checked but never decrypted.

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{ByteReader, RECORD_FORMAT_VERSION, put_u8, put_u16, put_u32};
use crate::core::keys::{KeyManager, NONCE_LEN, Sealed, TAG_LEN};
use crate::core::schema::{Column, ColumnType, Schema};
use crate::core::value::{Decimal, Value};

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_DECIMAL: u8 = 3;
const TAG_BOOLEAN: u8 = 4;
const TAG_SEALED: u8 = 5;

#[derive(Clone, Copy, Debug)]
struct Field<'a> {
    tag: u8,
    payload: &'a [u8],
}

pub struct RecordCodec<'a> {
    schema: &'a Schema,
    keys: &'a KeyManager,
}

impl<'a> RecordCodec<'a> {
    pub fn new(schema: &'a Schema, keys: &'a KeyManager) -> Self {
        Self { schema, keys }
    }

    /// Encodes an already validated row.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>, Error> {
        if values.len() != self.schema.len() {
            return Err(Error::new(ErrorKind::Schema)
                .with_message(format!(
                    "expected {} values, got {}",
                    self.schema.len(),
                    values.len()
                ))
                .with_table(&self.schema.table));
        }
        let mut out = Vec::new();
        put_u8(&mut out, RECORD_FORMAT_VERSION);
        put_u16(&mut out, self.schema.len() as u16);
        for (column, value) in self.schema.columns.iter().zip(values) {
            let (tag, payload) = plain_field(value);
            if column.encrypted && tag != TAG_NULL {
                let mut inner = Vec::with_capacity(payload.len() + 1);
                inner.push(tag);
                inner.extend_from_slice(&payload);
                let sealed = self.keys.seal(&self.schema.table, &column.name, &inner)?;
                write_field(&mut out, TAG_SEALED, &sealed.to_bytes())?;
            } else {
                write_field(&mut out, tag, &payload)?;
            }
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, Error> {
        let fields = self.split(bytes)?;
        fields
            .iter()
            .enumerate()
            .map(|(idx, field)| self.materialize(idx, *field))
            .collect()
    }

    /// Decodes only `positions` (in the given order); other fields are validated
    /// structurally and skipped.
    pub fn decode_projected(&self, bytes: &[u8], positions: &[usize]) -> Result<Vec<Value>, Error> {
        let fields = self.split(bytes)?;
        positions
            .iter()
            .map(|&idx| match fields.get(idx) {
                Some(field) => self.materialize(idx, *field),
                None => Err(Error::new(ErrorKind::Schema)
                    .with_message(format!("column position {idx} out of range"))
                    .with_table(&self.schema.table)),
            })
            .collect()
    }

    pub fn decode_column(&self, bytes: &[u8], position: usize) -> Result<Value, Error> {
        let mut values = self.decode_projected(bytes, &[position])?;
        values.pop().ok_or_else(|| Error::new(ErrorKind::Internal).with_message("empty projection"))
    }

    fn split<'b>(&self, bytes: &'b [u8]) -> Result<Vec<Field<'b>>, Error> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.u8().ok_or_else(|| self.corrupt("empty record"))?;
        if version != RECORD_FORMAT_VERSION {
            return Err(self.corrupt(&format!("unknown record version {version}")));
        }
        let count = reader.u16().ok_or_else(|| self.corrupt("truncated record header"))?;
        if usize::from(count) != self.schema.len() {
            return Err(self.corrupt(&format!(
                "record has {count} fields, schema has {}",
                self.schema.len()
            )));
        }
        let mut fields = Vec::with_capacity(self.schema.len());
        for column in &self.schema.columns {
            let tag = reader.u8().ok_or_else(|| self.corrupt("truncated field header"))?;
            let len = reader.u32().ok_or_else(|| self.corrupt("truncated field header"))?;
            let payload = reader
                .take(len as usize)
                .ok_or_else(|| self.corrupt(&format!("field '{}' truncated", column.name)))?;
            self.check_field(column, tag, payload)?;
            fields.push(Field { tag, payload });
        }
        if !reader.is_empty() {
            return Err(self.corrupt("trailing bytes after last field"));
        }
        Ok(fields)
    }

    fn check_field(&self, column: &Column, tag: u8, payload: &[u8]) -> Result<(), Error> {
        if tag == TAG_NULL {
            if !payload.is_empty() {
                return Err(self.corrupt(&format!("NULL field '{}' has a payload", column.name)));
            }
            return Ok(());
        }
        if column.encrypted {
            if tag != TAG_SEALED {
                return Err(self.corrupt(&format!("plain value in encrypted column '{}'", column.name)));
            }
            if payload.len() < NONCE_LEN + TAG_LEN + 1 {
                return Err(self.corrupt(&format!("sealed field '{}' too short", column.name)));
            }
            return Ok(());
        }
        check_plain(column, tag, payload).map_err(|message| self.corrupt(&message))
    }

    fn materialize(&self, idx: usize, field: Field<'_>) -> Result<Value, Error> {
        let column = &self.schema.columns[idx];
        match field.tag {
            TAG_NULL => Ok(Value::Null),
            TAG_SEALED => {
                let sealed = Sealed::from_bytes(field.payload)?;
                let inner = self.keys.open(&self.schema.table, &column.name, &sealed)?;
                let (&tag, payload) = inner
                    .split_first()
                    .ok_or_else(|| self.corrupt("empty sealed payload"))?;
                if tag == TAG_NULL || tag == TAG_SEALED {
                    return Err(self.corrupt(&format!("bad sealed tag in '{}'", column.name)));
                }
                check_plain(column, tag, payload).map_err(|message| self.corrupt(&message))?;
                decode_plain(column, tag, payload).map_err(|message| self.corrupt(&message))
            }
            tag => decode_plain(column, tag, field.payload).map_err(|message| self.corrupt(&message)),
        }
    }

    fn corrupt(&self, message: &str) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("record decode failed: {message}"))
            .with_table(&self.schema.table)
    }
}

fn write_field(out: &mut Vec<u8>, tag: u8, payload: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::new(ErrorKind::Schema).with_message("value too large to encode"))?;
    put_u8(out, tag);
    put_u32(out, len);
    out.extend_from_slice(payload);
    Ok(())
}

fn plain_field(value: &Value) -> (u8, Vec<u8>) {
    match value {
        Value::Null => (TAG_NULL, Vec::new()),
        Value::Int(n) => (TAG_INT, n.to_le_bytes().to_vec()),
        Value::Text(text) => (TAG_TEXT, text.as_bytes().to_vec()),
        Value::Decimal(d) => (TAG_DECIMAL, d.to_string().into_bytes()),
        Value::Boolean(b) => (TAG_BOOLEAN, vec![u8::from(*b)]),
    }
}

fn expected_tag(column_type: ColumnType) -> u8 {
    match column_type {
        ColumnType::Int => TAG_INT,
        ColumnType::Varchar(_) | ColumnType::Text => TAG_TEXT,
        ColumnType::Decimal => TAG_DECIMAL,
        ColumnType::Boolean => TAG_BOOLEAN,
    }
}

fn check_plain(column: &Column, tag: u8, payload: &[u8]) -> Result<(), String> {
    if tag != expected_tag(column.column_type) {
        return Err(format!("field '{}' has tag {tag} for {}", column.name, column.column_type));
    }
    match tag {
        TAG_INT if payload.len() != 8 => Err(format!("INT field '{}' has bad width", column.name)),
        TAG_BOOLEAN if payload.len() != 1 || payload[0] > 1 => {
            Err(format!("BOOLEAN field '{}' is malformed", column.name))
        }
        _ => Ok(()),
    }
}

fn decode_plain(column: &Column, tag: u8, payload: &[u8]) -> Result<Value, String> {
    match tag {
        TAG_INT => {
            let mut reader = ByteReader::new(payload);
            reader
                .i64()
                .map(Value::Int)
                .ok_or_else(|| format!("INT field '{}' truncated", column.name))
        }
        TAG_TEXT => std::str::from_utf8(payload)
            .map(|text| Value::Text(text.to_string()))
            .map_err(|_| format!("text field '{}' is not UTF-8", column.name)),
        TAG_DECIMAL => std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.parse::<Decimal>().ok())
            .map(Value::Decimal)
            .ok_or_else(|| format!("DECIMAL field '{}' is malformed", column.name)),
        TAG_BOOLEAN => Ok(Value::Boolean(payload.first() == Some(&1))),
        other => Err(format!("unknown field tag {other} in '{}'", column.name)),
    }
}
