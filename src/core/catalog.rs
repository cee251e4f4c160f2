// Table schemas persisted as one JSON document per table.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::dir::{DataDir, write_atomic};
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::Schema;

#[derive(Debug, Default)]
pub struct Catalog {
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl Catalog {
    pub fn load(dir: &DataDir) -> Result<Self, Error> {
        let mut schemas = BTreeMap::new();
        for table in dir.list_tables()? {
            let path = dir.schema_path(&table);
            let bytes = std::fs::read(&path).map_err(|err| Error::io(&path, err))?;
            let schema: Schema = serde_json::from_slice(&bytes).map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("schema file is not valid JSON")
                    .with_table(&table)
                    .with_path(&path)
                    .with_source(err)
            })?;
            schema.check().map_err(|err| {
                Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "schema file is invalid: {}",
                        err.message().unwrap_or("check failed")
                    ))
                    .with_table(&table)
                    .with_path(&path)
            })?;
            if schema.table != table {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("schema file names table '{}'", schema.table))
                    .with_table(&table)
                    .with_path(&path));
            }
            schemas.insert(table, Arc::new(schema));
        }
        Ok(Self { schemas })
    }

    pub fn get(&self, table: &str) -> Result<&Arc<Schema>, Error> {
        self.schemas.get(table).ok_or_else(|| {
            Error::new(ErrorKind::Schema)
                .with_message(format!("unknown table '{table}'"))
                .with_table(table)
        })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.schemas.contains_key(table)
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Schema>)> {
        self.schemas.iter()
    }

    /// Persists and registers a new table schema.
    pub fn create(&mut self, dir: &DataDir, schema: Schema) -> Result<Arc<Schema>, Error> {
        schema.check()?;
        if self.contains(&schema.table) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("table '{}' already exists", schema.table))
                .with_table(&schema.table));
        }
        let path = dir.schema_path(&schema.table);
        let json = serde_json::to_vec_pretty(&schema).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode schema")
                .with_source(err)
        })?;
        write_atomic(&path, &json, false).map_err(|err| err.with_table(&schema.table))?;
        let schema = Arc::new(schema);
        self.schemas.insert(schema.table.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn drop_table(&mut self, dir: &DataDir, table: &str) -> Result<Arc<Schema>, Error> {
        let schema = Arc::clone(self.get(table)?);
        let path = dir.schema_path(table);
        std::fs::remove_file(&path).map_err(|err| Error::io(&path, err).with_table(table))?;
        self.schemas.remove(table);
        Ok(schema)
    }
}
