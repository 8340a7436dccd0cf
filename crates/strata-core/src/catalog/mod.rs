//! Table catalog: name → schema mapping, persisted across restarts.
//!
//! The catalog file `catalog.dat` is a `count: u32 LE` header followed by
//! `count` length-prefixed entries (`len: u32 LE || serde_json bytes` of a
//! [`TableSchema`]). It is rewritten atomically (temp file + rename) after
//! every mutation. On load the table-id counter is advanced past the
//! highest persisted id, so ids are never reused across restarts even after
//! drops.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Error, SchemaError, StorageError};
use crate::types::{ColumnDef, TableId, TableSchema};

const CATALOG_FILE: &str = "catalog.dat";
const CATALOG_TMP: &str = "catalog.tmp";

#[derive(Debug)]
struct CatalogInner {
    tables: HashMap<String, TableSchema>,
    next_table_id: TableId,
}

/// The table catalog. DDL takes the writer side of the lock, lookups the
/// reader side.
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    /// Open the catalog in `dir` (usually `<dataDir>/metadata`), loading the
    /// persisted state when present.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(StorageError::from)?;

        let path = dir.join(CATALOG_FILE);
        let tables = match fs::read(&path) {
            Ok(bytes) => parse_catalog(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StorageError::from(e).into()),
        };

        let next_table_id = tables
            .values()
            .map(|schema| schema.table_id)
            .max()
            .map_or(1, |max| max + 1);

        Ok(Self {
            dir,
            inner: RwLock::new(CatalogInner {
                tables,
                next_table_id,
            }),
        })
    }

    /// Register a new table: allocate the next table id, derive the primary
    /// key column, and persist.
    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDef>,
        document_mode: bool,
    ) -> Result<TableSchema, Error> {
        let primary_keys: Vec<&str> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        if primary_keys.len() > 1 {
            return Err(SchemaError::InvalidArgument(format!(
                "table '{name}' declares {} primary key columns",
                primary_keys.len()
            ))
            .into());
        }
        let primary_key_column = primary_keys.first().map(|s| s.to_string());

        let mut inner = self.inner.write();
        if inner.tables.contains_key(name) {
            return Err(SchemaError::TableExists(name.to_string()).into());
        }

        let schema = TableSchema {
            table_id: inner.next_table_id,
            table_name: name.to_string(),
            columns,
            primary_key_column,
            document_mode,
            row_count: 0,
        };
        inner.next_table_id += 1;
        inner.tables.insert(name.to_string(), schema.clone());

        if let Err(e) = self.persist_locked(&inner) {
            inner.tables.remove(name);
            return Err(e);
        }
        Ok(schema)
    }

    /// Remove a table and persist. The name becomes reusable; the id never
    /// is (the counter is not rewound).
    pub fn drop_table(&self, name: &str) -> Result<TableSchema, Error> {
        let mut inner = self.inner.write();
        let Some(schema) = inner.tables.remove(name) else {
            return Err(SchemaError::TableNotFound(name.to_string()).into());
        };

        if let Err(e) = self.persist_locked(&inner) {
            inner.tables.insert(name.to_string(), schema);
            return Err(e);
        }
        Ok(schema)
    }

    pub fn get_table(&self, name: &str) -> Result<TableSchema, Error> {
        self.inner
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::TableNotFound(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().tables.contains_key(name)
    }

    /// Table names in sorted order.
    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_count(&self) -> usize {
        self.inner.read().tables.len()
    }

    /// Sum of live row counts across all tables.
    pub fn total_rows(&self) -> u64 {
        self.inner
            .read()
            .tables
            .values()
            .map(|schema| schema.row_count)
            .sum()
    }

    /// Adjust a table's live row count in memory. Keyed by table id because
    /// undo paths carry only ids. Counts are written out on the next
    /// [`Catalog::persist`] (checkpoint or shutdown), not on every DML call.
    pub fn adjust_row_count(&self, table_id: TableId, delta: i64) {
        let mut inner = self.inner.write();
        if let Some(schema) = inner
            .tables
            .values_mut()
            .find(|schema| schema.table_id == table_id)
        {
            schema.row_count = schema.row_count.saturating_add_signed(delta);
        }
    }

    /// Look up a table's name by id.
    pub fn table_name(&self, table_id: TableId) -> Option<String> {
        self.inner
            .read()
            .tables
            .values()
            .find(|schema| schema.table_id == table_id)
            .map(|schema| schema.table_name.clone())
    }

    /// Rewrite the catalog file from the current in-memory state.
    pub fn persist(&self) -> Result<(), Error> {
        let inner = self.inner.read();
        self.persist_locked(&inner)
    }

    fn persist_locked(&self, inner: &CatalogInner) -> Result<(), Error> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(inner.tables.len() as u32).to_le_bytes());

        // Stable order keeps the file byte-identical for identical state.
        let mut schemas: Vec<&TableSchema> = inner.tables.values().collect();
        schemas.sort_by_key(|schema| schema.table_id);
        for schema in schemas {
            let bytes = serde_json::to_vec(schema).map_err(|e| {
                StorageError::CorruptedCatalog(format!("failed to serialize schema: {e}"))
            })?;
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }

        let tmp = self.dir.join(CATALOG_TMP);
        fs::write(&tmp, &buf).map_err(StorageError::from)?;
        fs::rename(&tmp, self.dir.join(CATALOG_FILE)).map_err(StorageError::from)?;
        Ok(())
    }
}

fn parse_catalog(bytes: &[u8]) -> Result<HashMap<String, TableSchema>, Error> {
    let header = bytes
        .get(0..4)
        .ok_or_else(|| StorageError::CorruptedCatalog("missing count header".to_string()))?;
    let count = u32::from_le_bytes(header.try_into().unwrap());

    let mut tables = HashMap::with_capacity(count as usize);
    let mut offset = 4;
    for i in 0..count {
        let len_bytes = bytes.get(offset..offset + 4).ok_or_else(|| {
            StorageError::CorruptedCatalog(format!("truncated length prefix for entry {i}"))
        })?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        offset += 4;

        let entry = bytes.get(offset..offset + len).ok_or_else(|| {
            StorageError::CorruptedCatalog(format!("truncated entry {i} ({len} bytes)"))
        })?;
        offset += len;

        let schema: TableSchema = serde_json::from_slice(entry).map_err(|e| {
            StorageError::CorruptedCatalog(format!("failed to deserialize entry {i}: {e}"))
        })?;
        tables.insert(schema.table_name.clone(), schema);
    }
    Ok(tables)
}
