//! Core types: ids, layout constants, values, tuples, column and table schemas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Table identifier (allocated by the catalog, never reused).
pub type TableId = u32;

/// Page identifier (offset in units of PAGE_SIZE within a table file).
pub type PageId = u32;

/// Row identifier (unique within a table).
pub type RowId = u64;

/// Transaction identifier (monotonically increasing; 0 is reserved).
pub type TxnId = u64;

/// Log sequence number (strictly monotonic across the whole WAL stream).
pub type Lsn = u64;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Size of the fixed page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 20;

/// Bytes available for records in a page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Maximum size of a WAL segment file before rotation (16 MiB).
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// The reserved "no transaction" id.
pub const NO_TXN: TxnId = 0;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Text,
    Binary,
    Timestamp,
    Json,
}

/// A self-describing scalar value.
///
/// The serialized form is a tag byte followed by a type-specific payload;
/// see [`crate::encoding::value`] for the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    Timestamp(u64),
    Json(serde_json::Value),
}

impl Value {
    /// The declared type this value satisfies, or `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Text(_) => Some(DataType::Text),
            Value::Binary(_) => Some(DataType::Binary),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Json(_) => Some(DataType::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// An ordered record stored in a table.
///
/// Tombstoned tuples (`deleted == true`) stay physically present until
/// compaction; scans skip them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub row_id: RowId,
    /// The transaction that created this version of the tuple.
    pub txn_id: TxnId,
    /// Monotonic creation timestamp.
    pub timestamp: u64,
    pub deleted: bool,
    pub columns: BTreeMap<String, Value>,
}

impl Tuple {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }
}

/// A column definition (name, type, constraints, optional default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl ColumnDef {
    /// A plain non-key column with no default.
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    /// A non-nullable primary key column.
    pub fn primary_key(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            primary_key: true,
            unique: true,
            default_value: None,
        }
    }
}

/// Schema definition for a table.
///
/// In document mode the declared columns constrain only declared fields;
/// tuples may carry additional undeclared columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: TableId,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key_column: Option<String>,
    pub document_mode: bool,
    /// Live (non-tombstoned) row count, maintained by the executor.
    pub row_count: u64,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Transaction isolation level.
///
/// Stored as advisory metadata only: this core performs no visibility
/// checks, so every transaction effectively runs read-uncommitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}
