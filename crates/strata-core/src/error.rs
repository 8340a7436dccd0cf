//! Error types for all StrataDB operations.

use std::io;
use thiserror::Error;

use crate::types::{DataType, PageId, RowId, TableId, TxnId};

/// Top-level error type for StrataDB operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Transaction(#[from] TxnError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted page: {0}")]
    CorruptedPage(String),

    #[error("corrupted catalog: {0}")]
    CorruptedCatalog(String),

    #[error("table file already exists: {0}")]
    TableExists(TableId),

    #[error("table file missing: {0}")]
    TableMissing(TableId),

    #[error("page out of bounds: {page_id} >= {page_count}")]
    PageOutOfBounds { page_id: PageId, page_count: PageId },

    #[error("record of {0} bytes cannot fit in a page")]
    RecordTooLarge(usize),

    #[error("page has no room for a {needed}-byte record ({free} bytes free)")]
    PageFull { needed: usize, free: usize },

    #[error("data directory is locked by another process")]
    DirectoryLocked,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer pool exhausted: all {capacity} frames are pinned")]
    Exhausted { capacity: usize },
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("write-ahead log is poisoned by an earlier append failure; restart required")]
    Poisoned,

    #[error("corrupted WAL record: {0}")]
    CorruptedRecord(String),
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("unknown transaction: {0}")]
    Unknown(TxnId),

    #[error("transaction already committed or aborted: {0}")]
    Closed(TxnId),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("row {row_id} not found in table '{table}'")]
    RowNotFound { table: String, row_id: RowId },

    #[error("column '{0}' is not nullable")]
    NullViolation(String),

    #[error("column '{column}' expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: Option<DataType>,
    },

    #[error("missing primary key column '{0}'")]
    MissingPrimaryKey(String),

    #[error("duplicate value for unique column '{0}'")]
    DuplicateKey(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
