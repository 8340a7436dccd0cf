//! # StrataDB
//!
//! An embeddable relational/document storage engine: a file-per-table page
//! store fronted by a fixed-capacity buffer pool, guarded by a segmented
//! write-ahead log, with an undo-based transaction manager and a
//! catalog-aware executor on top.
//!
//! The TCP wire protocol, HTTP admin endpoint, and SQL parsing live outside
//! this crate; the executor receives structured operations and returns
//! tuples, and an admin endpoint reads [`api::Stats`] snapshots.
//!
//! Durability is "WAL appended in order, flushed periodically": commits are
//! made durable with an explicit WAL flush, rollback is undo-based and
//! in-memory, and crash recovery with redo replay is not implemented.
//! Isolation levels are recorded but not enforced (read-uncommitted
//! semantics).
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use strata_core::api::{Database, DatabaseOptions};
//! use strata_core::types::{ColumnDef, DataType, IsolationLevel, Value};
//!
//! let db = Database::open("./data", DatabaseOptions::default()).unwrap();
//!
//! db.create_table(
//!     "users",
//!     vec![
//!         ColumnDef::primary_key("id", DataType::Int),
//!         ColumnDef::new("name", DataType::Text, true),
//!     ],
//!     false,
//! )
//! .unwrap();
//!
//! let txn = db.begin(IsolationLevel::default()).unwrap();
//! let mut row = BTreeMap::new();
//! row.insert("id".to_string(), Value::Int(1));
//! row.insert("name".to_string(), Value::Text("ada".to_string()));
//! db.insert("users", row, txn).unwrap();
//! db.commit(txn).unwrap();
//! db.flush_wal().unwrap();
//!
//! let rows = db.select("users", &|_| true).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

pub mod api;
pub mod buffer;
pub mod catalog;
pub mod encoding;
pub mod error;
pub mod executor;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;
