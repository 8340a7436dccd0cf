//! The embedding database handle.
//!
//! `Database` owns every subsystem (page store, buffer pool, WAL manager,
//! transaction manager, catalog, executor) and wires them together. The
//! wire server and admin endpoint are external collaborators: they receive
//! a clone of this handle (it is `Arc`-based) and consume the executor
//! methods and the [`Stats`] snapshot; they never own the internals.
//!
//! All paths derive from the injected data directory; there is no
//! process-wide state. A directory can be served by at most one `Database`
//! at a time, enforced with an advisory lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::buffer::BufferPool;
use crate::catalog::Catalog;
use crate::error::{Error, StorageError};
use crate::executor::Executor;
use crate::storage::{DirectoryLock, PageStore};
use crate::txn::TransactionManager;
use crate::types::{ColumnDef, IsolationLevel, RowId, TableSchema, Tuple, TxnId, Value};
use crate::wal::{DEFAULT_FLUSH_INTERVAL, WalManager};

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Buffer pool size in MiB.
    pub buffer_pool_mib: u64,
    /// Background WAL flush interval.
    pub wal_flush_interval: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            buffer_pool_mib: 64,
            wal_flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// A point-in-time statistics snapshot.
///
/// Connection counts are fed by the external wire server through
/// [`Database::connection_opened`] / [`Database::connection_closed`]; the
/// rest is read from the core's own counters.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_queries: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub uptime_seconds: u64,
    pub cache_hit_rate: f64,
    pub table_count: u64,
    pub total_rows: u64,
    pub wal_size: u64,
}

struct DatabaseInner {
    store: Arc<PageStore>,
    pool: Arc<BufferPool>,
    catalog: Arc<Catalog>,
    wal: Arc<WalManager>,
    executor: Executor,
    total_queries: Arc<AtomicU64>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    started_at: Instant,
    _lock: DirectoryLock,
}

/// The main database handle.
///
/// `Database` is cheaply clonable (`Arc`-based) and `Send + Sync`. Only
/// read-uncommitted semantics are provided: isolation levels are recorded
/// as advisory metadata and not enforced.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) a database rooted at `data_dir`.
    ///
    /// Creates the `tables/`, `wal/`, `indexes/` (reserved), and
    /// `metadata/` subdirectories when absent, then takes the exclusive
    /// directory lock before touching any state.
    pub fn open(data_dir: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self, Error> {
        let data_dir = data_dir.as_ref();
        for sub in ["tables", "wal", "indexes", "metadata"] {
            fs::create_dir_all(data_dir.join(sub)).map_err(StorageError::from)?;
        }
        let lock = DirectoryLock::acquire(&data_dir.join("LOCK"))?;

        let store = Arc::new(PageStore::open(data_dir.join("tables"))?);
        let pool = Arc::new(BufferPool::new(options.buffer_pool_mib));
        let catalog = Arc::new(Catalog::open(data_dir.join("metadata"))?);
        let wal = Arc::new(WalManager::open(
            data_dir.join("wal"),
            options.wal_flush_interval,
        )?);
        // Redo replay is reserved; this only documents the intent.
        wal.recover()?;

        let txns = Arc::new(TransactionManager::new(Arc::clone(&wal)));
        let total_queries = Arc::new(AtomicU64::new(0));
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&catalog),
            Arc::clone(&txns),
            Arc::clone(&wal),
            Arc::clone(&total_queries),
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                store,
                pool,
                catalog,
                wal,
                executor,
                total_queries,
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                started_at: Instant::now(),
                _lock: lock,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Executor interface (consumed by the external wire server)
    // ------------------------------------------------------------------

    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDef>,
        document_mode: bool,
    ) -> Result<TableSchema, Error> {
        self.inner.executor.create_table(name, columns, document_mode)
    }

    pub fn drop_table(&self, name: &str) -> Result<(), Error> {
        self.inner.executor.drop_table(name)
    }

    pub fn insert(
        &self,
        table: &str,
        values: BTreeMap<String, Value>,
        txn_id: TxnId,
    ) -> Result<RowId, Error> {
        self.inner.executor.insert(table, values, txn_id)
    }

    pub fn select(
        &self,
        table: &str,
        filter: &dyn Fn(&Tuple) -> bool,
    ) -> Result<Vec<Tuple>, Error> {
        self.inner.executor.select(table, filter)
    }

    pub fn update(
        &self,
        table: &str,
        row_id: RowId,
        values: BTreeMap<String, Value>,
        txn_id: TxnId,
    ) -> Result<(), Error> {
        self.inner.executor.update(table, row_id, values, txn_id)
    }

    pub fn remove(&self, table: &str, row_id: RowId, txn_id: TxnId) -> Result<(), Error> {
        self.inner.executor.remove(table, row_id, txn_id)
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId, Error> {
        self.inner.executor.begin(level)
    }

    /// Commit. Follow up with [`Database::flush_wal`] when the commit must
    /// be durable before returning to the client.
    pub fn commit(&self, txn_id: TxnId) -> Result<(), Error> {
        self.inner.executor.commit(txn_id)
    }

    pub fn rollback(&self, txn_id: TxnId) -> Result<(), Error> {
        self.inner.executor.rollback(txn_id)
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.inner.catalog.list_tables()
    }

    pub fn table_schema(&self, name: &str) -> Result<TableSchema, Error> {
        self.inner.catalog.get_table(name)
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Force the WAL to stable storage.
    pub fn flush_wal(&self) -> Result<(), Error> {
        self.inner.wal.flush()?;
        Ok(())
    }

    /// Flush dirty pages, fsync table files, and flush the WAL.
    pub fn sync(&self) -> Result<(), Error> {
        self.inner.pool.flush_all(&self.inner.store)?;
        self.inner.store.sync()?;
        self.inner.wal.flush()?;
        Ok(())
    }

    /// Flush everything, persist the catalog, and record a checkpoint at
    /// the current LSN.
    pub fn checkpoint(&self) -> Result<(), Error> {
        self.inner.pool.flush_all(&self.inner.store)?;
        self.inner.store.sync()?;
        self.inner.catalog.persist()?;
        self.inner.wal.checkpoint(self.inner.wal.current_lsn())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats interface (consumed by the external admin endpoint)
    // ------------------------------------------------------------------

    /// Record a new client connection (fed by the wire server).
    pub fn connection_opened(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed client connection (fed by the wire server).
    pub fn connection_closed(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Snapshot the server statistics.
    pub fn stats(&self) -> Result<Stats, Error> {
        let inner = &self.inner;
        Ok(Stats {
            total_queries: inner.total_queries.load(Ordering::Relaxed),
            total_connections: inner.total_connections.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            uptime_seconds: inner.started_at.elapsed().as_secs(),
            cache_hit_rate: inner.pool.hit_rate(),
            table_count: inner.catalog.table_count() as u64,
            total_rows: inner.catalog.total_rows(),
            wal_size: inner.wal.wal_size()?,
        })
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        // Best-effort teardown: flush what we can, log what we cannot. The
        // WAL manager joins its flusher thread in its own Drop.
        if let Err(e) = self.pool.flush_all(&self.store) {
            warn!(error = %e, "failed to flush buffer pool during shutdown");
        }
        if let Err(e) = self.store.sync() {
            warn!(error = %e, "failed to sync table files during shutdown");
        }
        if let Err(e) = self.catalog.persist() {
            warn!(error = %e, "failed to persist catalog during shutdown");
        }
        if let Err(e) = self.wal.flush() {
            warn!(error = %e, "failed to flush wal during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::types::DataType;
    use tempfile::tempdir;

    fn user_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::primary_key("id", DataType::Int),
            ColumnDef::new("name", DataType::Text, true),
        ]
    }

    fn row(id: i64, name: &str) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::Int(id));
        values.insert("name".to_string(), Value::Text(name.to_string()));
        values
    }

    #[test]
    fn test_open_creates_directory_layout() {
        let dir = tempdir().unwrap();
        let _db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();

        for sub in ["tables", "wal", "indexes", "metadata"] {
            assert!(dir.path().join(sub).is_dir(), "missing {sub}/");
        }
        assert!(dir.path().join("LOCK").exists());
    }

    #[test]
    fn test_second_open_rejected_while_locked() {
        let dir = tempdir().unwrap();
        let _db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();

        match Database::open(dir.path(), DatabaseOptions::default()) {
            Err(Error::Storage(StorageError::DirectoryLocked)) => {}
            Err(other) => panic!("expected DirectoryLocked, got {other:?}"),
            Ok(_) => panic!("expected DirectoryLocked, got a handle"),
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
            db.create_table("users", user_columns(), false).unwrap();
            let t = db.begin(IsolationLevel::default()).unwrap();
            db.insert("users", row(1, "ada"), t).unwrap();
            db.commit(t).unwrap();
            db.sync().unwrap();
        }

        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        assert_eq!(db.list_tables(), vec!["users"]);
        let rows = db.select("users", &|_| true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("ada".to_string())));

        // New rows continue with fresh ids and transactions.
        let t = db.begin(IsolationLevel::default()).unwrap();
        let new_id = db.insert("users", row(2, "bob"), t).unwrap();
        db.commit(t).unwrap();
        assert!(new_id > rows[0].row_id);
    }

    #[test]
    fn test_stats_snapshot() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        db.create_table("users", user_columns(), false).unwrap();

        let t = db.begin(IsolationLevel::default()).unwrap();
        db.insert("users", row(1, "ada"), t).unwrap();
        db.insert("users", row(2, "bob"), t).unwrap();
        db.commit(t).unwrap();
        db.select("users", &|_| true).unwrap();

        db.connection_opened();
        db.connection_opened();
        db.connection_closed();

        let stats = db.stats().unwrap();
        assert!(stats.total_queries >= 5);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.table_count, 1);
        assert_eq!(stats.total_rows, 2);
        assert!(stats.wal_size > 0);
        assert!((0.0..=1.0).contains(&stats.cache_hit_rate));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        db.create_table("users", user_columns(), false).unwrap();
        let t = db.begin(IsolationLevel::default()).unwrap();
        db.insert("users", row(1, "ada"), t).unwrap();
        db.commit(t).unwrap();

        db.checkpoint().unwrap();

        // Data is still visible and the database keeps accepting writes.
        assert_eq!(db.select("users", &|_| true).unwrap().len(), 1);
        let t2 = db.begin(IsolationLevel::default()).unwrap();
        db.insert("users", row(2, "bob"), t2).unwrap();
        db.commit(t2).unwrap();
    }

    #[test]
    fn test_schema_violation_error_surface() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        db.create_table("users", user_columns(), false).unwrap();

        match db.create_table("users", user_columns(), false) {
            Err(Error::Schema(SchemaError::TableExists(_))) => {}
            other => panic!("expected TableExists, got {other:?}"),
        }
    }
}
