//! End-to-end scenarios driven through the public API.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use tempfile::tempdir;

use strata_core::api::{Database, DatabaseOptions};
use strata_core::buffer::BufferPool;
use strata_core::error::{Error, SchemaError, StorageError};
use strata_core::storage::PageStore;
use strata_core::types::{
    ColumnDef, DataType, IsolationLevel, PAGE_HEADER_SIZE, Tuple, Value,
};
use strata_core::wal::{self, WalRecordType};

fn open_db(path: &std::path::Path) -> Database {
    Database::open(path, DatabaseOptions::default()).unwrap()
}

fn users_table(db: &Database) {
    db.create_table(
        "t",
        vec![
            ColumnDef::primary_key("id", DataType::Int),
            ColumnDef::new("name", DataType::Text, true),
        ],
        false,
    )
    .unwrap();
}

fn row(id: i64, name: &str) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    values.insert("id".to_string(), Value::Int(id));
    values.insert("name".to_string(), Value::Text(name.to_string()));
    values
}

fn select_all(db: &Database) -> Vec<Tuple> {
    db.select("t", &|_| true).unwrap()
}

#[test]
fn insert_select_round_trip() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    users_table(&db);

    let t1 = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(1, "a"), t1).unwrap();
    db.commit(t1).unwrap();

    let rows = select_all(&db);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_id, 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get("name"), Some(&Value::Text("a".to_string())));
}

#[test]
fn rollback_undoes_insert() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    users_table(&db);

    let t1 = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(1, "a"), t1).unwrap();
    db.commit(t1).unwrap();
    let committed = select_all(&db);

    let t2 = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(2, "b"), t2).unwrap();
    db.rollback(t2).unwrap();

    assert_eq!(select_all(&db), committed);
}

#[test]
fn primary_key_uniqueness() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    users_table(&db);

    let t1 = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(1, "a"), t1).unwrap();
    db.commit(t1).unwrap();
    let before = select_all(&db);

    let t3 = db.begin(IsolationLevel::default()).unwrap();
    match db.insert("t", row(1, "c"), t3) {
        Err(Error::Schema(SchemaError::DuplicateKey(column))) => assert_eq!(column, "id"),
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    db.rollback(t3).unwrap();

    assert_eq!(select_all(&db), before, "failed insert must not mutate state");
}

#[test]
fn checksum_detects_corruption() {
    let dir = tempdir().unwrap();
    let store = PageStore::open(dir.path()).unwrap();
    store.create_table(1).unwrap();

    let mut page = store.read_page(1, 0).unwrap();
    page.append_record(b"soon to be torn").unwrap();
    store.write_page(1, &mut page).unwrap();
    store.sync().unwrap();

    // Corrupt one payload byte directly in the table file.
    let path = dir.path().join("table_000001.dat");
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(&[0x5a], (PAGE_HEADER_SIZE + 7) as u64)
        .unwrap();

    match store.read_page(1, 0) {
        Err(StorageError::CorruptedPage(_)) => {}
        other => panic!("expected CorruptedPage, got {other:?}"),
    }
}

#[test]
fn buffer_pool_eviction_preserves_data() {
    let dir = tempdir().unwrap();
    let store = PageStore::open(dir.path()).unwrap();
    store.create_table(1).unwrap();
    store.allocate_page(1).unwrap();
    store.allocate_page(1).unwrap();

    let pool = BufferPool::with_capacity(2);

    // Touch page 0 and leave it dirty.
    {
        let handle = pool
            .admit(1, 0, store.read_page(1, 0).unwrap(), &store)
            .unwrap();
        handle.write().append_record(b"survives eviction").unwrap();
        handle.mark_dirty();
    }
    // Touching pages 1 and 2 forces page 0 out of the two-frame pool.
    pool.admit(1, 1, store.read_page(1, 1).unwrap(), &store)
        .unwrap();
    pool.admit(1, 2, store.read_page(1, 2).unwrap(), &store)
        .unwrap();

    assert!(pool.get(1, 0).is_none(), "page 0 must have been evicted");
    let reread = store.read_page(1, 0).unwrap();
    assert_eq!(reread.record(0).unwrap(), b"survives eviction");
}

#[test]
fn durable_commit_lands_in_wal() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    users_table(&db);

    let t4 = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(4, "durable"), t4).unwrap();
    db.commit(t4).unwrap();
    db.flush_wal().unwrap();

    // Read the segment files straight off disk.
    let mut records = Vec::new();
    let mut segments: Vec<_> = fs::read_dir(dir.path().join("wal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    segments.sort();
    for segment in segments {
        records.extend(wal::read_segment(&segment).unwrap());
    }

    let insert_at = records
        .iter()
        .position(|r| r.record_type == WalRecordType::Insert && r.txn_id == t4)
        .expect("INSERT record for the committed txn");
    let commit_at = records
        .iter()
        .position(|r| r.record_type == WalRecordType::Commit && r.txn_id == t4)
        .expect("COMMIT record for the committed txn");
    assert!(
        insert_at < commit_at,
        "INSERT must precede COMMIT in the log"
    );
    assert!(records[insert_at].lsn < records[commit_at].lsn);
}

#[test]
fn lsn_and_txn_monotonicity_across_restart() {
    let dir = tempdir().unwrap();
    let mut last_txn = 0;
    {
        let db = open_db(dir.path());
        users_table(&db);
        for i in 0..3 {
            let t = db.begin(IsolationLevel::default()).unwrap();
            assert!(t > last_txn);
            last_txn = t;
            db.insert("t", row(i, "x"), t).unwrap();
            db.commit(t).unwrap();
        }
        db.flush_wal().unwrap();
    }

    let db = open_db(dir.path());
    let t = db.begin(IsolationLevel::default()).unwrap();
    db.insert("t", row(100, "y"), t).unwrap();
    db.commit(t).unwrap();
    db.flush_wal().unwrap();

    // Every LSN across both process lifetimes is strictly increasing.
    let mut records = Vec::new();
    let mut segments: Vec<_> = fs::read_dir(dir.path().join("wal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    segments.sort();
    for segment in segments {
        records.extend(wal::read_segment(&segment).unwrap());
    }
    for pair in records.windows(2) {
        assert!(pair[0].lsn < pair[1].lsn, "LSNs must be strictly monotonic");
    }
}

#[test]
fn tombstones_survive_flush_and_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        users_table(&db);
        let t = db.begin(IsolationLevel::default()).unwrap();
        let a = db.insert("t", row(1, "a"), t).unwrap();
        db.insert("t", row(2, "b"), t).unwrap();
        db.remove("t", a, t).unwrap();
        db.commit(t).unwrap();
        db.sync().unwrap();
    }

    let db = open_db(dir.path());
    let rows = select_all(&db);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Int(2)));

    // The reopened allocator must not reuse the tombstoned row's id.
    let t = db.begin(IsolationLevel::default()).unwrap();
    let fresh = db.insert("t", row(3, "c"), t).unwrap();
    db.commit(t).unwrap();
    assert!(fresh >= 3);
}

#[test]
fn update_visible_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        users_table(&db);
        let t = db.begin(IsolationLevel::default()).unwrap();
        let id = db.insert("t", row(1, "before"), t).unwrap();
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), Value::Text("after".to_string()));
        db.update("t", id, values, t).unwrap();
        db.commit(t).unwrap();
        db.sync().unwrap();
    }

    let db = open_db(dir.path());
    let rows = select_all(&db);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::Text("after".to_string())));
}

#[test]
fn document_mode_accepts_undeclared_fields() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    db.create_table(
        "docs",
        vec![ColumnDef::primary_key("id", DataType::Int)],
        true,
    )
    .unwrap();

    let t = db.begin(IsolationLevel::default()).unwrap();
    let mut doc = BTreeMap::new();
    doc.insert("id".to_string(), Value::Int(1));
    doc.insert(
        "payload".to_string(),
        Value::Json(serde_json::json!({"tags": ["a", "b"], "score": 4.5})),
    );
    doc.insert("blob".to_string(), Value::Binary(vec![1, 2, 3]));
    db.insert("docs", doc, t).unwrap();
    db.commit(t).unwrap();

    let rows = db.select("docs", &|_| true).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("payload"),
        Some(&Value::Json(serde_json::json!({"tags": ["a", "b"], "score": 4.5})))
    );
    assert_eq!(rows[0].get("blob"), Some(&Value::Binary(vec![1, 2, 3])));
}

#[test]
fn small_pool_full_workload() {
    // A deliberately tiny pool forces constant eviction under real DML.
    let dir = tempdir().unwrap();
    let store = std::sync::Arc::new(PageStore::open(dir.path().join("tables")).unwrap());
    let pool = std::sync::Arc::new(BufferPool::with_capacity(2));
    let catalog =
        std::sync::Arc::new(strata_core::catalog::Catalog::open(dir.path().join("metadata")).unwrap());
    let wal = std::sync::Arc::new(
        strata_core::wal::WalManager::open(dir.path().join("wal"), Duration::from_millis(100))
            .unwrap(),
    );
    let txns = std::sync::Arc::new(strata_core::txn::TransactionManager::new(wal.clone()));
    let exec = strata_core::executor::Executor::new(
        store,
        pool,
        catalog,
        txns,
        wal,
        std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
    );

    exec.create_table(
        "t",
        vec![
            ColumnDef::primary_key("id", DataType::Int),
            ColumnDef::new("name", DataType::Text, true),
        ],
        false,
    )
    .unwrap();

    let t = exec.begin(IsolationLevel::default()).unwrap();
    let long = "y".repeat(2000);
    for i in 0..20 {
        exec.insert("t", row(i, &long), t).unwrap();
    }
    exec.commit(t).unwrap();

    let rows = exec.select("t", &|_| true).unwrap();
    assert_eq!(rows.len(), 20);
}
