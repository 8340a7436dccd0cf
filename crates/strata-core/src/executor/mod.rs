//! Executor: DDL and DML over catalog, page store, buffer pool, WAL, and
//! the transaction manager.
//!
//! The write path for a DML operation is: validate against the schema,
//! append the WAL record describing the change, install the page image
//! through the buffer pool, and register the reversal step with the
//! transaction manager. Rollback replays those reversal steps through the
//! executor's [`UndoSink`] implementation as internal mutations that are
//! neither logged nor undo-registered themselves (the `Abort` record is the
//! only log entry a rollback produces).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::buffer::{BufferPool, PageHandle};
use crate::catalog::Catalog;
use crate::encoding::{TUPLE_DELETED_OFFSET, decode_tuple, encode_tuple};
use crate::error::{Error, SchemaError, StorageError};
use crate::storage::PageStore;
use crate::txn::{TransactionManager, UndoAction, UndoSink};
use crate::types::{
    ColumnDef, IsolationLevel, PAGE_PAYLOAD_SIZE, PageId, RowId, TableId, TableSchema, Tuple,
    TxnId, Value,
};
use crate::wal::{WalManager, WalRecordType};

/// Executes structured operations against named tables.
pub struct Executor {
    store: Arc<PageStore>,
    pool: Arc<BufferPool>,
    catalog: Arc<Catalog>,
    txns: Arc<TransactionManager>,
    wal: Arc<WalManager>,
    /// Next row id per table, seeded lazily from the highest id on disk.
    row_ids: Mutex<HashMap<TableId, RowId>>,
    /// Monotonic tuple-timestamp source, seeded from the wall clock at
    /// construction and bumped per tuple.
    clock: AtomicU64,
    total_queries: Arc<AtomicU64>,
}

impl Executor {
    pub fn new(
        store: Arc<PageStore>,
        pool: Arc<BufferPool>,
        catalog: Arc<Catalog>,
        txns: Arc<TransactionManager>,
        wal: Arc<WalManager>,
        total_queries: Arc<AtomicU64>,
    ) -> Self {
        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            store,
            pool,
            catalog,
            txns,
            wal,
            row_ids: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(now_micros),
            total_queries,
        }
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    /// Create a table: register the schema, create the table file, persist
    /// the catalog.
    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnDef>,
        document_mode: bool,
    ) -> Result<TableSchema, Error> {
        self.count_query();
        let schema = self.catalog.create_table(name, columns, document_mode)?;
        if let Err(e) = self.store.create_table(schema.table_id) {
            // Keep catalog and files consistent: a table without a file
            // must not survive in the catalog.
            let _ = self.catalog.drop_table(name);
            return Err(e.into());
        }
        Ok(schema)
    }

    /// Drop a table: deregister, discard its cached pages, delete the file.
    /// The name becomes reusable; the table id does not.
    pub fn drop_table(&self, name: &str) -> Result<(), Error> {
        self.count_query();
        let schema = self.catalog.drop_table(name)?;
        self.pool.discard_table(schema.table_id);
        self.row_ids.lock().remove(&schema.table_id);
        self.store.drop_table(schema.table_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    /// Insert a row under transaction `txn_id`, returning the new row id.
    pub fn insert(
        &self,
        table: &str,
        mut values: BTreeMap<String, Value>,
        txn_id: TxnId,
    ) -> Result<RowId, Error> {
        self.count_query();
        self.txns.ensure_active(txn_id)?;
        let schema = self.catalog.get_table(table)?;

        // Declared defaults fill omitted columns before validation.
        for col in &schema.columns {
            if let Some(default) = &col.default_value
                && !values.contains_key(&col.name)
            {
                values.insert(col.name.clone(), default.clone());
            }
        }

        validate_columns(&schema, &values)?;
        require_primary_key(&schema, &values)?;
        self.check_unique(&schema, &values, None)?;

        let tuple = Tuple {
            row_id: self.next_row_id(schema.table_id)?,
            txn_id,
            timestamp: self.tick(),
            deleted: false,
            columns: values,
        };
        let bytes = encode_tuple(&tuple);
        if bytes.len() + 4 > PAGE_PAYLOAD_SIZE {
            return Err(StorageError::RecordTooLarge(bytes.len()).into());
        }

        // Log first, then install the page image.
        let mut payload = Vec::with_capacity(12 + bytes.len());
        payload.extend_from_slice(&schema.table_id.to_le_bytes());
        payload.extend_from_slice(&tuple.row_id.to_le_bytes());
        payload.extend_from_slice(&bytes);
        self.wal.append(WalRecordType::Insert, txn_id, &payload)?;

        self.place_record(schema.table_id, &bytes)?;
        self.catalog.adjust_row_count(schema.table_id, 1);
        self.txns.add_undo(
            txn_id,
            UndoAction::RemoveInsert {
                table_id: schema.table_id,
                row_id: tuple.row_id,
            },
        )?;
        Ok(tuple.row_id)
    }

    /// Scan a table in (page ascending, slot ascending) order, skipping
    /// tombstones, yielding tuples that satisfy `filter`.
    pub fn select(
        &self,
        table: &str,
        filter: &dyn Fn(&Tuple) -> bool,
    ) -> Result<Vec<Tuple>, Error> {
        self.count_query();
        let schema = self.catalog.get_table(table)?;
        let mut rows = Vec::new();
        self.scan_records(schema.table_id, &mut |_, _, tuple| {
            if !tuple.deleted && filter(&tuple) {
                rows.push(tuple);
            }
            true
        })?;
        Ok(rows)
    }

    /// Merge `values` over the current image of row `row_id` and install
    /// the result, logging before and after images.
    pub fn update(
        &self,
        table: &str,
        row_id: RowId,
        values: BTreeMap<String, Value>,
        txn_id: TxnId,
    ) -> Result<(), Error> {
        self.count_query();
        self.txns.ensure_active(txn_id)?;
        let schema = self.catalog.get_table(table)?;
        validate_columns(&schema, &values)?;

        let Some((page_id, slot, before)) = self.locate_live(schema.table_id, row_id)? else {
            return Err(SchemaError::RowNotFound {
                table: table.to_string(),
                row_id,
            }
            .into());
        };

        self.check_unique(&schema, &values, Some(row_id))?;

        let mut after = before.clone();
        after.txn_id = txn_id;
        after.timestamp = self.tick();
        for (name, value) in values {
            after.columns.insert(name, value);
        }

        let before_bytes = encode_tuple(&before);
        let after_bytes = encode_tuple(&after);
        if after_bytes.len() + 4 > PAGE_PAYLOAD_SIZE {
            return Err(StorageError::RecordTooLarge(after_bytes.len()).into());
        }

        let mut payload =
            Vec::with_capacity(20 + before_bytes.len() + after_bytes.len());
        payload.extend_from_slice(&schema.table_id.to_le_bytes());
        payload.extend_from_slice(&row_id.to_le_bytes());
        payload.extend_from_slice(&(before_bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(&before_bytes);
        payload.extend_from_slice(&(after_bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(&after_bytes);
        self.wal.append(WalRecordType::Update, txn_id, &payload)?;

        self.install_image(schema.table_id, page_id, slot, &after_bytes)?;
        self.txns.add_undo(
            txn_id,
            UndoAction::RestoreImage {
                table_id: schema.table_id,
                row_id,
                before,
            },
        )?;
        Ok(())
    }

    /// Tombstone row `row_id`. The tuple stays physically present until
    /// compaction.
    pub fn remove(&self, table: &str, row_id: RowId, txn_id: TxnId) -> Result<(), Error> {
        self.count_query();
        self.txns.ensure_active(txn_id)?;
        let schema = self.catalog.get_table(table)?;

        let Some((page_id, slot, _)) = self.locate_live(schema.table_id, row_id)? else {
            return Err(SchemaError::RowNotFound {
                table: table.to_string(),
                row_id,
            }
            .into());
        };

        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&schema.table_id.to_le_bytes());
        payload.extend_from_slice(&row_id.to_le_bytes());
        self.wal.append(WalRecordType::Delete, txn_id, &payload)?;

        self.set_tombstone(schema.table_id, page_id, slot, true)?;
        self.catalog.adjust_row_count(schema.table_id, -1);
        self.txns.add_undo(
            txn_id,
            UndoAction::ClearTombstone {
                table_id: schema.table_id,
                row_id,
            },
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId, Error> {
        self.count_query();
        self.txns.begin(level)
    }

    /// Commit. Not durable on its own: follow up with a WAL flush when
    /// durability is required.
    pub fn commit(&self, txn_id: TxnId) -> Result<(), Error> {
        self.count_query();
        self.txns.commit(txn_id)?;
        Ok(())
    }

    /// Roll back, undoing this transaction's changes in reverse order.
    pub fn rollback(&self, txn_id: TxnId) -> Result<(), Error> {
        self.count_query();
        self.txns.rollback(txn_id, self)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn count_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Fetch a page through the buffer pool, loading it from the page store
    /// on a miss.
    fn page(&self, table_id: TableId, page_id: PageId) -> Result<PageHandle, Error> {
        if let Some(handle) = self.pool.get(table_id, page_id) {
            return Ok(handle);
        }
        let page = self.store.read_page(table_id, page_id)?;
        self.pool.admit(table_id, page_id, page, &self.store)
    }

    /// Visit every record of a table in (page ascending, slot ascending)
    /// order, tombstones included. The visitor returns `false` to stop.
    fn scan_records(
        &self,
        table_id: TableId,
        visit: &mut dyn FnMut(PageId, u16, Tuple) -> bool,
    ) -> Result<(), Error> {
        let page_count = self.store.page_count(table_id)?;
        for page_id in 0..page_count {
            let handle = self.page(table_id, page_id)?;
            let page = handle.read();
            for entry in page.records() {
                let (slot, bytes) = entry?;
                let tuple = decode_tuple(bytes)?;
                if !visit(page_id, slot, tuple) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Find the live tuple with `row_id`.
    fn locate_live(
        &self,
        table_id: TableId,
        row_id: RowId,
    ) -> Result<Option<(PageId, u16, Tuple)>, Error> {
        let mut found = None;
        self.scan_records(table_id, &mut |page_id, slot, tuple| {
            if tuple.row_id == row_id && !tuple.deleted {
                found = Some((page_id, slot, tuple));
                return false;
            }
            true
        })?;
        Ok(found)
    }

    /// Find the most recent tombstoned record with `row_id` (update spills
    /// can leave older tombstoned images of the same row behind).
    fn locate_tombstoned(
        &self,
        table_id: TableId,
        row_id: RowId,
    ) -> Result<Option<(PageId, u16, Tuple)>, Error> {
        let mut found = None;
        self.scan_records(table_id, &mut |page_id, slot, tuple| {
            if tuple.row_id == row_id && tuple.deleted {
                found = Some((page_id, slot, tuple));
            }
            true
        })?;
        Ok(found)
    }

    fn next_row_id(&self, table_id: TableId) -> Result<RowId, Error> {
        {
            let mut ids = self.row_ids.lock();
            if let Some(next) = ids.get_mut(&table_id) {
                let id = *next;
                *next += 1;
                return Ok(id);
            }
        }

        // First touch since open: seed from the highest row id on disk,
        // tombstones included, so ids are never reused.
        let mut max_id = 0;
        self.scan_records(table_id, &mut |_, _, tuple| {
            max_id = max_id.max(tuple.row_id);
            true
        })?;

        let mut ids = self.row_ids.lock();
        let next = ids.entry(table_id).or_insert(max_id + 1);
        let id = *next;
        *next += 1;
        Ok(id)
    }

    /// Append a record to the last page of a table, allocating a fresh page
    /// when it does not fit.
    fn place_record(&self, table_id: TableId, bytes: &[u8]) -> Result<(PageId, u16), Error> {
        let page_count = self.store.page_count(table_id)?;
        let last = page_count.saturating_sub(1);
        {
            let handle = self.page(table_id, last)?;
            let mut page = handle.write();
            if page.record_fits(bytes.len()) {
                let slot = page.append_record(bytes)?;
                drop(page);
                handle.mark_dirty();
                return Ok((last, slot));
            }
        }

        let page_id = self.store.allocate_page(table_id)?;
        let handle = self.page(table_id, page_id)?;
        let mut page = handle.write();
        let slot = page.append_record(bytes)?;
        drop(page);
        handle.mark_dirty();
        Ok((page_id, slot))
    }

    /// Replace the record at `(page_id, slot)` with a new image. When the
    /// page cannot hold the new size, the old record is tombstoned in place
    /// and the image is appended wherever it fits; scans key visibility on
    /// the tombstone flag, so exactly one live image remains.
    fn install_image(
        &self,
        table_id: TableId,
        page_id: PageId,
        slot: u16,
        bytes: &[u8],
    ) -> Result<(), Error> {
        {
            let handle = self.page(table_id, page_id)?;
            let mut page = handle.write();
            match page.replace_record(slot, bytes) {
                Ok(()) => {
                    drop(page);
                    handle.mark_dirty();
                    return Ok(());
                }
                Err(StorageError::PageFull { .. }) => {
                    page.record_mut(slot)?[TUPLE_DELETED_OFFSET] = 1;
                    drop(page);
                    handle.mark_dirty();
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.place_record(table_id, bytes)?;
        Ok(())
    }

    fn set_tombstone(
        &self,
        table_id: TableId,
        page_id: PageId,
        slot: u16,
        deleted: bool,
    ) -> Result<(), Error> {
        let handle = self.page(table_id, page_id)?;
        {
            let mut page = handle.write();
            page.record_mut(slot)?[TUPLE_DELETED_OFFSET] = u8::from(deleted);
        }
        handle.mark_dirty();
        Ok(())
    }

    /// Reject duplicate values in primary-key or unique columns among the
    /// other live tuples.
    fn check_unique(
        &self,
        schema: &TableSchema,
        values: &BTreeMap<String, Value>,
        exclude: Option<RowId>,
    ) -> Result<(), Error> {
        let targets: Vec<(&String, &Value)> = schema
            .columns
            .iter()
            .filter(|c| c.primary_key || c.unique)
            .filter_map(|c| values.get_key_value(&c.name))
            .filter(|(_, value)| !value.is_null())
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let mut conflict: Option<String> = None;
        self.scan_records(schema.table_id, &mut |_, _, tuple| {
            if tuple.deleted || Some(tuple.row_id) == exclude {
                return true;
            }
            for &(name, value) in &targets {
                if tuple.get(name) == Some(value) {
                    conflict = Some(name.clone());
                    return false;
                }
            }
            true
        })?;

        match conflict {
            Some(column) => Err(SchemaError::DuplicateKey(column).into()),
            None => Ok(()),
        }
    }
}

impl UndoSink for Executor {
    /// Interpret a reversal step as an internal mutation: no WAL record, no
    /// undo registration, no query accounting.
    fn undo(&self, action: &UndoAction) -> Result<(), Error> {
        match action {
            UndoAction::RemoveInsert { table_id, row_id } => {
                if let Some((page_id, slot, _)) = self.locate_live(*table_id, *row_id)? {
                    self.set_tombstone(*table_id, page_id, slot, true)?;
                    self.catalog.adjust_row_count(*table_id, -1);
                }
                Ok(())
            }
            UndoAction::RestoreImage {
                table_id,
                row_id,
                before,
            } => {
                let Some((page_id, slot, _)) = self.locate_live(*table_id, *row_id)? else {
                    let table = self
                        .catalog
                        .table_name(*table_id)
                        .unwrap_or_else(|| table_id.to_string());
                    return Err(SchemaError::RowNotFound {
                        table,
                        row_id: *row_id,
                    }
                    .into());
                };
                self.install_image(*table_id, page_id, slot, &encode_tuple(before))
            }
            UndoAction::ClearTombstone { table_id, row_id } => {
                if let Some((page_id, slot, _)) = self.locate_tombstoned(*table_id, *row_id)? {
                    self.set_tombstone(*table_id, page_id, slot, false)?;
                    self.catalog.adjust_row_count(*table_id, 1);
                }
                Ok(())
            }
        }
    }
}

fn validate_columns(schema: &TableSchema, values: &BTreeMap<String, Value>) -> Result<(), Error> {
    for (name, value) in values {
        match schema.column(name) {
            Some(col) => {
                if value.is_null() {
                    if !col.nullable {
                        return Err(SchemaError::NullViolation(name.clone()).into());
                    }
                } else if value.data_type() != Some(col.data_type) {
                    return Err(SchemaError::TypeMismatch {
                        column: name.clone(),
                        expected: col.data_type,
                        actual: value.data_type(),
                    }
                    .into());
                }
            }
            // Document mode accepts undeclared columns verbatim.
            None if schema.document_mode => {}
            None => {
                return Err(SchemaError::UnknownColumn {
                    table: schema.table_name.clone(),
                    column: name.clone(),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn require_primary_key(
    schema: &TableSchema,
    values: &BTreeMap<String, Value>,
) -> Result<(), Error> {
    if let Some(pk) = &schema.primary_key_column {
        match values.get(pk) {
            Some(value) if !value.is_null() => Ok(()),
            _ => Err(SchemaError::MissingPrimaryKey(pk.clone()).into()),
        }
    } else {
        Ok(())
    }
}
