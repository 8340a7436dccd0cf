//! Transaction lifecycle: BEGIN/COMMIT/ABORT with an in-memory undo log.
//!
//! Undo steps are plain data ([`UndoAction`]) rather than closures, applied
//! through the [`UndoSink`] seam by whoever owns the data path (the
//! executor). That keeps the undo log serializable and the transaction
//! manager free of references back into the storage stack.
//!
//! Isolation levels are recorded but not enforced: until visibility checks
//! exist, every transaction effectively runs read-uncommitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Error, TxnError};
use crate::types::{IsolationLevel, Lsn, NO_TXN, RowId, TableId, Tuple, TxnId};
use crate::wal::{WalManager, WalRecordType};

/// A reversal step recorded during DML, applied in LIFO order on rollback.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    /// Reverse an insert: the row disappears from the visible set.
    RemoveInsert { table_id: TableId, row_id: RowId },
    /// Reverse an update: the before-image is installed again.
    RestoreImage {
        table_id: TableId,
        row_id: RowId,
        before: Tuple,
    },
    /// Reverse a delete: the tombstone is cleared.
    ClearTombstone { table_id: TableId, row_id: RowId },
}

/// Applies undo actions against the data path during rollback.
pub trait UndoSink {
    fn undo(&self, action: &UndoAction) -> Result<(), Error>;
}

/// An in-flight transaction.
#[derive(Debug)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub isolation: IsolationLevel,
    pub start_lsn: Lsn,
    pub commit_lsn: Option<Lsn>,
    pub active: bool,
    undo_log: Vec<UndoAction>,
}

/// Issues transaction ids, tracks in-flight transactions, and coordinates
/// their lifecycle records with the WAL.
pub struct TransactionManager {
    active: RwLock<HashMap<TxnId, Transaction>>,
    /// Next transaction id. Atomic and taken outside the map lock; starts
    /// at 1 because 0 means "no transaction".
    counter: AtomicU64,
    wal: Arc<WalManager>,
}

impl TransactionManager {
    pub fn new(wal: Arc<WalManager>) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
            wal,
        }
    }

    /// Start a transaction: allocate the next id, record the starting LSN,
    /// and write a `Begin` record.
    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId, Error> {
        let txn_id = self.counter.fetch_add(1, Ordering::SeqCst);
        let start_lsn = self.wal.current_lsn();
        self.wal.append(WalRecordType::Begin, txn_id, &[])?;

        let txn = Transaction {
            txn_id,
            isolation: level,
            start_lsn,
            commit_lsn: None,
            active: true,
            undo_log: Vec::new(),
        };
        self.active.write().insert(txn_id, txn);
        Ok(txn_id)
    }

    /// Push a reversal step onto a transaction's undo stack.
    pub fn add_undo(&self, txn_id: TxnId, action: UndoAction) -> Result<(), Error> {
        let mut active = self.active.write();
        match active.get_mut(&txn_id) {
            Some(txn) => {
                txn.undo_log.push(action);
                Ok(())
            }
            None => Err(self.classify_missing(txn_id).into()),
        }
    }

    /// Commit: write a `Commit` record (its LSN is the commit LSN) and
    /// retire the transaction.
    ///
    /// The commit is not forced to disk; callers needing a durable commit
    /// follow up with [`WalManager::flush`].
    pub fn commit(&self, txn_id: TxnId) -> Result<Lsn, Error> {
        let mut active = self.active.write();
        let Some(mut txn) = active.remove(&txn_id) else {
            return Err(self.classify_missing(txn_id).into());
        };

        match self.wal.append(WalRecordType::Commit, txn_id, &[]) {
            Ok(lsn) => {
                txn.commit_lsn = Some(lsn);
                txn.active = false;
                Ok(lsn)
            }
            Err(e) => {
                // The transaction is still open if the commit record never
                // made it into the log.
                active.insert(txn_id, txn);
                Err(e.into())
            }
        }
    }

    /// Roll back: apply the undo stack in LIFO order through `sink`, then
    /// write an `Abort` record.
    ///
    /// A failing undo action is logged and skipped; the remaining actions
    /// still run. Undo actions execute with no lock held on the
    /// transaction map.
    pub fn rollback(&self, txn_id: TxnId, sink: &dyn UndoSink) -> Result<Lsn, Error> {
        let txn = {
            let mut active = self.active.write();
            let Some(txn) = active.remove(&txn_id) else {
                return Err(self.classify_missing(txn_id).into());
            };
            txn
        };

        for action in txn.undo_log.iter().rev() {
            if let Err(e) = sink.undo(action) {
                warn!(txn_id, error = %e, "undo action failed during rollback; continuing");
            }
        }

        let lsn = self.wal.append(WalRecordType::Abort, txn_id, &[])?;
        Ok(lsn)
    }

    /// Fail fast when `txn_id` does not name an in-flight transaction.
    pub fn ensure_active(&self, txn_id: TxnId) -> Result<(), Error> {
        if self.active.read().contains_key(&txn_id) {
            Ok(())
        } else {
            Err(self.classify_missing(txn_id).into())
        }
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.read().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// An id the allocator never handed out is unknown; an allocated id
    /// that is no longer in the map was committed or aborted.
    fn classify_missing(&self, txn_id: TxnId) -> TxnError {
        if txn_id == NO_TXN || txn_id >= self.counter.load(Ordering::SeqCst) {
            TxnError::Unknown(txn_id)
        } else {
            TxnError::Closed(txn_id)
        }
    }
}
