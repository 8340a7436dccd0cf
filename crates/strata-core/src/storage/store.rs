//! File-per-table page store.
//!
//! Each table lives in a single file `table_<id:06>.dat` that is an array of
//! fixed-size pages indexed by page id. Reads and writes use positioned I/O
//! (`pread`/`pwrite` via `FileExt`), so no per-file seek serialization is
//! needed; the handle cache is guarded by a reader/writer lock with table
//! creation, drop, and allocation on the writer side.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StorageError;
use crate::types::{PAGE_SIZE, PageId, TableId};

use super::page::Page;

pub struct PageStore {
    dir: PathBuf,
    files: RwLock<HashMap<TableId, Arc<File>>>,
}

impl PageStore {
    /// Open a page store rooted at `dir` (usually `<dataDir>/tables`),
    /// creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: RwLock::new(HashMap::new()),
        })
    }

    fn table_path(&self, table_id: TableId) -> PathBuf {
        self.dir.join(format!("table_{table_id:06}.dat"))
    }

    /// Create the file for a new table and write an initialized page 0.
    pub fn create_table(&self, table_id: TableId) -> Result<(), StorageError> {
        let mut files = self.files.write();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.table_path(table_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::TableExists(table_id));
            }
            Err(e) => return Err(e.into()),
        };

        let page = Page::new(0, table_id);
        file.write_all_at(page.as_bytes(), 0)?;
        file.sync_all()?;

        files.insert(table_id, Arc::new(file));
        Ok(())
    }

    /// Remove a table's file and drop its cached handle.
    pub fn drop_table(&self, table_id: TableId) -> Result<(), StorageError> {
        let mut files = self.files.write();
        files.remove(&table_id);

        match fs::remove_file(self.table_path(table_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::TableMissing(table_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the cached handle for a table, opening the file on first use.
    fn handle(&self, table_id: TableId) -> Result<Arc<File>, StorageError> {
        if let Some(file) = self.files.read().get(&table_id) {
            return Ok(Arc::clone(file));
        }
        let mut files = self.files.write();
        Self::open_locked(&self.table_path(table_id), table_id, &mut files)
    }

    fn open_locked(
        path: &Path,
        table_id: TableId,
        files: &mut HashMap<TableId, Arc<File>>,
    ) -> Result<Arc<File>, StorageError> {
        if let Some(file) = files.get(&table_id) {
            return Ok(Arc::clone(file));
        }
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::TableMissing(table_id));
            }
            Err(e) => return Err(e.into()),
        };
        let file = Arc::new(file);
        files.insert(table_id, Arc::clone(&file));
        Ok(file)
    }

    /// Read a page and verify its integrity.
    ///
    /// A page whose checksum does not match its payload is torn and is never
    /// surfaced to the caller.
    pub fn read_page(&self, table_id: TableId, page_id: PageId) -> Result<Page, StorageError> {
        let file = self.handle(table_id)?;
        let page_count = page_count_of(&file)?;
        if page_id >= page_count {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                page_count,
            });
        }

        let mut buf = [0u8; PAGE_SIZE];
        file.read_exact_at(&mut buf, u64::from(page_id) * PAGE_SIZE as u64)?;

        let page = Page::from_bytes(buf);
        page.verify_checksum()?;
        if page.page_id() != page_id || page.table_id() != table_id {
            return Err(StorageError::CorruptedPage(format!(
                "header mismatch: expected page {page_id} of table {table_id}, \
                 found page {} of table {}",
                page.page_id(),
                page.table_id()
            )));
        }
        Ok(page)
    }

    /// Recompute the page checksum and write the page at its offset.
    ///
    /// The write reaches the OS immediately; durability is deferred to
    /// [`PageStore::sync`].
    pub fn write_page(&self, table_id: TableId, page: &mut Page) -> Result<(), StorageError> {
        let file = self.handle(table_id)?;
        let page_count = page_count_of(&file)?;
        let page_id = page.page_id();
        if page_id >= page_count {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                page_count,
            });
        }

        page.write_checksum();
        file.write_all_at(page.as_bytes(), u64::from(page_id) * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Append a fresh, initialized page to a table file and return its id.
    ///
    /// Page ids start at 0 and strictly increase per table.
    pub fn allocate_page(&self, table_id: TableId) -> Result<PageId, StorageError> {
        let mut files = self.files.write();
        let file = Self::open_locked(&self.table_path(table_id), table_id, &mut files)?;

        let len = file.metadata()?.len();
        let page_id = (len / PAGE_SIZE as u64) as PageId;
        let page = Page::new(page_id, table_id);
        file.write_all_at(page.as_bytes(), len)?;
        Ok(page_id)
    }

    /// Number of pages in a table file.
    pub fn page_count(&self, table_id: TableId) -> Result<PageId, StorageError> {
        let file = self.handle(table_id)?;
        page_count_of(&file)
    }

    /// Fsync every cached table file.
    pub fn sync(&self) -> Result<(), StorageError> {
        let files = self.files.read();
        for file in files.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn page_count_of(file: &File) -> Result<PageId, StorageError> {
    Ok((file.metadata()?.len() / PAGE_SIZE as u64) as PageId)
}
