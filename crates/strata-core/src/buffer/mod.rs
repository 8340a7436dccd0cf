//! Bounded buffer pool over the page store.
//!
//! The pool caches up to `capacity` resident pages in frames. A frame is
//! pinned while a [`PageHandle`] to it is alive and is never evicted while
//! pinned. Eviction picks the unpinned frame with the smallest
//! `(last_access, insertion sequence)` pair; the tick counter is bumped on
//! every touch, so the sequence number only breaks ties between frames that
//! have never been touched since insertion.
//!
//! Dirty victims are written back through the page store with the pool
//! mutex released; the victim's slot is held in a reserved state during the
//! I/O so no other admission can claim it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BufferError, Error};
use crate::storage::{Page, PageStore};
use crate::types::{PAGE_SIZE, PageId, TableId};

fn frame_key(table_id: TableId, page_id: PageId) -> u64 {
    (u64::from(table_id) << 32) | u64::from(page_id)
}

struct Frame {
    table_id: TableId,
    page_id: PageId,
    page: Arc<RwLock<Page>>,
    dirty: bool,
    pins: u32,
    last_access: u64,
    seq: u64,
}

enum Slot {
    Empty,
    /// Mid-eviction: the frame has been taken out for write-back and the
    /// slot must not be claimed by anyone else.
    Reserved,
    Occupied(Frame),
}

struct PoolInner {
    slots: Vec<Slot>,
    map: HashMap<u64, usize>,
    tick: u64,
    seq: u64,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    capacity: usize,
}

/// A fixed-capacity page cache with LRU eviction and hit/miss accounting.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool sized in MiB: capacity = `size_mib * 2^20 / PAGE_SIZE`
    /// frames, fixed for the lifetime of the pool.
    pub fn new(size_mib: u64) -> Self {
        Self::with_capacity(((size_mib << 20) / PAGE_SIZE as u64) as usize)
    }

    /// Create a pool with an explicit frame capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    slots: (0..capacity).map(|_| Slot::Empty).collect(),
                    map: HashMap::new(),
                    tick: 0,
                    seq: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Look up a resident page, pinning its frame on a hit.
    ///
    /// On a miss the caller is responsible for loading the page from the
    /// page store and inserting it via [`BufferPool::admit`].
    pub fn get(&self, table_id: TableId, page_id: PageId) -> Option<PageHandle> {
        let key = frame_key(table_id, page_id);
        let mut inner = self.shared.inner.lock();
        match pin_locked(&self.shared, &mut inner, key) {
            Some(handle) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(handle)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly loaded page and return a pinned handle to it.
    ///
    /// At capacity the least-recently-used unpinned frame is evicted, being
    /// written back through `store` first if dirty. Fails with
    /// [`BufferError::Exhausted`] when every frame is pinned.
    pub fn admit(
        &self,
        table_id: TableId,
        page_id: PageId,
        page: Page,
        store: &PageStore,
    ) -> Result<PageHandle, Error> {
        let key = frame_key(table_id, page_id);
        let mut inner = self.shared.inner.lock();

        // Another thread may have admitted the same page while the caller
        // was loading it; pin the resident copy instead.
        if let Some(handle) = pin_locked(&self.shared, &mut inner, key) {
            return Ok(handle);
        }

        if let Some(idx) = inner.slots.iter().position(|s| matches!(s, Slot::Empty)) {
            return Ok(install(
                &self.shared,
                &mut inner,
                idx,
                key,
                table_id,
                page_id,
                page,
            ));
        }

        let Some(idx) = choose_victim(&inner) else {
            return Err(BufferError::Exhausted {
                capacity: self.shared.capacity,
            }
            .into());
        };
        let Slot::Occupied(victim) = std::mem::replace(&mut inner.slots[idx], Slot::Reserved)
        else {
            unreachable!("victim slot was occupied under the pool mutex");
        };
        let victim_key = frame_key(victim.table_id, victim.page_id);
        inner.map.remove(&victim_key);

        if victim.dirty {
            // Write back with the pool mutex released. The reserved slot
            // keeps the frame's place; no handle exists (pins == 0) and no
            // lookup can find it (map entry removed).
            drop(inner);
            let written = {
                let mut guard = victim.page.write();
                store.write_page(victim.table_id, &mut guard)
            };
            inner = self.shared.inner.lock();

            if let Err(e) = written {
                // Restore the victim; this admission fails and the dirty
                // page stays resident.
                inner.map.insert(victim_key, idx);
                inner.slots[idx] = Slot::Occupied(victim);
                return Err(e.into());
            }

            // The incoming page may have been admitted by someone else
            // while the mutex was released.
            if let Some(handle) = pin_locked(&self.shared, &mut inner, key) {
                inner.slots[idx] = Slot::Empty;
                return Ok(handle);
            }
        }

        Ok(install(
            &self.shared,
            &mut inner,
            idx,
            key,
            table_id,
            page_id,
            page,
        ))
    }

    /// Mark a resident page dirty. No-op when the page is not mapped.
    pub fn mark_dirty(&self, table_id: TableId, page_id: PageId) {
        let key = frame_key(table_id, page_id);
        let mut inner = self.shared.inner.lock();
        if let Some(&idx) = inner.map.get(&key)
            && let Slot::Occupied(frame) = &mut inner.slots[idx]
        {
            frame.dirty = true;
        }
    }

    /// Write every dirty frame back through the page store and clear the
    /// dirty bits.
    pub fn flush_all(&self, store: &PageStore) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Slot::Occupied(frame) = slot
                && frame.dirty
            {
                let mut guard = frame.page.write();
                store.write_page(frame.table_id, &mut guard)?;
                drop(guard);
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Discard every frame belonging to `table_id` without write-back.
    /// Used when the table itself is dropped.
    pub fn discard_table(&self, table_id: TableId) {
        let mut inner = self.shared.inner.lock();
        for idx in 0..inner.slots.len() {
            let key = match &inner.slots[idx] {
                Slot::Occupied(frame) if frame.table_id == table_id => {
                    frame_key(frame.table_id, frame.page_id)
                }
                _ => continue,
            };
            inner.map.remove(&key);
            inner.slots[idx] = Slot::Empty;
        }
    }

    pub fn hits(&self) -> u64 {
        self.shared.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.shared.misses.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)`; 0 before any access.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Pin the frame mapped under `key`, bumping its access time. Returns `None`
/// when the key is not resident. Does not touch the hit/miss counters.
fn pin_locked(
    shared: &Arc<PoolShared>,
    inner: &mut MutexGuard<'_, PoolInner>,
    key: u64,
) -> Option<PageHandle> {
    let &idx = inner.map.get(&key)?;
    inner.tick += 1;
    let tick = inner.tick;
    let Slot::Occupied(frame) = &mut inner.slots[idx] else {
        unreachable!("page map points at an unoccupied slot");
    };
    frame.last_access = tick;
    frame.pins += 1;
    Some(PageHandle {
        shared: Arc::clone(shared),
        key,
        page: Arc::clone(&frame.page),
    })
}

/// LRU victim: the unpinned frame with the smallest `(last_access, seq)`.
fn choose_victim(inner: &PoolInner) -> Option<usize> {
    let mut victim: Option<(usize, u64, u64)> = None;
    for (idx, slot) in inner.slots.iter().enumerate() {
        if let Slot::Occupied(frame) = slot
            && frame.pins == 0
        {
            let better = match victim {
                None => true,
                Some((_, la, sq)) => (frame.last_access, frame.seq) < (la, sq),
            };
            if better {
                victim = Some((idx, frame.last_access, frame.seq));
            }
        }
    }
    victim.map(|(idx, _, _)| idx)
}

fn install(
    shared: &Arc<PoolShared>,
    inner: &mut MutexGuard<'_, PoolInner>,
    idx: usize,
    key: u64,
    table_id: TableId,
    page_id: PageId,
    page: Page,
) -> PageHandle {
    inner.tick += 1;
    inner.seq += 1;
    let page = Arc::new(RwLock::new(page));
    let frame = Frame {
        table_id,
        page_id,
        page: Arc::clone(&page),
        dirty: false,
        pins: 1,
        last_access: inner.tick,
        seq: inner.seq,
    };
    inner.slots[idx] = Slot::Occupied(frame);
    inner.map.insert(key, idx);

    PageHandle {
        shared: Arc::clone(shared),
        key,
        page,
    }
}

/// A pinned reference to a resident page.
///
/// The frame stays resident while the handle is alive; dropping the handle
/// unpins it. Mutation goes through [`PageHandle::write`] followed by
/// [`PageHandle::mark_dirty`]. Handles are not held across executor
/// operations.
pub struct PageHandle {
    shared: Arc<PoolShared>,
    key: u64,
    page: Arc<RwLock<Page>>,
}

impl PageHandle {
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Mark the underlying frame dirty.
    pub fn mark_dirty(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(&idx) = inner.map.get(&self.key)
            && let Slot::Occupied(frame) = &mut inner.slots[idx]
            && Arc::ptr_eq(&frame.page, &self.page)
        {
            frame.dirty = true;
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        // The pointer comparison guards against a same-key frame admitted
        // after this one's table was discarded.
        if let Some(&idx) = inner.map.get(&self.key)
            && let Slot::Occupied(frame) = &mut inner.slots[idx]
            && Arc::ptr_eq(&frame.page, &self.page)
        {
            frame.pins = frame.pins.saturating_sub(1);
        }
    }
}
