use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pagecask_common::{EngineError, EngineResult, PageId, NO_LSN};
use pagecask_wal::manager::LogManager;
use tracing::{debug, trace};

use crate::disk::DiskManager;
use crate::page::{Page, PageKind};

/// Counters exposed through the engine's stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
    pub capacity: usize,
}

struct Frame {
    page: Page,
    pin_count: u32,
    dirty: bool,
    last_access_nanos: u64,
}

struct PoolInner {
    frames: Vec<Option<Frame>>,
    page_table: HashMap<PageId, usize>,
    free: Vec<usize>,
}

/// Fixed-capacity page cache. Each resident page lives in one frame with a
/// pin count, a dirty bit, and its last access time; eviction picks the
/// least-recently-used unpinned frame and writes dirty victims back before
/// the frame is reused.
///
/// Write-back enforces the WAL rule that a page with `page_lsn = L` never
/// reaches disk before the log is durable through `L`: the pool consults
/// [`LogManager::flushed_lsn`] and forces a flush when needed.
pub struct BufferPool {
    disk: Arc<DiskManager>,
    wal: Arc<LogManager>,
    inner: Mutex<PoolInner>,
    epoch: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>, wal: Arc<LogManager>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            disk,
            wal,
            inner: Mutex::new(PoolInner {
                frames: (0..capacity).map(|_| None).collect(),
                page_table: HashMap::new(),
                free: (0..capacity).rev().collect(),
            }),
            epoch: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fetch a page, pinning its frame. Cache misses load from disk into a
    /// free (or evicted) frame. The returned guard unpins on drop, carrying
    /// the dirty flag accumulated through [`PageGuard::with_mut`].
    pub fn fetch(&self, id: PageId) -> EngineResult<PageGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&idx) = inner.page_table.get(&id) {
            let now = self.now_nanos();
            let frame = inner.frames[idx].as_mut().unwrap();
            frame.pin_count += 1;
            frame.last_access_nanos = now;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageGuard {
                pool: self,
                page_id: id,
                dirtied: false,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let idx = self.grab_frame(&mut inner)?;

        let mut page = self.disk.read_page(id)?;
        if page.kind_tag() == PageKind::Invalid as u8 {
            // Allocated but never written: give the blank image its identity.
            page.set_id(id);
        } else if page.id() != id {
            return Err(EngineError::corrupted(
                "buffer-pool",
                format!("page {} carries on-disk id {}", id, page.id()),
            ));
        }

        let now = self.now_nanos();
        inner.frames[idx] = Some(Frame {
            page,
            pin_count: 1,
            dirty: false,
            last_access_nanos: now,
        });
        inner.page_table.insert(id, idx);

        Ok(PageGuard {
            pool: self,
            page_id: id,
            dirtied: false,
        })
    }

    /// Install a freshly allocated page without a disk read. The page is
    /// dirty from birth so it reaches the file even if never touched again.
    pub fn new_page(&self, id: PageId, kind: PageKind) -> EngineResult<PageGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.page_table.contains_key(&id) {
            return Err(EngineError::fatal(format!(
                "page {id} is already resident, cannot install it as new"
            )));
        }
        let idx = self.grab_frame(&mut inner)?;

        let now = self.now_nanos();
        inner.frames[idx] = Some(Frame {
            page: Page::new(id, kind),
            pin_count: 1,
            dirty: true,
            last_access_nanos: now,
        });
        inner.page_table.insert(id, idx);

        Ok(PageGuard {
            pool: self,
            page_id: id,
            dirtied: false,
        })
    }

    /// Write every dirty frame through the disk manager and mark it clean.
    /// Pinned frames are flushed too; their holders keep mutating under the
    /// pool lock, so the write sees a consistent image.
    pub fn flush_all(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids: Vec<PageId> = inner.page_table.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let idx = inner.page_table[&id];
            let frame = inner.frames[idx].as_mut().unwrap();
            if !frame.dirty {
                continue;
            }
            let lsn = frame.page.lsn();
            if lsn != NO_LSN {
                self.wal.flush_to(lsn)?;
            }
            self.disk.write_page(id, &frame.page)?;
            frame.dirty = false;
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident: inner.page_table.len(),
            capacity: inner.frames.len(),
        }
    }

    fn unpin(&self, id: PageId, dirtied: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.page_table.get(&id) {
            let frame = inner.frames[idx].as_mut().unwrap();
            debug_assert!(frame.pin_count > 0, "unpin of unpinned page {id}");
            frame.pin_count = frame.pin_count.saturating_sub(1);
            frame.dirty |= dirtied;
        }
    }

    /// A free frame, or the LRU unpinned victim's frame after write-back.
    /// Every frame pinned is fatal: the caller must structure access so an
    /// eviction target exists.
    fn grab_frame(&self, inner: &mut PoolInner) -> EngineResult<usize> {
        if let Some(idx) = inner.free.pop() {
            return Ok(idx);
        }

        let victim_idx = inner
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().map(|f| (i, f)))
            .filter(|(_, f)| f.pin_count == 0)
            .min_by_key(|(_, f)| f.last_access_nanos)
            .map(|(i, _)| i)
            .ok_or_else(|| {
                EngineError::fatal(format!(
                    "all {} buffer frames are pinned",
                    inner.frames.len()
                ))
            })?;

        let frame = inner.frames[victim_idx].take().unwrap();
        let victim_id = frame.page.id();
        if frame.dirty {
            // The write-back must complete before the frame is reassigned.
            let lsn = frame.page.lsn();
            if lsn != NO_LSN {
                self.wal.flush_to(lsn)?;
            }
            self.disk.write_page(victim_id, &frame.page)?;
            debug!(page = victim_id, lsn, "evicted dirty page with write-back");
        } else {
            trace!(page = victim_id, "evicted clean page");
        }
        inner.page_table.remove(&victim_id);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(victim_idx)
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Scoped pin on one page. Reads and mutations run under the pool lock via
/// the closure helpers; dropping the guard unpins with the accumulated
/// dirty flag, so no exit path can leak a pin.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    dirtied: bool,
}

impl PageGuard<'_> {
    pub fn id(&self) -> PageId {
        self.page_id
    }

    /// Read the pinned page.
    pub fn with<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let mut inner = self.pool.inner.lock().unwrap();
        let now = self.pool.now_nanos();
        let idx = inner.page_table[&self.page_id];
        let frame = inner.frames[idx].as_mut().unwrap();
        frame.last_access_nanos = now;
        f(&frame.page)
    }

    /// Mutate the pinned page and take on the write-back obligation.
    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut Page) -> R) -> R {
        self.dirtied = true;
        let mut inner = self.pool.inner.lock().unwrap();
        let now = self.pool.now_nanos();
        let idx = inner.page_table[&self.page_id];
        let frame = inner.frames[idx].as_mut().unwrap();
        frame.last_access_nanos = now;
        f(&mut frame.page)
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id, self.dirtied);
    }
}
