use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use pagecask_common::{EngineError, EngineResult, PageId, PAGE_SIZE};
use tracing::debug;

use crate::header::HeaderPayload;
use crate::page::{Page, PageKind};

/// Offset-addressed page I/O over one database file. Page `i` lives at byte
/// `i × 4096`. Reads and writes are serialized by the internal mutex;
/// allocation is a post-incremented cursor that the engine persists into the
/// header page.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    file: Option<File>,
    /// Pages currently backed by file bytes.
    file_pages: PageId,
    /// Allocation cursor; may run ahead of `file_pages` until write-back.
    num_pages: PageId,
}

impl DiskManager {
    /// Open or create the database file. A new file is initialized with a
    /// single header page at offset 0 (synced before the call returns). A
    /// file whose length is not a whole number of pages is corrupt.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| EngineError::io("disk", e))?;

        let len = file
            .metadata()
            .map_err(|e| EngineError::io("disk", e))?
            .len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(EngineError::corrupted(
                "disk",
                format!("file length {len} is not a multiple of the page size"),
            ));
        }

        let mut file_pages = (len / PAGE_SIZE as u64) as PageId;
        if file_pages == 0 {
            let mut header = Page::new(0, PageKind::Header);
            HeaderPayload::initial().encode_into(header.payload_mut());
            file.seek(SeekFrom::Start(0))
                .map_err(|e| EngineError::io("disk", e))?;
            file.write_all(header.bytes())
                .map_err(|e| EngineError::io("disk", e))?;
            file.sync_all().map_err(|e| EngineError::io("disk", e))?;
            file_pages = 1;
            debug!(path = %path.display(), "initialized new database file");
        }

        Ok(Self {
            inner: Mutex::new(DiskInner {
                file: Some(file),
                file_pages,
                num_pages: file_pages,
            }),
        })
    }

    /// Read the 4096-byte image of page `id`. Out-of-range ids are invalid;
    /// an allocated page the file does not yet cover reads as zeroes. A
    /// short read from the OS is an I/O failure.
    pub fn read_page(&self, id: PageId) -> EngineResult<Page> {
        let mut inner = self.inner.lock().unwrap();
        if id < 0 || id >= inner.num_pages {
            return Err(EngineError::invalid(format!(
                "page {id} out of range (have {})",
                inner.num_pages
            )));
        }
        if id >= inner.file_pages {
            return Ok(Page::from_bytes([0u8; PAGE_SIZE]));
        }

        let file = inner.file.as_mut().ok_or(EngineError::Closed)?;
        file.seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64))
            .map_err(|e| EngineError::io("disk", e))?;
        let mut buf = [0u8; PAGE_SIZE];
        file.read_exact(&mut buf)
            .map_err(|e| EngineError::io("disk", e))?;
        Ok(Page::from_bytes(buf))
    }

    /// Write a page image at its offset, extending the file as needed.
    pub fn write_page(&self, id: PageId, page: &Page) -> EngineResult<()> {
        if id < 0 {
            return Err(EngineError::invalid(format!("cannot write page {id}")));
        }
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file.as_mut().ok_or(EngineError::Closed)?;
        file.seek(SeekFrom::Start(id as u64 * PAGE_SIZE as u64))
            .map_err(|e| EngineError::io("disk", e))?;
        file.write_all(page.bytes())
            .map_err(|e| EngineError::io("disk", e))?;
        inner.file_pages = inner.file_pages.max(id + 1);
        inner.num_pages = inner.num_pages.max(id + 1);
        Ok(())
    }

    /// Hand out the next page id (post-incremented allocation cursor).
    pub fn allocate(&self) -> EngineResult<PageId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.file.is_none() {
            return Err(EngineError::Closed);
        }
        let id = inner.num_pages;
        inner.num_pages += 1;
        Ok(id)
    }

    /// Current allocation cursor (one past the highest allocated page).
    pub fn num_pages(&self) -> PageId {
        self.inner.lock().unwrap().num_pages
    }

    /// Raise the allocation cursor, e.g. to the header page's persisted
    /// `next_page_id` at open.
    pub fn reserve_through(&self, next_page_id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_pages = inner.num_pages.max(next_page_id);
    }

    /// Force file data and metadata to stable storage.
    pub fn flush(&self) -> EngineResult<()> {
        let inner = self.inner.lock().unwrap();
        let file = inner.file.as_ref().ok_or(EngineError::Closed)?;
        file.sync_all().map_err(|e| EngineError::io("disk", e))
    }

    /// Flush and release the file handle. Further I/O fails `Closed`.
    pub fn close(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.take() {
            file.sync_all().map_err(|e| EngineError::io("disk", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DiskManager {
        DiskManager::open(dir.path().join("test.db")).unwrap()
    }

    #[test]
    fn test_new_file_gets_header_page() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        assert_eq!(disk.num_pages(), 1);

        let header = disk.read_page(0).unwrap();
        assert_eq!(header.kind().unwrap(), PageKind::Header);
        let payload = HeaderPayload::decode(header.payload()).unwrap();
        assert_eq!(payload, HeaderPayload::initial());
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);

        let id = disk.allocate().unwrap();
        let mut page = Page::new(id, PageKind::Leaf);
        page.set_lsn(11);
        page.payload_mut()[0..4].copy_from_slice(b"data");
        disk.write_page(id, &page).unwrap();

        let read = disk.read_page(id).unwrap();
        assert_eq!(read.id(), id);
        assert_eq!(read.lsn(), 11);
        assert_eq!(&read.payload()[0..4], b"data");
    }

    #[test]
    fn test_allocate_post_increments() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        assert_eq!(disk.allocate().unwrap(), 1);
        assert_eq!(disk.allocate().unwrap(), 2);
        assert_eq!(disk.num_pages(), 3);
    }

    #[test]
    fn test_allocated_unwritten_page_reads_zeroed() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        let id = disk.allocate().unwrap();

        let page = disk.read_page(id).unwrap();
        assert_eq!(page.kind_tag(), 0);
        assert!(page.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range_reads_rejected() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        assert!(disk.read_page(-1).is_err());
        assert!(disk.read_page(5).is_err());
    }

    #[test]
    fn test_close_then_use_fails() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir);
        disk.close().unwrap();
        assert!(matches!(disk.read_page(0), Err(EngineError::Closed)));
        assert!(matches!(disk.allocate(), Err(EngineError::Closed)));
    }

    #[test]
    fn test_torn_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 17]).unwrap();
        assert!(matches!(
            DiskManager::open(&path),
            Err(EngineError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_reopen_preserves_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let disk = DiskManager::open(&path).unwrap();
            let id = disk.allocate().unwrap();
            let mut page = Page::new(id, PageKind::Leaf);
            page.payload_mut()[0] = 0x5A;
            disk.write_page(id, &page).unwrap();
            disk.close().unwrap();
        }

        let disk = DiskManager::open(&path).unwrap();
        assert_eq!(disk.num_pages(), 2);
        assert_eq!(disk.read_page(1).unwrap().payload()[0], 0x5A);
    }
}
