use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pagecask_btree::tree::BPlusTree;
use pagecask_common::{EngineError, EngineResult, Lsn, PageId, NO_LSN};
use pagecask_pagestore::buffer_pool::{BufferPool, PoolStats};
use pagecask_pagestore::disk::DiskManager;
use pagecask_pagestore::header::{HeaderPayload, HEADER_PAGE_ID};
use pagecask_txn::manager::{Transaction, TxnManager};
use pagecask_txn::recovery;
use pagecask_wal::lsn::LsnGenerator;
use pagecask_wal::manager::LogManager;
use pagecask_wal::reader;
use pagecask_wal::record::{LogRecord, RecordKind};
use tracing::info;

use crate::config::EngineConfig;

/// Counters surfaced to external collaborators (a CLI's STATS command, a
/// benchmark harness).
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub num_pages: PageId,
    pub flushed_lsn: Lsn,
    pub wal_segment: u64,
    pub active_txns: usize,
}

/// An embedded database: one file of 4 KiB pages beside a `<path>.wal/`
/// segment directory. Opening a path whose WAL directory holds segments
/// runs crash recovery before any operation is served. The handle is
/// `Send + Sync`; share it across threads with an `Arc`.
pub struct Database {
    disk: Arc<DiskManager>,
    wal: Arc<LogManager>,
    lsn: Arc<LsnGenerator>,
    pool: Arc<BufferPool>,
    txns: TxnManager,
    closed: AtomicBool,
}

impl Database {
    /// Open with default tunables.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::open_with(path, EngineConfig::default())
    }

    /// Open or create the database at `path`, running recovery if the WAL
    /// directory is non-empty.
    pub fn open_with(path: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let path = path.as_ref();
        let wal_dir = wal_dir_for(path);

        let disk = Arc::new(DiskManager::open(path)?);

        // Replay before constructing anything that appends: the surviving
        // records define where the LSN space continues.
        let had_segments = !reader::list_segments(&wal_dir)?.is_empty();
        let records = if had_segments {
            reader::replay_and_truncate(&wal_dir)?
        } else {
            Vec::new()
        };
        let max_lsn = reader::max_lsn(&records);

        let lsn = Arc::new(LsnGenerator::seeded(max_lsn.max(0)));
        let wal = Arc::new(LogManager::open(
            &wal_dir,
            config.wal_segment_size,
            config.wal_buffer_bytes,
            max_lsn,
        )?);

        let next_txn_id = if had_segments {
            let report = recovery::run(&records, &disk, &wal, &lsn)?;
            info!(
                redone = report.redone,
                undone = report.undone,
                losers = report.losers.len(),
                "recovery finished"
            );
            report.max_txn_id + 1
        } else {
            1
        };

        // The header page may know about allocations the file length does
        // not cover yet.
        let header = HeaderPayload::decode(disk.read_page(HEADER_PAGE_ID)?.payload())?;
        disk.reserve_through(header.next_page_id);

        let pool = Arc::new(BufferPool::new(
            Arc::clone(&disk),
            Arc::clone(&wal),
            config.buffer_pool_frames,
        ));
        let tree = Arc::new(BPlusTree::new(
            Arc::clone(&pool),
            Arc::clone(&disk),
            config.tree_order,
        )?);
        let txns = TxnManager::new(
            Arc::clone(&wal),
            Arc::clone(&lsn),
            tree,
            Arc::clone(&pool),
            next_txn_id,
        );

        info!(path = %path.display(), recovered = had_segments, "database open");
        Ok(Self {
            disk,
            wal,
            lsn,
            pool,
            txns,
            closed: AtomicBool::new(false),
        })
    }

    /// Start a snapshot transaction.
    pub fn begin(&self) -> EngineResult<Transaction> {
        self.ensure_open()?;
        self.txns.begin()
    }

    pub fn insert(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.ensure_open()?;
        self.txns.insert(txn, key, value)
    }

    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> EngineResult<()> {
        self.ensure_open()?;
        self.txns.delete(txn, key)
    }

    pub fn search(&self, txn: &Transaction, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.txns.search(txn, key)
    }

    /// Ordered `(k, v)` pairs with `lo ≤ k < hi`, under `txn`'s snapshot.
    pub fn range_scan(
        &self,
        txn: &Transaction,
        lo: &[u8],
        hi: &[u8],
    ) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        if lo.is_empty() {
            return Err(EngineError::invalid("key must not be empty".to_string()));
        }
        if lo >= hi {
            return Err(EngineError::invalid(
                "range scan requires lo < hi".to_string(),
            ));
        }
        self.txns.range_scan(txn, lo, hi)
    }

    pub fn commit(&self, txn: &Transaction) -> EngineResult<()> {
        self.ensure_open()?;
        self.txns.commit(txn)
    }

    pub fn abort(&self, txn: &Transaction) -> EngineResult<()> {
        self.ensure_open()?;
        self.txns.abort(txn)
    }

    pub fn stats(&self) -> EngineResult<EngineStats> {
        self.ensure_open()?;
        Ok(EngineStats {
            pool: self.pool.stats(),
            num_pages: self.disk.num_pages(),
            flushed_lsn: self.wal.flushed_lsn(),
            wal_segment: self.wal.current_segment(),
            active_txns: self.txns.active_count(),
        })
    }

    /// Flush everything and release the file handles. A clean shutdown ends
    /// with a forced Checkpoint record, so the next open replays a log whose
    /// tail is known-good. Idempotent; other operations fail `Closed`
    /// afterward.
    pub fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let checkpoint_lsn = self.lsn.next();
        self.wal.append(
            &LogRecord::control(RecordKind::Checkpoint, checkpoint_lsn, 0, NO_LSN),
            true,
        )?;

        // Persist the allocation cursor so reopening trusts the header.
        {
            let mut guard = self.pool.fetch(HEADER_PAGE_ID)?;
            let next_page_id = self.disk.num_pages();
            guard.with_mut(|page| -> EngineResult<()> {
                let mut header = HeaderPayload::decode(page.payload())?;
                header.next_page_id = next_page_id;
                header.encode_into(page.payload_mut());
                Ok(())
            })?;
        }

        self.pool.flush_all()?;
        self.wal.flush()?;
        self.disk.close()?;
        info!("database closed");
        Ok(())
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

/// WAL segments live in a sibling directory named after the database file.
fn wal_dir_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".wal");
    PathBuf::from(name)
}
