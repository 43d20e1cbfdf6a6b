use std::collections::{HashMap, HashSet};

use pagecask_btree::node::LeafNode;
use pagecask_common::{
    EngineError, EngineResult, Lsn, PageId, TxnId, NO_LSN, PAGE_PAYLOAD_SIZE,
};
use pagecask_pagestore::disk::DiskManager;
use pagecask_pagestore::page::PageKind;
use pagecask_wal::lsn::LsnGenerator;
use pagecask_wal::manager::LogManager;
use pagecask_wal::record::{decode_entry, LogRecord, RecordKind};
use tracing::{info, warn};

/// What recovery found and did; the engine seeds its generators from the
/// maxima.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub analyzed: usize,
    pub committed_txns: usize,
    pub losers: Vec<TxnId>,
    pub redone: usize,
    pub undone: usize,
    pub max_lsn: Lsn,
    pub max_txn_id: TxnId,
}

struct Analysis {
    /// Transaction table: survivors are the losers to undo, mapped to their
    /// last data-record LSN.
    txn_table: HashMap<TxnId, Lsn>,
    /// Dirty page table: page → earliest LSN that dirtied it.
    dirty_pages: HashMap<PageId, Lsn>,
    committed: HashSet<TxnId>,
    max_lsn: Lsn,
    max_txn_id: TxnId,
}

/// Run ARIES recovery over a replayed record set, repairing pages straight
/// through the disk manager (the buffer pool does not exist yet, so Redo
/// owns its target pages exclusively) and appending CLRs plus closing Abort
/// records through `wal`. Runs once at open, before any user transaction;
/// running it again over the resulting state is a no-op.
pub fn run(
    records: &[LogRecord],
    disk: &DiskManager,
    wal: &LogManager,
    lsn: &LsnGenerator,
) -> EngineResult<RecoveryReport> {
    let analysis = analyze(records);
    let first_redo_lsn = analysis.dirty_pages.values().min().copied();
    info!(
        records = records.len(),
        active = analysis.txn_table.len(),
        committed = analysis.committed.len(),
        dirty_pages = analysis.dirty_pages.len(),
        first_redo_lsn,
        "analysis complete"
    );

    let redone = match first_redo_lsn {
        Some(first) => redo(records, &analysis.committed, first, disk)?,
        None => 0,
    };
    info!(redone, "redo complete");

    let (undone, losers) = undo(records, &analysis.txn_table, disk, wal, lsn)?;
    info!(undone, losers = losers.len(), "undo complete");

    disk.flush()?;

    Ok(RecoveryReport {
        analyzed: records.len(),
        committed_txns: analysis.committed.len(),
        losers,
        redone,
        undone,
        max_lsn: analysis.max_lsn.max(lsn.current()),
        max_txn_id: analysis.max_txn_id,
    })
}

/// Phase 1: one forward pass building the transaction table, the dirty page
/// table, and the committed set.
fn analyze(records: &[LogRecord]) -> Analysis {
    let mut txn_table = HashMap::new();
    let mut dirty_pages = HashMap::new();
    let mut committed = HashSet::new();
    let mut max_lsn = NO_LSN;
    let mut max_txn_id = 0;

    for record in records {
        max_lsn = max_lsn.max(record.lsn);
        max_txn_id = max_txn_id.max(record.txn_id);
        match record.kind {
            RecordKind::Begin => {
                txn_table.insert(record.txn_id, record.lsn);
            }
            RecordKind::Commit => {
                txn_table.remove(&record.txn_id);
                committed.insert(record.txn_id);
            }
            RecordKind::Abort => {
                txn_table.remove(&record.txn_id);
            }
            RecordKind::Insert | RecordKind::Update | RecordKind::Delete
                if record.page_id >= 0 =>
            {
                dirty_pages.entry(record.page_id).or_insert(record.lsn);
                txn_table.insert(record.txn_id, record.lsn);
            }
            _ => {}
        }
    }

    Analysis {
        txn_table,
        dirty_pages,
        committed,
        max_lsn,
        max_txn_id,
    }
}

/// Phase 2: forward from `first_redo_lsn`, reapplying committed data
/// records to pages whose `page_lsn` has not caught up.
fn redo(
    records: &[LogRecord],
    committed: &HashSet<TxnId>,
    first_redo_lsn: Lsn,
    disk: &DiskManager,
) -> EngineResult<usize> {
    let mut redone = 0;
    for record in records {
        if record.lsn < first_redo_lsn
            || !record.kind.is_data()
            || record.page_id < 0
            || !committed.contains(&record.txn_id)
        {
            continue;
        }
        if apply_image(disk, record.page_id, &record.old, &record.new, record.lsn)? {
            redone += 1;
        }
    }
    Ok(redone)
}

/// Phase 3: walk each loser's chain backward via `prev_lsn`, reversing data
/// records with their old images. Every reversal logs a CLR whose
/// `prev_lsn` is the undone record's own `prev_lsn` (the undo-next
/// pointer), and CLRs met on the walk are jumped over, never re-undone.
/// Each loser ends with an Abort record so a later recovery skips it.
fn undo(
    records: &[LogRecord],
    txn_table: &HashMap<TxnId, Lsn>,
    disk: &DiskManager,
    wal: &LogManager,
    lsn: &LsnGenerator,
) -> EngineResult<(usize, Vec<TxnId>)> {
    let by_lsn: HashMap<Lsn, &LogRecord> = records.iter().map(|r| (r.lsn, r)).collect();

    let mut losers: Vec<TxnId> = txn_table.keys().copied().collect();
    losers.sort_unstable();

    // First pass: log every CLR (and the closing Abort per loser), collecting
    // the page reversals to apply.
    struct Reversal {
        page_id: PageId,
        displaced: Vec<u8>,
        restore: Vec<u8>,
        clr_lsn: Lsn,
    }
    let mut reversals: Vec<Reversal> = Vec::new();

    for &loser in &losers {
        let mut cursor = txn_table[&loser];
        let mut last_lsn = cursor;
        while cursor != NO_LSN {
            let Some(record) = by_lsn.get(&cursor) else {
                warn!(txn = loser, lsn = cursor, "undo chain broke, stopping walk");
                break;
            };
            match record.kind {
                RecordKind::Begin => break,
                RecordKind::Clr => {
                    cursor = record.prev_lsn;
                }
                RecordKind::Insert | RecordKind::Update | RecordKind::Delete => {
                    let clr_lsn = lsn.next();
                    wal.append(
                        &LogRecord {
                            lsn: clr_lsn,
                            txn_id: loser,
                            prev_lsn: record.prev_lsn,
                            kind: RecordKind::Clr,
                            page_id: record.page_id,
                            old: Vec::new(),
                            new: record.old.clone(),
                        },
                        false,
                    )?;
                    reversals.push(Reversal {
                        page_id: record.page_id,
                        displaced: record.new.clone(),
                        restore: record.old.clone(),
                        clr_lsn,
                    });
                    last_lsn = clr_lsn;
                    cursor = record.prev_lsn;
                }
                _ => {
                    cursor = record.prev_lsn;
                }
            }
        }

        let abort_lsn = lsn.next();
        wal.append(
            &LogRecord::control(RecordKind::Abort, abort_lsn, loser, last_lsn),
            false,
        )?;
    }

    // CLRs must be durable before any page stamped with their LSNs.
    if !losers.is_empty() {
        wal.flush()?;
    }

    let mut undone = 0;
    for r in &reversals {
        if apply_image(disk, r.page_id, &r.displaced, &r.restore, r.clr_lsn)? {
            undone += 1;
        }
    }

    Ok((undone, losers))
}

/// Apply an entry image to a leaf page: upsert the `apply` image's entry,
/// or remove the entry named by `displaced` when `apply` is empty.
/// Pages the file does not know yet materialize as empty leaves. Returns
/// false when the page LSN gate skipped the change.
fn apply_image(
    disk: &DiskManager,
    page_id: PageId,
    displaced: &[u8],
    apply: &[u8],
    lsn: Lsn,
) -> EngineResult<bool> {
    disk.reserve_through(page_id + 1);
    let mut page = disk.read_page(page_id)?;

    if page.lsn() >= lsn {
        return Ok(false);
    }

    let mut leaf = match page.kind_tag() {
        0 => LeafNode::new(),
        _ => match page.kind()? {
            PageKind::Leaf => LeafNode::decode(page.payload())?,
            other => {
                return Err(EngineError::fatal(format!(
                    "recovery cannot apply a record to page {page_id} of kind {other:?}"
                )))
            }
        },
    };

    if apply.is_empty() {
        if displaced.is_empty() {
            return Ok(false);
        }
        let (key, _) = decode_entry(displaced)?;
        if let Ok(at) = leaf.find(&key) {
            leaf.entries.remove(at);
        }
    } else {
        let (key, value) = decode_entry(apply)?;
        match leaf.find(&key) {
            Ok(at) => leaf.entries[at].1 = value,
            Err(at) => leaf.entries.insert(at, (key, value)),
        }
        if leaf.encoded_size() > PAGE_PAYLOAD_SIZE {
            // The entry landed elsewhere after a split on the forward path;
            // structural changes are not logged, so there is nothing sound
            // to do with this page.
            warn!(page = page_id, lsn, "image does not fit its logged page, skipping");
            return Ok(false);
        }
    }

    let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
    leaf.encode_into(&mut buf)?;
    page.set_id(page_id);
    page.set_kind(PageKind::Leaf);
    page.payload_mut().copy_from_slice(&buf);
    page.set_lsn(lsn);
    disk.write_page(page_id, &page)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecask_pagestore::page::Page;
    use pagecask_wal::record::encode_entry;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        disk: DiskManager,
        wal: LogManager,
        lsn: LsnGenerator,
    }

    fn harness(seed_lsn: Lsn) -> Harness {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::open(dir.path().join("test.db")).unwrap();
        let wal = LogManager::open(dir.path().join("wal"), 1 << 20, 1 << 16, seed_lsn).unwrap();
        let lsn = LsnGenerator::seeded(seed_lsn.max(0));
        Harness {
            _dir: dir,
            disk,
            wal,
            lsn,
        }
    }

    fn begin(lsn: Lsn, txn: TxnId) -> LogRecord {
        LogRecord::control(RecordKind::Begin, lsn, txn, NO_LSN)
    }

    fn commit(lsn: Lsn, txn: TxnId, prev: Lsn) -> LogRecord {
        LogRecord::control(RecordKind::Commit, lsn, txn, prev)
    }

    fn insert(lsn: Lsn, txn: TxnId, prev: Lsn, page: PageId, key: &[u8], value: &[u8]) -> LogRecord {
        LogRecord {
            lsn,
            txn_id: txn,
            prev_lsn: prev,
            kind: RecordKind::Insert,
            page_id: page,
            old: Vec::new(),
            new: encode_entry(key, value),
        }
    }

    fn update(
        lsn: Lsn,
        txn: TxnId,
        prev: Lsn,
        page: PageId,
        key: &[u8],
        old: &[u8],
        new: &[u8],
    ) -> LogRecord {
        LogRecord {
            lsn,
            txn_id: txn,
            prev_lsn: prev,
            kind: RecordKind::Update,
            page_id: page,
            old: encode_entry(key, old),
            new: encode_entry(key, new),
        }
    }

    fn leaf_on(disk: &DiskManager, page: PageId) -> LeafNode {
        LeafNode::decode(disk.read_page(page).unwrap().payload()).unwrap()
    }

    #[test]
    fn test_redo_applies_committed_change() {
        let h = harness(3);
        // Begin(1), Insert(2, page 5), Commit(3); page 5 never flushed.
        let records = vec![
            begin(1, 100),
            insert(2, 100, 1, 5, b"k", b"v"),
            commit(3, 100, 2),
        ];

        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(report.undone, 0);
        assert!(report.losers.is_empty());

        let page = h.disk.read_page(5).unwrap();
        assert_eq!(page.lsn(), 2);
        let leaf = leaf_on(&h.disk, 5);
        assert_eq!(leaf.find(b"k"), Ok(0));
        assert_eq!(leaf.entries[0].1, b"v");
    }

    #[test]
    fn test_redo_skips_page_already_current() {
        let h = harness(3);
        // Page 5 already carries LSN 2 (it was flushed before the crash).
        let mut page = Page::new(5, PageKind::Leaf);
        let mut leaf = LeafNode::new();
        leaf.entries.push((b"k".to_vec(), b"already".to_vec()));
        let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
        leaf.encode_into(&mut buf).unwrap();
        page.payload_mut().copy_from_slice(&buf);
        page.set_lsn(2);
        h.disk.reserve_through(6);
        h.disk.write_page(5, &page).unwrap();

        let records = vec![
            begin(1, 100),
            insert(2, 100, 1, 5, b"k", b"v"),
            commit(3, 100, 2),
        ];
        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.redone, 0, "durable change must not be reapplied");
        assert_eq!(leaf_on(&h.disk, 5).entries[0].1, b"already");
    }

    #[test]
    fn test_uncommitted_changes_not_redone() {
        let h = harness(2);
        let records = vec![begin(1, 200), insert(2, 200, 1, 4, b"k", b"ghost")];

        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.redone, 0);
        assert_eq!(report.losers, vec![200]);
    }

    #[test]
    fn test_undo_reverses_loser_update() {
        let h = harness(5);
        // Committed insert put k="x" on page 7; loser 200 updated it to "y".
        let records = vec![
            begin(1, 100),
            insert(2, 100, 1, 7, b"k", b"x"),
            commit(3, 100, 2),
            begin(4, 200),
            update(5, 200, 4, 7, b"k", b"x", b"y"),
        ];

        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.redone, 1);
        assert_eq!(report.undone, 1);
        assert_eq!(report.losers, vec![200]);

        let leaf = leaf_on(&h.disk, 7);
        assert_eq!(leaf.entries[0].1, b"x", "loser's update must be reversed");

        // A CLR referencing the undone update and a closing Abort exist.
        let appended = pagecask_wal::reader::read_all(h._dir.path().join("wal").as_path()).unwrap();
        let clr = appended.iter().find(|r| r.kind == RecordKind::Clr).unwrap();
        assert_eq!(clr.txn_id, 200);
        assert_eq!(clr.page_id, 7);
        assert_eq!(clr.prev_lsn, 4, "undo-next points past the undone record");
        assert!(appended
            .iter()
            .any(|r| r.kind == RecordKind::Abort && r.txn_id == 200));
    }

    #[test]
    fn test_undo_removes_loser_insert() {
        let h = harness(2);
        let records = vec![begin(1, 300), insert(2, 300, 1, 6, b"k", b"mine")];

        // Pretend the dirty page reached disk before the crash.
        apply_image(&h.disk, 6, &[], &encode_entry(b"k", b"mine"), 2).unwrap();
        assert_eq!(leaf_on(&h.disk, 6).entries.len(), 1);

        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.undone, 1);
        assert!(leaf_on(&h.disk, 6).entries.is_empty(), "insert must be removed");
    }

    #[test]
    fn test_recovery_twice_is_noop() {
        let h = harness(5);
        let records = vec![
            begin(1, 100),
            insert(2, 100, 1, 7, b"k", b"x"),
            commit(3, 100, 2),
            begin(4, 200),
            update(5, 200, 4, 7, b"k", b"x", b"y"),
        ];
        run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        let image_after_first = *h.disk.read_page(7).unwrap().bytes();

        // Second run over the post-recovery WAL: the loser now ends in an
        // Abort record, so nothing is undone and pages stay put.
        let replayed =
            pagecask_wal::reader::read_all(h._dir.path().join("wal").as_path()).unwrap();
        let all: Vec<LogRecord> = records.iter().cloned().chain(replayed).collect();
        let report = run(&all, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.undone, 0);
        assert!(report.losers.is_empty());
        assert_eq!(*h.disk.read_page(7).unwrap().bytes(), image_after_first);
    }

    #[test]
    fn test_losers_with_multiple_writes_unwind_fully() {
        let h = harness(4);
        let records = vec![
            begin(1, 400),
            insert(2, 400, 1, 3, b"a", b"1"),
            insert(3, 400, 2, 3, b"b", b"2"),
            update(4, 400, 3, 3, b"a", b"1", b"1+"),
        ];

        // All three changes hit the page before the crash.
        apply_image(&h.disk, 3, &[], &encode_entry(b"a", b"1"), 2).unwrap();
        apply_image(&h.disk, 3, &[], &encode_entry(b"b", b"2"), 3).unwrap();
        apply_image(&h.disk, 3, &[], &encode_entry(b"a", b"1+"), 4).unwrap();

        let report = run(&records, &h.disk, &h.wal, &h.lsn).unwrap();
        assert_eq!(report.undone, 3);
        assert!(leaf_on(&h.disk, 3).entries.is_empty());
    }
}
