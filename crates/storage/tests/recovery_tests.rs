//! Crash-shaped tests: engines dropped without `close()`, hand-crafted WAL
//! states, and corrupted segment tails, all recovered through the public
//! open path.

use std::path::{Path, PathBuf};

use anyhow::Result;
use pagecask_btree::node::LeafNode;
use pagecask_common::NO_LSN;
use pagecask_pagestore::disk::DiskManager;
use pagecask_pagestore::header::{HeaderPayload, HEADER_PAGE_ID};
use pagecask_storage::{Database, EngineConfig};
use pagecask_wal::manager::LogManager;
use pagecask_wal::reader::{list_segments, max_lsn, read_all};
use pagecask_wal::record::{encode_entry, LogRecord, RecordKind};
use tempfile::TempDir;

fn small_config() -> EngineConfig {
    EngineConfig {
        buffer_pool_frames: 32,
        wal_segment_size: 64 * 1024,
        wal_buffer_bytes: 4 * 1024,
        tree_order: 8,
    }
}

fn wal_dir(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}

// =========================================================================
// Test 1: Commit, then crash without close; reopen recovers the data
// =========================================================================
#[test]
fn test_committed_data_survives_crash() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = TempDir::new()?;
    let path = dir.path().join("crash.db");

    {
        let db = Database::open_with(&path, small_config())?;
        let t = db.begin()?;
        db.insert(&t, b"42", b"answer")?;
        db.commit(&t)?;
        // Dropped without close: nothing else is flushed deliberately.
    }

    let db = Database::open_with(&path, small_config())?;
    let t = db.begin()?;
    assert_eq!(db.search(&t, b"42")?.unwrap(), b"answer");
    db.close()?;
    Ok(())
}

// =========================================================================
// Test 2: Uncommitted transaction at crash is invisible after recovery
// =========================================================================
#[test]
fn test_running_transaction_undone_by_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("loser.db");

    {
        let db = Database::open_with(&path, small_config()).unwrap();
        let t = db.begin().unwrap();
        db.insert(&t, b"committed", b"yes").unwrap();
        db.commit(&t).unwrap();

        let loser = db.begin().unwrap();
        db.insert(&loser, b"pending", b"no").unwrap();
        // Crash with `loser` still running.
    }

    let db = Database::open_with(&path, small_config()).unwrap();
    let t = db.begin().unwrap();
    assert_eq!(db.search(&t, b"committed").unwrap().unwrap(), b"yes");
    assert!(
        db.search(&t, b"pending").unwrap().is_none(),
        "loser writes must not be observable"
    );

    // Recovery closed the loser with an Abort record.
    let records = read_all(&wal_dir(&path)).unwrap();
    assert!(records
        .iter()
        .any(|r| r.kind == RecordKind::Abort));
    db.close().unwrap();
}

// =========================================================================
// Test 3: Crafted redo: a committed change logged for a page that never
// reached the file (the WAL is the only witness)
// =========================================================================
#[test]
fn test_redo_rebuilds_unflushed_page() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redo.db");
    let wal_path = wal_dir(&path);

    // A header page whose root points at page 1, which is never written.
    {
        let disk = DiskManager::open(&path).unwrap();
        let mut page = disk.read_page(HEADER_PAGE_ID).unwrap();
        let mut header = HeaderPayload::decode(page.payload()).unwrap();
        header.root = 1;
        header.next_page_id = 2;
        header.encode_into(page.payload_mut());
        disk.write_page(HEADER_PAGE_ID, &page).unwrap();
        disk.close().unwrap();
    }

    // WAL: Begin(100), Insert(page 1, k=v, lsn 2), Commit(lsn 3).
    {
        let wal = LogManager::open(&wal_path, 64 * 1024, 4 * 1024, NO_LSN).unwrap();
        wal.append(&LogRecord::control(RecordKind::Begin, 1, 100, NO_LSN), false)
            .unwrap();
        wal.append(
            &LogRecord {
                lsn: 2,
                txn_id: 100,
                prev_lsn: 1,
                kind: RecordKind::Insert,
                page_id: 1,
                old: Vec::new(),
                new: encode_entry(b"k", b"v"),
            },
            false,
        )
        .unwrap();
        wal.append(&LogRecord::control(RecordKind::Commit, 3, 100, 2), true)
            .unwrap();
    }

    let db = Database::open_with(&path, small_config()).unwrap();
    let t = db.begin().unwrap();
    assert_eq!(db.search(&t, b"k").unwrap().unwrap(), b"v");
    db.close().unwrap();
}

// =========================================================================
// Test 4: Crafted undo: a loser's update was flushed before the crash and
// must be reversed with a CLR
// =========================================================================
#[test]
fn test_undo_reverses_flushed_update() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("undo.db");
    let wal_path = wal_dir(&path);

    // Committed base state through the engine: k = "x".
    {
        let db = Database::open_with(&path, small_config()).unwrap();
        let t = db.begin().unwrap();
        db.insert(&t, b"k", b"x").unwrap();
        db.commit(&t).unwrap();
        db.close().unwrap();
    }

    let records = read_all(&wal_path).unwrap();
    let top = max_lsn(&records);
    let leaf_page = records
        .iter()
        .find(|r| r.kind == RecordKind::Insert)
        .unwrap()
        .page_id;

    // A writer updates k to "y", its page is stolen to disk, then it dies
    // without a Commit.
    {
        let wal = LogManager::open(&wal_path, 64 * 1024, 4 * 1024, top).unwrap();
        wal.append(
            &LogRecord::control(RecordKind::Begin, top + 1, 900, NO_LSN),
            false,
        )
        .unwrap();
        wal.append(
            &LogRecord {
                lsn: top + 2,
                txn_id: 900,
                prev_lsn: top + 1,
                kind: RecordKind::Update,
                page_id: leaf_page,
                old: encode_entry(b"k", b"x"),
                new: encode_entry(b"k", b"y"),
            },
            true,
        )
        .unwrap();

        let disk = DiskManager::open(&path).unwrap();
        let mut page = disk.read_page(leaf_page).unwrap();
        let mut leaf = LeafNode::decode(page.payload()).unwrap();
        let at = leaf.find(b"k").unwrap();
        leaf.entries[at].1 = b"y".to_vec();
        let mut buf = vec![0u8; page.payload().len()];
        leaf.encode_into(&mut buf).unwrap();
        page.payload_mut().copy_from_slice(&buf);
        page.set_lsn(top + 2);
        disk.write_page(leaf_page, &page).unwrap();
        disk.close().unwrap();
    }

    let db = Database::open_with(&path, small_config()).unwrap();
    let t = db.begin().unwrap();
    assert_eq!(
        db.search(&t, b"k").unwrap().unwrap(),
        b"x",
        "undo must restore the pre-update value"
    );
    db.close().unwrap();

    let after = read_all(&wal_path).unwrap();
    let clr = after
        .iter()
        .find(|r| r.kind == RecordKind::Clr)
        .expect("undo logs a CLR");
    assert_eq!(clr.txn_id, 900);
    assert_eq!(clr.page_id, leaf_page);
    assert_eq!(clr.prev_lsn, top + 1, "CLR points past the undone record");
}

// =========================================================================
// Test 5: Corrupting a record's checksum truncates replay there; earlier
// commits survive and the engine keeps appending afterward
// =========================================================================
#[test]
fn test_checksum_corruption_truncates_then_appends() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crc.db");
    let wal_path = wal_dir(&path);

    {
        let db = Database::open_with(&path, small_config()).unwrap();
        for i in 0..3u8 {
            let t = db.begin().unwrap();
            db.insert(&t, &[b'k', b'0' + i], b"v").unwrap();
            db.commit(&t).unwrap();
        }
        db.close().unwrap();
    }
    let count_before = read_all(&wal_path).unwrap().len();

    // Flip one byte in the final record (the shutdown checkpoint).
    let seg = list_segments(&wal_path).unwrap().pop().unwrap();
    let mut bytes = std::fs::read(&seg.path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&seg.path, &bytes).unwrap();

    assert_eq!(
        read_all(&wal_path).unwrap().len(),
        count_before - 1,
        "replay stops at the corrupt record and keeps everything prior"
    );

    // Reopen: recovery truncates the bad tail, data is intact, and new
    // appends land after the last accepted record.
    let db = Database::open_with(&path, small_config()).unwrap();
    let t = db.begin().unwrap();
    for i in 0..3u8 {
        assert!(db.search(&t, &[b'k', b'0' + i]).unwrap().is_some());
    }
    db.commit(&t).unwrap();

    let t = db.begin().unwrap();
    db.insert(&t, b"k9", b"post-corruption").unwrap();
    db.commit(&t).unwrap();
    db.close().unwrap();

    let db = Database::open_with(&path, small_config()).unwrap();
    let t = db.begin().unwrap();
    assert_eq!(db.search(&t, b"k9").unwrap().unwrap(), b"post-corruption");
    db.close().unwrap();
}

// =========================================================================
// Test 6: Recovery is idempotent: opening twice over the same crash state
// converges to the same answers
// =========================================================================
#[test]
fn test_double_recovery_is_stable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("twice.db");

    {
        let db = Database::open_with(&path, small_config()).unwrap();
        let t = db.begin().unwrap();
        db.insert(&t, b"stable", b"1").unwrap();
        db.commit(&t).unwrap();
        let loser = db.begin().unwrap();
        db.insert(&loser, b"ghost", b"2").unwrap();
        // Crash.
    }

    for round in 0..2 {
        let db = Database::open_with(&path, small_config()).unwrap();
        let t = db.begin().unwrap();
        assert_eq!(
            db.search(&t, b"stable").unwrap().unwrap(),
            b"1",
            "round {round}"
        );
        assert!(db.search(&t, b"ghost").unwrap().is_none(), "round {round}");
        db.close().unwrap();
    }
}

// =========================================================================
// Test 7: WAL segments rotate under load and recovery reads across them
// =========================================================================
#[test]
fn test_recovery_spans_rotated_segments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("segments.db");
    let config = EngineConfig {
        wal_segment_size: 4 * 1024, // rotate every few records
        ..small_config()
    };

    {
        let db = Database::open_with(&path, config.clone()).unwrap();
        for i in 0..200u32 {
            let t = db.begin().unwrap();
            let key = format!("key-{i:05}");
            db.insert(&t, key.as_bytes(), &vec![0xAB; 64]).unwrap();
            db.commit(&t).unwrap();
        }
        // Crash without close.
    }

    assert!(
        list_segments(&wal_dir(&path)).unwrap().len() > 1,
        "load must have rotated segments"
    );

    let db = Database::open_with(&path, config).unwrap();
    let t = db.begin().unwrap();
    let all = db.range_scan(&t, b"key-", b"key-~").unwrap();
    assert_eq!(all.len(), 200);
    db.close().unwrap();
}
