use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use pagecask_common::{EngineError, EngineResult, Lsn, NO_LSN};
use tracing::debug;

use crate::record::LogRecord;

/// Bytes of the fixed file header at the start of every segment:
/// magic (u32), version (u32), start LSN (i64), zero padding.
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// "WAL1" in ASCII.
pub const SEGMENT_MAGIC: u32 = 0x5741_4C31;

pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Segment file name: 24 zero-padded decimal digits plus `.log`.
pub fn segment_file_name(number: u64) -> String {
    format!("{number:024}.log")
}

/// Parse a segment number back out of a file name, if it is one.
pub fn parse_segment_number(name: &str) -> Option<u64> {
    let digits = name.strip_suffix(".log")?;
    if digits.len() != 24 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub(crate) fn encode_segment_header(start_lsn: Lsn) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&start_lsn.to_le_bytes());
    buf
}

/// Append side of the WAL: an in-memory buffer in front of the active
/// segment, rotation before a record would overflow `segment_size`, and a
/// durability watermark (`flushed_lsn`) that only advances on fsync.
///
/// Appends are serialized by the internal mutex; records arrive pre-stamped
/// by the caller's [`crate::lsn::LsnGenerator`].
pub struct LogManager {
    inner: Mutex<LogInner>,
    /// Highest LSN guaranteed durable. Read lock-free by the buffer pool
    /// for the WAL-before-page check.
    flushed: AtomicI64,
}

struct LogInner {
    dir: PathBuf,
    file: File,
    segment_number: u64,
    /// Logical size of the active segment, counting buffered frames.
    segment_bytes: u64,
    segment_size: u64,
    buf: Vec<u8>,
    buf_cap: usize,
    /// Highest LSN serialized (possibly still only buffered).
    last_appended: Lsn,
}

impl LogManager {
    /// Open the WAL directory, continuing the highest-numbered segment or
    /// creating the first one. `durable_lsn` is the highest LSN already on
    /// disk (from replay); the watermark starts there.
    pub fn open(
        dir: impl AsRef<Path>,
        segment_size: u64,
        buffer_bytes: usize,
        durable_lsn: Lsn,
    ) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| EngineError::io("wal", e))?;

        let existing = crate::reader::list_segments(&dir)?;
        let (file, segment_number, segment_bytes) = match existing.last() {
            Some(seg) => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&seg.path)
                    .map_err(|e| EngineError::io("wal", e))?;
                let len = file
                    .metadata()
                    .map_err(|e| EngineError::io("wal", e))?
                    .len();
                // Everything surviving replay is treated as durable; one
                // fsync settles anything the dying process left in OS caches.
                file.sync_all().map_err(|e| EngineError::io("wal", e))?;
                (file, seg.number, len)
            }
            None => {
                let number = 1;
                let file = create_segment(&dir, number, durable_lsn.max(0) + 1)?;
                (file, number, SEGMENT_HEADER_SIZE as u64)
            }
        };

        Ok(Self {
            inner: Mutex::new(LogInner {
                dir,
                file,
                segment_number,
                segment_bytes,
                segment_size,
                buf: Vec::with_capacity(buffer_bytes),
                buf_cap: buffer_bytes.max(1),
                last_appended: durable_lsn.max(NO_LSN),
            }),
            flushed: AtomicI64::new(durable_lsn.max(NO_LSN)),
        })
    }

    /// Append one record. With `force`, does not return until the record's
    /// segment is durable (force-log-at-commit). Returns the record's LSN.
    pub fn append(&self, record: &LogRecord, force: bool) -> EngineResult<Lsn> {
        let mut inner = self.inner.lock().unwrap();

        let bytes = record.encode();
        let frame_len = 4 + bytes.len() as u64;

        // Rotate before the record would push the segment past its size.
        if inner.segment_bytes + frame_len > inner.segment_size
            && inner.segment_bytes > SEGMENT_HEADER_SIZE as u64
        {
            self.rotate(&mut inner, record.lsn)?;
        }

        inner
            .buf
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        inner.buf.extend_from_slice(&bytes);
        inner.segment_bytes += frame_len;
        inner.last_appended = record.lsn;

        if inner.buf.len() >= inner.buf_cap {
            // Spill to the file without fsync; durability waits for a force.
            write_buffer(&mut inner)?;
        }

        if force {
            write_buffer(&mut inner)?;
            inner
                .file
                .sync_all()
                .map_err(|e| EngineError::io("wal", e))?;
            self.flushed.store(inner.last_appended, Ordering::SeqCst);
        }

        Ok(record.lsn)
    }

    /// Flush the buffer and fsync the active segment, advancing the
    /// durability watermark to the last appended LSN.
    pub fn flush(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        write_buffer(&mut inner)?;
        inner
            .file
            .sync_all()
            .map_err(|e| EngineError::io("wal", e))?;
        self.flushed.store(inner.last_appended, Ordering::SeqCst);
        Ok(())
    }

    /// Highest LSN guaranteed to be on stable storage.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::SeqCst)
    }

    /// Make the WAL durable at least up to `lsn`. Used by the buffer pool
    /// before writing back a page with `page_lsn = lsn`.
    pub fn flush_to(&self, lsn: Lsn) -> EngineResult<()> {
        if self.flushed_lsn() < lsn {
            self.flush()?;
        }
        Ok(())
    }

    /// Number of the active segment (for stats).
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().unwrap().segment_number
    }

    fn rotate(&self, inner: &mut LogInner, next_record_lsn: Lsn) -> EngineResult<()> {
        write_buffer(inner)?;
        inner
            .file
            .sync_all()
            .map_err(|e| EngineError::io("wal", e))?;
        self.flushed.store(inner.last_appended, Ordering::SeqCst);

        let next_number = inner.segment_number + 1;
        debug!(
            sealed = inner.segment_number,
            opened = next_number,
            "rotating wal segment"
        );
        inner.file = create_segment(&inner.dir, next_number, next_record_lsn)?;
        inner.segment_number = next_number;
        inner.segment_bytes = SEGMENT_HEADER_SIZE as u64;
        Ok(())
    }
}

fn write_buffer(inner: &mut LogInner) -> EngineResult<()> {
    if inner.buf.is_empty() {
        return Ok(());
    }
    inner
        .file
        .write_all(&inner.buf)
        .map_err(|e| EngineError::io("wal", e))?;
    inner.buf.clear();
    Ok(())
}

fn create_segment(dir: &Path, number: u64, start_lsn: Lsn) -> EngineResult<File> {
    let path = dir.join(segment_file_name(number));
    let mut file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .map_err(|e| EngineError::io("wal", e))?;
    file.write_all(&encode_segment_header(start_lsn))
        .map_err(|e| EngineError::io("wal", e))?;
    Ok(file)
}
