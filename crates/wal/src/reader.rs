use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use pagecask_common::{EngineError, EngineResult, Lsn, NO_LSN};
use tracing::{info, warn};

use crate::manager::{
    parse_segment_number, SEGMENT_FORMAT_VERSION, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};
use crate::record::LogRecord;

/// Upper bound on a single record's length prefix. Anything larger is
/// treated as corruption and truncates replay.
pub const MAX_RECORD_BYTES: u32 = 16 * 1024 * 1024;

/// One discovered segment file.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub number: u64,
    pub path: PathBuf,
}

/// List the WAL directory's segment files in ascending numeric order.
/// A missing directory is an empty log.
pub fn list_segments(dir: &Path) -> EngineResult<Vec<SegmentFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::io("wal", e)),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io("wal", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(number) = parse_segment_number(name) {
            segments.push(SegmentFile {
                number,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(|s| s.number);
    Ok(segments)
}

/// Outcome of scanning one segment: the records it held and where the last
/// good frame ended.
struct SegmentScan {
    /// Offset just past the last good record (at least the file header).
    good_end: u64,
    /// False if the scan stopped before a clean EOF: truncated frame,
    /// unreasonable length, bad header, or checksum mismatch.
    clean: bool,
}

/// Replay every record from every segment in LSN order, without touching
/// the files. Each segment halts at EOF, a non-positive or unreasonable
/// length prefix, or a checksum mismatch; a mid-segment stop ends the
/// overall scan, since nothing beyond a corruption point is trustworthy. The
/// truncation point is the last good record.
pub fn read_all(dir: &Path) -> EngineResult<Vec<LogRecord>> {
    let mut records = Vec::new();
    for segment in list_segments(dir)? {
        let scan = read_segment(&segment, &mut records)?;
        if !scan.clean {
            break;
        }
    }
    Ok(records)
}

/// Replay as [`read_all`], then make the on-disk log agree with what was
/// accepted: the segment where the scan stopped is cut back to its last good
/// record and any later segments are removed, so subsequent appends start
/// right after the last accepted record.
pub fn replay_and_truncate(dir: &Path) -> EngineResult<Vec<LogRecord>> {
    let segments = list_segments(dir)?;
    let mut records = Vec::new();

    let mut stop: Option<usize> = None;
    for (idx, segment) in segments.iter().enumerate() {
        let scan = read_segment(segment, &mut records)?;
        if !scan.clean {
            info!(
                segment = segment.number,
                good_end = scan.good_end,
                "truncating wal at last good record"
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&segment.path)
                .map_err(|e| EngineError::io("wal", e))?;
            file.set_len(scan.good_end)
                .map_err(|e| EngineError::io("wal", e))?;
            file.sync_all().map_err(|e| EngineError::io("wal", e))?;
            stop = Some(idx);
            break;
        }
    }

    if let Some(idx) = stop {
        for dead in &segments[idx + 1..] {
            warn!(segment = dead.number, "removing segment past corruption point");
            fs::remove_file(&dead.path).map_err(|e| EngineError::io("wal", e))?;
        }
    }

    Ok(records)
}

fn read_segment(segment: &SegmentFile, out: &mut Vec<LogRecord>) -> EngineResult<SegmentScan> {
    let mut file = File::open(&segment.path).map_err(|e| EngineError::io("wal", e))?;

    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            warn!(segment = segment.number, "segment shorter than file header");
            return Ok(SegmentScan { good_end: 0, clean: false });
        }
        Err(e) => return Err(EngineError::io("wal", e)),
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if magic != SEGMENT_MAGIC || version != SEGMENT_FORMAT_VERSION {
        warn!(
            segment = segment.number,
            magic, version, "bad segment file header, stopping replay"
        );
        return Ok(SegmentScan {
            good_end: SEGMENT_HEADER_SIZE as u64,
            clean: false,
        });
    }

    let mut good_end = SEGMENT_HEADER_SIZE as u64;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(SegmentScan { good_end, clean: true });
            }
            Err(e) => return Err(EngineError::io("wal", e)),
        }

        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_RECORD_BYTES {
            warn!(
                segment = segment.number,
                offset = good_end,
                len,
                "unreasonable record length, truncating replay"
            );
            return Ok(SegmentScan { good_end, clean: false });
        }

        let mut body = vec![0u8; len as usize];
        match file.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(
                    segment = segment.number,
                    offset = good_end,
                    "record frame cut short, truncating replay"
                );
                return Ok(SegmentScan { good_end, clean: false });
            }
            Err(e) => return Err(EngineError::io("wal", e)),
        }

        match LogRecord::decode(&body) {
            Ok(record) => {
                out.push(record);
                good_end = file.stream_position().map_err(|e| EngineError::io("wal", e))?;
            }
            Err(_) => {
                warn!(
                    segment = segment.number,
                    offset = good_end,
                    "record failed checksum, truncating replay"
                );
                return Ok(SegmentScan { good_end, clean: false });
            }
        }
    }
}

/// Highest LSN seen in a replayed record set, or `NO_LSN` when empty. Used
/// to seed the generators above everything already in the log.
pub fn max_lsn(records: &[LogRecord]) -> Lsn {
    records.iter().map(|r| r.lsn).max().unwrap_or(NO_LSN)
}
