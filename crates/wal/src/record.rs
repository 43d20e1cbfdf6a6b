use crc32fast::Hasher;
use pagecask_common::{EngineError, EngineResult, Lsn, PageId, TxnId, INVALID_PAGE_ID};

/// Bytes of every record that are not payload: the fixed header fields
/// (lsn, txn id, prev lsn, kind, page id), the two payload length prefixes,
/// and the trailing CRC32.
///
/// Layout (little-endian):
///   lsn       : i64  (8)
///   txn_id    : u32  (4)
///   prev_lsn  : i64  (8)
///   kind      : u8   (1)
///   page_id   : i32  (4)
///   old_len   : u32  (4)
///   old_bytes : [u8; old_len]
///   new_len   : u32  (4)
///   new_bytes : [u8; new_len]
///   crc32     : u32  (4)   CRC of every preceding byte
pub const RECORD_FIXED_BYTES: usize = 37;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Insert = 3,
    Update = 4,
    Delete = 5,
    Checkpoint = 6,
    Clr = 7,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Begin),
            1 => Some(Self::Commit),
            2 => Some(Self::Abort),
            3 => Some(Self::Insert),
            4 => Some(Self::Update),
            5 => Some(Self::Delete),
            6 => Some(Self::Checkpoint),
            7 => Some(Self::Clr),
            _ => None,
        }
    }

    /// True for the kinds that modify a data page and participate in
    /// Redo/Undo (CLRs are applied but never reversed).
    pub fn is_data(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// One replayable change. Records are written once and never mutated.
///
/// For data records `old`/`new` hold *entry images* (see [`encode_entry`]):
/// the pre- and post-state of the affected leaf entry. Control records
/// (Begin/Commit/Abort/Checkpoint) carry empty payloads and `page_id = -1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub kind: RecordKind,
    pub page_id: PageId,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

impl LogRecord {
    /// Build a control record (no page, no payload).
    pub fn control(kind: RecordKind, lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            kind,
            page_id: INVALID_PAGE_ID,
            old: Vec::new(),
            new: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_BYTES + self.old.len() + self.new.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.page_id.to_le_bytes());
        buf.extend_from_slice(&(self.old.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.old);
        buf.extend_from_slice(&(self.new.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.new);
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Decode a record, verifying the trailing CRC against every preceding
    /// byte. Errors are `Corrupted` so replay can truncate at this point.
    pub fn decode(buf: &[u8]) -> EngineResult<Self> {
        if buf.len() < RECORD_FIXED_BYTES {
            return Err(EngineError::corrupted(
                "wal",
                format!("record shorter than fixed fields: {} bytes", buf.len()),
            ));
        }

        let lsn = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let txn_id = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let prev_lsn = i64::from_le_bytes(buf[12..20].try_into().unwrap());
        let kind = RecordKind::from_u8(buf[20]).ok_or_else(|| {
            EngineError::corrupted("wal", format!("unknown record kind tag {}", buf[20]))
        })?;
        let page_id = i32::from_le_bytes(buf[21..25].try_into().unwrap());

        let old_len = u32::from_le_bytes(buf[25..29].try_into().unwrap()) as usize;
        let old_end = 29usize.checked_add(old_len).ok_or_else(|| {
            EngineError::corrupted("wal", "old payload length overflows".to_string())
        })?;
        if old_end + 8 > buf.len() {
            return Err(EngineError::corrupted(
                "wal",
                format!("old payload length {old_len} exceeds record (lsn {lsn})"),
            ));
        }
        let old = buf[29..old_end].to_vec();

        let new_len = u32::from_le_bytes(buf[old_end..old_end + 4].try_into().unwrap()) as usize;
        let new_start = old_end + 4;
        if new_start + new_len + 4 != buf.len() {
            return Err(EngineError::corrupted(
                "wal",
                format!("new payload length {new_len} disagrees with record (lsn {lsn})"),
            ));
        }
        let new = buf[new_start..new_start + new_len].to_vec();

        let stored_crc =
            u32::from_le_bytes(buf[buf.len() - 4..].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&buf[..buf.len() - 4]);
        let computed = hasher.finalize();
        if stored_crc != computed {
            return Err(EngineError::corrupted(
                "wal",
                format!("checksum mismatch at lsn {lsn}: stored {stored_crc:#010x}, computed {computed:#010x}"),
            ));
        }

        Ok(Self {
            lsn,
            txn_id,
            prev_lsn,
            kind,
            page_id,
            old,
            new,
        })
    }
}

// ---------------------------------------------------------------------------
// Entry images
// ---------------------------------------------------------------------------

/// Encode the entry image carried by data records: `key_len || key || value`.
/// An empty image (no bytes at all) means "no entry": the key was absent
/// before an insert, or is removed by the reversal of one.
pub fn encode_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + value.len());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Decode an entry image produced by [`encode_entry`].
pub fn decode_entry(image: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>)> {
    if image.len() < 4 {
        return Err(EngineError::corrupted(
            "wal",
            format!("entry image shorter than its length prefix: {} bytes", image.len()),
        ));
    }
    let key_len = u32::from_le_bytes(image[0..4].try_into().unwrap()) as usize;
    if 4 + key_len > image.len() {
        return Err(EngineError::corrupted(
            "wal",
            format!("entry image key length {key_len} exceeds image"),
        ));
    }
    let key = image[4..4 + key_len].to_vec();
    let value = image[4 + key_len..].to_vec();
    Ok((key, value))
}
