use pagecask_common::{EngineError, EngineResult, PageId, INVALID_PAGE_ID, PAGE_PAYLOAD_SIZE};

/// Payload tag bytes. Kept equal to the page-kind tags so a payload that
/// disagrees with its page header is immediately visible.
pub const LEAF_TAG: u8 = 3;
pub const INTERNAL_TAG: u8 = 2;

/// Fixed bytes of a leaf payload before its entries: tag, entry count,
/// next-leaf page id.
pub const LEAF_HEADER_BYTES: usize = 1 + 4 + 4;

/// Fixed bytes of an internal payload before its keys: tag, key count.
pub const INTERNAL_HEADER_BYTES: usize = 1 + 4;

/// Ordered `(key, value)` entries plus the forward link that threads all
/// leaves into an ascending chain for range scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub next_leaf: PageId,
}

impl LeafNode {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_leaf: INVALID_PAGE_ID,
        }
    }

    /// Binary search among the (strictly ascending) keys.
    pub fn find(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    pub fn encoded_size(&self) -> usize {
        LEAF_HEADER_BYTES
            + self
                .entries
                .iter()
                .map(|(k, v)| 8 + k.len() + v.len())
                .sum::<usize>()
    }

    /// Serialize into a page payload buffer, zero-filling the remainder.
    pub fn encode_into(&self, payload: &mut [u8]) -> EngineResult<()> {
        let size = self.encoded_size();
        if size > payload.len() {
            return Err(EngineError::fatal(format!(
                "leaf node of {size} bytes exceeds payload capacity {}",
                payload.len()
            )));
        }
        payload.fill(0);
        payload[0] = LEAF_TAG;
        payload[1..5].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        payload[5..9].copy_from_slice(&self.next_leaf.to_le_bytes());

        let mut at = LEAF_HEADER_BYTES;
        for (key, value) in &self.entries {
            payload[at..at + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
            at += 4;
            payload[at..at + key.len()].copy_from_slice(key);
            at += key.len();
            payload[at..at + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
            at += 4;
            payload[at..at + value.len()].copy_from_slice(value);
            at += value.len();
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> EngineResult<Self> {
        if payload.len() < LEAF_HEADER_BYTES {
            return Err(corrupt("leaf payload shorter than its header"));
        }
        if payload[0] != LEAF_TAG {
            return Err(corrupt(format!(
                "expected leaf tag {LEAF_TAG}, found {}",
                payload[0]
            )));
        }
        let count = u32::from_le_bytes(payload[1..5].try_into().unwrap()) as usize;
        let next_leaf = i32::from_le_bytes(payload[5..9].try_into().unwrap());

        let mut entries = Vec::with_capacity(count.min(PAGE_PAYLOAD_SIZE / 8));
        let mut at = LEAF_HEADER_BYTES;
        for _ in 0..count {
            let key = read_chunk(payload, &mut at)?;
            let value = read_chunk(payload, &mut at)?;
            entries.push((key, value));
        }
        Ok(Self { entries, next_leaf })
    }
}

impl Default for LeafNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Separator keys and child page ids: `count` keys, `count + 1` children,
/// every key in child `i` within `[keys[i-1], keys[i])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Index of the child to descend into for `key`: right of the greatest
    /// separator ≤ `key`, or the leftmost child when no separator is.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    pub fn encoded_size(&self) -> usize {
        INTERNAL_HEADER_BYTES
            + self.keys.iter().map(|k| 4 + k.len()).sum::<usize>()
            + 4 * self.children.len()
    }

    pub fn encode_into(&self, payload: &mut [u8]) -> EngineResult<()> {
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
        let size = self.encoded_size();
        if size > payload.len() {
            return Err(EngineError::fatal(format!(
                "internal node of {size} bytes exceeds payload capacity {}",
                payload.len()
            )));
        }
        payload.fill(0);
        payload[0] = INTERNAL_TAG;
        payload[1..5].copy_from_slice(&(self.keys.len() as u32).to_le_bytes());

        let mut at = INTERNAL_HEADER_BYTES;
        for key in &self.keys {
            payload[at..at + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
            at += 4;
            payload[at..at + key.len()].copy_from_slice(key);
            at += key.len();
        }
        for child in &self.children {
            payload[at..at + 4].copy_from_slice(&child.to_le_bytes());
            at += 4;
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> EngineResult<Self> {
        if payload.len() < INTERNAL_HEADER_BYTES {
            return Err(corrupt("internal payload shorter than its header"));
        }
        if payload[0] != INTERNAL_TAG {
            return Err(corrupt(format!(
                "expected internal tag {INTERNAL_TAG}, found {}",
                payload[0]
            )));
        }
        let count = u32::from_le_bytes(payload[1..5].try_into().unwrap()) as usize;

        let mut keys = Vec::with_capacity(count.min(PAGE_PAYLOAD_SIZE / 4));
        let mut at = INTERNAL_HEADER_BYTES;
        for _ in 0..count {
            keys.push(read_chunk(payload, &mut at)?);
        }
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..count + 1 {
            if at + 4 > payload.len() {
                return Err(corrupt("internal node children run past the payload"));
            }
            children.push(i32::from_le_bytes(payload[at..at + 4].try_into().unwrap()));
            at += 4;
        }
        Ok(Self { keys, children })
    }
}

/// Largest entry an empty leaf can hold; anything bigger can never be
/// stored, because a node occupies exactly one page.
pub fn max_entry_bytes() -> usize {
    PAGE_PAYLOAD_SIZE - LEAF_HEADER_BYTES - 8
}

fn read_chunk(payload: &[u8], at: &mut usize) -> EngineResult<Vec<u8>> {
    if *at + 4 > payload.len() {
        return Err(corrupt("length prefix runs past the payload"));
    }
    let len = u32::from_le_bytes(payload[*at..*at + 4].try_into().unwrap()) as usize;
    *at += 4;
    if len > PAGE_PAYLOAD_SIZE || *at + len > payload.len() {
        return Err(corrupt(format!("impossible chunk length {len}")));
    }
    let chunk = payload[*at..*at + len].to_vec();
    *at += len;
    Ok(chunk)
}

fn corrupt(detail: impl Into<String>) -> EngineError {
    EngineError::corrupted("btree", detail)
}
