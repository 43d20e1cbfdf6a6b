use pagecask_common::{EngineError, EngineResult, PageId, INVALID_PAGE_ID};

/// The header page always lives at offset 0.
pub const HEADER_PAGE_ID: PageId = 0;

/// On-disk format version stamped into the header page.
pub const FORMAT_VERSION: u32 = 1;

/// Payload of the single header page: format version, the B+ tree root
/// (-1 while the tree is empty), and the next allocatable page id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPayload {
    pub version: u32,
    pub root: PageId,
    pub next_page_id: PageId,
}

impl HeaderPayload {
    /// Header for a freshly created database file.
    pub fn initial() -> Self {
        Self {
            version: FORMAT_VERSION,
            root: INVALID_PAGE_ID,
            next_page_id: HEADER_PAGE_ID + 1,
        }
    }

    pub fn encode_into(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.version.to_le_bytes());
        payload[4..8].copy_from_slice(&self.root.to_le_bytes());
        payload[8..12].copy_from_slice(&self.next_page_id.to_le_bytes());
    }

    pub fn decode(payload: &[u8]) -> EngineResult<Self> {
        if payload.len() < 12 {
            return Err(EngineError::corrupted(
                "header-page",
                format!("payload too short: {} bytes", payload.len()),
            ));
        }
        let version = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(EngineError::corrupted(
                "header-page",
                format!("unsupported format version {version}"),
            ));
        }
        Ok(Self {
            version,
            root: i32::from_le_bytes(payload[4..8].try_into().unwrap()),
            next_page_id: i32::from_le_bytes(payload[8..12].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecask_common::PAGE_PAYLOAD_SIZE;

    #[test]
    fn test_initial_header() {
        let header = HeaderPayload::initial();
        assert_eq!(header.root, INVALID_PAGE_ID);
        assert_eq!(header.next_page_id, 1);
    }

    #[test]
    fn test_roundtrip() {
        let mut payload = vec![0u8; PAGE_PAYLOAD_SIZE];
        let header = HeaderPayload {
            version: FORMAT_VERSION,
            root: 17,
            next_page_id: 42,
        };
        header.encode_into(&mut payload);
        assert_eq!(HeaderPayload::decode(&payload).unwrap(), header);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut payload = vec![0u8; PAGE_PAYLOAD_SIZE];
        HeaderPayload::initial().encode_into(&mut payload);
        payload[0] = 0xEE;
        assert!(HeaderPayload::decode(&payload).is_err());
    }
}
