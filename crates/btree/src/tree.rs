use std::sync::Arc;

use pagecask_common::{
    EngineError, EngineResult, Lsn, PageId, INVALID_PAGE_ID, PAGE_PAYLOAD_SIZE,
};
use pagecask_pagestore::buffer_pool::BufferPool;
use pagecask_pagestore::disk::DiskManager;
use pagecask_pagestore::header::{HeaderPayload, HEADER_PAGE_ID};
use pagecask_pagestore::page::PageKind;
use tracing::debug;

use crate::node::{max_entry_bytes, InternalNode, LeafNode};

/// Smallest sensible fanout: a root split needs one separator plus two
/// children.
pub const MIN_ORDER: usize = 3;

/// Hard ceiling on descent depth; deeper means a cycle in a corrupt file.
const MAX_DEPTH: usize = 64;

/// B+ tree over byte keys and byte values, one node per page, accessed
/// through the buffer pool. The root page id lives in the header page;
/// `-1` means the tree is empty. Leaves are chained through `next_leaf`
/// for range scans.
///
/// Mutating operations take an optional LSN and stamp it onto every page
/// they touch, so pages changed on behalf of a logged transaction carry the
/// driving record's LSN.
pub struct BPlusTree {
    pool: Arc<BufferPool>,
    disk: Arc<DiskManager>,
    order: usize,
}

impl BPlusTree {
    pub fn new(pool: Arc<BufferPool>, disk: Arc<DiskManager>, order: usize) -> EngineResult<Self> {
        if order < MIN_ORDER {
            return Err(EngineError::invalid(format!(
                "tree order {order} is below the minimum {MIN_ORDER}"
            )));
        }
        Ok(Self { pool, disk, order })
    }

    /// Current root page id (`-1` = empty tree).
    pub fn root(&self) -> EngineResult<PageId> {
        let guard = self.pool.fetch(HEADER_PAGE_ID)?;
        let header = guard.with(|page| HeaderPayload::decode(page.payload()))?;
        Ok(header.root)
    }

    fn set_root(&self, root: PageId) -> EngineResult<()> {
        let mut guard = self.pool.fetch(HEADER_PAGE_ID)?;
        guard.with_mut(|page| -> EngineResult<()> {
            let mut header = HeaderPayload::decode(page.payload())?;
            header.root = root;
            header.encode_into(page.payload_mut());
            Ok(())
        })?;
        debug!(root, "tree root changed");
        Ok(())
    }

    /// Insert or overwrite. Returns `true` when the key was new.
    pub fn insert(&self, key: &[u8], value: &[u8], lsn: Option<Lsn>) -> EngineResult<bool> {
        validate_key(key)?;
        if key.len() + value.len() > max_entry_bytes() {
            return Err(EngineError::invalid(format!(
                "entry of {} bytes can never fit a page",
                key.len() + value.len()
            )));
        }

        let root = self.root()?;
        if root == INVALID_PAGE_ID {
            let id = self.disk.allocate()?;
            let mut leaf = LeafNode::new();
            leaf.entries.push((key.to_vec(), value.to_vec()));
            self.write_new_leaf(id, &leaf, lsn)?;
            self.set_root(id)?;
            return Ok(true);
        }

        let (leaf_id, path) = self.descend(root, key)?;
        let mut leaf = self.read_leaf(leaf_id)?;
        let was_new = match leaf.find(key) {
            Ok(at) => {
                leaf.entries[at].1 = value.to_vec();
                false
            }
            Err(at) => {
                leaf.entries.insert(at, (key.to_vec(), value.to_vec()));
                true
            }
        };

        if leaf.encoded_size() <= PAGE_PAYLOAD_SIZE {
            self.write_leaf(leaf_id, &leaf, lsn)?;
            return Ok(was_new);
        }

        // Split: the upper half (with the extra entry on odd counts) moves
        // to a new page, the chain is relinked, and the new leaf's smallest
        // key is promoted into the parent.
        let split_at = leaf.entries.len() / 2;
        let upper = leaf.entries.split_off(split_at);
        let new_id = self.disk.allocate()?;
        let new_leaf = LeafNode {
            entries: upper,
            next_leaf: leaf.next_leaf,
        };
        leaf.next_leaf = new_id;
        let separator = new_leaf.entries[0].0.clone();

        debug!(left = leaf_id, right = new_id, "leaf split");
        self.write_new_leaf(new_id, &new_leaf, lsn)?;
        self.write_leaf(leaf_id, &leaf, lsn)?;
        self.promote(path, leaf_id, separator, new_id, lsn)?;
        Ok(was_new)
    }

    /// Leaf-level deletion; underflowing leaves are left as they are.
    /// Returns `true` when the key existed.
    pub fn delete(&self, key: &[u8], lsn: Option<Lsn>) -> EngineResult<bool> {
        validate_key(key)?;
        let root = self.root()?;
        if root == INVALID_PAGE_ID {
            return Ok(false);
        }
        let (leaf_id, _path) = self.descend(root, key)?;
        let mut leaf = self.read_leaf(leaf_id)?;
        match leaf.find(key) {
            Ok(at) => {
                leaf.entries.remove(at);
                self.write_leaf(leaf_id, &leaf, lsn)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn search(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let root = self.root()?;
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let (leaf_id, _path) = self.descend(root, key)?;
        let leaf = self.read_leaf(leaf_id)?;
        Ok(leaf.find(key).ok().map(|at| leaf.entries[at].1.clone()))
    }

    /// All `(k, v)` with `lo ≤ k < hi`, ascending, by walking the leaf chain.
    pub fn range_scan(&self, lo: &[u8], hi: &[u8]) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>> {
        validate_key(lo)?;
        if lo >= hi {
            return Err(EngineError::invalid(
                "range scan requires lo < hi".to_string(),
            ));
        }

        let root = self.root()?;
        let mut out = Vec::new();
        if root == INVALID_PAGE_ID {
            return Ok(out);
        }

        let (mut leaf_id, _path) = self.descend(root, lo)?;
        let mut hops = 0usize;
        while leaf_id != INVALID_PAGE_ID {
            let leaf = self.read_leaf(leaf_id)?;
            for (key, value) in &leaf.entries {
                if key.as_slice() >= hi {
                    return Ok(out);
                }
                if key.as_slice() >= lo {
                    out.push((key.clone(), value.clone()));
                }
            }
            leaf_id = leaf.next_leaf;
            hops += 1;
            if hops as i64 > self.disk.num_pages() as i64 {
                return Err(EngineError::corrupted("btree", "leaf chain cycles"));
            }
        }
        Ok(out)
    }

    /// Leaf page that holds (or would hold) `key`, creating the root leaf
    /// for an empty tree. Used to pre-resolve the page id stamped into data
    /// log records.
    pub fn target_leaf(&self, key: &[u8]) -> EngineResult<PageId> {
        validate_key(key)?;
        let root = self.root()?;
        if root == INVALID_PAGE_ID {
            let id = self.disk.allocate()?;
            self.write_new_leaf(id, &LeafNode::new(), None)?;
            self.set_root(id)?;
            return Ok(id);
        }
        let (leaf_id, _path) = self.descend(root, key)?;
        Ok(leaf_id)
    }

    // -- descent -----------------------------------------------------------

    /// Walk from the root to the leaf for `key`, recording the descent path
    /// as `(internal page id, child index)` pairs. The path substitutes for
    /// parent pointers during split propagation.
    fn descend(&self, root: PageId, key: &[u8]) -> EngineResult<(PageId, Vec<(PageId, usize)>)> {
        let mut path = Vec::new();
        let mut current = root;
        loop {
            if path.len() > MAX_DEPTH {
                return Err(EngineError::corrupted(
                    "btree",
                    format!("descent deeper than {MAX_DEPTH}, tree is cyclic"),
                ));
            }
            let guard = self.pool.fetch(current)?;
            let kind = guard.with(|page| page.kind())?;
            match kind {
                PageKind::Leaf => return Ok((current, path)),
                PageKind::Internal => {
                    let node = guard.with(|page| InternalNode::decode(page.payload()))?;
                    let idx = node.child_index(key);
                    path.push((current, idx));
                    current = node.children[idx];
                }
                other => {
                    return Err(EngineError::corrupted(
                        "btree",
                        format!("page {current} has kind {other:?} inside the tree"),
                    ))
                }
            }
        }
    }

    /// Insert `separator`/`right` into the parents along `path`, splitting
    /// internals as needed; an empty path grows a new root.
    fn promote(
        &self,
        mut path: Vec<(PageId, usize)>,
        mut left: PageId,
        mut separator: Vec<u8>,
        mut right: PageId,
        lsn: Option<Lsn>,
    ) -> EngineResult<()> {
        loop {
            let Some((parent_id, child_idx)) = path.pop() else {
                let new_root = self.disk.allocate()?;
                let node = InternalNode {
                    keys: vec![separator],
                    children: vec![left, right],
                };
                self.write_new_internal(new_root, &node, lsn)?;
                self.set_root(new_root)?;
                debug!(root = new_root, "tree grew a level");
                return Ok(());
            };

            let mut node = self.read_internal(parent_id)?;
            node.keys.insert(child_idx, separator);
            node.children.insert(child_idx + 1, right);

            if node.keys.len() <= self.order - 1 && node.encoded_size() <= PAGE_PAYLOAD_SIZE {
                self.write_internal(parent_id, &node, lsn)?;
                return Ok(());
            }

            // Split the internal node; the middle key moves up.
            let mid = node.keys.len() / 2;
            let up = node.keys[mid].clone();
            let right_keys = node.keys.split_off(mid + 1);
            node.keys.pop();
            let right_children = node.children.split_off(mid + 1);
            let right_node = InternalNode {
                keys: right_keys,
                children: right_children,
            };

            let right_id = self.disk.allocate()?;
            debug!(left = parent_id, right = right_id, "internal split");
            self.write_new_internal(right_id, &right_node, lsn)?;
            self.write_internal(parent_id, &node, lsn)?;

            left = parent_id;
            separator = up;
            right = right_id;
        }
    }

    // -- node I/O ----------------------------------------------------------

    fn read_leaf(&self, id: PageId) -> EngineResult<LeafNode> {
        let guard = self.pool.fetch(id)?;
        guard.with(|page| {
            match page.kind()? {
                PageKind::Leaf => {}
                other => {
                    return Err(EngineError::corrupted(
                        "btree",
                        format!("page {id} is {other:?}, expected a leaf"),
                    ))
                }
            }
            LeafNode::decode(page.payload())
        })
    }

    fn read_internal(&self, id: PageId) -> EngineResult<InternalNode> {
        let guard = self.pool.fetch(id)?;
        guard.with(|page| {
            match page.kind()? {
                PageKind::Internal => {}
                other => {
                    return Err(EngineError::corrupted(
                        "btree",
                        format!("page {id} is {other:?}, expected an internal node"),
                    ))
                }
            }
            InternalNode::decode(page.payload())
        })
    }

    fn write_leaf(&self, id: PageId, leaf: &LeafNode, lsn: Option<Lsn>) -> EngineResult<()> {
        let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
        leaf.encode_into(&mut buf)?;
        let mut guard = self.pool.fetch(id)?;
        guard.with_mut(|page| {
            page.payload_mut().copy_from_slice(&buf);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }
        });
        Ok(())
    }

    fn write_new_leaf(&self, id: PageId, leaf: &LeafNode, lsn: Option<Lsn>) -> EngineResult<()> {
        let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
        leaf.encode_into(&mut buf)?;
        let mut guard = self.pool.new_page(id, PageKind::Leaf)?;
        guard.with_mut(|page| {
            page.payload_mut().copy_from_slice(&buf);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }
        });
        Ok(())
    }

    fn write_internal(&self, id: PageId, node: &InternalNode, lsn: Option<Lsn>) -> EngineResult<()> {
        let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
        node.encode_into(&mut buf)?;
        let mut guard = self.pool.fetch(id)?;
        guard.with_mut(|page| {
            page.payload_mut().copy_from_slice(&buf);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }
        });
        Ok(())
    }

    fn write_new_internal(
        &self,
        id: PageId,
        node: &InternalNode,
        lsn: Option<Lsn>,
    ) -> EngineResult<()> {
        let mut buf = vec![0u8; PAGE_PAYLOAD_SIZE];
        node.encode_into(&mut buf)?;
        let mut guard = self.pool.new_page(id, PageKind::Internal)?;
        guard.with_mut(|page| {
            page.payload_mut().copy_from_slice(&buf);
            if let Some(lsn) = lsn {
                page.set_lsn(lsn);
            }
        });
        Ok(())
    }
}

fn validate_key(key: &[u8]) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::invalid("key must not be empty".to_string()));
    }
    Ok(())
}
