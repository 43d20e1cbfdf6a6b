use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pagecask_btree::node::max_entry_bytes;
use pagecask_btree::tree::BPlusTree;
use pagecask_pagestore::buffer_pool::BufferPool;
use pagecask_common::{EngineError, EngineResult, Lsn, TxnId, NO_LSN};
use pagecask_wal::lsn::LsnGenerator;
use pagecask_wal::manager::LogManager;
use pagecask_wal::record::{encode_entry, LogRecord, RecordKind};
use tracing::debug;

use crate::mvcc::{TxnState, Version, VersionChain};

/// Caller-held transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxnId,
    /// LSN current when the transaction began; its snapshot boundary.
    pub start_lsn: Lsn,
}

struct ActiveTxn {
    start_lsn: Lsn,
    last_lsn: Lsn,
}

struct WriteOp {
    key: Vec<u8>,
    /// `None` deletes the key at commit.
    value: Option<Vec<u8>>,
    /// LSN of the data record, stamped onto the page when persisted.
    lsn: Lsn,
}

struct TxnInner {
    next_txn_id: TxnId,
    /// Full state history for visibility checks (commit LSNs included).
    states: HashMap<TxnId, TxnState>,
    /// Running transactions only.
    active: HashMap<TxnId, ActiveTxn>,
    /// Pending writes per running transaction, in write order.
    writes: HashMap<TxnId, Vec<WriteOp>>,
    /// Per-key version chains.
    chains: HashMap<Vec<u8>, VersionChain>,
}

/// Transaction manager: allocates transaction ids, owns the state table and
/// the MVCC chains, writes the WAL records for every transition, and applies
/// winning versions to the B+ tree at commit.
///
/// One mutex serializes the state table, the chains, and the tree writes
/// made on behalf of commits, which also keeps tree fallthrough reads
/// consistent with concurrently committing writers.
pub struct TxnManager {
    wal: Arc<LogManager>,
    lsn: Arc<LsnGenerator>,
    tree: Arc<BPlusTree>,
    pool: Arc<BufferPool>,
    inner: Mutex<TxnInner>,
}

impl TxnManager {
    pub fn new(
        wal: Arc<LogManager>,
        lsn: Arc<LsnGenerator>,
        tree: Arc<BPlusTree>,
        pool: Arc<BufferPool>,
        next_txn_id: TxnId,
    ) -> Self {
        Self {
            wal,
            lsn,
            tree,
            pool,
            inner: Mutex::new(TxnInner {
                next_txn_id: next_txn_id.max(1),
                states: HashMap::new(),
                active: HashMap::new(),
                writes: HashMap::new(),
                chains: HashMap::new(),
            }),
        }
    }

    /// Start a transaction: fresh monotonic id, snapshot at the current
    /// LSN, Begin record appended (not forced).
    pub fn begin(&self) -> EngineResult<Transaction> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let id = inner.next_txn_id;
        inner.next_txn_id += 1;

        let start_lsn = self.lsn.current();
        let begin_lsn = self.lsn.next();
        self.wal.append(
            &LogRecord::control(RecordKind::Begin, begin_lsn, id, NO_LSN),
            false,
        )?;

        inner.states.insert(id, TxnState::Running);
        inner.active.insert(
            id,
            ActiveTxn {
                start_lsn,
                last_lsn: begin_lsn,
            },
        );
        debug!(txn = id, start_lsn, "transaction began");
        Ok(Transaction { id, start_lsn })
    }

    /// Write `key = value` on behalf of `txn`.
    pub fn insert(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> EngineResult<()> {
        if key.len() + value.len() > max_entry_bytes() {
            return Err(EngineError::invalid(format!(
                "entry of {} bytes can never fit a page",
                key.len() + value.len()
            )));
        }
        self.write(txn, key, Some(value.to_vec()))
    }

    /// Delete `key` on behalf of `txn` (tombstone until commit).
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> EngineResult<()> {
        self.write(txn, key, None)
    }

    fn write(&self, txn: &Transaction, key: &[u8], value: Option<Vec<u8>>) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::invalid("key must not be empty".to_string()));
        }
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        must_be_running(inner, txn.id)?;

        // The record's old image is what this transaction currently sees;
        // walking backward through old images is exactly Undo.
        let old_value = self.visible_value(inner, txn, key)?;

        // Seed the chain with the persisted state before the first write to
        // this key, so older snapshots survive later commits.
        if !inner.chains.contains_key(key) {
            let base = self.tree.search(key)?;
            inner
                .chains
                .insert(key.to_vec(), VersionChain::seeded(base));
        }

        let kind = match (&value, &old_value) {
            (Some(_), None) => RecordKind::Insert,
            (Some(_), Some(_)) => RecordKind::Update,
            (None, _) => RecordKind::Delete,
        };
        let page_id = self.tree.target_leaf(key)?;
        let record_lsn = self.lsn.next();
        let prev_lsn = inner.active[&txn.id].last_lsn;

        self.wal.append(
            &LogRecord {
                lsn: record_lsn,
                txn_id: txn.id,
                prev_lsn,
                kind,
                page_id,
                old: old_value
                    .map(|v| encode_entry(key, &v))
                    .unwrap_or_default(),
                new: value
                    .as_ref()
                    .map(|v| encode_entry(key, v))
                    .unwrap_or_default(),
            },
            false,
        )?;

        inner.chains.get_mut(key).unwrap().push(Version {
            created_by: txn.id,
            value: value.clone(),
            lsn: record_lsn,
        });
        inner.active.get_mut(&txn.id).unwrap().last_lsn = record_lsn;
        inner.writes.entry(txn.id).or_default().push(WriteOp {
            key: key.to_vec(),
            value,
            lsn: record_lsn,
        });
        Ok(())
    }

    /// Snapshot read: the version chain resolves first (own writes, then
    /// versions committed at or before the snapshot); a key with no chain
    /// falls through to the persisted tree.
    pub fn search(&self, txn: &Transaction, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(EngineError::invalid("key must not be empty".to_string()));
        }
        let guard = self.inner.lock().unwrap();
        let inner = &*guard;
        must_be_running(inner, txn.id)?;
        self.visible_value(inner, txn, key)
    }

    /// Range scan with snapshot semantics: the persisted tree overlaid with
    /// every chain version visible to `txn` (tombstones hide keys).
    pub fn range_scan(
        &self,
        txn: &Transaction,
        lo: &[u8],
        hi: &[u8],
    ) -> EngineResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.inner.lock().unwrap();
        let inner = &*guard;
        must_be_running(inner, txn.id)?;

        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = self
            .tree
            .range_scan(lo, hi)?
            .into_iter()
            .collect();

        for (key, chain) in &inner.chains {
            if key.as_slice() < lo || key.as_slice() >= hi {
                continue;
            }
            if let Some(version) = chain.visible_for(txn.id, txn.start_lsn, &inner.states) {
                match &version.value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Commit: force the Commit record, persist the winning versions into
    /// the tree (stamping each page with its record's LSN), then garbage-
    /// collect chain versions no running snapshot needs.
    pub fn commit(&self, txn: &Transaction) -> EngineResult<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        must_be_running(inner, txn.id)?;

        let prev_lsn = inner.active[&txn.id].last_lsn;
        let commit_lsn = self.lsn.next();
        self.wal.append(
            &LogRecord::control(RecordKind::Commit, commit_lsn, txn.id, prev_lsn),
            true,
        )?;

        let ops = inner.writes.remove(&txn.id).unwrap_or_default();
        for op in &ops {
            match &op.value {
                Some(value) => {
                    self.tree.insert(&op.key, value, Some(op.lsn))?;
                }
                None => {
                    self.tree.delete(&op.key, Some(op.lsn))?;
                }
            }
        }
        if !ops.is_empty() {
            // Structure changes (splits, root moves) are not logged, so the
            // pages a commit touched must reach the file before the commit
            // returns; the pool still orders each write behind the WAL.
            self.pool.flush_all()?;
        }

        inner
            .states
            .insert(txn.id, TxnState::Committed { commit_lsn });
        inner.active.remove(&txn.id);

        let floor = inner
            .active
            .values()
            .map(|a| a.start_lsn)
            .min()
            .unwrap_or(i64::MAX);
        for op in &ops {
            if let Some(chain) = inner.chains.get_mut(&op.key) {
                chain.prune(&inner.states, floor);
            }
        }
        debug!(txn = txn.id, commit_lsn, writes = ops.len(), "committed");
        Ok(())
    }

    /// Abort: force the Abort record and discard the transaction's chain
    /// versions. Versions that never reached the tree need no page undo;
    /// anything flushed early is repaired by recovery's Undo phase.
    pub fn abort(&self, txn: &Transaction) -> EngineResult<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        must_be_running(inner, txn.id)?;

        let prev_lsn = inner.active[&txn.id].last_lsn;
        let abort_lsn = self.lsn.next();
        self.wal.append(
            &LogRecord::control(RecordKind::Abort, abort_lsn, txn.id, prev_lsn),
            true,
        )?;

        let ops = inner.writes.remove(&txn.id).unwrap_or_default();
        for op in &ops {
            let drop_chain = match inner.chains.get_mut(&op.key) {
                Some(chain) => {
                    chain.remove_versions_of(txn.id);
                    chain.only_bootstrap()
                }
                None => false,
            };
            if drop_chain {
                inner.chains.remove(&op.key);
            }
        }

        inner.states.insert(txn.id, TxnState::Aborted);
        inner.active.remove(&txn.id);
        debug!(txn = txn.id, discarded = ops.len(), "aborted");
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    fn visible_value(
        &self,
        inner: &TxnInner,
        txn: &Transaction,
        key: &[u8],
    ) -> EngineResult<Option<Vec<u8>>> {
        if let Some(chain) = inner.chains.get(key) {
            if let Some(version) = chain.visible_for(txn.id, txn.start_lsn, &inner.states) {
                return Ok(version.value.clone());
            }
        }
        self.tree.search(key)
    }
}

fn must_be_running(inner: &TxnInner, id: TxnId) -> EngineResult<()> {
    match inner.states.get(&id) {
        Some(TxnState::Running) => Ok(()),
        Some(_) => Err(EngineError::invalid(format!(
            "transaction {id} is no longer running"
        ))),
        None => Err(EngineError::invalid(format!("unknown transaction {id}"))),
    }
}
