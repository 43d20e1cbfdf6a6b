use std::collections::HashMap;

use pagecask_common::{Lsn, TxnId, BOOTSTRAP_TXN};

/// Lifecycle of a transaction. Transitions are one-shot:
/// `Running → Committed | Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Running,
    Committed { commit_lsn: Lsn },
    Aborted,
}

/// One entry in a key's version chain. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub created_by: TxnId,
    pub value: Option<Vec<u8>>,
    /// LSN of the data record that created this version; stamped onto the
    /// page when the version is persisted at commit.
    pub lsn: Lsn,
}

/// Per-key version list, oldest first. Every chain starts with a bootstrap
/// version owned by [`BOOTSTRAP_TXN`] capturing the persisted tree state at
/// the moment the key was first written in this session, so snapshot reads
/// keep working after newer commits overwrite the tree.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    /// New chain seeded with the pre-existing committed state of the key
    /// (`None` when the tree had no entry).
    pub fn seeded(base: Option<Vec<u8>>) -> Self {
        Self {
            versions: vec![Version {
                created_by: BOOTSTRAP_TXN,
                value: base,
                lsn: pagecask_common::NO_LSN,
            }],
        }
    }

    pub fn push(&mut self, version: Version) {
        self.versions.push(version);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Newest version visible to a reader, walking newest → oldest:
    /// the reader's own writes first, otherwise versions whose creator
    /// committed at or before the reader's snapshot. Running and aborted
    /// creators are skipped. The bootstrap version is visible to everyone,
    /// so a seeded chain always yields something.
    pub fn visible_for(
        &self,
        reader: TxnId,
        start_lsn: Lsn,
        states: &HashMap<TxnId, TxnState>,
    ) -> Option<&Version> {
        self.versions.iter().rev().find(|v| {
            if v.created_by == reader {
                return true;
            }
            if v.created_by == BOOTSTRAP_TXN {
                return true;
            }
            matches!(
                states.get(&v.created_by),
                Some(TxnState::Committed { commit_lsn }) if *commit_lsn <= start_lsn
            )
        })
    }

    /// Drop every version created by `txn` (abort path).
    pub fn remove_versions_of(&mut self, txn: TxnId) {
        self.versions.retain(|v| v.created_by != txn);
    }

    /// True when only the bootstrap seed remains; such a chain repeats what
    /// the tree already says and can be dropped entirely.
    pub fn only_bootstrap(&self) -> bool {
        self.versions.len() == 1 && self.versions[0].created_by == BOOTSTRAP_TXN
    }

    /// Garbage-collect versions no running transaction can see. `floor` is
    /// the smallest `start_lsn` among running transactions (`i64::MAX` when
    /// none). Keeps, newest → oldest: every running version, every committed
    /// version at or after the floor, and the newest committed version below
    /// it (the snapshot base); aborted versions and older history go.
    pub fn prune(&mut self, states: &HashMap<TxnId, TxnState>, floor: Lsn) {
        let mut have_base = false;
        let mut kept: Vec<Version> = Vec::with_capacity(self.versions.len());
        for version in self.versions.drain(..).rev() {
            let state = if version.created_by == BOOTSTRAP_TXN {
                TxnState::Committed {
                    commit_lsn: pagecask_common::NO_LSN,
                }
            } else {
                states
                    .get(&version.created_by)
                    .copied()
                    .unwrap_or(TxnState::Aborted)
            };
            let keep = match state {
                TxnState::Running => true,
                TxnState::Aborted => false,
                TxnState::Committed { commit_lsn } => {
                    if commit_lsn <= floor {
                        // Newest committed version at or below the floor is
                        // the snapshot base; older history is unreachable.
                        if have_base {
                            false
                        } else {
                            have_base = true;
                            true
                        }
                    } else {
                        true
                    }
                }
            };
            if keep {
                kept.push(version);
            }
        }
        kept.reverse();
        self.versions = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(at: Lsn) -> TxnState {
        TxnState::Committed { commit_lsn: at }
    }

    fn version(created_by: TxnId, value: &[u8], lsn: Lsn) -> Version {
        Version {
            created_by,
            value: Some(value.to_vec()),
            lsn,
        }
    }

    #[test]
    fn test_own_writes_visible() {
        let mut states = HashMap::new();
        states.insert(7, TxnState::Running);

        let mut chain = VersionChain::seeded(None);
        chain.push(version(7, b"mine", 3));

        let v = chain.visible_for(7, 0, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"mine".as_slice()));
    }

    #[test]
    fn test_running_and_aborted_writers_skipped() {
        let mut states = HashMap::new();
        states.insert(2, TxnState::Running);
        states.insert(3, TxnState::Aborted);

        let mut chain = VersionChain::seeded(Some(b"base".to_vec()));
        chain.push(version(2, b"uncommitted", 5));
        chain.push(version(3, b"aborted", 6));

        let v = chain.visible_for(9, 10, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"base".as_slice()));
    }

    #[test]
    fn test_snapshot_cutoff() {
        let mut states = HashMap::new();
        states.insert(2, committed(5));

        let mut chain = VersionChain::seeded(Some(b"old".to_vec()));
        chain.push(version(2, b"new", 4));

        // Reader whose snapshot predates the commit sees the base.
        let v = chain.visible_for(9, 3, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"old".as_slice()));

        // Reader that began after the commit sees the new version.
        let v = chain.visible_for(9, 5, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"new".as_slice()));
    }

    #[test]
    fn test_tombstone_is_a_version() {
        let mut states = HashMap::new();
        states.insert(2, committed(5));

        let mut chain = VersionChain::seeded(Some(b"here".to_vec()));
        chain.push(Version {
            created_by: 2,
            value: None,
            lsn: 4,
        });

        let v = chain.visible_for(9, 8, &states).unwrap();
        assert!(v.value.is_none(), "deleted key must read as absent");
    }

    #[test]
    fn test_abort_removes_versions() {
        let mut chain = VersionChain::seeded(None);
        chain.push(version(5, b"a", 1));
        chain.push(version(5, b"b", 2));
        assert_eq!(chain.len(), 3);

        chain.remove_versions_of(5);
        assert!(chain.only_bootstrap());
    }

    #[test]
    fn test_prune_respects_running_snapshot() {
        let mut states = HashMap::new();
        states.insert(1, committed(2));
        states.insert(2, committed(9));

        let mut chain = VersionChain::seeded(Some(b"seed".to_vec()));
        chain.push(version(1, b"first", 1));
        chain.push(version(2, b"second", 8));

        // A reader with start_lsn 5 still needs txn 1's version.
        chain.prune(&states, 5);
        let v = chain.visible_for(9, 5, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"first".as_slice()));
        // The seed below the base was dropped.
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_prune_without_readers_keeps_newest_committed() {
        let mut states = HashMap::new();
        states.insert(1, committed(2));
        states.insert(2, committed(9));

        let mut chain = VersionChain::seeded(Some(b"seed".to_vec()));
        chain.push(version(1, b"first", 1));
        chain.push(version(2, b"second", 8));

        chain.prune(&states, i64::MAX);
        assert_eq!(chain.len(), 1);
        let v = chain.visible_for(9, i64::MAX, &states).unwrap();
        assert_eq!(v.value.as_deref(), Some(b"second".as_slice()));
    }
}
