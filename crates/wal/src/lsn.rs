use std::sync::atomic::{AtomicI64, Ordering};

use pagecask_common::Lsn;

/// Lock-free monotonic LSN source. Starts at 0, so the first [`next`]
/// returns 1. Concurrent callers always receive distinct values.
///
/// [`next`]: LsnGenerator::next
#[derive(Debug)]
pub struct LsnGenerator {
    last: AtomicI64,
}

impl LsnGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Generator whose next LSN follows `last`, used after recovery to
    /// continue above everything already in the log.
    pub fn seeded(last: Lsn) -> Self {
        Self {
            last: AtomicI64::new(last.max(0)),
        }
    }

    /// Allocate the next LSN.
    pub fn next(&self) -> Lsn {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Peek at the most recently allocated LSN without consuming one.
    pub fn current(&self) -> Lsn {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for LsnGenerator {
    fn default() -> Self {
        Self::new()
    }
}
