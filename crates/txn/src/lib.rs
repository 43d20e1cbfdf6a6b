//! Transactions: snapshot-isolated MVCC version chains over the B+ tree,
//! the transaction state machine, and ARIES-style crash recovery
//! (Analysis / Redo / Undo) driven by the replayed WAL.

pub mod manager;
pub mod mvcc;
pub mod recovery;
