//! Key-ordered index: B+ tree nodes serialized into page payloads, the tree
//! itself layered over the buffer pool, and order-preserving key encodings
//! for callers with typed keys.

pub mod codec;
pub mod node;
pub mod tree;
