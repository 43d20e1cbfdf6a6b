//! The engine boundary: configuration plus the [`engine::Database`] handle
//! that external collaborators (CLIs, benchmarks, tests) program against.

pub mod config;
pub mod engine;

pub use config::EngineConfig;
pub use engine::{Database, EngineStats};
pub use pagecask_common::{EngineError, EngineResult};
pub use pagecask_txn::manager::Transaction;
