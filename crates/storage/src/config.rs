use pagecask_common::{EngineError, EngineResult, PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Engine tunables. The page size is a compile-time constant (4096) and is
/// deliberately absent; everything else can come from a TOML snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Frames in the buffer pool.
    pub buffer_pool_frames: usize,
    /// Bytes per WAL segment before rotation.
    pub wal_segment_size: u64,
    /// Bytes buffered in memory ahead of the active segment.
    pub wal_buffer_bytes: usize,
    /// B+ tree fanout (maximum children of an internal node).
    pub tree_order: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 1000,
            wal_segment_size: 16 * 1024 * 1024,
            wal_buffer_bytes: 1024 * 1024,
            tree_order: 64,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML; unknown keys are configuration errors.
    pub fn from_toml(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::invalid(format!("bad engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.tree_order < pagecask_btree::tree::MIN_ORDER {
            return Err(EngineError::invalid(format!(
                "tree_order {} is below the minimum {}",
                self.tree_order,
                pagecask_btree::tree::MIN_ORDER
            )));
        }
        if self.buffer_pool_frames == 0 {
            return Err(EngineError::invalid(
                "buffer_pool_frames must be positive".to_string(),
            ));
        }
        if (self.wal_segment_size as usize) < PAGE_SIZE {
            return Err(EngineError::invalid(format!(
                "wal_segment_size {} is smaller than one page",
                self.wal_segment_size
            )));
        }
        if self.wal_buffer_bytes == 0 {
            return Err(EngineError::invalid(
                "wal_buffer_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
