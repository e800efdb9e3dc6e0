//! Configuration for the cascade engine.

use crate::record::Record;
use crate::{CascadeError, Result};
use serde::{Deserialize, Serialize};

/// Bytes held per buffered element: the record itself plus its entry in the
/// redundant hash column.
const ELEMENT_FOOTPRINT: usize = std::mem::size_of::<Record>() + std::mem::size_of::<u32>();

/// Engine configuration.
///
/// `buffer_capacity` is the hard per-buffer element cap (B_max);
/// `buffer_threshold` is the fullness mark (B_threshold) at which a buffer
/// enters the sort/empty pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum number of children per tree node (the fanout bound `b`).
    pub fanout: usize,
    /// Per-buffer element cap.
    pub buffer_capacity: usize,
    /// Element count at which a buffer is considered full.
    pub buffer_threshold: usize,
    /// Number of pre-allocated root-level buffers cycled between the
    /// ingest thread and the pipeline (includes the live root and the
    /// current input node).
    pub root_pool_size: usize,
    /// Number of sorter threads.
    pub sorter_threads: usize,
    /// Number of merger threads.
    pub merger_threads: usize,
    /// Number of emptier threads.
    pub emptier_threads: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            fanout: 8,
            buffer_capacity: 16 * 1024 * 1024,
            buffer_threshold: 8 * 1024 * 1024,
            root_pool_size: 4,
            sorter_threads: 2,
            merger_threads: 4,
            emptier_threads: 4,
        }
    }
}

impl TreeConfig {
    /// Creates a configuration whose buffer cap is sized to 25% of
    /// available system RAM, split across the root-level buffer pool.
    /// Minimum 1M elements per buffer so small machines still batch
    /// usefully.
    pub fn auto_sized() -> Self {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;

        let defaults = Self::default();
        let per_buffer = target_bytes / (defaults.root_pool_size * ELEMENT_FOOTPRINT);
        let buffer_capacity = per_buffer.max(1 << 20);

        Self {
            buffer_capacity,
            buffer_threshold: buffer_capacity / 2,
            ..defaults
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.fanout < 2 {
            return Err(CascadeError::Config(format!(
                "fanout must be at least 2, got {}",
                self.fanout
            )));
        }
        if self.buffer_threshold == 0 {
            return Err(CascadeError::Config(
                "buffer_threshold must be non-zero".to_string(),
            ));
        }
        if self.buffer_threshold >= self.buffer_capacity {
            return Err(CascadeError::Config(format!(
                "buffer_threshold ({}) must be below buffer_capacity ({})",
                self.buffer_threshold, self.buffer_capacity
            )));
        }
        // The pool must cover the live root, the input node, and at least
        // one spare for rotation.
        if self.root_pool_size < 3 {
            return Err(CascadeError::Config(format!(
                "root_pool_size must be at least 3, got {}",
                self.root_pool_size
            )));
        }
        if self.sorter_threads == 0 || self.merger_threads == 0 || self.emptier_threads == 0 {
            return Err(CascadeError::Config(
                "every worker pool needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the total byte budget of the root-level buffer pool.
    pub fn root_pool_size_bytes(&self) -> usize {
        self.root_pool_size * self.buffer_capacity * ELEMENT_FOOTPRINT
    }
}
