//! Pluggable sort/aggregate offload.

use cascade_common::{CascadeError, Record, Result};

/// A co-processor hook for the buffer primitives.
///
/// Implementations must meet the exact postconditions of the CPU paths:
/// after `sort` both columns are ordered by hash and stay aligned; after
/// `aggregate` the deduplicated prefix replaces the input and the new
/// length is returned. Any error makes the engine fall back to the CPU
/// path with no observable difference in output. Concurrent access to the
/// device is serialized by the tree, so implementations may assume one
/// caller at a time.
pub trait SortOffload: Send + Sync {
    /// Sorts both columns by hash.
    fn sort(&self, hashes: &mut [u32], records: &mut [Record]) -> Result<()>;

    /// Aggregates a hash-sorted buffer in place, returning the new length.
    ///
    /// Optional; the default reports the capability as missing and the
    /// engine aggregates on the CPU.
    fn aggregate(&self, hashes: &mut [u32], records: &mut [Record]) -> Result<usize> {
        let _ = (hashes, records);
        Err(CascadeError::Offload(
            "aggregate offload not implemented".to_string(),
        ))
    }
}
