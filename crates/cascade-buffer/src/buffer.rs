//! Bounded record buffer with parallel hash column.

use crate::offload::SortOffload;
use crate::sort::sort_by_hash;
use cascade_common::{CascadeError, Record, Result};
use tracing::debug;

/// A bounded contiguous array of records awaiting downward propagation.
///
/// Two parallel columns are kept: the records themselves and a redundant
/// copy of each record's hash. The hash column keeps the sort and
/// partition hot loops on a dense `u32` array; the record still carries
/// its own hash, and `hashes[i] == records[i].hash` holds for every
/// live element.
#[derive(Debug)]
pub struct Buffer {
    hashes: Vec<u32>,
    records: Vec<Record>,
    capacity: usize,
    threshold: usize,
}

impl Buffer {
    /// Creates a buffer with storage reserved up front.
    pub fn new(capacity: usize, threshold: usize) -> Result<Self> {
        let mut buffer = Self::unallocated(capacity, threshold);
        buffer.ensure_allocated()?;
        Ok(buffer)
    }

    /// Creates a buffer in the deallocated state (no storage held).
    /// Storage is re-reserved on the next write.
    pub fn unallocated(capacity: usize, threshold: usize) -> Self {
        Self {
            hashes: Vec::new(),
            records: Vec::new(),
            capacity,
            threshold,
        }
    }

    fn ensure_allocated(&mut self) -> Result<()> {
        if self.hashes.capacity() >= self.capacity {
            return Ok(());
        }
        let additional = self.capacity - self.hashes.len();
        self.hashes
            .try_reserve_exact(additional)
            .map_err(|_| CascadeError::OutOfMemory {
                requested: self.capacity,
            })?;
        let additional = self.capacity - self.records.len();
        self.records
            .try_reserve_exact(additional)
            .map_err(|_| CascadeError::OutOfMemory {
                requested: self.capacity,
            })?;
        Ok(())
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns true if the buffer holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Returns true once the buffer has crossed its fullness threshold.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() > self.threshold
    }

    /// Element cap.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fullness threshold.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The hash column.
    #[inline]
    pub fn hashes(&self) -> &[u32] {
        &self.hashes
    }

    /// The record column.
    #[inline]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Appends one record. O(1); appending past the element cap is an
    /// invariant violation.
    pub fn append(&mut self, record: Record) -> Result<()> {
        self.ensure_allocated()?;
        if self.len() >= self.capacity {
            return Err(CascadeError::invariant(format!(
                "append past buffer capacity ({})",
                self.capacity
            )));
        }
        self.hashes.push(record.hash);
        self.records.push(record);
        Ok(())
    }

    /// Copies a run of both columns from another buffer's slices onto the
    /// end of this one.
    ///
    /// The element cap is a steady-state target, not a hard bound here: a
    /// cascade through a low-fanout node can deliver a run that overshoots
    /// it, and the tree relies on the next merge/empty cycle to shrink the
    /// buffer back. Storage grows to fit rather than dropping records.
    pub fn extend_from_run(&mut self, hashes: &[u32], records: &[Record]) -> Result<()> {
        debug_assert_eq!(hashes.len(), records.len());
        if hashes.is_empty() {
            return Ok(());
        }
        self.ensure_allocated()?;
        let needed = self.len() + hashes.len();
        if needed > self.hashes.capacity() {
            debug!(
                len = self.len(),
                run = hashes.len(),
                capacity = self.capacity,
                "run overshoots buffer cap, growing"
            );
            let additional = needed - self.hashes.len();
            self.hashes
                .try_reserve_exact(additional)
                .map_err(|_| CascadeError::OutOfMemory { requested: needed })?;
            self.records
                .try_reserve_exact(additional)
                .map_err(|_| CascadeError::OutOfMemory { requested: needed })?;
        }
        self.hashes.extend_from_slice(hashes);
        self.records.extend_from_slice(records);
        Ok(())
    }

    /// Drops all contents, keeping the storage for reuse.
    pub fn clear(&mut self) {
        self.hashes.clear();
        self.records.clear();
    }

    /// Keeps the first `len` elements.
    pub fn truncate(&mut self, len: usize) {
        self.hashes.truncate(len);
        self.records.truncate(len);
    }

    /// Frees the storage and resets the buffer.
    pub fn deallocate(&mut self) {
        self.hashes = Vec::new();
        self.records = Vec::new();
    }

    /// Steals this buffer's storage and contents, leaving it deallocated.
    pub fn take(&mut self) -> Buffer {
        Buffer {
            hashes: std::mem::take(&mut self.hashes),
            records: std::mem::take(&mut self.records),
            capacity: self.capacity,
            threshold: self.threshold,
        }
    }

    /// Sorts the buffer by hash.
    ///
    /// When an offload engine is supplied it is tried first; on any device
    /// error the CPU path runs instead, with identical postconditions.
    pub fn sort(&mut self, offload: Option<&dyn SortOffload>) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if let Some(engine) = offload {
            match engine.sort(&mut self.hashes, &mut self.records) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(error = %err, "offload sort failed, falling back to cpu");
                }
            }
        }
        sort_by_hash(&mut self.hashes, &mut self.records);
        Ok(())
    }

    /// Collapses equal-key records in a hash-sorted buffer.
    ///
    /// Single in-place scan. Equal hashes do not imply equal keys, and the
    /// sort does not group keys inside a hash run, so a new element is
    /// checked against every already-emitted entry of the current run
    /// before it is emitted itself. Output invariant: adjacent entries
    /// either ascend in hash or share a hash with distinct keys.
    pub fn aggregate(&mut self) -> Result<()> {
        let num = self.len();
        if num == 0 {
            return Ok(());
        }

        let mut write = 0usize; // last emitted slot
        let mut run_start = 0usize; // first emitted slot of the current hash run
        for read in 1..num {
            let hash = self.hashes[read];
            if hash != self.hashes[write] {
                debug_assert!(hash > self.hashes[write], "aggregate requires sorted input");
                write += 1;
                self.hashes[write] = hash;
                self.records[write] = self.records[read];
                run_start = write;
                continue;
            }

            // Same hash: merge into a matching key within the run, or
            // emit as a new collision entry.
            let record = self.records[read];
            let mut merged = false;
            for slot in run_start..=write {
                if self.records[slot].same_key(&record) {
                    self.records[slot].merge(&record);
                    merged = true;
                    break;
                }
            }
            if !merged {
                write += 1;
                self.hashes[write] = hash;
                self.records[write] = record;
            }
        }
        self.truncate(write + 1);
        Ok(())
    }
}
