//! Fixed-layout aggregation records and their binary wire format.

use crate::{CascadeError, Result};
use bytes::{Buf, BufMut};

/// Fixed capacity of a record key in bytes. Shorter keys are zero-padded,
/// longer keys are truncated.
pub const KEY_SIZE: usize = 16;

/// Size of one record on the wire: `u32 hash; u8 key[16]; u64 value`
/// (28 bytes logical) padded to 32 for natural alignment.
pub const RECORD_WIRE_SIZE: usize = 32;

const WIRE_PADDING: usize = RECORD_WIRE_SIZE - 28;

/// A single aggregation record.
///
/// Ordering between records is defined solely by `hash`; equal hashes may
/// host different keys (collisions), which are disambiguated by key
/// comparison during aggregation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// 32-bit hash of the key, computed by the client.
    pub hash: u32,
    /// Fixed-capacity key bytes, zero-padded.
    pub key: [u8; KEY_SIZE],
    /// Aggregated value.
    pub value: u64,
}

impl Record {
    /// Creates a record, padding or truncating `key` to [`KEY_SIZE`].
    pub fn new(hash: u32, key: &[u8], value: u64) -> Self {
        let mut padded = [0u8; KEY_SIZE];
        let len = key.len().min(KEY_SIZE);
        padded[..len].copy_from_slice(&key[..len]);
        Self {
            hash,
            key: padded,
            value,
        }
    }

    /// Returns true if `other` carries the same key bytes.
    ///
    /// Key equality is bytewise on the padded key; the hash is not
    /// consulted here.
    #[inline]
    pub fn same_key(&self, other: &Record) -> bool {
        self.key == other.key
    }

    /// Merges `other` into this record.
    ///
    /// This is the single home of the merge operator: associative and
    /// commutative on values of equal-key records, so aggregation order
    /// inside a sorted run is irrelevant. The scalar reference merge is
    /// integer addition.
    #[inline]
    pub fn merge(&mut self, other: &Record) {
        debug_assert!(self.same_key(other));
        self.value = self.value.wrapping_add(other.value);
    }

    /// Encodes this record into `buf` in wire layout.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.hash);
        buf.put_slice(&self.key);
        buf.put_u64_le(self.value);
        buf.put_bytes(0, WIRE_PADDING);
    }

    /// Decodes one record from `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < RECORD_WIRE_SIZE {
            return Err(CascadeError::Wire(format!(
                "truncated record: {} of {} bytes",
                buf.remaining(),
                RECORD_WIRE_SIZE
            )));
        }
        let hash = buf.get_u32_le();
        let mut key = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut key);
        let value = buf.get_u64_le();
        buf.advance(WIRE_PADDING);
        Ok(Self { hash, key, value })
    }

    /// Encodes a batch as `records.len()` concatenated wire records.
    pub fn encode_batch<B: BufMut>(records: &[Record], buf: &mut B) {
        for record in records {
            record.encode(buf);
        }
    }

    /// Decodes a batch payload. The record count is derived from
    /// `payload.len() / RECORD_WIRE_SIZE`; a ragged payload is rejected.
    pub fn decode_batch(payload: &[u8]) -> Result<Vec<Record>> {
        if payload.len() % RECORD_WIRE_SIZE != 0 {
            return Err(CascadeError::Wire(format!(
                "batch payload of {} bytes is not a multiple of {}",
                payload.len(),
                RECORD_WIRE_SIZE
            )));
        }
        let mut buf = payload;
        let mut records = Vec::with_capacity(payload.len() / RECORD_WIRE_SIZE);
        while buf.has_remaining() {
            records.push(Record::decode(&mut buf)?);
        }
        Ok(records)
    }
}
