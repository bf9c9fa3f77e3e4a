//! Block handles
//!
//! A handle packs the bucket id into the low byte and the byte offset of the
//! block in that bucket's file into the remaining 56 bits:
//!
//! ```text
//!  63                                         8 7        0
//! +--------------------------------------------+----------+
//! |               byte offset                  | bucket id|
//! +--------------------------------------------+----------+
//! ```
//!
//! The raw `u64` is what goes to disk in the `frees` file and what callers
//! store inside their own blocks.

use super::size_class::{block_size, MAX_BUCKETS};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

const BUCKET_BITS: u32 = 8;
const BUCKET_MASK: u64 = (1 << BUCKET_BITS) - 1;

/// Opaque 64-bit handle to an allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u64);

impl SlotId {
    /// All-ones failure sentinel. Its bucket byte is 0xFF, which is never a valid bucket.
    pub const NULL: SlotId = SlotId(u64::MAX);

    /// Pack a bucket id and a byte offset into a handle
    pub fn new(bucket: u8, offset: u64) -> Self {
        debug_assert!(offset >> (64 - BUCKET_BITS) == 0, "offset {offset} overflows handle");
        Self(offset << BUCKET_BITS | bucket as u64)
    }

    /// Reinterpret a raw value, e.g. one read back from a block
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Bucket id in the low byte. May be out of range for corrupted handles.
    pub const fn bucket(self) -> u8 {
        (self.0 & BUCKET_MASK) as u8
    }

    /// Byte offset of the block within its bucket file
    pub const fn offset(self) -> u64 {
        self.0 >> BUCKET_BITS
    }

    /// Whether the bucket byte names a real size class
    pub fn is_valid(self) -> bool {
        (self.bucket() as usize) < MAX_BUCKETS
    }

    /// Block size of this handle's bucket, 0 when the bucket is invalid
    pub fn block_size(self) -> u64 {
        block_size(self.bucket() as usize)
    }

    /// Collapse an allocation result into a raw handle, mapping errors to [`SlotId::NULL`]
    pub fn from_result(result: Result<(SlotId, u64)>) -> u64 {
        result.map_or(Self::NULL.0, |(slot, _)| slot.0)
    }
}

impl From<u64> for SlotId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<SlotId> for u64 {
    fn from(slot: SlotId) -> Self {
        slot.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Slot(bucket={}, offset={})", self.bucket(), self.offset())
        } else {
            write!(f, "Slot(invalid {:#x})", self.0)
        }
    }
}
