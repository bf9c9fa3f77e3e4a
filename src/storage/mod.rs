//! Storage layer
//!
//! ```text
//! slab   size classes, bucket directory, allocator engine, free-list persistence
//! file   positional file I/O underneath every bucket and the metadata file
//! ```

pub mod file;
pub mod slab;

pub use file::BlockFile;
pub use slab::{AllocDb, AllocStats, BucketStats, SlotId};
