//! Block allocator
//!
//! Manages on-disk storage as fixed-size blocks organised by size class,
//! one growable file per class.
//!
//! # Architecture
//!
//! ```text
//! AllocDb
//!   ├─→ BucketDirectory (160 lazily created slots)
//!   │     ├─→ bucket 0 (1024B)  → file "0",  free: [3072, 0]
//!   │     ├─→ bucket 1 (1280B)  → file "1",  free: []
//!   │     └─→ bucket 5 (2560B)  → file "5",  free: [5120]
//!   └─→ frees (root + every free handle, replaced atomically on flush)
//! ```
//!
//! Handles are `offset << 8 | bucket`, so a handle alone is enough to find
//! its file, its offset and its size.

pub mod allocator;
pub mod directory;
pub mod metadata;
pub mod size_class;
pub mod slot;

pub use allocator::{AllocDb, AllocStats, BucketStats};
pub use directory::{Bucket, BucketDirectory};
pub use metadata::{MetadataImage, ROOT_UNSET};
pub use size_class::{block_size, bucket_for, iter_classes, SizeClass, MAX_BUCKETS, MIN_BLOCK_SIZE};
pub use slot::SlotId;
