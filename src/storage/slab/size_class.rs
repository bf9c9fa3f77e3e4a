//! Size class management for the block allocator
//!
//! Size classes start at 1 KiB and take four steps per power of two:
//!
//! ```text
//! bucket:  0     1     2     3     4     5     6     7     8  ...
//! size:    1024  1280  1536  1792  2048  2560  3072  3584  4096
//! ```
//!
//! so a block is never more than 25% larger than the request it serves.

use crate::storage::file::BlockFile;
use std::io;
use std::path::Path;
use tracing::debug;

/// Smallest block size; every request up to this size lands in bucket 0
pub const MIN_BLOCK_SIZE: u64 = 1024;

/// Number of size classes. Bucket ids at or above this are invalid.
pub const MAX_BUCKETS: usize = 160;

/// Bucket serving a request of `size` bytes, or `None` if no class is large enough
pub fn bucket_for(size: u64) -> Option<usize> {
    if size <= MIN_BLOCK_SIZE {
        return Some(0);
    }
    let n = size - 1;
    // Octave above 1024, then the two bits under the leading one pick the quarter step
    let octave = 53u32.saturating_sub(n.leading_zeros());
    let step = (n >> (octave + 8)) & 3;
    let bucket = ((octave as usize) << 2 | step as usize) + 1;
    (bucket < MAX_BUCKETS).then_some(bucket)
}

/// Block size of `bucket`, or 0 if the bucket id is invalid
pub fn block_size(bucket: usize) -> u64 {
    if bucket >= MAX_BUCKETS {
        return 0;
    }
    (MIN_BLOCK_SIZE | ((bucket as u64 & 3) << 8)) << (bucket >> 2)
}

/// Every valid `(bucket, block_size)` pair in ascending order
pub fn iter_classes() -> impl Iterator<Item = (usize, u64)> {
    (0..MAX_BUCKETS).map(|b| (b, block_size(b)))
}

/// File name of a bucket's data file inside the allocator directory
pub fn data_file_name(bucket: usize) -> String {
    bucket.to_string()
}

/// Mutable state of one size class
///
/// Always accessed through the bucket's mutex; nothing here locks.
#[derive(Debug, Default)]
pub struct SizeClass {
    /// Backing file, opened on first use
    file: Option<BlockFile>,
    /// File length, which is also the next append offset
    end: u64,
    /// Freed offsets, reused last-in first-out
    free: Vec<u64>,
}

impl SizeClass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the bucket file if it is not open yet and pick up its length
    pub fn ensure_open(&mut self, dir: &Path, bucket: usize) -> io::Result<&BlockFile> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = BlockFile::open(dir.join(data_file_name(bucket)))?;
                self.end = file.len()?;
                debug!(bucket, end = self.end, "Opened bucket file");
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// The open file, if any
    pub fn file(&self) -> Option<&BlockFile> {
        self.file.as_ref()
    }

    /// The open file, provided `len` bytes at `offset` lie inside it
    pub fn file_range(&self, offset: u64, len: u64) -> io::Result<&BlockFile> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bucket file not open"))?;
        match offset.checked_add(len) {
            Some(block_end) if block_end <= self.end => Ok(file),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "block past end of file",
            )),
        }
    }

    /// Pop the most recently freed offset
    pub fn take_free(&mut self) -> Option<u64> {
        self.free.pop()
    }

    /// Append a block of `block_size` bytes to the file and return its offset.
    ///
    /// The cursor only moves once the file has actually been extended, so a
    /// failed grow can be retried from the same offset.
    pub fn grow(&mut self, block_size: u64) -> io::Result<u64> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bucket file not open"))?;
        let offset = self.end;
        let new_end = offset
            .checked_add(block_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bucket file too large"))?;
        file.set_len(new_end)?;
        self.end = new_end;
        Ok(offset)
    }

    /// Return an offset to the free stack. No double-free detection.
    pub fn release(&mut self, offset: u64) {
        self.free.push(offset);
    }

    /// Freed offsets, oldest first
    pub fn free_offsets(&self) -> &[u64] {
        &self.free
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Current end of the bucket file (0 until opened)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Drop the file handle
    pub fn close_file(&mut self) -> Option<BlockFile> {
        self.file.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_class() {
        assert_eq!(bucket_for(0), Some(0));
        assert_eq!(bucket_for(1), Some(0));
        assert_eq!(bucket_for(1024), Some(0));
        assert_eq!(block_size(0), 1024);
    }

    #[test]
    fn test_first_octaves() {
        let expected = [1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120];
        for (bucket, &size) in expected.iter().enumerate() {
            assert_eq!(block_size(bucket), size, "bucket {}", bucket);
        }

        assert_eq!(bucket_for(1025), Some(1));
        assert_eq!(bucket_for(1280), Some(1));
        assert_eq!(bucket_for(1281), Some(2));
        assert_eq!(bucket_for(1792), Some(3));
        assert_eq!(bucket_for(1793), Some(4));
        assert_eq!(bucket_for(2048), Some(4));
        assert_eq!(bucket_for(2049), Some(5));
    }

    #[test]
    fn test_overhead_bounded() {
        for (bucket, size) in iter_classes().skip(1) {
            let prev = block_size(bucket - 1);
            let ratio = size as f64 / prev as f64;
            assert!(ratio > 1.0 && ratio <= 1.25, "Ratio: {}", ratio);
        }
    }

    #[test]
    fn test_capacity_boundary() {
        let largest = block_size(MAX_BUCKETS - 1);
        assert_eq!(largest, 1792 << 39);
        assert_eq!(bucket_for(largest), Some(MAX_BUCKETS - 1));
        assert_eq!(bucket_for(largest + 1), None);
        assert_eq!(bucket_for(u64::MAX), None);
        assert_eq!(block_size(MAX_BUCKETS), 0);
        assert_eq!(block_size(255), 0);
    }

    #[test]
    fn test_every_class_maps_to_itself() {
        for (bucket, size) in iter_classes() {
            assert_eq!(bucket_for(size), Some(bucket));
            if bucket > 0 {
                assert_eq!(bucket_for(block_size(bucket - 1) + 1), Some(bucket));
            }
        }
    }

    #[test]
    fn test_size_class_grow_and_reuse() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sc = SizeClass::new();
        sc.ensure_open(dir.path(), 0)?;

        assert_eq!(sc.grow(1024)?, 0);
        assert_eq!(sc.grow(1024)?, 1024);
        assert_eq!(sc.grow(1024)?, 2048);
        assert_eq!(sc.end(), 3072);
        assert_eq!(sc.file().map(|f| f.len()).transpose()?, Some(3072));

        sc.release(0);
        sc.release(2048);
        assert_eq!(sc.free_count(), 2);
        // LIFO
        assert_eq!(sc.take_free(), Some(2048));
        assert_eq!(sc.take_free(), Some(0));
        assert_eq!(sc.take_free(), None);
        Ok(())
    }

    #[test]
    fn test_ensure_open_picks_up_existing_length() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("7"), vec![0u8; 3584 * 2])?;

        let mut sc = SizeClass::new();
        sc.ensure_open(dir.path(), 7)?;
        assert_eq!(sc.end(), 3584 * 2);
        assert_eq!(sc.grow(3584)?, 3584 * 2);
        Ok(())
    }

    #[test]
    fn test_grow_without_file_leaves_cursor() {
        let mut sc = SizeClass::new();
        assert!(sc.grow(1024).is_err());
        assert_eq!(sc.end(), 0);
    }

    #[test]
    fn test_failed_grow_leaves_cursor() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sc = SizeClass::new();
        sc.ensure_open(dir.path(), 0)?;
        assert_eq!(sc.grow(1024)?, 0);

        // The file layer refuses a length this large
        assert!(sc.grow(u64::MAX - sc.end()).is_err());
        assert_eq!(sc.end(), 1024);
        // Overflowing the cursor is refused before touching the file
        assert!(sc.grow(u64::MAX).is_err());
        assert_eq!(sc.end(), 1024);

        // A retry continues from the same offset
        assert_eq!(sc.grow(1024)?, 1024);
        assert_eq!(sc.file().map(|f| f.len()).transpose()?, Some(2048));
        Ok(())
    }

    #[test]
    fn test_file_range() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sc = SizeClass::new();
        assert!(sc.file_range(0, 1024).is_err());

        sc.ensure_open(dir.path(), 0)?;
        sc.grow(1024)?;
        sc.grow(1024)?;
        assert!(sc.file_range(0, 1024).is_ok());
        assert!(sc.file_range(1024, 1024).is_ok());
        assert!(sc.file_range(2048, 1024).is_err());
        assert!(sc.file_range(1500, 1024).is_err());
        assert!(sc.file_range(u64::MAX, 1024).is_err());
        Ok(())
    }
}
