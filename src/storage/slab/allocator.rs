//! Block allocator implementation

use super::directory::BucketDirectory;
use super::metadata::{MetadataImage, MetadataWriter};
use super::size_class::{block_size, bucket_for, data_file_name, SizeClass, MAX_BUCKETS};
use super::slot::SlotId;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Persistent block allocator
///
/// Hands out fixed-size blocks from one file per size class and keeps the
/// per-class free lists plus a single caller-defined root value in a
/// `frees` file that survives restarts.
///
/// All methods except [`close`](AllocDb::close) take `&self` and may be
/// called from many threads. Operations on different size classes never
/// contend with each other.
pub struct AllocDb {
    config: AllocatorConfig,
    buckets: BucketDirectory,
    root: AtomicU64,
    /// Serializes flushes against each other
    flush_lock: Mutex<()>,
    closed: bool,
}

impl AllocDb {
    /// Open or create an allocator in `path` with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(AllocatorConfig::new(path))
    }

    /// Open or create an allocator described by `config`
    ///
    /// Creates the directory if needed and loads the free lists and root
    /// from the last flush. Fails if the directory cannot be created or an
    /// existing metadata file cannot be read.
    pub fn with_config(config: AllocatorConfig) -> Result<Self> {
        let dir = config.path.clone();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;

        let image = MetadataImage::load(&dir)?;
        let buckets = BucketDirectory::new();
        for slot in &image.frees {
            if let Some(bucket) = buckets.resolve(slot.bucket() as usize, true) {
                bucket.lock().release(slot.offset());
            }
        }

        info!(
            path = ?dir,
            root = image.root,
            frees = image.frees.len(),
            buckets = buckets.len(),
            "Opened allocator"
        );

        Ok(Self {
            config,
            buckets,
            root: AtomicU64::new(image.root),
            flush_lock: Mutex::new(()),
            closed: false,
        })
    }

    /// Directory holding the bucket and metadata files
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Size of the block behind `ptr`, equal to what `alloc` reported for it.
    ///
    /// Needs no I/O and works for freed blocks too. Returns 0 for an invalid handle.
    pub fn size_of(ptr: SlotId) -> u64 {
        ptr.block_size()
    }

    /// The persisted root value. [`ROOT_UNSET`](super::metadata::ROOT_UNSET) on a fresh database.
    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    /// Set the root value. Durable after the next `flush` or `close`.
    pub fn set_root(&self, root: u64) {
        self.root.store(root, Ordering::Release);
    }

    /// Allocate a block of at least `size` bytes
    ///
    /// Returns the handle and the actual block size. Freed blocks of the same
    /// class are reused most-recent first; otherwise the class file grows.
    pub fn alloc(&self, size: u64) -> Result<(SlotId, u64)> {
        let bucket = bucket_for(size).ok_or(Error::CapacityExceeded(size))?;
        let block = block_size(bucket);
        let heap = self
            .buckets
            .resolve(bucket, true)
            .ok_or(Error::CapacityExceeded(size))?;

        let mut sc = heap.lock();
        let offset = match sc.take_free() {
            Some(offset) => {
                metrics::counter!("allocdb_alloc_reused_total").increment(1);
                offset
            }
            None => {
                let offset = self.grow(&mut sc, bucket, block)?;
                metrics::counter!("allocdb_grow_bytes_total").increment(block);
                offset
            }
        };
        drop(sc);

        let slot = SlotId::new(bucket as u8, offset);
        metrics::counter!("allocdb_alloc_total").increment(1);
        debug!(size, block, %slot, "Allocated block");
        Ok((slot, block))
    }

    fn grow(&self, sc: &mut SizeClass, bucket: usize, block: u64) -> Result<u64> {
        sc.ensure_open(self.path(), bucket)
            .map_err(|e| self.io_failure(format!("opening bucket {}", bucket), e))?;
        sc.grow(block)
            .map_err(|e| self.io_failure(format!("growing bucket {}", bucket), e))
    }

    /// Return a block to its class free list
    ///
    /// Invalid handles, and handles into a class this allocator has never
    /// touched, are ignored. Freeing twice is not detected.
    pub fn free(&self, ptr: SlotId) {
        if !ptr.is_valid() {
            debug!(ptr = ptr.to_raw(), "Ignoring free of invalid handle");
            return;
        }
        let Some(heap) = self.buckets.get(ptr.bucket() as usize) else {
            debug!(%ptr, "Ignoring free in unknown bucket");
            return;
        };
        heap.lock().release(ptr.offset());
        metrics::counter!("allocdb_free_total").increment(1);
        debug!(%ptr, "Freed block");
    }

    /// Free a block after checking it lies inside its bucket file
    ///
    /// Unlike [`free`](AllocDb::free) this opens the bucket when needed, so
    /// it works for handles allocated by an earlier process whose class has
    /// no free list yet.
    pub fn free_checked(&self, ptr: SlotId) -> Result<()> {
        if !ptr.is_valid() {
            return Err(Error::InvalidPointer(ptr.to_raw()));
        }
        let bucket = ptr.bucket() as usize;
        let heap = self
            .buckets
            .resolve(bucket, true)
            .ok_or(Error::InvalidPointer(ptr.to_raw()))?;

        let mut sc = heap.lock();
        sc.ensure_open(self.path(), bucket)
            .map_err(|e| self.io_failure(format!("opening bucket {}", bucket), e))?;
        if sc.file_range(ptr.offset(), ptr.block_size()).is_err() {
            return Err(Error::InvalidPointer(ptr.to_raw()));
        }
        sc.release(ptr.offset());
        drop(sc);

        metrics::counter!("allocdb_free_total").increment(1);
        debug!(%ptr, "Freed block");
        Ok(())
    }

    /// Read the whole block behind `ptr` into the front of `buf`
    pub fn read(&self, ptr: SlotId, buf: &mut [u8]) -> Result<()> {
        let (bucket, len) = self.check_io(ptr, buf.len())?;
        let heap = self
            .buckets
            .resolve(bucket, true)
            .ok_or(Error::InvalidPointer(ptr.to_raw()))?;

        let mut sc = heap.lock();
        let file = sc
            .ensure_open(self.path(), bucket)
            .map_err(|e| self.io_failure(format!("opening bucket {}", bucket), e))?;
        let read = file
            .read_at(&mut buf[..len], ptr.offset())
            .map_err(|e| self.io_failure(format!("reading {}", ptr), e))?;
        if read < len {
            return Err(self.io_failure(
                format!("reading {}", ptr),
                io::Error::new(io::ErrorKind::UnexpectedEof, "block past end of file"),
            ));
        }
        Ok(())
    }

    /// Read the block behind `ptr` into a new buffer of `size_of(ptr)` bytes
    ///
    /// Fails with [`Error::BufferAllocation`] when the block is too large to
    /// hold in memory.
    pub fn read_vec(&self, ptr: SlotId) -> Result<Vec<u8>> {
        let size = ptr.block_size();
        let len = usize::try_from(size).map_err(|_| Error::BufferAllocation(size))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| Error::BufferAllocation(size))?;
        buf.resize(len, 0);
        self.read(ptr, &mut buf)?;
        Ok(buf)
    }

    /// Write the first `size_of(ptr)` bytes of `buf` to the block behind `ptr`
    ///
    /// The block must already lie inside the bucket file; writes never extend it.
    pub fn write(&self, ptr: SlotId, buf: &[u8]) -> Result<()> {
        let (bucket, len) = self.check_io(ptr, buf.len())?;
        let heap = self
            .buckets
            .resolve(bucket, true)
            .ok_or(Error::InvalidPointer(ptr.to_raw()))?;

        let mut sc = heap.lock();
        sc.ensure_open(self.path(), bucket)
            .map_err(|e| self.io_failure(format!("opening bucket {}", bucket), e))?;
        let file = sc
            .file_range(ptr.offset(), len as u64)
            .map_err(|e| self.io_failure(format!("writing {}", ptr), e))?;
        let written = file
            .write_at(&buf[..len], ptr.offset())
            .map_err(|e| self.io_failure(format!("writing {}", ptr), e))?;
        if written < len {
            return Err(self.io_failure(
                format!("writing {}", ptr),
                io::Error::new(io::ErrorKind::WriteZero, "short write"),
            ));
        }
        Ok(())
    }

    /// Validate a handle and buffer for block I/O, returning (bucket, block length)
    fn check_io(&self, ptr: SlotId, buf_len: usize) -> Result<(usize, usize)> {
        if !ptr.is_valid() {
            return Err(Error::InvalidPointer(ptr.to_raw()));
        }
        let needed = ptr.block_size() as usize;
        if buf_len < needed {
            return Err(Error::BufferTooSmall {
                needed,
                got: buf_len,
            });
        }
        Ok((ptr.bucket() as usize, needed))
    }

    fn io_failure(&self, context: String, source: io::Error) -> Error {
        metrics::counter!("allocdb_io_errors_total").increment(1);
        warn!(path = ?self.path(), error = %source, "I/O failure while {}", context);
        Error::io(context, source)
    }

    /// Persist the root and every free list, and sync the bucket files
    ///
    /// All bucket locks are taken up front in ascending order so the image
    /// reflects a single instant; each is released as soon as its free list
    /// has been written. The new image replaces the old one atomically.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();

        let held: Vec<(usize, MutexGuard<'_, SizeClass>)> = self
            .buckets
            .iter()
            .map(|(id, bucket)| (id, bucket.lock()))
            .collect();

        let mut writer = MetadataWriter::create(self.path(), self.root())?;
        for (id, sc) in held {
            writer.push_frees(id, sc.free_offsets())?;
            if self.config.sync_data_files {
                if let Some(file) = sc.file() {
                    file.sync()
                        .map_err(|e| self.io_failure(format!("syncing bucket {}", id), e))?;
                }
            }
        }

        let entries = writer.finish(self.config.sync_metadata)?.commit()?;
        metrics::counter!("allocdb_flush_total").increment(1);
        info!(path = ?self.path(), entries, "Flushed allocator metadata");
        Ok(())
    }

    /// Flush and tear down, closing every bucket file
    ///
    /// Dropping an `AllocDb` does the same but can only log a failure.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let root = *self.root.get_mut();
        let mut writer = MetadataWriter::create(&self.config.path, root)?;
        for (id, sc) in self.buckets.iter_mut() {
            writer.push_frees(id, sc.free_offsets())?;
            if let Some(file) = sc.close_file() {
                if self.config.sync_data_files {
                    file.sync()
                        .map_err(|e| Error::io(format!("syncing bucket {}", id), e))?;
                }
            }
        }

        let entries = writer.finish(self.config.sync_metadata)?.commit()?;
        info!(path = ?self.config.path, entries, "Closed allocator");
        Ok(())
    }

    /// Per-class statistics
    ///
    /// Covers every class that is live in memory or has a file on disk.
    /// Bucket locks are taken one at a time, so the totals are not a single
    /// snapshot under concurrent use.
    pub fn stats(&self) -> AllocStats {
        let mut stats = AllocStats {
            root: self.root(),
            ..AllocStats::default()
        };

        for bucket in 0..MAX_BUCKETS {
            let block = block_size(bucket);
            let class = match self.buckets.get(bucket) {
                Some(heap) => {
                    let sc = heap.lock();
                    let open = sc.file().is_some();
                    BucketStats {
                        bucket,
                        block_size: block,
                        file_len: if open { sc.end() } else { self.disk_len(bucket) },
                        free_blocks: sc.free_count() as u64,
                        open,
                    }
                }
                None => {
                    let file_len = self.disk_len(bucket);
                    if file_len == 0 {
                        continue;
                    }
                    BucketStats {
                        bucket,
                        block_size: block,
                        file_len,
                        free_blocks: 0,
                        open: false,
                    }
                }
            };
            stats.total_bytes += class.file_len;
            stats.free_bytes += class.free_blocks * block;
            stats.buckets.push(class);
        }

        stats
    }

    fn disk_len(&self, bucket: usize) -> u64 {
        std::fs::metadata(self.path().join(data_file_name(bucket)))
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Drop for AllocDb {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(path = ?self.config.path, error = %e, "Failed to persist allocator on drop");
        }
    }
}

/// Statistics for the allocator
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AllocStats {
    pub root: u64,
    pub buckets: Vec<BucketStats>,
    /// Sum of all bucket file lengths
    pub total_bytes: u64,
    /// Bytes sitting on free lists
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub bucket: usize,
    pub block_size: u64,
    pub file_len: u64,
    pub free_blocks: u64,
    /// Whether the bucket file is currently open
    pub open: bool,
}
