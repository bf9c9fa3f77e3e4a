//! Bucket directory
//!
//! One slot per possible bucket id, populated the first time anything touches
//! that size class. Lookups of an existing bucket take no lock; creation goes
//! through a directory-wide lock and publishes the bucket at most once, so a
//! reader sees either nothing or a fully built bucket.

use super::size_class::{SizeClass, MAX_BUCKETS};
use parking_lot::Mutex;
use std::sync::OnceLock;
use tracing::debug;

/// A size class behind its own lock
pub type Bucket = Mutex<SizeClass>;

pub struct BucketDirectory {
    slots: Box<[OnceLock<Bucket>]>,
    /// Serializes bucket creation. Never held across I/O.
    create_lock: Mutex<()>,
}

impl BucketDirectory {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_BUCKETS).map(|_| OnceLock::new()).collect(),
            create_lock: Mutex::new(()),
        }
    }

    /// Existing bucket, without creating one
    pub fn get(&self, bucket: usize) -> Option<&Bucket> {
        self.slots.get(bucket)?.get()
    }

    /// Look up `bucket`, creating it when `create` is set.
    ///
    /// Returns `None` for invalid ids, and for absent buckets when `create` is false.
    pub fn resolve(&self, bucket: usize, create: bool) -> Option<&Bucket> {
        let slot = self.slots.get(bucket)?;
        if let Some(existing) = slot.get() {
            return Some(existing);
        }
        if !create {
            return None;
        }

        let _guard = self.create_lock.lock();
        Some(slot.get_or_init(|| {
            debug!(bucket, "Created bucket");
            Mutex::new(SizeClass::new())
        }))
    }

    /// Created buckets in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Bucket)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.get().map(|b| (id, b)))
    }

    /// Created buckets in ascending id order, with exclusive access and no locking
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut SizeClass)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.get_mut().map(|b| (id, b.get_mut())))
    }

    /// Number of buckets created so far
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BucketDirectory {
    fn default() -> Self {
        Self::new()
    }
}
