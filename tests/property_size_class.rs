//! Property-based tests for size-class arithmetic
//!
//! Uses proptest to check that bucket lookup and block size agree with each
//! other for arbitrary request sizes

use allocdb::storage::slab::{block_size, bucket_for, SlotId, MAX_BUCKETS, MIN_BLOCK_SIZE};
use proptest::prelude::*;

fn largest_block() -> u64 {
    block_size(MAX_BUCKETS - 1)
}

proptest! {
    #[test]
    fn prop_block_fits_request(size in 0u64..=(1792u64 << 39)) {
        let bucket = bucket_for(size).expect("size within range");
        let block = block_size(bucket);
        prop_assert!(block >= size);
        prop_assert!(block >= MIN_BLOCK_SIZE);
    }

    #[test]
    fn prop_smallest_fitting_class(size in (MIN_BLOCK_SIZE + 1)..=(1792u64 << 39)) {
        let bucket = bucket_for(size).unwrap();
        prop_assert!(bucket > 0);
        // The class below would not have fit
        prop_assert!(block_size(bucket - 1) < size);
    }

    #[test]
    fn prop_bucket_roundtrips_through_block_size(size in 0u64..=(1792u64 << 39)) {
        let bucket = bucket_for(size).unwrap();
        prop_assert_eq!(bucket_for(block_size(bucket)), Some(bucket));
    }

    #[test]
    fn prop_monotonic(a in 0u64..(1u64 << 48), b in 0u64..(1u64 << 48)) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(bucket_for(lo).unwrap() <= bucket_for(hi).unwrap());
    }

    #[test]
    fn prop_oversized_rejected(extra in 1u64..(1u64 << 62)) {
        prop_assert_eq!(bucket_for(largest_block().saturating_add(extra)), None);
    }

    #[test]
    fn prop_handle_keeps_bucket_and_offset(bucket in 0u8..=255, offset in 0u64..(1u64 << 56)) {
        let slot = SlotId::new(bucket, offset);
        prop_assert_eq!(slot.bucket(), bucket);
        prop_assert_eq!(slot.offset(), offset);
        prop_assert_eq!(slot.is_valid(), (bucket as usize) < MAX_BUCKETS);
        prop_assert_eq!(slot.block_size(), block_size(bucket as usize));
    }
}
