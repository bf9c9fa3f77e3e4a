//! End-to-end persistence tests for AllocDb

use allocdb::error::Error;
use allocdb::storage::slab::ROOT_UNSET;
use allocdb::{AllocDb, AllocatorConfig, SlotId};
use std::collections::HashMap;
use std::fs;

#[test]
fn test_fresh_directory_is_created() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let path = temp_dir.path().join("nested").join("db");

    let db = AllocDb::open(&path)?;
    assert!(path.is_dir());
    assert_eq!(db.root(), ROOT_UNSET);
    assert_eq!(db.stats().total_bytes, 0);
    Ok(())
}

#[test]
fn test_open_fails_when_directory_is_a_file() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let path = temp_dir.path().join("occupied");
    fs::write(&path, b"not a directory").unwrap();

    assert!(matches!(AllocDb::open(&path), Err(Error::Io { .. })));
}

#[test]
fn test_reopen_preserves_blocks_root_and_file_sizes() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let mut written: HashMap<SlotId, Vec<u8>> = HashMap::new();

    {
        let db = AllocDb::open(temp_dir.path())?;
        for (i, size) in [10u64, 1500, 1500, 4000, 20_000, 20_000, 100_000]
            .into_iter()
            .enumerate()
        {
            let (slot, actual) = db.alloc(size)?;
            assert_eq!(AllocDb::size_of(slot), actual);
            let data = vec![i as u8 + 1; actual as usize];
            db.write(slot, &data)?;
            written.insert(slot, data);
        }
        db.set_root(0x1234);
        db.flush()?;
        db.close()?;
    }

    let sizes_before: Vec<_> = {
        let mut entries: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_name() != "frees")
            .map(|e| (e.file_name(), e.metadata().unwrap().len()))
            .collect();
        entries.sort();
        entries
    };

    let db = AllocDb::open(temp_dir.path())?;
    assert_eq!(db.root(), 0x1234);
    for (slot, data) in &written {
        assert_eq!(&db.read_vec(*slot)?, data, "block {}", slot);
    }
    drop(db);

    let mut sizes_after: Vec<_> = fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_name() != "frees")
        .map(|e| (e.file_name(), e.metadata().unwrap().len()))
        .collect();
    sizes_after.sort();
    assert_eq!(sizes_after, sizes_before);
    Ok(())
}

#[test]
fn test_drop_persists_free_lists() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let freed = {
        let db = AllocDb::open(temp_dir.path())?;
        let (a, _) = db.alloc(6000)?;
        db.alloc(6000)?;
        db.free(a);
        a
    };

    let db = AllocDb::open(temp_dir.path())?;
    assert_eq!(db.alloc(6000)?.0, freed);
    Ok(())
}

#[test]
fn test_corrupt_free_entries_are_skipped() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let good = SlotId::new(2, 0);

    let mut image = Vec::new();
    image.extend_from_slice(&77u64.to_be_bytes());
    image.extend_from_slice(&SlotId::new(250, 4096).to_raw().to_be_bytes());
    image.extend_from_slice(&good.to_raw().to_be_bytes());
    image.extend_from_slice(&[1, 2, 3, 4]);
    fs::write(temp_dir.path().join("frees"), image).unwrap();

    let db = AllocDb::open(temp_dir.path())?;
    assert_eq!(db.root(), 77);
    let stats = db.stats();
    assert_eq!(stats.buckets.len(), 1);
    assert_eq!(stats.buckets[0].bucket, 2);
    assert_eq!(stats.buckets[0].free_blocks, 1);
    assert_eq!(db.alloc(1536)?.0, good);
    Ok(())
}

#[test]
fn test_config_without_syncing() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let config = AllocatorConfig {
        path: temp_dir.path().to_path_buf(),
        sync_data_files: false,
        sync_metadata: false,
    };

    let db = AllocDb::with_config(config.clone())?;
    assert_eq!(db.config(), &config);
    let (slot, size) = db.alloc(1)?;
    db.write(slot, &vec![3u8; size as usize])?;
    db.set_root(slot.to_raw());
    db.flush()?;
    drop(db);

    let db = AllocDb::with_config(config)?;
    let root = SlotId::from_raw(db.root());
    assert_eq!(root, slot);
    assert!(db.read_vec(root)?.iter().all(|&b| b == 3));
    Ok(())
}

#[test]
fn test_free_in_fresh_process_is_reused() -> Result<(), Error> {
    let temp_dir = tempfile::tempdir().expect("temp dir");

    // One process per step, as the command-line tool runs
    let slot = {
        let db = AllocDb::open(temp_dir.path())?;
        let (slot, _) = db.alloc(100)?;
        db.flush()?;
        db.close()?;
        slot
    };
    {
        let db = AllocDb::open(temp_dir.path())?;
        db.free_checked(slot)?;
        db.flush()?;
        db.close()?;
    }

    let db = AllocDb::open(temp_dir.path())?;
    assert_eq!(db.stats().free_bytes, AllocDb::size_of(slot));
    assert_eq!(db.alloc(100)?.0, slot);
    Ok(())
}
