//! Free-list and root persistence
//!
//! The `frees` file is a flat array of big-endian 64-bit words:
//!
//! ```text
//! [root][free handle][free handle]...
//! ```
//!
//! Each free handle carries its bucket id in the low byte, so the words can be
//! in any order. The file is never edited in place: a new image is written to
//! `frees.tmp` and renamed over `frees`, so a crash at any point leaves either
//! the old or the new image, never a mix.

use super::size_class::MAX_BUCKETS;
use super::slot::SlotId;
use crate::error::{Error, Result};
use crate::storage::file::{self, BlockFile};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Canonical metadata file name
pub const METADATA_FILE: &str = "frees";

/// Scratch file the next image is staged in
pub const METADATA_TMP: &str = "frees.tmp";

/// Root value of a database that has never had one set
pub const ROOT_UNSET: u64 = u64::MAX;

const WORD: usize = std::mem::size_of::<u64>();

/// Decode whole big-endian words; a trailing partial word is dropped
pub fn decode_words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(WORD).map(|chunk| {
        let mut word = [0u8; WORD];
        word.copy_from_slice(chunk);
        u64::from_be_bytes(word)
    })
}

/// Append `value` to `out` as a big-endian word
pub fn encode_word(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Contents of a metadata file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataImage {
    pub root: u64,
    /// Free handles with a valid bucket id, in file order
    pub frees: Vec<SlotId>,
}

impl Default for MetadataImage {
    fn default() -> Self {
        Self {
            root: ROOT_UNSET,
            frees: Vec::new(),
        }
    }
}

impl MetadataImage {
    /// Parse a raw file image, discarding words with an invalid bucket id
    pub fn parse(bytes: &[u8]) -> Self {
        let mut words = decode_words(bytes);
        let root = words.next().unwrap_or(ROOT_UNSET);

        let mut discarded = 0usize;
        let frees = words
            .map(SlotId::from_raw)
            .filter(|slot| {
                let keep = slot.is_valid();
                if !keep {
                    discarded += 1;
                }
                keep
            })
            .collect();

        if discarded > 0 {
            warn!(discarded, "Discarded free entries with invalid bucket ids");
        }
        Self { root, frees }
    }

    /// Read `frees` from `dir`. A missing file is an empty database.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let image = Self::parse(&bytes);
                info!(
                    path = ?path,
                    root = image.root,
                    frees = image.frees.len(),
                    "Loaded allocator metadata"
                );
                Ok(image)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = ?path, "No metadata file found, starting fresh");
                Ok(Self::default())
            }
            Err(e) => Err(Error::io(format!("reading {}", path.display()), e)),
        }
    }
}

/// Streams a new metadata image into `frees.tmp`
pub struct MetadataWriter {
    file: BlockFile,
    target: PathBuf,
    offset: u64,
    entries: usize,
    scratch: Vec<u8>,
}

impl MetadataWriter {
    /// Truncate the scratch file and write `root` as the first word
    pub fn create(dir: &Path, root: u64) -> Result<Self> {
        let tmp = dir.join(METADATA_TMP);
        let file = BlockFile::create(&tmp)
            .map_err(|e| Error::io(format!("creating {}", tmp.display()), e))?;
        let mut writer = Self {
            file,
            target: dir.join(METADATA_FILE),
            offset: 0,
            entries: 0,
            scratch: Vec::new(),
        };
        let mut head = Vec::with_capacity(WORD);
        encode_word(&mut head, root);
        writer.append(&head)?;
        Ok(writer)
    }

    /// Append the free offsets of one bucket
    pub fn push_frees(&mut self, bucket: usize, offsets: &[u64]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        debug_assert!(bucket < MAX_BUCKETS);

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.reserve(offsets.len() * WORD);
        for &offset in offsets {
            encode_word(&mut scratch, SlotId::new(bucket as u8, offset).to_raw());
        }
        let result = self.append(&scratch);
        self.scratch = scratch;
        result?;

        self.entries += offsets.len();
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let written = self
            .file
            .write_at(bytes, self.offset)
            .map_err(|e| Error::io(format!("writing {}", self.file.path().display()), e))?;
        if written < bytes.len() {
            return Err(Error::io(
                format!("writing {}", self.file.path().display()),
                io::Error::new(io::ErrorKind::WriteZero, "short write"),
            ));
        }
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Close the scratch file, optionally syncing it first. Nothing is visible yet.
    pub fn finish(self, sync: bool) -> Result<StagedMetadata> {
        let tmp = self.file.path().to_path_buf();
        if sync {
            self.file
                .sync()
                .map_err(|e| Error::io(format!("syncing {}", tmp.display()), e))?;
        }
        debug!(entries = self.entries, bytes = self.offset, "Staged metadata image");
        Ok(StagedMetadata {
            tmp,
            target: self.target,
            entries: self.entries,
        })
    }
}

/// A complete image in `frees.tmp` waiting to be renamed into place
#[derive(Debug)]
pub struct StagedMetadata {
    tmp: PathBuf,
    target: PathBuf,
    entries: usize,
}

impl StagedMetadata {
    /// Atomically replace `frees` with the staged image
    pub fn commit(self) -> Result<usize> {
        file::replace(&self.tmp, &self.target)
            .map_err(|e| Error::io(format!("renaming {}", self.tmp.display()), e))?;
        Ok(self.entries)
    }
}
