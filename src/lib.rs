// AllocDB - persistent block allocator
// Fixed-size blocks in per-class files, addressed by 64-bit handles

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;

// Re-exports for convenience
pub use config::AllocatorConfig;
pub use storage::slab::{AllocDb, AllocStats, BucketStats, SlotId};

/// AllocDB error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid pointer: {0:#x}")]
        InvalidPointer(u64),

        #[error("Requested size {0} exceeds the largest size class")]
        CapacityExceeded(u64),

        #[error("Buffer too small: block needs {needed} bytes, buffer has {got}")]
        BufferTooSmall { needed: usize, got: usize },

        #[error("I/O error while {context}")]
        Io {
            context: String,
            #[source]
            source: std::io::Error,
        },

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Cannot allocate a {0} byte buffer")]
        BufferAllocation(u64),
    }

    impl Error {
        /// Wrap an `io::Error` with a short description of what was being done.
        pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
            Error::Io {
                context: context.into(),
                source,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
