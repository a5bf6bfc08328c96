//! # Tessera Storage
//!
//! Disk persistence for the Tessera consensus core:
//! - [`BlobStore`] - an append-only content store of length-prefixed
//!   records, addressed by file offset
//! - [`BufferedRef`] - a lazily-flushed reference that is either in memory,
//!   on disk, or both
//! - [`import`] - block-import files replayed through the normal block
//!   receive path
//!
//! The consensus state holds `BufferedRef`s to bulky objects (block bodies,
//! execution states); draining the state to disk at shutdown flushes every
//! unflushed reference.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod blob;
pub mod import;

pub use blob::{BlobOffset, BlobStore, BufferedRef, NULL_OFFSET};
pub use import::{BlockImportReader, BlockImportWriter, IMPORT_FORMAT_VERSION};

use std::path::PathBuf;
use tessera_types::SerializationError;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying file I/O failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored object failed to decode
    #[error("corrupt record at offset {offset}: {source}")]
    CorruptRecord {
        /// File offset of the bad record
        offset: u64,
        /// Decoding failure
        source: SerializationError,
    },

    /// A record's length prefix exceeds the safety limit
    #[error("record at offset {offset} claims {size} bytes, over the limit")]
    OversizedRecord {
        /// File offset of the bad record
        offset: u64,
        /// Claimed payload size
        size: u64,
    },

    /// Attempted to read through the null offset sentinel
    #[error("attempted to dereference the null blob offset")]
    NullOffset,

    /// A block-import file does not exist
    #[error("import file not found: {0}")]
    ImportFileMissing(PathBuf),

    /// A block-import record carries an unknown format version
    #[error("unsupported import format version {0}")]
    UnsupportedImportVersion(u64),

    /// A block-import file ended in the middle of a record
    #[error("import file truncated mid-record at offset {0}")]
    TruncatedImportRecord(u64),
}
