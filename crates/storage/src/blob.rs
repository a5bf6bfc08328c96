//! Append-only blob store and buffered persistent references.
//!
//! The blob file is a stream of `size:u64_be ‖ payload` records. Offsets
//! into the file are stable forever (the file is never compacted), so an
//! offset is a durable identity for the stored bytes. The sentinel
//! [`NULL_OFFSET`] denotes "no reference".
//!
//! [`BufferedRef`] wraps a value that starts in memory and migrates to disk
//! on first flush; afterwards the in-memory value and the offset coexist
//! and reads never touch the file again until the value is dropped.

use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tessera_types::serialize::ALLOCATION_LIMIT;
use tessera_types::{Deserial, Serial};
use tracing::{debug, trace};

/// Byte offset of a record within the blob file.
pub type BlobOffset = u64;

/// Sentinel offset meaning "no reference".
pub const NULL_OFFSET: BlobOffset = u64::MAX;

struct BlobFile {
    file: File,
    /// Size of the file, which is also the offset of the next record.
    end: u64,
}

/// An append-only store of length-prefixed byte records.
///
/// All access goes through a single mutex on the file handle; writes append,
/// reads seek. The store never rewrites existing bytes.
pub struct BlobStore {
    inner: Mutex<BlobFile>,
}

impl BlobStore {
    /// Opens (or creates) the blob file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let end = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), size = end, "Opened blob store");
        Ok(Self {
            inner: Mutex::new(BlobFile { file, end }),
        })
    }

    /// Appends a record, returning its offset.
    pub fn store(&self, payload: &[u8]) -> Result<BlobOffset> {
        let mut inner = self.inner.lock();
        let offset = inner.end;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&(payload.len() as u64).to_be_bytes())?;
        inner.file.write_all(payload)?;
        inner.end = offset + 8 + payload.len() as u64;
        trace!(offset, len = payload.len(), "Stored blob");
        Ok(offset)
    }

    /// Reads the record at `offset`.
    pub fn read(&self, offset: BlobOffset) -> Result<Vec<u8>> {
        if offset == NULL_OFFSET {
            return Err(StorageError::NullOffset);
        }
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut size_bytes = [0u8; 8];
        inner.file.read_exact(&mut size_bytes)?;
        let size = u64::from_be_bytes(size_bytes);
        if size > ALLOCATION_LIMIT {
            return Err(StorageError::OversizedRecord { offset, size });
        }
        let mut payload = vec![0u8; size as usize];
        inner.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Flushes buffered writes to the operating system.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }
}

/// A persistent reference: on disk, in memory, or both after a flush.
#[derive(Debug)]
pub enum BufferedRef<T> {
    /// Only the disk copy exists; reads deserialize from the store.
    OnDisk(BlobOffset),
    /// The value is held in memory; `cached` is its offset once flushed.
    InMemory {
        /// The owned in-memory value
        value: T,
        /// Offset of the flushed copy, if any
        cached: Option<BlobOffset>,
    },
}

impl<T: Serial + Deserial> BufferedRef<T> {
    /// Wraps a fresh in-memory value with no disk copy yet.
    pub fn new(value: T) -> Self {
        BufferedRef::InMemory {
            value,
            cached: None,
        }
    }

    /// References an already-stored record.
    pub fn from_offset(offset: BlobOffset) -> Self {
        BufferedRef::OnDisk(offset)
    }

    /// The disk offset, if the value has ever been flushed.
    pub fn offset(&self) -> Option<BlobOffset> {
        match self {
            BufferedRef::OnDisk(offset) => Some(*offset),
            BufferedRef::InMemory { cached, .. } => *cached,
        }
    }

    /// Writes the value through to the store on first flush.
    ///
    /// Subsequent flushes return the cached offset without touching the
    /// file. The in-memory value is retained.
    pub fn flush(&mut self, store: &BlobStore) -> Result<BlobOffset> {
        match self {
            BufferedRef::OnDisk(offset) => Ok(*offset),
            BufferedRef::InMemory { value, cached } => {
                if let Some(offset) = cached {
                    return Ok(*offset);
                }
                let offset = store.store(&value.to_bytes())?;
                *cached = Some(offset);
                Ok(offset)
            }
        }
    }

    /// Resolves the value, reading from disk if it is not in memory.
    pub fn load(&self, store: &BlobStore) -> Result<T>
    where
        T: Clone,
    {
        match self {
            BufferedRef::InMemory { value, .. } => Ok(value.clone()),
            BufferedRef::OnDisk(offset) => {
                let bytes = store.read(*offset)?;
                T::from_bytes(&bytes).map_err(|source| StorageError::CorruptRecord {
                    offset: *offset,
                    source,
                })
            }
        }
    }

    /// Drops the in-memory copy, keeping only the disk reference.
    ///
    /// Returns an error if the value has never been flushed.
    pub fn archive(&mut self) -> Result<()> {
        match self {
            BufferedRef::OnDisk(_) => Ok(()),
            BufferedRef::InMemory { cached, .. } => match cached {
                Some(offset) => {
                    *self = BufferedRef::OnDisk(*offset);
                    Ok(())
                }
                None => Err(StorageError::NullOffset),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_offset_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs.dat")).unwrap();
        assert!(matches!(
            store.read(NULL_OFFSET),
            Err(StorageError::NullOffset)
        ));
    }
}
