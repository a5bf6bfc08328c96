//! Block-import files.
//!
//! An import file is a sequence of `version:varint ‖ size:u64_be ‖
//! block_bytes` records. Replay reads records until end of file and feeds
//! each block through the normal receive path; a file that ends exactly at
//! a record boundary is complete, anything else is a truncation error.

use crate::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// The only import format version this node writes and accepts.
pub const IMPORT_FORMAT_VERSION: u64 = 1;

/// Writes serialized blocks to an import file.
pub struct BlockImportWriter {
    out: BufWriter<File>,
}

impl BlockImportWriter {
    /// Creates (truncating) an import file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Created block import file");
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Appends one serialized block.
    pub fn append(&mut self, block_bytes: &[u8]) -> Result<()> {
        let mut version = IMPORT_FORMAT_VERSION;
        loop {
            let byte = (version & 0x7f) as u8;
            version >>= 7;
            if version == 0 {
                self.out.write_all(&[byte])?;
                break;
            }
            self.out.write_all(&[byte | 0x80])?;
        }
        self.out
            .write_all(&(block_bytes.len() as u64).to_be_bytes())?;
        self.out.write_all(block_bytes)?;
        Ok(())
    }

    /// Flushes and closes the file.
    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads serialized blocks back out of an import file.
pub struct BlockImportReader {
    source: BufReader<File>,
    position: u64,
}

impl BlockImportReader {
    /// Opens an import file, mapping a missing file to
    /// [`StorageError::ImportFileMissing`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::ImportFileMissing(path.as_ref().to_path_buf())
            } else {
                StorageError::Io(e)
            }
        })?;
        info!(path = %path.as_ref().display(), "Replaying block import file");
        Ok(Self {
            source: BufReader::new(file),
            position: 0,
        })
    }

    /// Reads the next block, or `None` at a clean end of file.
    pub fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        let record_start = self.position;
        let version = match self.read_varint_or_eof()? {
            Some(version) => version,
            None => return Ok(None),
        };
        if version != IMPORT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedImportVersion(version));
        }
        let mut size_bytes = [0u8; 8];
        self.read_exact(&mut size_bytes, record_start)?;
        let size = u64::from_be_bytes(size_bytes);
        if size > tessera_types::serialize::ALLOCATION_LIMIT {
            return Err(StorageError::OversizedRecord {
                offset: record_start,
                size,
            });
        }
        let mut block_bytes = vec![0u8; size as usize];
        self.read_exact(&mut block_bytes, record_start)?;
        Ok(Some(block_bytes))
    }

    fn read_exact(&mut self, buf: &mut [u8], record_start: u64) -> Result<()> {
        self.source.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StorageError::TruncatedImportRecord(record_start)
            } else {
                StorageError::Io(e)
            }
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Reads a varint, returning `None` on end of file at a record boundary.
    fn read_varint_or_eof(&mut self) -> Result<Option<u64>> {
        let record_start = self.position;
        let mut value = 0u64;
        let mut shift = 0u32;
        let mut first = true;
        loop {
            let mut byte = [0u8; 1];
            match self.source.read_exact(&mut byte) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if first {
                        return Ok(None);
                    }
                    return Err(StorageError::TruncatedImportRecord(record_start));
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
            self.position += 1;
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(Some(value));
            }
            shift += 7;
            first = false;
        }
    }
}
