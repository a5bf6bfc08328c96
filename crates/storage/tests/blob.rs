//! Tests for the blob store and buffered references.

use tessera_storage::{BlobStore, BufferedRef, StorageError, NULL_OFFSET};
use tessera_types::{FinalizationRecord, Hash};

fn store() -> (tempfile::TempDir, BlobStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(dir.path().join("blobs.dat")).unwrap();
    (dir, store)
}

fn record(index: u64) -> FinalizationRecord {
    FinalizationRecord {
        index,
        block: Hash::sha256(&index.to_be_bytes()),
        proof: Default::default(),
        delay: 1,
    }
}

#[test]
fn store_and_read_back() {
    let (_dir, store) = store();
    let first = store.store(b"first payload").unwrap();
    let second = store.store(b"second").unwrap();
    assert_eq!(store.read(first).unwrap(), b"first payload");
    assert_eq!(store.read(second).unwrap(), b"second");
    // Offsets advance by header + payload
    assert_eq!(second, first + 8 + 13);
}

#[test]
fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blobs.dat");
    let offset = {
        let store = BlobStore::open(&path).unwrap();
        let offset = store.store(b"durable").unwrap();
        store.sync().unwrap();
        offset
    };
    let reopened = BlobStore::open(&path).unwrap();
    assert_eq!(reopened.read(offset).unwrap(), b"durable");
    // New writes continue after the existing content
    let next = reopened.store(b"more").unwrap();
    assert!(next > offset);
}

#[test]
fn null_offset_never_reads() {
    let (_dir, store) = store();
    assert!(matches!(
        store.read(NULL_OFFSET),
        Err(StorageError::NullOffset)
    ));
}

#[test]
fn buffered_ref_flush_is_idempotent() {
    let (_dir, store) = store();
    let mut reference = BufferedRef::new(record(3));
    assert_eq!(reference.offset(), None);

    let offset = reference.flush(&store).unwrap();
    assert_eq!(reference.offset(), Some(offset));
    // A second flush must not write again
    assert_eq!(reference.flush(&store).unwrap(), offset);

    // The value is still resolvable from memory and from disk
    assert_eq!(reference.load(&store).unwrap(), record(3));
    let on_disk: BufferedRef<FinalizationRecord> = BufferedRef::from_offset(offset);
    assert_eq!(on_disk.load(&store).unwrap(), record(3));
}

#[test]
fn archive_requires_flush() {
    let (_dir, store) = store();
    let mut reference = BufferedRef::new(record(5));
    assert!(reference.archive().is_err());
    reference.flush(&store).unwrap();
    reference.archive().unwrap();
    assert_eq!(reference.load(&store).unwrap(), record(5));
}

mod import {
    use tessera_storage::{BlockImportReader, BlockImportWriter, StorageError};

    #[test]
    fn writer_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.mdb");
        let mut writer = BlockImportWriter::create(&path).unwrap();
        writer.append(b"block one").unwrap();
        writer.append(b"block two, longer").unwrap();
        writer.finish().unwrap();

        let mut reader = BlockImportReader::open(&path).unwrap();
        assert_eq!(reader.next_block().unwrap().unwrap(), b"block one");
        assert_eq!(reader.next_block().unwrap().unwrap(), b"block two, longer");
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let result = BlockImportReader::open(dir.path().join("absent.mdb"));
        assert!(matches!(result, Err(StorageError::ImportFileMissing(_))));
    }

    #[test]
    fn truncated_record_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.mdb");
        let mut writer = BlockImportWriter::create(&path).unwrap();
        writer.append(b"complete").unwrap();
        writer.finish().unwrap();

        // Chop off the tail of the last record
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut reader = BlockImportReader::open(&path).unwrap();
        assert!(matches!(
            reader.next_block(),
            Err(StorageError::TruncatedImportRecord(_))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.mdb");
        // version 9 varint, size 0
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&0u64.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = BlockImportReader::open(&path).unwrap();
        assert!(matches!(
            reader.next_block(),
            Err(StorageError::UnsupportedImportVersion(9))
        ));
    }
}
