//! SHA-256 hashing facade.

use sha2::{Digest, Sha256};
use tessera_types::Hash;

/// Computes the SHA-256 hash of the given data.
pub fn sha256(data: &[u8]) -> Hash {
    Hash::sha256(data)
}

/// Computes the SHA-256 hash of multiple data slices without concatenating.
pub fn sha256_concat(data: &[&[u8]]) -> Hash {
    Hash::sha256_concat(data)
}

/// Incremental SHA-256 hasher for streaming input.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Creates a new hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalizes and returns the digest.
    pub fn finalize(self) -> Hash {
        Hash::new(self.inner.finalize().into())
    }
}
