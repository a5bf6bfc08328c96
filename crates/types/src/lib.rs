//! # Tessera Types
//!
//! Core type definitions for the Tessera chain.
//!
//! This crate provides the fundamental types used throughout Tessera:
//! - [`Hash`] - 32-byte SHA-256 digests (block, transaction and session ids)
//! - [`Block`] - Genesis and baked blocks with their bit-exact wire codec
//! - [`Transaction`] - Nonce-ordered signed transactions
//! - [`FinalizationRecord`] - Settled finalization decisions
//! - [`serialize`] - The canonical big-endian wire encoding primitives
//!
//! Cryptographic material appears here only as opaque fixed-size byte
//! newtypes ([`keys`]); the algebra lives in `tessera-crypto`.
//!
//! ## Example
//!
//! ```rust
//! use tessera_types::{Hash, serialize::{Serial, Deserial}, FinalizationRecord};
//!
//! let genesis_hash = Hash::sha256(b"genesis");
//! let record = FinalizationRecord::genesis(genesis_hash);
//! let bytes = record.to_bytes();
//! assert_eq!(FinalizationRecord::from_bytes(&bytes).unwrap(), record);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block;
pub mod finalization;
pub mod hash;
pub mod keys;
pub mod serialize;
pub mod transaction;

// Re-export main types at crate root
pub use block::{BakedBlock, BakerId, BakerInfo, Block, BlockHeight, GenesisData, Slot};
pub use finalization::{FinalizationIndex, FinalizationProof, FinalizationRecord};
pub use hash::{BlockHash, Hash, TransactionHash, HASH_SIZE};
pub use keys::{
    BlsPublicKeyBytes, BlsSignatureBytes, PublicKeyBytes, SignatureBytes, VrfProofBytes,
    VrfPublicKeyBytes,
};
pub use serialize::{Deserial, ReadCursor, Serial, SerializationError, SerializeResult};
pub use transaction::{AccountAddress, Energy, Nonce, Transaction};

/// Result type alias for Tessera type operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Tessera types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Wire decoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),
}
