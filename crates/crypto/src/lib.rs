//! # Tessera Crypto
//!
//! Cryptographic primitives for the Tessera chain.
//!
//! This crate provides:
//! - **SHA-256 hashing** - block and transaction identities
//! - **Ed25519 signatures** - block, transaction and finalization-message
//!   signing (64-byte signatures)
//! - **ECVRF proofs** - the slot lottery and ABBA coin tickets (80-byte
//!   proofs)
//! - **BLS12-381 signatures** - aggregatable finalization witnesses
//!   (min_sig: 48-byte signatures, 96-byte public keys)
//!
//! The consensus core treats all of these as opaque sign/verify/prove
//! operations; the wire sizes are fixed by `tessera-types`.
//!
//! ## Example
//!
//! ```rust
//! use tessera_crypto::{sha256, ed25519::SignKeypair, vrf::VrfSecretKey};
//!
//! let hash = sha256(b"hello world");
//!
//! let keypair = SignKeypair::from_seed(&[7u8; 32]);
//! let signature = keypair.sign(b"message");
//! assert!(keypair.public_key().verify(b"message", &signature));
//!
//! let vrf = VrfSecretKey::from_seed(&[9u8; 32]);
//! let (output, proof) = vrf.prove(b"slot lottery");
//! assert!(vrf.public_key().verify(b"slot lottery", &proof).is_some());
//! assert!(output.to_fraction() < 1.0);
//! ```

pub mod bls;
pub mod ed25519;
pub mod hash;
pub mod vrf;

// Re-export commonly used items
pub use bls::{BlsPublicKey, BlsSecretKey, BlsSignature};
pub use ed25519::{SignKeypair, SignPublicKey};
pub use hash::{sha256, sha256_concat, Hasher};
pub use vrf::{VrfOutput, VrfProof, VrfPublicKey, VrfSecretKey};

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid proof bytes
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// BLS operation failed
    #[error("BLS operation failed: {0}")]
    BlsError(String),

    /// Nothing to aggregate
    #[error("cannot aggregate an empty signature set")]
    EmptyAggregation,
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
