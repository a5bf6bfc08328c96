//! Ed25519 signatures.
//!
//! Blocks, transactions and finalization messages all carry 64-byte Ed25519
//! signatures over their canonical wire bytes. Keys are derived
//! deterministically from 32-byte seeds so test fixtures are reproducible.

use crate::{CryptoError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use tessera_types::{PublicKeyBytes, SignatureBytes};

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct SignKeypair {
    signing: SigningKey,
}

impl SignKeypair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derives a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The corresponding verification key.
    pub fn public_key(&self) -> SignPublicKey {
        SignPublicKey {
            verifying: self.signing.verifying_key(),
        }
    }

    /// Signs a message, returning the 64-byte wire signature.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing.sign(message).to_bytes())
    }
}

/// An Ed25519 verification key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignPublicKey {
    verifying: VerifyingKey,
}

impl SignPublicKey {
    /// Decodes a verification key from its 32-byte wire form.
    ///
    /// Fails if the bytes are not a valid curve point.
    pub fn from_bytes(bytes: &PublicKeyBytes) -> Result<Self> {
        let verifying = VerifyingKey::from_bytes(bytes.as_bytes())
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { verifying })
    }

    /// The 32-byte wire form.
    pub fn to_bytes(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.verifying.to_bytes())
    }

    /// Verifies a 64-byte signature over a message.
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        let signature = Signature::from_bytes(signature.as_bytes());
        self.verifying.verify(message, &signature).is_ok()
    }
}
