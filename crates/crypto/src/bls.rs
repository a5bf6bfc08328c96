//! BLS12-381 signatures for finalization witnesses.
//!
//! Finalization proofs aggregate witness signatures from a weighted quorum
//! of committee members into a single 48-byte signature. Tessera uses the
//! **min_sig** parameterization (signatures in G1, public keys in G2) so the
//! aggregate matches the 48-byte slot in the finalization record wire
//! format.
//!
//! Aggregates verify against the set of contributing public keys and the
//! common witness message; the committee-index list in the finalization
//! record says which keys to use.

use crate::{CryptoError, Result};
use blst::min_sig::{AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::RngCore;
use tessera_types::{BlsPublicKeyBytes, BlsSignatureBytes};

/// Domain separation tag for finalization witness signatures.
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_TESSERA_FIN_";

/// A BLS secret key.
#[derive(Clone)]
pub struct BlsSecretKey {
    inner: SecretKey,
}

impl BlsSecretKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        Self::from_seed(&ikm)
    }

    /// Derives a key deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let inner = SecretKey::key_gen(seed, b"tessera-finalization")
            .expect("key_gen only fails on short input");
        Self { inner }
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature {
            inner: self.inner.sign(message, DST, &[]),
        }
    }
}

/// A BLS public key (96 bytes compressed, G2).
#[derive(Clone)]
pub struct BlsPublicKey {
    inner: PublicKey,
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.to_bytes() == other.inner.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlsPublicKey({}..)", hex::encode(&self.inner.to_bytes()[..4]))
    }
}

impl BlsPublicKey {
    /// Decodes a public key from its 96-byte wire form, validating the
    /// group membership.
    pub fn from_bytes(bytes: &BlsPublicKeyBytes) -> Result<Self> {
        let inner = PublicKey::key_validate(bytes.as_bytes())
            .map_err(|e| CryptoError::InvalidPublicKey(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    /// The 96-byte wire form.
    pub fn to_bytes(&self) -> BlsPublicKeyBytes {
        BlsPublicKeyBytes(self.inner.to_bytes())
    }
}

/// A BLS signature or aggregate (48 bytes compressed, G1).
#[derive(Clone)]
pub struct BlsSignature {
    inner: Signature,
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.inner.to_bytes() == other.inner.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlsSignature({}..)", hex::encode(&self.inner.to_bytes()[..4]))
    }
}

impl BlsSignature {
    /// Decodes a signature from its 48-byte wire form.
    ///
    /// Rejects non-canonical encodings: the bytes must re-encode to
    /// themselves.
    pub fn from_bytes(bytes: &BlsSignatureBytes) -> Result<Self> {
        let inner = Signature::from_bytes(bytes.as_bytes())
            .map_err(|e| CryptoError::InvalidSignature(format!("{e:?}")))?;
        if inner.to_bytes() != bytes.0 {
            return Err(CryptoError::InvalidSignature(
                "non-canonical signature encoding".into(),
            ));
        }
        Ok(Self { inner })
    }

    /// The 48-byte wire form.
    pub fn to_bytes(&self) -> BlsSignatureBytes {
        BlsSignatureBytes(self.inner.to_bytes())
    }

    /// Verifies a single signature.
    pub fn verify(&self, message: &[u8], public_key: &BlsPublicKey) -> bool {
        self.inner
            .verify(true, message, DST, &[], &public_key.inner, false)
            == BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregates signatures over a common message.
    pub fn aggregate(signatures: &[&BlsSignature]) -> Result<BlsSignature> {
        if signatures.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let refs: Vec<&Signature> = signatures.iter().map(|s| &s.inner).collect();
        let aggregate = AggregateSignature::aggregate(&refs, true)
            .map_err(|e| CryptoError::BlsError(format!("{e:?}")))?;
        Ok(BlsSignature {
            inner: aggregate.to_signature(),
        })
    }

    /// Verifies an aggregate over a common message against the set of
    /// contributing public keys.
    pub fn verify_aggregate(&self, message: &[u8], public_keys: &[&BlsPublicKey]) -> bool {
        if public_keys.is_empty() {
            return false;
        }
        let refs: Vec<&PublicKey> = public_keys.iter().map(|pk| &pk.inner).collect();
        self.inner.fast_aggregate_verify(true, message, DST, &refs)
            == BLST_ERROR::BLST_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: u8) -> Vec<BlsSecretKey> {
        (0..n).map(|i| BlsSecretKey::from_seed(&[i + 1; 32])).collect()
    }

    #[test]
    fn sign_and_verify() {
        let key = BlsSecretKey::from_seed(&[1u8; 32]);
        let signature = key.sign(b"witness");
        assert!(signature.verify(b"witness", &key.public_key()));
        assert!(!signature.verify(b"forged", &key.public_key()));
    }

    #[test]
    fn aggregate_verifies_against_all_keys() {
        let keys = keys(3);
        let signatures: Vec<_> = keys.iter().map(|k| k.sign(b"common")).collect();
        let refs: Vec<_> = signatures.iter().collect();
        let aggregate = BlsSignature::aggregate(&refs).unwrap();

        let public_keys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let pk_refs: Vec<_> = public_keys.iter().collect();
        assert!(aggregate.verify_aggregate(b"common", &pk_refs));

        // A missing contributor breaks verification
        assert!(!aggregate.verify_aggregate(b"common", &pk_refs[..2]));
    }

    #[test]
    fn wire_round_trip() {
        let key = BlsSecretKey::from_seed(&[9u8; 32]);
        let signature = key.sign(b"wire");
        let restored = BlsSignature::from_bytes(&signature.to_bytes()).unwrap();
        assert!(restored.verify(b"wire", &key.public_key()));

        let pk = BlsPublicKey::from_bytes(&key.public_key().to_bytes()).unwrap();
        assert_eq!(pk, key.public_key());
    }

    #[test]
    fn empty_aggregation_rejected() {
        assert!(matches!(
            BlsSignature::aggregate(&[]),
            Err(CryptoError::EmptyAggregation)
        ));
    }
}
