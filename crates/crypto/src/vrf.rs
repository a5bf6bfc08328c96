//! Verifiable random function for the slot lottery.
//!
//! An ECVRF construction over edwards25519 with SHA-512. Each baker proves a
//! pseudorandom 64-byte output for an input it cannot bias; anyone holding
//! the baker's VRF public key can verify the proof and recover the same
//! output. The slot lottery compares the output, mapped to a uniform
//! fraction in [0, 1), against the election difficulty; ABBA uses the same
//! construction for its per-phase coin tickets.

use crate::{CryptoError, Result};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_POINT,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
    traits::VartimeMultiscalarMul,
};
use rand::RngCore;
use sha2::{Digest, Sha512};
use tessera_types::{VrfProofBytes, VrfPublicKeyBytes};

/// VRF secret key.
///
/// Derived from a 32-byte seed by SHA-512 expansion and Ed25519-style
/// clamping.
#[derive(Clone)]
pub struct VrfSecretKey {
    scalar: Scalar,
    public: VrfPublicKey,
}

/// VRF public key: a point on the Edwards curve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VrfPublicKey {
    point: EdwardsPoint,
    compressed: [u8; 32],
}

/// A VRF proof: `gamma ‖ c ‖ s`, 80 bytes on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VrfProof {
    gamma: [u8; 32],
    c: [u8; 32],
    s: [u8; 32],
}

/// The pseudorandom VRF output, derived from the gamma point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VrfOutput {
    value: [u8; 64],
}

impl VrfOutput {
    /// Borrow the raw 64-byte output.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.value
    }

    /// Maps the output to a uniform fraction in [0, 1).
    ///
    /// The first eight bytes are read big-endian and divided by 2^64, which
    /// is the comparison form the slot lottery uses.
    pub fn to_fraction(&self) -> f64 {
        let head = u64::from_be_bytes(self.value[..8].try_into().expect("exact slice"));
        head as f64 / 2f64.powi(64)
    }
}

impl VrfSecretKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derives a key deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(seed);
        let expanded = hasher.finalize();

        let mut scalar_bytes = [0u8; 32];
        scalar_bytes.copy_from_slice(&expanded[..32]);
        // Ed25519 clamping
        scalar_bytes[0] &= 248;
        scalar_bytes[31] &= 127;
        scalar_bytes[31] |= 64;

        let scalar = Scalar::from_bytes_mod_order(scalar_bytes);
        let point = scalar * ED25519_BASEPOINT_POINT;

        Self {
            scalar,
            public: VrfPublicKey {
                point,
                compressed: point.compress().to_bytes(),
            },
        }
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> &VrfPublicKey {
        &self.public
    }

    /// Produces the VRF output and proof for an input.
    pub fn prove(&self, input: &[u8]) -> (VrfOutput, VrfProof) {
        let h = hash_to_curve(input);
        let gamma = self.scalar * h;

        // Deterministic nonce: no randomness may leak into the proof
        let k = self.nonce(input);
        let u = k * ED25519_BASEPOINT_POINT;
        let v = k * h;

        let c = challenge(&self.public.compressed, &h, &gamma, &u, &v);
        let s = k - c * self.scalar;

        let output = VrfOutput {
            value: output_from_gamma(&gamma),
        };
        let proof = VrfProof {
            gamma: gamma.compress().to_bytes(),
            c: c.to_bytes(),
            s: s.to_bytes(),
        };
        (output, proof)
    }

    fn nonce(&self, input: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(b"TESSERA_VRF_NONCE");
        hasher.update(self.scalar.as_bytes());
        hasher.update(input);
        Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
    }
}

impl VrfPublicKey {
    /// Decodes a public key from its 32-byte wire form.
    pub fn from_bytes(bytes: &VrfPublicKeyBytes) -> Result<Self> {
        let point = CompressedEdwardsY::from_slice(bytes.as_bytes())
            .ok()
            .and_then(|compressed| compressed.decompress())
            .ok_or_else(|| CryptoError::InvalidPublicKey("not a curve point".into()))?;
        Ok(Self {
            point,
            compressed: bytes.0,
        })
    }

    /// The 32-byte wire form.
    pub fn to_bytes(&self) -> VrfPublicKeyBytes {
        VrfPublicKeyBytes(self.compressed)
    }

    /// Verifies a proof, returning the output on success.
    pub fn verify(&self, input: &[u8], proof: &VrfProof) -> Option<VrfOutput> {
        let gamma = CompressedEdwardsY::from_slice(&proof.gamma)
            .ok()?
            .decompress()?;

        let c = Scalar::from_canonical_bytes(proof.c);
        let s = Scalar::from_canonical_bytes(proof.s);
        // subtle::CtOption: reject non-canonical scalars outright
        if (!bool::from(c.is_some())) || (!bool::from(s.is_some())) {
            return None;
        }
        let c = c.unwrap();
        let s = s.unwrap();

        let h = hash_to_curve(input);
        let u = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c, &self.point, &s);
        let v = EdwardsPoint::vartime_multiscalar_mul(&[s, c], &[h, gamma]);

        if challenge(&self.compressed, &h, &gamma, &u, &v) == c {
            Some(VrfOutput {
                value: output_from_gamma(&gamma),
            })
        } else {
            None
        }
    }
}

impl VrfProof {
    /// The 80-byte wire form.
    pub fn to_bytes(&self) -> VrfProofBytes {
        let mut out = [0u8; 80];
        out[..32].copy_from_slice(&self.gamma);
        out[32..64].copy_from_slice(&self.c);
        out[64..].copy_from_slice(&self.s);
        VrfProofBytes(out)
    }

    /// Splits the 80-byte wire form into its components.
    ///
    /// Point and scalar validity are only checked during [`VrfPublicKey::verify`].
    pub fn from_bytes(bytes: &VrfProofBytes) -> Self {
        let raw = bytes.as_bytes();
        let mut gamma = [0u8; 32];
        let mut c = [0u8; 32];
        let mut s = [0u8; 32];
        gamma.copy_from_slice(&raw[..32]);
        c.copy_from_slice(&raw[32..64]);
        s.copy_from_slice(&raw[64..]);
        Self { gamma, c, s }
    }
}

fn hash_to_curve(data: &[u8]) -> EdwardsPoint {
    let mut hasher = Sha512::new();
    hasher.update(b"TESSERA_VRF_H2C");
    hasher.update(data);
    EdwardsPoint::nonspec_map_to_curve::<Sha512>(&hasher.finalize())
}

fn challenge(
    public: &[u8; 32],
    h: &EdwardsPoint,
    gamma: &EdwardsPoint,
    u: &EdwardsPoint,
    v: &EdwardsPoint,
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(b"TESSERA_VRF_CHALLENGE");
    hasher.update(ED25519_BASEPOINT_POINT.compress().as_bytes());
    hasher.update(h.compress().as_bytes());
    hasher.update(public);
    hasher.update(gamma.compress().as_bytes());
    hasher.update(u.compress().as_bytes());
    hasher.update(v.compress().as_bytes());
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

fn output_from_gamma(gamma: &EdwardsPoint) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(b"TESSERA_VRF_OUT");
    hasher.update(gamma.compress().as_bytes());
    hasher.finalize().into()
}
