//! Opaque cryptographic byte material.
//!
//! The wire format only cares about the size of keys, proofs and signatures;
//! their algebraic structure lives in `tessera-crypto`. These newtypes keep
//! the type crate free of curve arithmetic while still giving every field a
//! distinct type.

use crate::serialize::{Deserial, ReadCursor, Serial, SerializeResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! opaque_bytes {
    ($(#[$doc:meta])* $name:ident, $size:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            /// Size of the encoded value in bytes.
            pub const SIZE: usize = $size;

            /// Borrow the raw bytes.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $size])
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}..)"), hex::encode(&self.0[..4.min($size)]))
            }
        }

        impl Serial for $name {
            fn serial(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.0);
            }
        }

        impl Deserial for $name {
            fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
                Ok(Self(src.read_array()?))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let s = s.strip_prefix("0x").unwrap_or(&s);
                let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
                let arr: [u8; $size] = bytes.try_into().map_err(|_| {
                    serde::de::Error::custom(concat!(
                        stringify!($name),
                        " must be ",
                        stringify!($size),
                        " bytes"
                    ))
                })?;
                Ok(Self(arr))
            }
        }
    };
}

opaque_bytes!(
    /// A 64-byte Ed25519 signature over canonical wire bytes.
    SignatureBytes,
    64
);

opaque_bytes!(
    /// An 80-byte VRF proof (`gamma:32 ‖ c:32 ‖ s:32`).
    VrfProofBytes,
    80
);

opaque_bytes!(
    /// A 48-byte BLS12-381 (min_sig) signature or aggregate thereof.
    BlsSignatureBytes,
    48
);

opaque_bytes!(
    /// A 32-byte Ed25519 verification key.
    PublicKeyBytes,
    32
);

opaque_bytes!(
    /// A 32-byte VRF public key (compressed Edwards point).
    VrfPublicKeyBytes,
    32
);

opaque_bytes!(
    /// A 96-byte BLS12-381 (min_sig) public key.
    BlsPublicKeyBytes,
    96
);
