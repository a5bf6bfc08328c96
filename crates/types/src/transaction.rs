//! Transaction types.
//!
//! A Tessera transaction is a signed, nonce-ordered instruction from a single
//! sender account. The consensus core never interprets the payload; it only
//! enforces nonce ordering, energy accounting and the block-size cap, and
//! hands the payload to the execution layer.

use crate::hash::TransactionHash;
use crate::keys::SignatureBytes;
use crate::serialize::{write_u32, write_u64, Deserial, ReadCursor, Serial, SerializeResult};
use crate::{Error, Hash, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Sequence number of a transaction within its sender account.
pub type Nonce = u64;

/// Execution cost unit charged to a transaction.
pub type Energy = u64;

/// A 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AccountAddress(pub [u8; 32]);

impl AccountAddress {
    /// Creates an address from a slice, rejecting wrong lengths.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(Error::InvalidLength {
                expected: 32,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAddress({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Serial for AccountAddress {
    fn serial(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Deserial for AccountAddress {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        Ok(Self(src.read_array()?))
    }
}

/// A signed transaction.
///
/// Wire format: `sender:32 ‖ nonce:u64_be ‖ energy:u64_be ‖
/// payload_len:u32_be ‖ payload ‖ signature:64`. The signature covers every
/// byte up to itself; the transaction hash is SHA-256 over those same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Originating account
    pub sender: AccountAddress,
    /// Sender-local sequence number
    pub nonce: Nonce,
    /// Maximum energy this transaction may consume
    pub energy: Energy,
    /// Opaque payload interpreted by the execution layer
    pub payload: Vec<u8>,
    /// Ed25519 signature over the signable bytes
    pub signature: SignatureBytes,
}

impl Transaction {
    /// The bytes covered by the signature and the transaction hash.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 8 + 4 + self.payload.len());
        self.sender.serial(&mut out);
        write_u64(&mut out, self.nonce);
        write_u64(&mut out, self.energy);
        write_u32(&mut out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        out
    }

    /// The transaction identity.
    pub fn hash(&self) -> TransactionHash {
        Hash::sha256(&self.signable_bytes())
    }

    /// Serialized size in bytes, as counted against the block-size cap.
    pub fn size(&self) -> usize {
        32 + 8 + 8 + 4 + self.payload.len() + SignatureBytes::SIZE
    }
}

impl Serial for Transaction {
    fn serial(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signable_bytes());
        self.signature.serial(out);
    }
}

impl Deserial for Transaction {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let sender = AccountAddress::deserial(src)?;
        let nonce = src.read_u64()?;
        let energy = src.read_u64()?;
        let payload_len = src.read_u32()?;
        let payload = src.read_vec(u64::from(payload_len), "transaction payload")?;
        let signature = SignatureBytes::deserial(src)?;
        Ok(Self {
            sender,
            nonce,
            energy,
            payload,
            signature,
        })
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("sender", &self.sender)
            .field("nonce", &self.nonce)
            .field("energy", &self.energy)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx {} (sender: {}, nonce: {})",
            self.hash().short(),
            self.sender,
            self.nonce
        )
    }
}
