//! Finalization records.
//!
//! A finalization record is the durable artifact of one successful WMVBA
//! round: the finalized block hash together with the set of committee
//! members that witnessed it and their aggregated BLS signature.

use crate::hash::BlockHash;
use crate::keys::BlsSignatureBytes;
use crate::serialize::{
    write_u32, write_u64, Deserial, ReadCursor, Serial, SerializationError, SerializeResult,
    ALLOCATION_LIMIT,
};
use crate::BlockHeight;
use std::fmt;

/// Monotone counter of finalized blocks; genesis is index 0.
pub type FinalizationIndex = u64;

/// The quorum evidence inside a finalization record: the sorted indices of
/// the witnessing committee members and their aggregated signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinalizationProof {
    /// Committee-relative party indices, strictly ascending
    pub parties: Vec<u32>,
    /// Aggregate of the parties' witness signatures
    pub signature: BlsSignatureBytes,
}

impl FinalizationProof {
    /// Number of witnessing parties.
    pub fn party_count(&self) -> usize {
        self.parties.len()
    }
}

/// A settled finalization decision.
///
/// Wire format: `index:u64_be ‖ block:32 ‖ party_count:u32_be ‖
/// parties:u32_be[] ‖ bls_aggregate:48 ‖ delay:u64_be`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationRecord {
    /// Dense finalization index (0 = genesis)
    pub index: FinalizationIndex,
    /// The finalized block
    pub block: BlockHash,
    /// Quorum evidence
    pub proof: FinalizationProof,
    /// The delta the successful round ran at
    pub delay: BlockHeight,
}

impl FinalizationRecord {
    /// The implicit record finalizing genesis: index 0, empty proof.
    pub fn genesis(genesis_hash: BlockHash) -> Self {
        Self {
            index: 0,
            block: genesis_hash,
            proof: FinalizationProof::default(),
            delay: 0,
        }
    }
}

impl Serial for FinalizationRecord {
    fn serial(&self, out: &mut Vec<u8>) {
        write_u64(out, self.index);
        self.block.serial(out);
        write_u32(out, self.proof.parties.len() as u32);
        for party in &self.proof.parties {
            write_u32(out, *party);
        }
        self.proof.signature.serial(out);
        write_u64(out, self.delay);
    }
}

impl Deserial for FinalizationRecord {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let index = src.read_u64()?;
        let block = BlockHash::deserial(src)?;
        let count = src.read_u32()?;
        if u64::from(count) > ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(
                "finalization proof parties",
                u64::from(count),
            ));
        }
        let mut parties = Vec::with_capacity(count.min(4096) as usize);
        let mut previous: Option<u32> = None;
        for _ in 0..count {
            let party = src.read_u32()?;
            if previous.is_some_and(|p| p >= party) {
                return Err(SerializationError::InvalidField {
                    field: "finalization proof parties",
                    reason: "party indices must be strictly ascending".into(),
                });
            }
            previous = Some(party);
            parties.push(party);
        }
        let signature = BlsSignatureBytes::deserial(src)?;
        let delay = src.read_u64()?;
        Ok(Self {
            index,
            block,
            proof: FinalizationProof { parties, signature },
            delay,
        })
    }
}

impl fmt::Display for FinalizationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finalization record #{} for {} ({} parties, delay {})",
            self.index,
            self.block.short(),
            self.proof.party_count(),
            self.delay
        )
    }
}
