//! Block types for the Tessera chain.
//!
//! A block is either the *genesis* block (slot 0, carrying the chain
//! parameters) or a *baked* block (slot > 0, produced by the slot lottery
//! winner). Block identity is the SHA-256 hash of the canonical encoding of
//! every field except the trailing signature, and the signature signs those
//! same bytes.

use crate::hash::BlockHash;
use crate::keys::{BlsPublicKeyBytes, PublicKeyBytes, SignatureBytes, VrfProofBytes, VrfPublicKeyBytes};
use crate::serialize::{
    write_f64, write_u32, write_u64, Deserial, ReadCursor, Serial, SerializationError,
    SerializeResult,
};
use crate::transaction::Transaction;
use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete time unit since genesis (`slot_duration_ms` each).
pub type Slot = u64;

/// Distance of a block from genesis along parent links.
pub type BlockHeight = u64;

/// Identity of a baker within the genesis roster.
pub type BakerId = u64;

/// One member of the genesis roster: baking keys plus (optionally)
/// finalization-committee membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BakerInfo {
    /// Baker identity referenced by baked blocks
    pub id: BakerId,
    /// Ed25519 key blocks and finalization messages are verified against
    pub sign_key: PublicKeyBytes,
    /// VRF key for the slot lottery and ABBA tickets
    pub vrf_key: VrfPublicKeyBytes,
    /// BLS key for finalization witness signatures
    pub bls_key: BlsPublicKeyBytes,
    /// Stake-derived integer weight
    pub stake: u64,
    /// Whether this baker sits on the finalization committee
    pub finalizer: bool,
}

impl Serial for BakerInfo {
    fn serial(&self, out: &mut Vec<u8>) {
        write_u64(out, self.id);
        self.sign_key.serial(out);
        self.vrf_key.serial(out);
        self.bls_key.serial(out);
        write_u64(out, self.stake);
        out.push(u8::from(self.finalizer));
    }
}

impl Deserial for BakerInfo {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let id = src.read_u64()?;
        let sign_key = PublicKeyBytes::deserial(src)?;
        let vrf_key = VrfPublicKeyBytes::deserial(src)?;
        let bls_key = BlsPublicKeyBytes::deserial(src)?;
        let stake = src.read_u64()?;
        let finalizer = match src.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(SerializationError::InvalidField {
                    field: "finalizer flag",
                    reason: format!("expected 0 or 1, got {other}"),
                })
            }
        };
        Ok(Self {
            id,
            sign_key,
            vrf_key,
            bls_key,
            stake,
            finalizer,
        })
    }
}

/// Chain parameters carried by the genesis block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisData {
    /// Genesis time, milliseconds since the Unix epoch
    pub time_ms: u64,
    /// Duration of one slot in milliseconds
    pub slot_duration_ms: u64,
    /// Per-slot election difficulty, in (0, 1)
    pub election_difficulty: f64,
    /// Number of slots per epoch
    pub epoch_length: u64,
    /// Minimum number of blocks skipped between finalized blocks
    pub min_skip: u64,
    /// Seed of the leadership election lottery
    pub leadership_election_nonce: Hash,
    /// The baker roster; finalizer members form the initial committee
    pub bakers: Vec<BakerInfo>,
}

impl GenesisData {
    /// Validate parameter ranges that the wire format cannot express.
    pub fn validate(&self) -> SerializeResult<()> {
        if !(self.election_difficulty > 0.0 && self.election_difficulty < 1.0) {
            return Err(SerializationError::InvalidField {
                field: "election difficulty",
                reason: format!("{} is not in (0, 1)", self.election_difficulty),
            });
        }
        if self.slot_duration_ms == 0 {
            return Err(SerializationError::InvalidField {
                field: "slot duration",
                reason: "must be positive".into(),
            });
        }
        if self.epoch_length == 0 {
            return Err(SerializationError::InvalidField {
                field: "epoch length",
                reason: "must be positive".into(),
            });
        }
        if self.bakers.is_empty() {
            return Err(SerializationError::InvalidField {
                field: "baker roster",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl Serial for GenesisData {
    fn serial(&self, out: &mut Vec<u8>) {
        write_u64(out, self.time_ms);
        write_u64(out, self.slot_duration_ms);
        write_f64(out, self.election_difficulty);
        write_u64(out, self.epoch_length);
        write_u64(out, self.min_skip);
        self.leadership_election_nonce.serial(out);
        write_u32(out, self.bakers.len() as u32);
        for baker in &self.bakers {
            baker.serial(out);
        }
    }
}

impl Deserial for GenesisData {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let time_ms = src.read_u64()?;
        let slot_duration_ms = src.read_u64()?;
        let election_difficulty = src.read_f64()?;
        let epoch_length = src.read_u64()?;
        let min_skip = src.read_u64()?;
        let leadership_election_nonce = Hash::deserial(src)?;
        let count = src.read_u32()?;
        let mut bakers = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            bakers.push(BakerInfo::deserial(src)?);
        }
        let genesis = Self {
            time_ms,
            slot_duration_ms,
            election_difficulty,
            epoch_length,
            min_skip,
            leadership_election_nonce,
            bakers,
        };
        genesis.validate()?;
        Ok(genesis)
    }
}

/// A block produced by a slot-lottery winner.
///
/// Wire format: `slot:u64_be ‖ parent:32 ‖ baker_id:u64_be ‖
/// election_proof:80 ‖ nonce:80 ‖ last_finalized:32 ‖ tx_count:u64_be ‖
/// transactions ‖ signature:64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BakedBlock {
    /// Slot this block was baked in (strictly increases along any chain)
    pub slot: Slot,
    /// Hash of the parent block
    pub parent: BlockHash,
    /// The winning baker
    pub baker_id: BakerId,
    /// VRF proof of the slot-lottery win
    pub election_proof: VrfProofBytes,
    /// VRF block nonce feeding the next leadership seed
    pub nonce: VrfProofBytes,
    /// Hash of the last block the baker considered finalized
    pub last_finalized: BlockHash,
    /// Ordered transaction list
    pub transactions: Vec<Transaction>,
    /// Baker signature over every preceding byte
    pub signature: SignatureBytes,
}

impl BakedBlock {
    /// The bytes covered by the baker signature and the block hash.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, self.slot);
        self.parent.serial(&mut out);
        write_u64(&mut out, self.baker_id);
        self.election_proof.serial(&mut out);
        self.nonce.serial(&mut out);
        self.last_finalized.serial(&mut out);
        write_u64(&mut out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.serial(&mut out);
        }
        out
    }

    fn deserial_body(slot: Slot, src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let parent = BlockHash::deserial(src)?;
        let baker_id = src.read_u64()?;
        let election_proof = VrfProofBytes::deserial(src)?;
        let nonce = VrfProofBytes::deserial(src)?;
        let last_finalized = BlockHash::deserial(src)?;
        let tx_count = src.read_u64()?;
        if tx_count > crate::serialize::ALLOCATION_LIMIT {
            return Err(SerializationError::OversizedLength(
                "transaction list",
                tx_count,
            ));
        }
        let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::deserial(src)?);
        }
        let signature = SignatureBytes::deserial(src)?;
        Ok(Self {
            slot,
            parent,
            baker_id,
            election_proof,
            nonce,
            last_finalized,
            transactions,
            signature,
        })
    }
}

/// A block: genesis or baked.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// The unique slot-0 block carrying the chain parameters
    Genesis(GenesisData),
    /// Any later block, produced through the slot lottery
    Normal(BakedBlock),
}

impl Block {
    /// The slot the block belongs to (0 for genesis).
    pub fn slot(&self) -> Slot {
        match self {
            Block::Genesis(_) => 0,
            Block::Normal(block) => block.slot,
        }
    }

    /// The parent hash, absent for genesis.
    pub fn parent(&self) -> Option<BlockHash> {
        match self {
            Block::Genesis(_) => None,
            Block::Normal(block) => Some(block.parent),
        }
    }

    /// The baker's last-finalized pointer, absent for genesis.
    pub fn last_finalized(&self) -> Option<BlockHash> {
        match self {
            Block::Genesis(_) => None,
            Block::Normal(block) => Some(block.last_finalized),
        }
    }

    /// The transactions carried by the block (empty for genesis).
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            Block::Genesis(_) => &[],
            Block::Normal(block) => &block.transactions,
        }
    }

    /// Whether this is the genesis block.
    pub fn is_genesis(&self) -> bool {
        matches!(self, Block::Genesis(_))
    }

    /// The block identity: SHA-256 over all fields except the signature.
    pub fn hash(&self) -> BlockHash {
        match self {
            Block::Genesis(genesis) => {
                let mut bytes = Vec::new();
                write_u64(&mut bytes, 0);
                genesis.serial(&mut bytes);
                Hash::sha256(&bytes)
            }
            Block::Normal(block) => Hash::sha256(&block.signable_bytes()),
        }
    }
}

impl Serial for Block {
    fn serial(&self, out: &mut Vec<u8>) {
        match self {
            Block::Genesis(genesis) => {
                write_u64(out, 0);
                genesis.serial(out);
            }
            Block::Normal(block) => {
                out.extend_from_slice(&block.signable_bytes());
                block.signature.serial(out);
            }
        }
    }
}

impl Deserial for Block {
    fn deserial(src: &mut ReadCursor<'_>) -> SerializeResult<Self> {
        let slot = src.read_u64()?;
        if slot == 0 {
            Ok(Block::Genesis(GenesisData::deserial(src)?))
        } else {
            Ok(Block::Normal(BakedBlock::deserial_body(slot, src)?))
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Block::Genesis(_) => write!(f, "genesis block ({})", self.hash().short()),
            Block::Normal(block) => write!(
                f,
                "block {} (slot: {}, baker: {}, {} txs)",
                self.hash().short(),
                block.slot,
                block.baker_id,
                block.transactions.len()
            ),
        }
    }
}
