//! Shared consensus types.
//!
//! This module provides:
//! - [`UpdateResult`] - the status code every ingress API returns
//! - [`ChainParameters`] - chain constants derived from genesis plus the
//!   node's local caps
//! - [`ConsensusEvent`] - outbound effects collected under the consensus
//!   lock and performed after it is released

use tessera_types::{BlockHash, FinalizationIndex, GenesisData, Slot};

/// Status code returned by the ingress APIs.
///
/// Recoverable failures are local to the one message being processed; the
/// state is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The message was applied to the state
    Success,
    /// The bytes did not decode
    SerializationFail,
    /// The message failed validation (signature, proof, or semantics)
    Invalid,
    /// The message was already known
    Duplicate,
    /// The message is below the finalized horizon
    Stale,
    /// The block references an unknown parent and was stored pending
    PendingBlock,
    /// The finalization message is for the next index and was buffered
    PendingFinalization,
    /// The finalization message belongs to a different session
    IncorrectSession,
    /// The block's slot is too far ahead of the clock; it was not stored
    EarlyBlock,
    /// The message cannot be verified against any known committee
    Unverifiable,
    /// The peer should continue the catch-up exchange
    ContinueCatchUp,
    /// A block-import file was not found
    MissingImportFile,
}

impl UpdateResult {
    /// Whether the message advanced the state.
    pub fn is_successful(self) -> bool {
        matches!(self, UpdateResult::Success)
    }

    /// Whether the message was buffered awaiting more data.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            UpdateResult::PendingBlock | UpdateResult::PendingFinalization
        )
    }

    /// Whether a broadcast message with this outcome should be relayed
    /// onwards. Duplicates, stale and invalid messages are not.
    pub fn is_rebroadcastable(self) -> bool {
        self.is_successful() || self.is_pending()
    }
}

/// Chain constants: the genesis parameters plus node-local caps.
#[derive(Debug, Clone)]
pub struct ChainParameters {
    /// Genesis time, milliseconds since the Unix epoch
    pub genesis_time_ms: u64,
    /// Slot duration in milliseconds
    pub slot_duration_ms: u64,
    /// Per-slot election difficulty
    pub election_difficulty: f64,
    /// Slots per epoch
    pub epoch_length: u64,
    /// Minimum blocks skipped between finalized blocks
    pub min_skip: u64,
    /// Maximum serialized size of a block's transaction list
    pub max_block_size: u64,
    /// Maximum total energy of a block's transactions
    pub max_block_energy: u64,
    /// Slots a received block may run ahead of the clock
    pub early_block_threshold: Slot,
    /// Slots a received transaction is kept before purge
    pub keep_alive_slots: Slot,
    /// Insertions between amortized purge sweeps
    pub insertions_before_purge: u64,
}

impl ChainParameters {
    /// Assemble parameters from genesis data and node-local caps.
    pub fn new(
        genesis: &GenesisData,
        max_block_size: u64,
        max_block_energy: u64,
        early_block_threshold: Slot,
        keep_alive_slots: Slot,
        insertions_before_purge: u64,
    ) -> Self {
        Self {
            genesis_time_ms: genesis.time_ms,
            slot_duration_ms: genesis.slot_duration_ms,
            election_difficulty: genesis.election_difficulty,
            epoch_length: genesis.epoch_length,
            min_skip: genesis.min_skip,
            max_block_size,
            max_block_energy,
            early_block_threshold,
            keep_alive_slots,
            insertions_before_purge,
        }
    }

    /// The slot the wall clock is currently in.
    pub fn slot_of(&self, now_ms: u64) -> Slot {
        now_ms.saturating_sub(self.genesis_time_ms) / self.slot_duration_ms
    }

    /// The timestamp at which `slot` begins.
    pub fn slot_start_ms(&self, slot: Slot) -> u64 {
        self.genesis_time_ms + slot * self.slot_duration_ms
    }

    /// The epoch a slot belongs to.
    pub fn epoch_of(&self, slot: Slot) -> u64 {
        slot / self.epoch_length
    }
}

/// An outbound effect produced under the consensus lock.
///
/// The runner drains these after releasing the lock; callbacks never run
/// with the lock held.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Broadcast a serialized finalization message
    BroadcastFinalizationMessage(Vec<u8>),
    /// Broadcast a serialized finalization record
    BroadcastFinalizationRecord(Vec<u8>),
    /// Broadcast a serialized catch-up status message
    BroadcastCatchUpStatus(Vec<u8>),
    /// Send a serialized finalization record to the requesting peer
    DirectedFinalizationRecord(Vec<u8>),
    /// Send a serialized block to the requesting peer
    DirectedBlock(Vec<u8>),
    /// (Re)arm the finalization replay timer for the current round
    ResetReplayTimer {
        /// Absolute deadline, milliseconds since the Unix epoch
        deadline_ms: u64,
    },
    /// The Seen output buffer has a flush due at this deadline
    BufferDeadline {
        /// Absolute deadline, milliseconds since the Unix epoch
        deadline_ms: u64,
    },
    /// A block reached finalized status
    BlockFinalized {
        /// The finalized block
        hash: BlockHash,
        /// Its finalization index
        index: FinalizationIndex,
    },
    /// A scheduled protocol update took effect at this finalization; the
    /// runner fires its regenesis callback
    Regenesis {
        /// The update's parameter payload
        payload: Vec<u8>,
    },
}
