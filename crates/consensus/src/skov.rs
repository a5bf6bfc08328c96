//! Skov: the consensus driver.
//!
//! Owns the tree state and transaction table, validates and inserts
//! incoming blocks (delegating execution to the scheduler), bakes our own
//! blocks when the slot lottery says so, and hands finalization its hooks:
//! block arrival notifications and the `finalize_block` path that promotes
//! a record's chain and rolls back pruned transactions.

use crate::committee::{FinalizationCommittee, FinalizationKeys};
use crate::election::{
    block_nonce_input, try_win_slot, verify_block_nonce, verify_election, BirkParameters,
};
use crate::execution::{BlockExecutor, ChainMetadata};
use crate::finalization::{FinalizationSettings, FinalizationState};
use crate::transaction_table::{AddResult, TransactionTable};
use crate::tree::{BlockIdx, BlockStatus, PendingBlock, TreeError, TreeState};
use crate::types::{ChainParameters, ConsensusEvent, UpdateResult};
use crate::updates::{ProtocolUpdate, ProtocolUpdateQueue};
use std::collections::HashSet;
use std::sync::Arc;
use tessera_crypto::{SignKeypair, SignPublicKey, VrfSecretKey};
use tessera_types::{
    BakedBlock, BakerId, Block, BlockHash, Deserial, GenesisData, Serial, SignatureBytes, Slot,
    Transaction,
};
use tracing::{debug, info, trace, warn};

/// Errors constructing the consensus state.
#[derive(Debug, thiserror::Error)]
pub enum SkovError {
    /// The genesis payload is unusable
    #[error("invalid genesis: {0}")]
    InvalidGenesis(#[from] tessera_types::SerializationError),

    /// The committee could not be built
    #[error(transparent)]
    Committee(#[from] crate::committee::CommitteeError),

    /// The lottery snapshot could not be built
    #[error(transparent)]
    Election(#[from] crate::election::ElectionError),
}

/// Our baking identity.
#[derive(Clone)]
pub struct BakerCredentials {
    /// Our baker id in the roster
    pub id: BakerId,
    /// Block signing key
    pub sign: SignKeypair,
    /// Election/nonce VRF key
    pub vrf: VrfSecretKey,
}

/// Outcome of one bake attempt.
#[derive(Debug)]
pub enum BakeOutcome {
    /// We won the slot and inserted + serialized the block
    Baked {
        /// The serialized block, ready to broadcast
        bytes: Vec<u8>,
        /// Its hash
        hash: BlockHash,
        /// The slot it was baked in
        slot: Slot,
    },
    /// We lost the slot; sleep until this timestamp then try the next one
    WaitUntil(u64),
}

/// The block-and-transaction half of the consensus state.
pub struct SkovData {
    /// The tree-indexed block store
    pub tree: TreeState,
    /// The transaction table
    pub table: TransactionTable,
    /// Chain constants
    pub params: ChainParameters,
    /// Scheduled chain-parameter updates
    pub updates: ProtocolUpdateQueue,
    executor: Box<dyn BlockExecutor>,
}

impl SkovData {
    /// Finalizes a record whose block is alive: promotes the chain, prunes
    /// the rest, settles the chain's transactions and reverts the pruned
    /// ones.
    pub(crate) fn finalize_block(
        &mut self,
        record: tessera_types::FinalizationRecord,
    ) -> Result<(), TreeError> {
        let block = record.block;
        let outcome = self.tree.mark_finalized(&block, record)?;
        let horizon = self.tree.last_finalized_slot();
        for idx in outcome.newly_finalized {
            let (hash, slot, txs) = {
                let pointer = self.tree.pointer(idx);
                (
                    pointer.hash,
                    pointer.block.slot(),
                    pointer.block.transactions().to_vec(),
                )
            };
            self.table.finalize_transactions(hash, slot, &txs);
        }
        for (hash, dead_block) in outcome.dead {
            self.table
                .revert_block(&hash, dead_block.transactions(), horizon);
        }
        Ok(())
    }

    /// Consults the update queue at the newly finalized block's time.
    pub(crate) fn promote_protocol_updates(&mut self) -> Option<ProtocolUpdate> {
        let finalized_time = self
            .params
            .slot_start_ms(self.tree.last_finalized_slot());
        self.updates.promote_elapsed(finalized_time)
    }
}

/// The complete consensus state: everything the global lock protects.
pub struct SkovState {
    /// Tree, table and execution
    pub data: SkovData,
    /// The finalization orchestrator
    pub finalization: FinalizationState,
}

impl SkovState {
    /// Builds the state from genesis.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        genesis: GenesisData,
        params: ChainParameters,
        executor: Box<dyn BlockExecutor>,
        my_baker_id: Option<BakerId>,
        finalization_keys: Option<FinalizationKeys>,
        finalization_settings: FinalizationSettings,
    ) -> Result<Self, SkovError> {
        genesis.validate()?;
        let birk = Arc::new(BirkParameters::from_genesis(&genesis)?);
        let committee = Arc::new(FinalizationCommittee::from_genesis(&genesis)?);
        let genesis_state = executor.genesis_state(&genesis);
        let tree = TreeState::new(Block::Genesis(genesis.clone()), genesis_state, birk);
        let session = tree.genesis_hash();
        let finalization = FinalizationState::new(
            session,
            committee,
            finalization_keys.map(Arc::new),
            my_baker_id,
            genesis.min_skip,
            finalization_settings,
        );
        info!(session = %session.short(), "Consensus state initialized");
        Ok(Self {
            data: SkovData {
                tree,
                table: TransactionTable::new(),
                params,
                updates: ProtocolUpdateQueue::new(),
                executor,
            },
            finalization,
        })
    }

    /// The genesis hash / finalization session id.
    pub fn genesis_hash(&self) -> BlockHash {
        self.data.tree.genesis_hash()
    }

    /// The current best block's hash.
    pub fn best_block_hash(&self) -> BlockHash {
        self.data.tree.pointer(self.data.tree.best_block()).hash
    }

    /// The last finalized block's hash.
    pub fn last_finalized_hash(&self) -> BlockHash {
        self.data.tree.last_finalized().hash
    }

    /// Ingress: a serialized block.
    pub fn receive_block(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        let Ok(block) = Block::from_bytes(bytes) else {
            return (UpdateResult::SerializationFail, Vec::new());
        };
        let hash = block.hash();

        if self.data.tree.status(&hash).is_some() {
            return (UpdateResult::Duplicate, Vec::new());
        }

        let Block::Normal(ref baked) = block else {
            // A competing genesis is never acceptable
            return (UpdateResult::Invalid, Vec::new());
        };

        if baked.slot <= self.data.tree.last_finalized_slot() {
            trace!(block = %hash.short(), slot = baked.slot, "Stale block");
            return (UpdateResult::Stale, Vec::new());
        }

        if !self.verify_baker_signature(baked) {
            warn!(block = %hash.short(), baker = baked.baker_id, "Bad block signature");
            return (UpdateResult::Invalid, Vec::new());
        }

        let now_slot = self.data.params.slot_of(now_ms);
        if baked.slot > now_slot.saturating_add(self.data.params.early_block_threshold) {
            debug!(block = %hash.short(), slot = baked.slot, now_slot, "Early block");
            return (UpdateResult::EarlyBlock, Vec::new());
        }

        let parent_hash = baked.parent;
        match self.data.tree.status(&parent_hash) {
            None | Some(BlockStatus::Pending { .. }) => {
                debug!(block = %hash.short(), parent = %parent_hash.short(), "Parent unknown; block pending");
                self.data.tree.add_pending(PendingBlock {
                    hash,
                    block,
                    receive_time_ms: now_ms,
                });
                (UpdateResult::PendingBlock, Vec::new())
            }
            Some(BlockStatus::Dead) => {
                self.data.tree.mark_dead(hash);
                (UpdateResult::Invalid, Vec::new())
            }
            Some(BlockStatus::Alive(parent)) | Some(BlockStatus::Finalized { idx: parent, .. }) => {
                match self.process_block(parent, block, now_ms, now_ms) {
                    Ok(_) => {
                        let events = self.after_arrival(hash, now_ms);
                        (UpdateResult::Success, events)
                    }
                    Err(result) => (result, Vec::new()),
                }
            }
        }
    }

    /// Validates and inserts a block whose parent is live. On failure the
    /// hash is marked dead so a replay is cheap.
    fn process_block(
        &mut self,
        parent: BlockIdx,
        block: Block,
        receive_time_ms: u64,
        now_ms: u64,
    ) -> Result<BlockIdx, UpdateResult> {
        let hash = block.hash();
        let Block::Normal(ref baked) = block else {
            return Err(UpdateResult::Invalid);
        };

        let (parent_slot, parent_height, parent_birk, parent_state) = {
            let pointer = self.data.tree.pointer(parent);
            (
                pointer.block.slot(),
                pointer.height,
                Arc::clone(&pointer.birk),
                Arc::clone(&pointer.state),
            )
        };

        if baked.slot <= parent_slot {
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }

        // A parent below the finalized horizon heads a branch that pruning
        // already abandoned
        if parent_height < self.data.tree.last_finalized().height {
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Stale);
        }

        // The lottery snapshot the block must be validated against
        let epoch = self.data.params.epoch_of(baked.slot);
        let birk = if epoch == parent_birk.epoch {
            parent_birk
        } else {
            Arc::new(parent_birk.for_epoch(epoch))
        };

        if !verify_election(&birk, baked.baker_id, baked.slot, &baked.election_proof) {
            warn!(block = %hash.short(), baker = baked.baker_id, "Election proof failed");
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }
        if !verify_block_nonce(&birk, baked.baker_id, baked.slot, &baked.nonce) {
            warn!(block = %hash.short(), "Block nonce proof failed");
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }

        // The block's last-finalized pointer must be a finalized ancestor
        // of its parent
        let lf_ok = match self.data.tree.status(&baked.last_finalized) {
            Some(BlockStatus::Finalized { idx, .. }) => {
                self.data.tree.is_ancestor(idx, parent)
            }
            _ => false,
        };
        if !lf_ok {
            warn!(block = %hash.short(), "Inconsistent last-finalized pointer");
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }

        // Size and signature sanity of the carried transactions
        let tx_bytes: usize = baked.transactions.iter().map(|tx| tx.size()).sum();
        if tx_bytes as u64 > self.data.params.max_block_size {
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }
        for tx in &baked.transactions {
            if !verify_transaction_signature(tx) {
                self.data.tree.mark_dead(hash);
                return Err(UpdateResult::Invalid);
            }
        }

        let meta = ChainMetadata {
            slot: baked.slot,
            height: parent_height + 1,
        };
        let outcome = match self
            .data
            .executor
            .execute(&parent_state, &baked.transactions, &meta)
        {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(block = %hash.short(), reason = %reason, "Execution rejected block");
                self.data.tree.mark_dead(hash);
                return Err(UpdateResult::Invalid);
            }
        };
        if outcome.energy_used > self.data.params.max_block_energy {
            self.data.tree.mark_dead(hash);
            return Err(UpdateResult::Invalid);
        }

        let slot = baked.slot;
        let transactions = baked.transactions.clone();
        let idx = self.data.tree.insert_block(
            block,
            parent,
            outcome.new_state,
            birk,
            receive_time_ms,
            now_ms,
        );
        for (index, tx) in transactions.iter().enumerate() {
            self.data.table.add_transaction(tx.clone(), slot);
            self.data
                .table
                .commit_transaction(hash, slot, tx.hash(), index as u64);
        }
        Ok(idx)
    }

    /// After a block becomes alive: drain the pending children it unlocks
    /// and notify finalization about every arrival.
    fn after_arrival(&mut self, hash: BlockHash, now_ms: u64) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();
        let mut arrivals = vec![hash];
        let mut cursor = 0;
        while cursor < arrivals.len() {
            let parent_hash = arrivals[cursor];
            cursor += 1;
            let Some(parent_idx) = self.data.tree.live_idx(&parent_hash) else {
                continue;
            };
            for pending in self.data.tree.take_pending_children(&parent_hash) {
                match self.process_block(parent_idx, pending.block, pending.receive_time_ms, now_ms)
                {
                    Ok(_) => {
                        debug!(block = %pending.hash.short(), "Pending block became alive");
                        arrivals.push(pending.hash);
                    }
                    Err(_) => {
                        trace!(block = %pending.hash.short(), "Pending block rejected");
                    }
                }
            }
        }
        for arrived in arrivals {
            events.extend(
                self.finalization
                    .notify_block_arrival(arrived, &mut self.data, now_ms),
            );
        }
        events
    }

    fn verify_baker_signature(&self, baked: &BakedBlock) -> bool {
        let genesis_birk = &self.data.tree.genesis().birk;
        let Some(baker) = genesis_birk.baker(baked.baker_id) else {
            return false;
        };
        baker
            .sign_key
            .verify(&baked.signable_bytes(), &baked.signature)
    }

    /// Ingress: a serialized transaction.
    pub fn receive_transaction(&mut self, bytes: &[u8], now_ms: u64) -> UpdateResult {
        let Ok(tx) = Transaction::from_bytes(bytes) else {
            return UpdateResult::SerializationFail;
        };
        if !verify_transaction_signature(&tx) {
            return UpdateResult::Invalid;
        }
        let slot = self.data.params.slot_of(now_ms);
        let result = match self.data.table.add_transaction(tx, slot) {
            AddResult::Added => UpdateResult::Success,
            AddResult::Duplicate => UpdateResult::Duplicate,
            AddResult::ObsoleteNonce => UpdateResult::Stale,
        };
        // Amortized sweep: enough insertions accumulated since the last one
        if self.purge_due() {
            self.purge_transactions(now_ms);
        }
        result
    }

    /// Ingress: a serialized finalization message.
    pub fn receive_finalization_message(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        self.finalization
            .receive_message(bytes, &mut self.data, now_ms)
    }

    /// Ingress: a serialized finalization record.
    pub fn receive_finalization_record(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        self.finalization
            .receive_record(bytes, &mut self.data, now_ms)
    }

    /// Ingress: a serialized catch-up status.
    pub fn receive_catch_up_status(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        self.finalization
            .receive_catch_up(bytes, &mut self.data, now_ms)
    }

    /// Starts the first finalization round (called once by the runner).
    pub fn start_finalization(&mut self, now_ms: u64) -> Vec<ConsensusEvent> {
        self.finalization.start_round(&mut self.data, now_ms)
    }

    /// The finalization replay timer fired.
    pub fn on_replay_timer(&mut self, generation: u64, now_ms: u64) -> Vec<ConsensusEvent> {
        self.finalization.on_replay_timer(generation, now_ms)
    }

    /// The current replay timer generation (armed timers carry it).
    pub fn replay_generation(&self) -> u64 {
        self.finalization.replay_generation()
    }

    /// The Seen buffer flush deadline passed.
    pub fn on_buffer_deadline(&mut self, now_ms: u64) -> Vec<ConsensusEvent> {
        self.finalization.flush_seen_buffer(now_ms)
    }

    /// One bake attempt at `slot`.
    pub fn try_bake(
        &mut self,
        credentials: &BakerCredentials,
        slot: Slot,
        now_ms: u64,
    ) -> (BakeOutcome, Vec<ConsensusEvent>) {
        let parent_idx = self.data.tree.best_block_before_slot(slot);
        let (parent_slot, parent_birk) = {
            let pointer = self.data.tree.pointer(parent_idx);
            (pointer.block.slot(), Arc::clone(&pointer.birk))
        };
        if parent_slot >= slot {
            // No eligible parent yet (the chain tip is at or past this slot)
            let wake = self.data.params.slot_start_ms(slot + 1);
            return (BakeOutcome::WaitUntil(wake), Vec::new());
        }

        let epoch = self.data.params.epoch_of(slot);
        let birk = if epoch == parent_birk.epoch {
            parent_birk
        } else {
            Arc::new(parent_birk.for_epoch(epoch))
        };

        let Some(election_proof) = try_win_slot(&credentials.vrf, &birk, credentials.id, slot)
        else {
            let wake = self.data.params.slot_start_ms(slot + 1);
            return (BakeOutcome::WaitUntil(wake), Vec::new());
        };

        let (_, nonce_proof) = credentials.vrf.prove(&block_nonce_input(
            &birk.leadership_election_nonce,
            slot,
        ));

        let transactions = self.select_transactions(parent_idx);
        let mut baked = BakedBlock {
            slot,
            parent: self.data.tree.pointer(parent_idx).hash,
            baker_id: credentials.id,
            election_proof: election_proof.to_bytes(),
            nonce: nonce_proof.to_bytes(),
            last_finalized: self.data.tree.last_finalized().hash,
            transactions,
            signature: SignatureBytes::default(),
        };
        baked.signature = credentials.sign.sign(&baked.signable_bytes());
        let block = Block::Normal(baked);
        let hash = block.hash();
        let bytes = block.to_bytes();

        // Insert through the normal path before the broadcast leaves the
        // critical section
        match self.process_block(parent_idx, block, now_ms, now_ms) {
            Ok(_) => {
                info!(block = %hash.short(), slot, "Baked block");
                let events = self.after_arrival(hash, now_ms);
                (BakeOutcome::Baked { bytes, hash, slot }, events)
            }
            Err(result) => {
                // Our own block failing our own checks is a bug
                warn!(block = %hash.short(), ?result, "Discarding our own baked block");
                let wake = self.data.params.slot_start_ms(slot + 1);
                (BakeOutcome::WaitUntil(wake), Vec::new())
            }
        }
    }

    /// Greedy transaction fill: `(sender, nonce)` order, sequential nonces
    /// per sender, skipping what the parent chain already committed, under
    /// the size and energy caps.
    fn select_transactions(&self, parent: BlockIdx) -> Vec<Transaction> {
        let mut excluded: HashSet<tessera_types::TransactionHash> = HashSet::new();
        let mut cursor = parent;
        loop {
            let pointer = self.data.tree.pointer(cursor);
            for tx in pointer.block.transactions() {
                excluded.insert(tx.hash());
            }
            if cursor == self.data.tree.last_finalized_idx() || pointer.parent == cursor {
                break;
            }
            cursor = pointer.parent;
        }

        let mut picked = Vec::new();
        let mut size = 0u64;
        let mut energy = 0u64;
        let mut next_nonce: std::collections::HashMap<tessera_types::AccountAddress, u64> =
            std::collections::HashMap::new();
        for tx in self.data.table.pending_in_order(&excluded) {
            let expected = next_nonce
                .entry(tx.sender)
                .or_insert_with(|| self.data.table.next_nonce(&tx.sender));
            if tx.nonce != *expected {
                continue;
            }
            if size + tx.size() as u64 > self.data.params.max_block_size
                || energy + tx.energy > self.data.params.max_block_energy
            {
                continue;
            }
            size += tx.size() as u64;
            energy += tx.energy;
            *expected += 1;
            picked.push(tx.clone());
        }
        picked
    }

    /// Schedules a chain-parameter update; it takes effect at the first
    /// finalization past its effective time.
    pub fn enqueue_protocol_update(&mut self, update: ProtocolUpdate) {
        self.data.updates.enqueue(update);
    }

    /// Purges timed-out received transactions.
    pub fn purge_transactions(&mut self, now_ms: u64) {
        let slot = self.data.params.slot_of(now_ms);
        self.data
            .table
            .purge(slot, self.data.params.keep_alive_slots);
    }

    /// Whether the insertion counter warrants an early purge.
    pub fn purge_due(&self) -> bool {
        self.data
            .table
            .purge_due(self.data.params.insertions_before_purge)
    }
}

/// A transaction's sender address is its Ed25519 verification key; the
/// signature covers the signable bytes.
fn verify_transaction_signature(tx: &Transaction) -> bool {
    let Ok(key) = SignPublicKey::from_bytes(&tessera_types::PublicKeyBytes(tx.sender.0)) else {
        return false;
    };
    key.verify(&tx.signable_bytes(), &tx.signature)
}
