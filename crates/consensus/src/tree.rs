//! The tree state: every block the node knows, in every lifecycle stage.
//!
//! Blocks live in an arena of [`BlockPointer`]s indexed by insertion;
//! genesis' parent and last-finalized references are the sentinel "self"
//! index, so the pointer graph has no cycles of ownership. A hash-keyed
//! status table tracks the lifecycle (`Pending → Alive → Finalized`, or
//! `→ Dead` when a branch is pruned), `branches` lists the alive blocks per
//! height above the last finalized block, and the pending queues hold
//! blocks whose parents have not arrived.

use crate::election::BirkParameters;
use crate::execution::ExecutionState;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use tessera_types::{
    Block, BlockHash, BlockHeight, FinalizationIndex, FinalizationRecord, Slot,
};
use tracing::{debug, info, trace};

/// Arena index of a block pointer.
pub type BlockIdx = usize;

/// An alive or finalized block with its consensus metadata.
#[derive(Debug)]
pub struct BlockPointer {
    /// The block's identity
    pub hash: BlockHash,
    /// The block itself
    pub block: Arc<Block>,
    /// Arena index of the parent (self for genesis)
    pub parent: BlockIdx,
    /// Arena index of the block's last-finalized pointer (self for genesis)
    pub last_finalized: BlockIdx,
    /// Distance from genesis
    pub height: BlockHeight,
    /// Post-execution state handle
    pub state: Arc<dyn ExecutionState>,
    /// When the serialized block first reached us, ms
    pub receive_time_ms: u64,
    /// When the block became alive, ms
    pub arrive_time_ms: u64,
    /// Number of transactions carried
    pub tx_count: usize,
    /// Lottery snapshot governing this block's children
    pub birk: Arc<BirkParameters>,
}

/// Lifecycle status of a block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Received, parent not yet alive
    Pending {
        /// When the block reached us, ms
        receive_time_ms: u64,
    },
    /// In the tree, extending a live branch
    Alive(BlockIdx),
    /// Abandoned by finalization pruning
    Dead,
    /// Irrevocable
    Finalized {
        /// Arena index of the pointer
        idx: BlockIdx,
        /// The record that finalized it (intermediate ancestors share the
        /// index of the record that pruned to them)
        record_index: FinalizationIndex,
    },
}

/// A block waiting for its parent.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    /// The block's identity
    pub hash: BlockHash,
    /// The deserialized block
    pub block: Block,
    /// When it reached us, ms
    pub receive_time_ms: u64,
}

/// What a finalization did to the tree.
#[derive(Debug)]
pub struct PruneOutcome {
    /// Chain members newly promoted to finalized, oldest first (the last
    /// entry is the record's block)
    pub newly_finalized: Vec<BlockIdx>,
    /// Blocks killed by pruning, with their contents for transaction
    /// rollback
    pub dead: Vec<(BlockHash, Arc<Block>)>,
}

/// Errors from tree-state mutation.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// Finalization target is not an alive block
    #[error("block {0} is not alive")]
    NotAlive(BlockHash),

    /// Finalization indices must be dense
    #[error("non-sequential finalization: expected index {expected}, got {got}")]
    NonSequentialFinalization {
        /// The next index the tree expects
        expected: FinalizationIndex,
        /// The index that arrived
        got: FinalizationIndex,
    },
}

/// The tree-indexed block store.
pub struct TreeState {
    arena: Vec<BlockPointer>,
    statuses: HashMap<BlockHash, BlockStatus>,
    /// Finalized chain by height
    finalized_at_height: BTreeMap<BlockHeight, BlockIdx>,
    /// Dense records, genesis at position 0
    records: Vec<FinalizationRecord>,
    /// Alive blocks per height above the last finalized block;
    /// `branches[0]` is height `last_finalized.height + 1`
    branches: VecDeque<Vec<BlockIdx>>,
    /// Parent hash → children awaiting it
    pending_children: HashMap<BlockHash, Vec<BlockHash>>,
    pending_blocks: HashMap<BlockHash, PendingBlock>,
    /// Slot-ordered view of pending blocks, for stale expiry
    pending_queue: BinaryHeap<Reverse<(Slot, BlockHash)>>,
    last_finalized: BlockIdx,
    genesis: BlockIdx,
    /// The block the transaction table's committed view follows
    focus: BlockIdx,
}

impl TreeState {
    /// Builds the tree around a genesis block.
    pub fn new(
        genesis_block: Block,
        genesis_state: Arc<dyn ExecutionState>,
        birk: Arc<BirkParameters>,
    ) -> Self {
        let hash = genesis_block.hash();
        let pointer = BlockPointer {
            hash,
            block: Arc::new(genesis_block),
            parent: 0,
            last_finalized: 0,
            height: 0,
            state: genesis_state,
            receive_time_ms: 0,
            arrive_time_ms: 0,
            tx_count: 0,
            birk,
        };
        let mut statuses = HashMap::new();
        statuses.insert(
            hash,
            BlockStatus::Finalized {
                idx: 0,
                record_index: 0,
            },
        );
        let mut finalized_at_height = BTreeMap::new();
        finalized_at_height.insert(0, 0);
        info!(genesis = %hash.short(), "Tree state initialized");
        Self {
            arena: vec![pointer],
            statuses,
            finalized_at_height,
            records: vec![FinalizationRecord::genesis(hash)],
            branches: VecDeque::new(),
            pending_children: HashMap::new(),
            pending_blocks: HashMap::new(),
            pending_queue: BinaryHeap::new(),
            last_finalized: 0,
            genesis: 0,
            focus: 0,
        }
    }

    /// The pointer at an arena index.
    pub fn pointer(&self, idx: BlockIdx) -> &BlockPointer {
        &self.arena[idx]
    }

    /// The genesis pointer.
    pub fn genesis(&self) -> &BlockPointer {
        &self.arena[self.genesis]
    }

    /// The genesis block hash, which is also the finalization session id.
    pub fn genesis_hash(&self) -> BlockHash {
        self.arena[self.genesis].hash
    }

    /// Arena index of the last finalized block.
    pub fn last_finalized_idx(&self) -> BlockIdx {
        self.last_finalized
    }

    /// The last finalized pointer.
    pub fn last_finalized(&self) -> &BlockPointer {
        &self.arena[self.last_finalized]
    }

    /// Slot of the last finalized block.
    pub fn last_finalized_slot(&self) -> Slot {
        self.last_finalized().block.slot()
    }

    /// The record finalizing index `index`, if settled.
    pub fn record(&self, index: FinalizationIndex) -> Option<&FinalizationRecord> {
        self.records.get(index as usize)
    }

    /// The next finalization index the tree expects.
    pub fn next_finalization_index(&self) -> FinalizationIndex {
        self.records.len() as FinalizationIndex
    }

    /// All settled records from `from` on, for catch-up responses.
    pub fn records_from(&self, from: FinalizationIndex) -> &[FinalizationRecord] {
        &self.records[(from as usize).min(self.records.len())..]
    }

    /// The finalized block at a height, if that height is settled.
    pub fn finalized_at_height(&self, height: BlockHeight) -> Option<&BlockPointer> {
        self.finalized_at_height
            .get(&height)
            .map(|&idx| &self.arena[idx])
    }

    /// Lifecycle status of a hash, if known.
    pub fn status(&self, hash: &BlockHash) -> Option<BlockStatus> {
        self.statuses.get(hash).copied()
    }

    /// Arena index of an alive-or-finalized block.
    pub fn live_idx(&self, hash: &BlockHash) -> Option<BlockIdx> {
        match self.statuses.get(hash)? {
            BlockStatus::Alive(idx) => Some(*idx),
            BlockStatus::Finalized { idx, .. } => Some(*idx),
            _ => None,
        }
    }

    /// The focus block: the tip the transaction commit view follows.
    pub fn focus(&self) -> BlockIdx {
        self.focus
    }

    /// Inserts an executed block as alive under `parent`.
    pub fn insert_block(
        &mut self,
        block: Block,
        parent: BlockIdx,
        state: Arc<dyn ExecutionState>,
        birk: Arc<BirkParameters>,
        receive_time_ms: u64,
        arrive_time_ms: u64,
    ) -> BlockIdx {
        let hash = block.hash();
        let height = self.arena[parent].height + 1;
        let last_finalized = self.last_finalized;
        let idx = self.arena.len();
        self.arena.push(BlockPointer {
            hash,
            tx_count: block.transactions().len(),
            block: Arc::new(block),
            parent,
            last_finalized,
            height,
            state,
            receive_time_ms,
            arrive_time_ms,
            birk,
        });
        self.statuses.insert(hash, BlockStatus::Alive(idx));

        let level = (height - self.arena[self.last_finalized].height - 1) as usize;
        if level == self.branches.len() {
            self.branches.push_back(vec![idx]);
        } else {
            self.branches[level].push(idx);
        }
        self.focus = self.best_block();
        debug!(block = %hash.short(), height, "Block is alive");
        idx
    }

    /// Stores a block whose parent has not arrived.
    pub fn add_pending(&mut self, pending: PendingBlock) {
        let parent = pending
            .block
            .parent()
            .expect("pending blocks are never genesis");
        self.statuses.insert(
            pending.hash,
            BlockStatus::Pending {
                receive_time_ms: pending.receive_time_ms,
            },
        );
        self.pending_queue
            .push(Reverse((pending.block.slot(), pending.hash)));
        self.pending_children
            .entry(parent)
            .or_default()
            .push(pending.hash);
        self.pending_blocks.insert(pending.hash, pending);
    }

    /// Whether a hash is waiting in the pending store.
    pub fn is_pending(&self, hash: &BlockHash) -> bool {
        self.pending_blocks.contains_key(hash)
    }

    /// Removes and returns the children waiting on `parent`, in slot order.
    pub fn take_pending_children(&mut self, parent: &BlockHash) -> Vec<PendingBlock> {
        let hashes = self.pending_children.remove(parent).unwrap_or_default();
        let mut children: Vec<PendingBlock> = hashes
            .into_iter()
            .filter_map(|hash| {
                self.statuses.remove(&hash);
                self.pending_blocks.remove(&hash)
            })
            .collect();
        children.sort_by_key(|p| p.block.slot());
        children
    }

    /// Marks a hash dead (failed validation or dead parent) so replays are
    /// cheap duplicates.
    pub fn mark_dead(&mut self, hash: BlockHash) {
        self.statuses.insert(hash, BlockStatus::Dead);
    }

    /// Drops pending blocks whose slot is at or below the finalized
    /// horizon; they can never become alive.
    pub fn drop_stale_pending(&mut self) {
        let horizon = self.last_finalized_slot();
        while let Some(Reverse((slot, hash))) = self.pending_queue.peek().copied() {
            if slot > horizon {
                break;
            }
            self.pending_queue.pop();
            if let Some(pending) = self.pending_blocks.remove(&hash) {
                trace!(block = %hash.short(), slot, "Dropping stale pending block");
                self.statuses.insert(hash, BlockStatus::Dead);
                if let Some(parent) = pending.block.parent() {
                    if let Some(children) = self.pending_children.get_mut(&parent) {
                        children.retain(|h| *h != hash);
                    }
                }
            }
        }
    }

    /// The alive blocks at a given height.
    pub fn live_blocks_at_height(&self, height: BlockHeight) -> Vec<BlockIdx> {
        let lf_height = self.last_finalized().height;
        if height <= lf_height {
            return self
                .finalized_at_height
                .get(&height)
                .map(|&idx| vec![idx])
                .unwrap_or_default();
        }
        let level = (height - lf_height - 1) as usize;
        self.branches
            .get(level)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    /// The best block: among alive blocks at maximum height, the one with
    /// the lowest hash. Falls back to the last finalized block when no
    /// branch is alive.
    pub fn best_block(&self) -> BlockIdx {
        for level in self.branches.iter().rev() {
            if let Some(&best) = level
                .iter()
                .min_by_key(|&&idx| self.arena[idx].hash)
            {
                return best;
            }
        }
        self.last_finalized
    }

    /// The best block whose slot is strictly below `slot` (the baker's
    /// parent choice).
    pub fn best_block_before_slot(&self, slot: Slot) -> BlockIdx {
        for level in self.branches.iter().rev() {
            if let Some(&best) = level
                .iter()
                .filter(|&&idx| self.arena[idx].block.slot() < slot)
                .min_by_key(|&&idx| self.arena[idx].hash)
            {
                return best;
            }
        }
        self.last_finalized
    }

    /// Walks parent links to the ancestor of `idx` at `height`.
    pub fn ancestor_at_height(&self, mut idx: BlockIdx, height: BlockHeight) -> BlockIdx {
        while self.arena[idx].height > height {
            idx = self.arena[idx].parent;
        }
        idx
    }

    /// Whether `ancestor` lies on the parent chain of `descendant`.
    pub fn is_ancestor(&self, ancestor: BlockIdx, descendant: BlockIdx) -> bool {
        let height = self.arena[ancestor].height;
        self.arena[descendant].height >= height
            && self.ancestor_at_height(descendant, height) == ancestor
    }

    /// Promotes an alive block to finalized and prunes every branch that
    /// does not pass through it.
    ///
    /// Alive ancestors between the old and new last-finalized block are
    /// promoted as well (they share the record's index). Returns the
    /// promoted chain and the pruned blocks for transaction rollback.
    pub fn mark_finalized(
        &mut self,
        hash: &BlockHash,
        record: FinalizationRecord,
    ) -> Result<PruneOutcome, TreeError> {
        let idx = match self.statuses.get(hash) {
            Some(BlockStatus::Alive(idx)) => *idx,
            _ => return Err(TreeError::NotAlive(*hash)),
        };
        let expected = self.next_finalization_index();
        if record.index != expected {
            return Err(TreeError::NonSequentialFinalization {
                expected,
                got: record.index,
            });
        }

        let target_height = self.arena[idx].height;
        let old_lf_height = self.arena[self.last_finalized].height;

        // The chain being promoted, oldest first
        let mut chain = Vec::new();
        let mut cursor = idx;
        while cursor != self.last_finalized {
            chain.push(cursor);
            cursor = self.arena[cursor].parent;
        }
        chain.reverse();

        for &member in &chain {
            let member_hash = self.arena[member].hash;
            self.statuses.insert(
                member_hash,
                BlockStatus::Finalized {
                    idx: member,
                    record_index: record.index,
                },
            );
            self.finalized_at_height
                .insert(self.arena[member].height, member);
        }

        // Prune: below the new horizon only the promoted chain survives;
        // above it, only descendants of the new last-finalized block.
        let depth = (target_height - old_lf_height) as usize;
        let mut kept: Vec<BlockIdx> = Vec::new();
        let mut dead = Vec::new();
        let mut new_branches: VecDeque<Vec<BlockIdx>> = VecDeque::new();
        for (level_i, level) in self.branches.iter().enumerate() {
            let mut survivors = Vec::new();
            for &candidate in level {
                let keep = if level_i < depth {
                    chain[level_i] == candidate
                } else {
                    kept.contains(&self.arena[candidate].parent)
                        || (level_i == depth && self.arena[candidate].parent == idx)
                };
                if keep {
                    survivors.push(candidate);
                } else {
                    let candidate_hash = self.arena[candidate].hash;
                    self.statuses.insert(candidate_hash, BlockStatus::Dead);
                    dead.push((candidate_hash, Arc::clone(&self.arena[candidate].block)));
                }
            }
            if level_i >= depth {
                new_branches.push_back(survivors.clone());
            }
            kept = survivors;
            if level_i < depth {
                // On promoted levels the survivor is the chain member; its
                // children are judged against it
                kept = vec![chain[level_i]];
            }
        }
        // Trim empty tails left by pruning
        while new_branches.back().is_some_and(|level| level.is_empty()) {
            new_branches.pop_back();
        }
        self.branches = new_branches;
        self.last_finalized = idx;
        self.records.push(record);
        self.focus = self.best_block();
        self.drop_stale_pending();

        info!(
            block = %hash.short(),
            height = target_height,
            index = self.records.len() as u64 - 1,
            pruned = dead.len(),
            "Block finalized"
        );
        Ok(PruneOutcome {
            newly_finalized: chain,
            dead,
        })
    }
}
