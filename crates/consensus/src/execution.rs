//! The execution-layer seam.
//!
//! Block execution (account balances, contract evaluation, minting) is an
//! external collaborator. The consensus core calls it as a pure function
//! of `(parent state, transactions, chain metadata)` and stores only the
//! opaque state handles it returns.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use tessera_types::{BlockHeight, Energy, GenesisData, Slot, Transaction, TransactionHash};

/// An opaque post-execution block state handle.
pub trait ExecutionState: Send + Sync + Debug {
    /// Downcast support for the concrete execution layer.
    fn as_any(&self) -> &dyn Any;
}

/// Context the scheduler sees about the block being executed.
#[derive(Debug, Clone, Copy)]
pub struct ChainMetadata {
    /// The block's slot
    pub slot: Slot,
    /// The block's height
    pub height: BlockHeight,
}

/// What the scheduler produced for one block.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Per-transaction acceptance, in block order
    pub results: Vec<(TransactionHash, bool)>,
    /// The post-execution state
    pub new_state: Arc<dyn ExecutionState>,
    /// Total energy charged
    pub energy_used: Energy,
    /// Transactions that failed outright
    pub failed: Vec<TransactionHash>,
    /// Transactions the scheduler did not reach
    pub unprocessed: Vec<TransactionHash>,
}

/// The deterministic transaction scheduler.
pub trait BlockExecutor: Send {
    /// The state of the chain before any block is executed.
    fn genesis_state(&self, genesis: &GenesisData) -> Arc<dyn ExecutionState>;

    /// Executes a block's transactions against its parent's state.
    ///
    /// Must be a pure function of its arguments; an `Err` means the block
    /// is invalid (not that the node is broken).
    fn execute(
        &self,
        parent_state: &Arc<dyn ExecutionState>,
        transactions: &[Transaction],
        meta: &ChainMetadata,
    ) -> Result<ExecutionOutcome, String>;
}
