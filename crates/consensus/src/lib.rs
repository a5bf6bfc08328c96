//! # Tessera Consensus
//!
//! The consensus and finalization core of the Tessera chain.
//!
//! A chain of baker-produced blocks grows through the per-slot VRF lottery
//! while, once per epoch stretch, the finalization committee runs a
//! Weighted Multi-Valued Byzantine Agreement (WMVBA) round that picks one
//! block and makes it irrevocable. This crate implements:
//!
//! - **Tree state** ([`tree`]) - the block store with its
//!   pending/alive/dead/finalized lifecycle, branches, and pruning
//! - **Transaction table** ([`transaction_table`]) - per-sender
//!   nonce-ordered pending transactions with the timed purge discipline
//! - **Leader election** ([`election`]) - the per-slot VRF lottery
//! - **Skov** ([`skov`]) - the consensus driver: receive, validate,
//!   execute, insert, bake, finalize
//! - **WMVBA** ([`freeze`], [`abba`], [`wmvba`]) - the per-round
//!   agreement state machine with weighted thresholds and equivocation
//!   handling
//! - **Finalization orchestration** ([`finalization`], [`fin_queue`],
//!   [`catchup`], [`buffer`]) - round scheduling, delta doubling, message
//!   buffering, catch-up replay and the record queue
//!
//! ## Threshold model
//!
//! All voting is weighted by stake. For committee weight `W` the
//! corruption bound is `⌊(W − 1) / 3⌋`; every protocol step advances at
//! `W − corrupt` weight, and a finalization proof is valid strictly above
//! `corrupt` weight.
//!
//! The crate itself is single-threaded: the embedding runner serializes
//! every mutation behind one consensus lock and performs the returned
//! [`ConsensusEvent`]s after releasing it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod abba;
pub mod buffer;
pub mod catchup;
pub mod committee;
pub mod election;
pub mod execution;
pub mod fin_queue;
pub mod finalization;
pub mod freeze;
pub mod messages;
pub mod skov;
pub mod transaction_table;
pub mod tree;
pub mod types;
pub mod updates;
pub mod wmvba;

// Re-export main types at crate root for convenience
pub use committee::{CommitteeError, FinalizationCommittee, FinalizationKeys, Party, PartyIndex};
pub use election::{BirkParameters, ElectionError, LotteryBaker};
pub use execution::{BlockExecutor, ChainMetadata, ExecutionOutcome, ExecutionState};
pub use finalization::{FinalizationSettings, FinalizationState};
pub use fin_queue::{FinalizationQueue, OutputWitnesses};
pub use messages::{
    CatchUpMessage, Delta, FailedRoundEvidence, FinalizationMessage, FinalizationMessageHeader,
    FinalizationSummary, Phase, WmvbaMessage,
};
pub use skov::{BakeOutcome, BakerCredentials, SkovData, SkovError, SkovState};
pub use transaction_table::{AddResult, TransactionStatus, TransactionTable};
pub use tree::{BlockIdx, BlockPointer, BlockStatus, PendingBlock, TreeError, TreeState};
pub use types::{ChainParameters, ConsensusEvent, UpdateResult};
pub use updates::{ProtocolUpdate, ProtocolUpdateQueue};
pub use wmvba::{WitnessTally, Wmvba, WmvbaOutput, WmvbaResult};
