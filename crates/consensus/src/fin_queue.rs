//! The finalization queue.
//!
//! Finalization records can outrun block delivery: a record may arrive (or
//! be assembled) before the block it finalizes. Such *unsettled* records
//! wait here, together with whatever witness-creator signatures have been
//! observed for their index, until block arrival lets them settle. Entries
//! are dropped once a later finalized block proves the index settled
//! everywhere.

use crate::committee::PartyIndex;
use std::collections::BTreeMap;
use tessera_types::{BlsSignatureBytes, FinalizationIndex, FinalizationRecord};
use tracing::{debug, trace};

/// Accumulated witness signatures for one index, kept even when the local
/// round did not finish.
#[derive(Debug, Default, Clone)]
pub struct OutputWitnesses {
    /// party → witness signature
    pub signatures: Vec<(PartyIndex, BlsSignatureBytes)>,
}

#[derive(Debug, Default)]
struct QueueEntry {
    record: Option<FinalizationRecord>,
    witnesses: OutputWitnesses,
}

/// Ordered queue of unsettled finalization records.
#[derive(Debug)]
pub struct FinalizationQueue {
    /// The smallest index that could still be unsettled
    first_index: FinalizationIndex,
    entries: BTreeMap<FinalizationIndex, QueueEntry>,
}

impl FinalizationQueue {
    /// Creates a queue whose first interesting index is `first_index`.
    pub fn new(first_index: FinalizationIndex) -> Self {
        Self {
            first_index,
            entries: BTreeMap::new(),
        }
    }

    /// The smallest index that could still be unsettled.
    pub fn first_index(&self) -> FinalizationIndex {
        self.first_index
    }

    /// Whether an index is at or past the queue's window.
    pub fn is_settled(&self, index: FinalizationIndex) -> bool {
        index < self.first_index
    }

    /// Stores an unsettled record. Returns false if the index is already
    /// settled or a record for it is already queued.
    pub fn add_record(&mut self, record: FinalizationRecord) -> bool {
        if record.index < self.first_index {
            return false;
        }
        let entry = self.entries.entry(record.index).or_default();
        if entry.record.is_some() {
            return false;
        }
        debug!(index = record.index, block = %record.block.short(), "Queued unsettled finalization record");
        entry.record = Some(record);
        true
    }

    /// The queued record for an index, if any.
    pub fn record(&self, index: FinalizationIndex) -> Option<&FinalizationRecord> {
        self.entries.get(&index).and_then(|e| e.record.as_ref())
    }

    /// Accumulates a witness signature for an unsettled index. Returns
    /// false if the index is settled or the party already contributed.
    pub fn add_witness(
        &mut self,
        index: FinalizationIndex,
        party: PartyIndex,
        signature: BlsSignatureBytes,
    ) -> bool {
        if index < self.first_index {
            return false;
        }
        let entry = self.entries.entry(index).or_default();
        if entry
            .witnesses
            .signatures
            .iter()
            .any(|(p, _)| *p == party)
        {
            return false;
        }
        trace!(index, party, "Accumulated output witness");
        entry.witnesses.signatures.push((party, signature));
        true
    }

    /// The accumulated witnesses for an index.
    pub fn witnesses(&self, index: FinalizationIndex) -> Option<&OutputWitnesses> {
        self.entries.get(&index).map(|e| &e.witnesses)
    }

    /// Queued records whose block might match `hash`, for retry on block
    /// arrival.
    pub fn records_for_block(
        &self,
        hash: &tessera_types::BlockHash,
    ) -> Vec<FinalizationRecord> {
        self.entries
            .values()
            .filter_map(|e| e.record.as_ref())
            .filter(|r| r.block == *hash)
            .cloned()
            .collect()
    }

    /// Advances the settled horizon: every index up to and including
    /// `settled` is dropped.
    pub fn advance(&mut self, settled: FinalizationIndex) {
        if settled + 1 > self.first_index {
            self.first_index = settled + 1;
            self.entries = self.entries.split_off(&self.first_index);
        }
    }
}
