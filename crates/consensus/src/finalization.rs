//! The finalization orchestrator.
//!
//! Drives one WMVBA round at a time: schedules the target height and delta
//! for each finalization index, buffers out-of-round messages, folds
//! catch-up summaries, assembles finalization records from round results
//! and reconciles records with block arrival through the finalization
//! queue. Nodes outside the committee run a passive witness aggregator
//! instead of an active round.

use crate::buffer::OutputBuffer;
use crate::catchup::{CatchUpResult, CatchUpState};
use crate::committee::{FinalizationCommittee, FinalizationKeys, PartyIndex};
use crate::fin_queue::FinalizationQueue;
use crate::messages::{
    make_baid, witness_message, CatchUpMessage, Delta, FailedRoundEvidence, FinalizationMessage,
    FinalizationMessageHeader, FinalizationSummary, WmvbaMessage,
};
use crate::skov::SkovData;
use crate::types::ConsensusEvent;
use crate::wmvba::{WitnessTally, Wmvba, WmvbaOutput, WmvbaResult};
use crate::UpdateResult;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tessera_types::{
    BlockHash, BlockHeight, BlsSignatureBytes, Deserial, FinalizationIndex, FinalizationProof,
    FinalizationRecord, Hash, Serial,
};
use tessera_crypto::BlsSignature;
use tracing::{debug, error, info, trace, warn};

/// Timing knobs for the orchestrator (mapped from node configuration).
#[derive(Debug, Clone)]
pub struct FinalizationSettings {
    /// Base delay before a round's catch-up replay, ms
    pub replay_base_delay_ms: u64,
    /// Additional replay delay per committee member per attempt, ms
    pub replay_per_party_ms: u64,
    /// Upper bound on Seen buffering, ms
    pub seen_max_delay_ms: u64,
    /// Seen buffering step, ms
    pub seen_delay_step_ms: u64,
    /// Catch-up signature de-dup window, ms
    pub dedup_window_ms: u64,
}

impl Default for FinalizationSettings {
    fn default() -> Self {
        Self {
            replay_base_delay_ms: 300,
            replay_per_party_ms: 50,
            seen_max_delay_ms: 10_000,
            seen_delay_step_ms: 1_000,
            dedup_window_ms: 60_000,
        }
    }
}

/// The current round: active (committee member) or passive (observer).
enum FinalizationRound {
    /// Aggregate witness signatures per delta without voting
    Passive(HashMap<Delta, WitnessTally>),
    /// A live WMVBA instance
    Active(Wmvba),
}

/// Per-index, per-round finalization state.
pub struct FinalizationState {
    /// Session id: the genesis block hash
    session: Hash,
    committee: Arc<FinalizationCommittee>,
    keys: Option<Arc<FinalizationKeys>>,
    /// Our committee index, if we are a member
    me: Option<PartyIndex>,

    current_index: FinalizationIndex,
    target_height: BlockHeight,
    round_delta: Delta,
    round: FinalizationRound,
    nominated: bool,

    /// Evidence per failed round of the current index, newest first
    failed_rounds: Vec<FailedRoundEvidence>,
    /// index → delta → dedup hash → message
    pending: BTreeMap<FinalizationIndex, BTreeMap<Delta, HashMap<Hash, FinalizationMessage>>>,
    queue: FinalizationQueue,
    catch_up: CatchUpState,
    buffer: OutputBuffer,
    settings: FinalizationSettings,
    min_skip: u64,
}

impl FinalizationState {
    /// Creates the orchestrator at index 1 over a fresh tree.
    pub fn new(
        session: Hash,
        committee: Arc<FinalizationCommittee>,
        keys: Option<Arc<FinalizationKeys>>,
        my_baker_id: Option<tessera_types::BakerId>,
        min_skip: u64,
        settings: FinalizationSettings,
    ) -> Self {
        let me = my_baker_id.and_then(|id| committee.party_of_baker(id));
        let mut state = Self {
            session,
            committee,
            keys,
            me,
            current_index: 1,
            target_height: 0,
            round_delta: 1,
            round: FinalizationRound::Passive(HashMap::new()),
            nominated: false,
            failed_rounds: Vec::new(),
            pending: BTreeMap::new(),
            queue: FinalizationQueue::new(1),
            catch_up: CatchUpState::new(settings.dedup_window_ms),
            buffer: OutputBuffer::new(settings.seen_max_delay_ms, settings.seen_delay_step_ms),
            settings,
            min_skip,
        };
        state.target_height = state.height_for_index(0, 0);
        state.round = state.make_round();
        state
    }

    /// Our committee index, if we are a member.
    pub fn party_index(&self) -> Option<PartyIndex> {
        self.me
    }

    /// The index the orchestrator is currently working on.
    pub fn current_index(&self) -> FinalizationIndex {
        self.current_index
    }

    /// The block height the current index targets.
    pub fn target_height(&self) -> BlockHeight {
        self.target_height
    }

    /// The delta of the current round.
    pub fn round_delta(&self) -> Delta {
        self.round_delta
    }

    /// `H(i) = H(i−1) + max(1 + min_skip, ⌊gap/2⌋)` where gap is the
    /// best-block lead over the last finalized block.
    fn height_for_index(&self, last_finalized_height: BlockHeight, gap: BlockHeight) -> BlockHeight {
        last_finalized_height + (1 + self.min_skip).max(gap / 2)
    }

    fn make_round(&self) -> FinalizationRound {
        match (self.me, self.keys.clone()) {
            (Some(me), Some(keys)) => FinalizationRound::Active(Wmvba::new(
                make_baid(&self.session, self.current_index, self.round_delta),
                Arc::clone(&self.committee),
                Some(me),
                Some(keys),
            )),
            _ => FinalizationRound::Passive(HashMap::new()),
        }
    }

    /// Starts (or restarts) the current round: justify the alive inputs,
    /// replay buffered messages, nominate if the tree is deep enough, and
    /// arm the replay timer.
    pub fn start_round(&mut self, data: &mut SkovData, now_ms: u64) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();
        debug!(
            index = self.current_index,
            delta = self.round_delta,
            target = self.target_height,
            active = matches!(self.round, FinalizationRound::Active(_)),
            "Starting finalization round"
        );
        self.nominated = false;

        if let FinalizationRound::Active(_) = self.round {
            // Justify the ancestor at the target height of every alive
            // block delta levels above it
            let eligible = data.tree.live_blocks_at_height(self.target_height + self.round_delta);
            let mut outputs = Vec::new();
            for idx in eligible {
                let ancestor = data.tree.ancestor_at_height(idx, self.target_height);
                let hash = data.tree.pointer(ancestor).hash;
                if let FinalizationRound::Active(wmvba) = &mut self.round {
                    outputs.extend(wmvba.justify_input(hash));
                }
            }
            events.extend(self.run_active(data, outputs, now_ms));
            events.extend(self.try_nominate(data, now_ms));
        }

        // Replay buffered messages for this exact round
        let replayable: Vec<FinalizationMessage> = self
            .pending
            .get(&self.current_index)
            .and_then(|by_delta| by_delta.get(&self.round_delta))
            .map(|msgs| msgs.values().cloned().collect())
            .unwrap_or_default();
        for message in replayable {
            events.extend(self.feed_current(message, data, now_ms));
        }

        let deadline_ms = self.catch_up.next_deadline(
            now_ms,
            self.settings.replay_base_delay_ms,
            self.settings.replay_per_party_ms,
            self.committee.len() as u64,
        );
        events.push(ConsensusEvent::ResetReplayTimer { deadline_ms });
        events
    }

    /// Nominates the best block's ancestor at the target height once the
    /// best block is delta levels past it.
    fn try_nominate(&mut self, data: &mut SkovData, now_ms: u64) -> Vec<ConsensusEvent> {
        if self.nominated {
            return Vec::new();
        }
        let best = data.tree.best_block();
        if data.tree.pointer(best).height < self.target_height + self.round_delta {
            return Vec::new();
        }
        let nominee_idx = data.tree.ancestor_at_height(best, self.target_height);
        let nominee = data.tree.pointer(nominee_idx).hash;
        self.nominated = true;
        let outputs = match &mut self.round {
            FinalizationRound::Active(wmvba) => {
                let mut outputs = wmvba.justify_input(nominee);
                outputs.extend(wmvba.start(nominee));
                outputs
            }
            FinalizationRound::Passive(_) => Vec::new(),
        };
        self.run_active(data, outputs, now_ms)
    }

    /// Processes WMVBA outputs: sign and emit messages (looping our own
    /// back in) and handle round completion.
    fn run_active(
        &mut self,
        data: &mut SkovData,
        seeds: Vec<WmvbaOutput>,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();
        let mut queue: VecDeque<WmvbaOutput> = seeds.into();
        // Completion is handled only after the queue drains: every message
        // still in flight must carry the round it was produced in.
        let mut completion = None;
        while let Some(output) = queue.pop_front() {
            match output {
                WmvbaOutput::SendMessage(message) => {
                    let (Some(me), Some(keys)) = (self.me, self.keys.clone()) else {
                        continue;
                    };
                    let header = FinalizationMessageHeader {
                        session: self.session,
                        index: self.current_index,
                        delta: self.round_delta,
                        sender: me,
                    };
                    let signed =
                        FinalizationMessage::sign(header, message.clone(), &keys.sign);

                    match &message {
                        WmvbaMessage::CssSeen { .. } => {
                            if let Some(deadline_ms) =
                                self.buffer.buffer_seen(signed.clone(), now_ms)
                            {
                                events.push(ConsensusEvent::BufferDeadline { deadline_ms });
                            }
                        }
                        WmvbaMessage::CssDoneReporting { phase, .. } => {
                            if let Some(seen) = self.buffer.flush_for_done_reporting(
                                self.current_index,
                                self.round_delta,
                                *phase,
                            ) {
                                events.push(ConsensusEvent::BroadcastFinalizationMessage(
                                    seen.to_bytes(),
                                ));
                            }
                            events.push(ConsensusEvent::BroadcastFinalizationMessage(
                                signed.to_bytes(),
                            ));
                        }
                        _ => {
                            events.push(ConsensusEvent::BroadcastFinalizationMessage(
                                signed.to_bytes(),
                            ));
                        }
                    }

                    // Our own message also drives our round
                    if let FinalizationRound::Active(wmvba) = &mut self.round {
                        queue.extend(wmvba.receive(me, message, signed.signature));
                    }
                }
                WmvbaOutput::Complete(result) => {
                    completion = Some(result);
                }
            }
        }
        if let Some(result) = completion {
            events.extend(self.on_round_complete(result, data, now_ms));
        }
        events
    }

    /// Handles round completion: a failed round doubles delta and retries;
    /// a successful one yields a record.
    fn on_round_complete(
        &mut self,
        result: Option<WmvbaResult>,
        data: &mut SkovData,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        match result {
            None => {
                let signatures = match &self.round {
                    FinalizationRound::Active(wmvba) => wmvba.done_false_signatures(),
                    FinalizationRound::Passive(_) => Vec::new(),
                };
                info!(
                    index = self.current_index,
                    delta = self.round_delta,
                    "Finalization round failed; doubling delta"
                );
                self.failed_rounds.insert(
                    0,
                    FailedRoundEvidence {
                        delta: self.round_delta,
                        signatures,
                    },
                );
                self.round_delta *= 2;
                self.round = self.make_round();
                self.start_round(data, now_ms)
            }
            Some(result) => {
                let record = FinalizationRecord {
                    index: self.current_index,
                    block: result.value,
                    proof: FinalizationProof {
                        parties: result.parties,
                        signature: result.aggregate,
                    },
                    delay: self.round_delta,
                };
                let mut events = vec![ConsensusEvent::BroadcastFinalizationRecord(
                    record.to_bytes(),
                )];
                events.extend(self.trusted_finalize(record, data, now_ms));
                events
            }
        }
    }

    /// Applies a record we trust (assembled locally or proof-verified): if
    /// its block is alive, finalize now; otherwise park it in the queue
    /// until the block arrives.
    pub fn trusted_finalize(
        &mut self,
        record: FinalizationRecord,
        data: &mut SkovData,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        use crate::tree::BlockStatus;
        match data.tree.status(&record.block) {
            Some(BlockStatus::Alive(_)) => {
                let index = record.index;
                let hash = record.block;
                match data.finalize_block(record) {
                    Ok(()) => {
                        let mut events = vec![ConsensusEvent::BlockFinalized { hash, index }];
                        if let Some(update) = data.promote_protocol_updates() {
                            events.push(ConsensusEvent::Regenesis {
                                payload: update.payload,
                            });
                        }
                        events.extend(self.notify_block_finalized(index, data, now_ms));
                        events
                    }
                    Err(err) => {
                        // Only internal bugs reach here; the state is
                        // still consistent under the lock.
                        error!(error = %err, "Finalization failed");
                        panic!("invariant violation: {err}");
                    }
                }
            }
            Some(BlockStatus::Finalized { .. }) => Vec::new(),
            Some(BlockStatus::Dead) => {
                error!(block = %record.block.short(), "Finalization record for a pruned block");
                panic!("invariant violation: finalization record for a dead block");
            }
            Some(BlockStatus::Pending { .. }) | None => {
                self.queue.add_record(record);
                Vec::new()
            }
        }
    }

    /// Advances to the next index after a block was finalized.
    fn notify_block_finalized(
        &mut self,
        index: FinalizationIndex,
        data: &mut SkovData,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        // Drain everything tied to the settled index
        self.pending.remove(&index);
        self.buffer.clear_index(index);
        self.queue.advance(index);
        self.catch_up.reset();
        self.failed_rounds.clear();

        self.current_index = index + 1;
        let record = data
            .tree
            .record(index)
            .expect("settled record exists")
            .clone();
        self.round_delta = if record.delay > 2 {
            (record.delay / 2).max(1)
        } else {
            1
        };

        let lf_height = data.tree.last_finalized().height;
        let best_height = data.tree.pointer(data.tree.best_block()).height;
        self.target_height = self.height_for_index(lf_height, best_height - lf_height);

        // The committee is recomputed from the newly finalized state; the
        // roster is genesis-fixed, so this is a re-derivation of the same
        // weights.
        self.round = self.make_round();
        let mut events = self.start_round(data, now_ms);

        // A record for the new index may already be waiting in the queue
        if let Some(record) = self.queue.record(self.current_index).cloned() {
            if data.tree.live_idx(&record.block).is_some() {
                events.extend(self.trusted_finalize(record, data, now_ms));
            }
        }
        events
    }

    /// Ingress: a finalization message from a peer.
    pub fn receive_message(
        &mut self,
        bytes: &[u8],
        data: &mut SkovData,
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        let Ok(message) = FinalizationMessage::from_bytes(bytes) else {
            return (UpdateResult::SerializationFail, Vec::new());
        };

        if message.header.session != self.session {
            return (UpdateResult::IncorrectSession, Vec::new());
        }

        let index = message.header.index;
        if index < self.current_index {
            // Old index: only useful as a witness for a still-unsettled
            // record
            if !self.queue.is_settled(index) {
                if let WmvbaMessage::WitnessCreator { value, signature } = &message.message {
                    if self.verify_envelope(&message)
                        && self.verify_witness_signature(index, message.header.delta, value, message.header.sender, signature)
                    {
                        self.queue
                            .add_witness(index, message.header.sender, *signature);
                        return (UpdateResult::Success, Vec::new());
                    }
                }
            }
            return (UpdateResult::Stale, Vec::new());
        }

        if index > self.current_index + 1 {
            return (UpdateResult::Invalid, Vec::new());
        }

        if !self.verify_envelope(&message) {
            return (UpdateResult::Invalid, Vec::new());
        }

        // Buffer (for the next index, or for replay within this one)
        let slot = self
            .pending
            .entry(index)
            .or_default()
            .entry(message.header.delta)
            .or_default();
        if slot.insert(message.dedup_hash(), message.clone()).is_some() {
            return (UpdateResult::Duplicate, Vec::new());
        }

        if index == self.current_index + 1 {
            trace!(index, "Buffered message for the next finalization index");
            return (UpdateResult::PendingFinalization, Vec::new());
        }

        let unknown_value = self.references_unknown_block(&message, data);
        let events = self.feed_current(message, data, now_ms);
        if unknown_value {
            (UpdateResult::PendingBlock, events)
        } else {
            (UpdateResult::Success, events)
        }
    }

    fn verify_envelope(&self, message: &FinalizationMessage) -> bool {
        match self.committee.party(message.header.sender) {
            Some(party) => message.verify(&party.sign_key),
            None => false,
        }
    }

    fn verify_witness_signature(
        &self,
        index: FinalizationIndex,
        delta: Delta,
        value: &BlockHash,
        sender: PartyIndex,
        signature: &BlsSignatureBytes,
    ) -> bool {
        let Some(party) = self.committee.party(sender) else {
            return false;
        };
        let Ok(parsed) = BlsSignature::from_bytes(signature) else {
            return false;
        };
        let baid = make_baid(&self.session, index, delta);
        parsed.verify(&witness_message(&baid, value), &party.bls_key)
    }

    fn references_unknown_block(&self, message: &FinalizationMessage, data: &SkovData) -> bool {
        let value = match &message.message {
            WmvbaMessage::Proposal(value) => Some(*value),
            WmvbaMessage::Vote(Some(value)) => Some(*value),
            WmvbaMessage::WitnessCreator { value, .. } => Some(*value),
            _ => None,
        };
        match value {
            Some(value) => data.tree.live_idx(&value).is_none(),
            None => false,
        }
    }

    /// Feeds a verified current-index message into the round.
    fn feed_current(
        &mut self,
        message: FinalizationMessage,
        data: &mut SkovData,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        // A round completing mid-replay advances the index; anything still
        // queued for the old index must not leak into the new round.
        if message.header.index != self.current_index {
            return Vec::new();
        }
        let delta = message.header.delta;
        if matches!(self.round, FinalizationRound::Active(_)) {
            if delta != self.round_delta {
                // Kept buffered; replayed if delta doubling reaches it
                return Vec::new();
            }
            let outputs = match &mut self.round {
                FinalizationRound::Active(wmvba) => wmvba.receive(
                    message.header.sender,
                    message.message.clone(),
                    message.signature,
                ),
                FinalizationRound::Passive(_) => Vec::new(),
            };
            self.run_active(data, outputs, now_ms)
        } else {
            let WmvbaMessage::WitnessCreator { value, signature } = message.message else {
                return Vec::new();
            };
            if !self.verify_witness_signature(
                message.header.index,
                delta,
                &value,
                message.header.sender,
                &signature,
            ) {
                return Vec::new();
            }
            let weight = self.committee.weight(message.header.sender);
            let corrupt = self.committee.corrupt_weight();
            let completed = match &mut self.round {
                FinalizationRound::Passive(tallies) => tallies
                    .entry(delta)
                    .or_default()
                    .add(message.header.sender, weight, value, signature, corrupt),
                FinalizationRound::Active(_) => None,
            };
            let Some(result) = completed else {
                return Vec::new();
            };
            debug!(index = self.current_index, "Passive witness aggregation completed");
            let record = FinalizationRecord {
                index: self.current_index,
                block: result.value,
                proof: FinalizationProof {
                    parties: result.parties,
                    signature: result.aggregate,
                },
                delay: delta,
            };
            let mut events = vec![ConsensusEvent::BroadcastFinalizationRecord(
                record.to_bytes(),
            )];
            events.extend(self.trusted_finalize(record, data, now_ms));
            events
        }
    }

    /// Ingress: a finalization record from a peer (or a block import).
    pub fn receive_record(
        &mut self,
        bytes: &[u8],
        data: &mut SkovData,
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        let Ok(record) = FinalizationRecord::from_bytes(bytes) else {
            return (UpdateResult::SerializationFail, Vec::new());
        };

        let expected = data.tree.next_finalization_index();
        if record.index < expected {
            return (UpdateResult::Stale, Vec::new());
        }

        if !self.verify_record_proof(&record) {
            return (UpdateResult::Invalid, Vec::new());
        }

        if record.index > expected {
            // Cannot apply out of order; hold it for later arrivals
            self.queue.add_record(record);
            return (UpdateResult::PendingFinalization, Vec::new());
        }

        let known = data.tree.live_idx(&record.block).is_some();
        let events = self.trusted_finalize(record, data, now_ms);
        if known {
            (UpdateResult::Success, events)
        } else {
            (UpdateResult::PendingBlock, events)
        }
    }

    /// Verifies a record's aggregate BLS proof and quorum weight.
    pub fn verify_record_proof(&self, record: &FinalizationRecord) -> bool {
        let mut weight = 0u64;
        let mut keys = Vec::with_capacity(record.proof.parties.len());
        for &party_index in &record.proof.parties {
            let Some(party) = self.committee.party(party_index) else {
                return false;
            };
            weight += party.weight;
            keys.push(&party.bls_key);
        }
        if weight <= self.committee.corrupt_weight() {
            return false;
        }
        let Ok(aggregate) = BlsSignature::from_bytes(&record.proof.signature) else {
            return false;
        };
        let baid = make_baid(&self.session, record.index, record.delay);
        aggregate.verify_aggregate(&witness_message(&baid, &record.block), &keys)
    }

    /// A block became alive: justify what it unlocks, retry queued records
    /// waiting on it, and nominate if the tree is now deep enough.
    pub fn notify_block_arrival(
        &mut self,
        hash: BlockHash,
        data: &mut SkovData,
        now_ms: u64,
    ) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();

        // Records waiting for exactly this block
        for record in self.queue.records_for_block(&hash) {
            if record.index == data.tree.next_finalization_index() {
                events.extend(self.trusted_finalize(record, data, now_ms));
            }
        }

        if let FinalizationRound::Active(_) = self.round {
            if let Some(idx) = data.tree.live_idx(&hash) {
                let height = data.tree.pointer(idx).height;
                if height >= self.target_height + self.round_delta {
                    let ancestor = data.tree.ancestor_at_height(idx, self.target_height);
                    let ancestor_hash = data.tree.pointer(ancestor).hash;
                    let outputs = match &mut self.round {
                        FinalizationRound::Active(wmvba) => wmvba.justify_input(ancestor_hash),
                        FinalizationRound::Passive(_) => Vec::new(),
                    };
                    events.extend(self.run_active(data, outputs, now_ms));
                }
            }
            events.extend(self.try_nominate(data, now_ms));
        }
        events
    }

    /// Builds our current summary for catch-up.
    pub fn build_summary(&self) -> FinalizationSummary {
        let messages = match &self.round {
            FinalizationRound::Active(wmvba) => wmvba
                .summary_messages()
                .into_iter()
                .map(|(party, message, signature)| FinalizationMessage {
                    header: FinalizationMessageHeader {
                        session: self.session,
                        index: self.current_index,
                        delta: self.round_delta,
                        sender: party,
                    },
                    message,
                    signature,
                })
                .collect(),
            FinalizationRound::Passive(_) => Vec::new(),
        };
        FinalizationSummary {
            failed_rounds: self.failed_rounds.clone(),
            messages,
        }
    }

    /// The replay timer fired: rebroadcast our summary and re-arm.
    pub fn on_replay_timer(&mut self, generation: u64, now_ms: u64) -> Vec<ConsensusEvent> {
        if generation != self.catch_up.generation {
            // A newer round reset the timer; this firing is stale
            return Vec::new();
        }
        let (Some(me), Some(keys)) = (self.me, self.keys.clone()) else {
            return Vec::new();
        };
        self.catch_up.attempts += 1;
        let message = CatchUpMessage::sign(
            self.session,
            self.current_index,
            me,
            self.build_summary(),
            &keys.sign,
        );
        debug!(
            index = self.current_index,
            attempts = self.catch_up.attempts,
            "Replaying finalization summary"
        );
        let deadline_ms = self.catch_up.next_deadline(
            now_ms,
            self.settings.replay_base_delay_ms,
            self.settings.replay_per_party_ms,
            self.committee.len() as u64,
        );
        vec![
            ConsensusEvent::BroadcastCatchUpStatus(message.to_bytes()),
            ConsensusEvent::ResetReplayTimer { deadline_ms },
        ]
    }

    /// The timer generation for arming replay timers.
    pub fn replay_generation(&self) -> u64 {
        self.catch_up.generation
    }

    /// Ingress: a peer's catch-up status.
    pub fn receive_catch_up(
        &mut self,
        bytes: &[u8],
        data: &mut SkovData,
        now_ms: u64,
    ) -> (UpdateResult, Vec<ConsensusEvent>) {
        let Ok(message) = CatchUpMessage::from_bytes(bytes) else {
            return (UpdateResult::SerializationFail, Vec::new());
        };
        if message.session != self.session {
            return (UpdateResult::IncorrectSession, Vec::new());
        }
        // A status we cannot check against the committee we know
        let Some(party) = self.committee.party(message.sender) else {
            return (UpdateResult::Unverifiable, Vec::new());
        };
        if !message.verify(&party.sign_key) {
            return (UpdateResult::Unverifiable, Vec::new());
        }
        if !self
            .catch_up
            .fresh_signature(now_ms, Hash::sha256(message.signature.as_bytes()))
        {
            return (UpdateResult::Duplicate, Vec::new());
        }

        if message.index < self.current_index {
            // The sender is behind: hand it the records (and blocks) it is
            // missing, point-to-point
            let mut events = Vec::new();
            for record in data.tree.records_from(message.index) {
                if let Some(idx) = data.tree.live_idx(&record.block) {
                    events.push(ConsensusEvent::DirectedBlock(
                        data.tree.pointer(idx).block.to_bytes(),
                    ));
                }
                events.push(ConsensusEvent::DirectedFinalizationRecord(record.to_bytes()));
            }
            debug!(peer_index = message.index, "Peer is behind; sending records");
            return (UpdateResult::Success, events);
        }

        if message.index > self.current_index {
            // We are behind; the peer layer should fetch from this peer
            return (UpdateResult::ContinueCatchUp, Vec::new());
        }

        let result = self.process_summary(message.summary, data, now_ms);
        let outcome = if result.0.skov_catch_up_needed {
            UpdateResult::ContinueCatchUp
        } else {
            UpdateResult::Success
        };
        (outcome, result.1)
    }

    /// Folds a peer's summary into our round.
    fn process_summary(
        &mut self,
        summary: FinalizationSummary,
        data: &mut SkovData,
        now_ms: u64,
    ) -> (CatchUpResult, Vec<ConsensusEvent>) {
        let mut events = Vec::new();
        let mut unknown_blocks = false;

        // Failed-round evidence: verify the senders really signed
        // WeAreDone(false) at those deltas and absorb any we were missing
        for evidence in &summary.failed_rounds {
            for (party_index, signature) in &evidence.signatures {
                let Some(party) = self.committee.party(*party_index) else {
                    continue;
                };
                let probe = FinalizationMessage {
                    header: FinalizationMessageHeader {
                        session: self.session,
                        index: self.current_index,
                        delta: evidence.delta,
                        sender: *party_index,
                    },
                    message: WmvbaMessage::WeAreDone(false),
                    signature: *signature,
                };
                if !probe.verify(&party.sign_key) {
                    warn!(party = party_index, "Bad failed-round signature in summary");
                    continue;
                }
                if evidence.delta == self.round_delta {
                    events.extend(self.feed_current(probe, data, now_ms));
                }
            }
        }

        let behind = summary
            .failed_rounds
            .first()
            .is_some_and(|newest| newest.delta >= self.round_delta);

        for message in summary.messages {
            if message.header.session != self.session
                || message.header.index != self.current_index
            {
                continue;
            }
            if !self.verify_envelope(&message) {
                continue;
            }
            if self.references_unknown_block(&message, data) {
                unknown_blocks = true;
            }
            let slot = self
                .pending
                .entry(message.header.index)
                .or_default()
                .entry(message.header.delta)
                .or_default();
            if slot.insert(message.dedup_hash(), message.clone()).is_some() {
                continue;
            }
            events.extend(self.feed_current(message, data, now_ms));
        }

        (
            CatchUpResult {
                behind,
                skov_catch_up_needed: unknown_blocks,
            },
            events,
        )
    }

    /// The Seen buffer's flush deadline passed: send what is due.
    pub fn flush_seen_buffer(&mut self, now_ms: u64) -> Vec<ConsensusEvent> {
        let mut events: Vec<ConsensusEvent> = self
            .buffer
            .take_due(now_ms)
            .into_iter()
            .map(|message| ConsensusEvent::BroadcastFinalizationMessage(message.to_bytes()))
            .collect();
        if let Some(deadline_ms) = self.buffer.next_deadline() {
            events.push(ConsensusEvent::BufferDeadline { deadline_ms });
        }
        events
    }
}
