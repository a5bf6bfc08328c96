//! The WMVBA round driver: Freeze → ABBA → witness aggregation.
//!
//! One [`Wmvba`] instance runs a single finalization round, identified by
//! its `baid` (`session ‖ index ‖ delta`). It owns the freeze and ABBA
//! sub-states, detects equivocation, buffers future-phase messages, and
//! aggregates BLS witness signatures once ABBA decides there is a freeze
//! value.
//!
//! Equivocation: two distinct messages of the same kind from the same party
//! are both recorded; the party's weight is ignored for justification
//! thereafter, but its signatures remain usable in failure witnessing.

use crate::abba::{AbbaOutput, AbbaState};
use crate::committee::{FinalizationCommittee, FinalizationKeys, PartyIndex};
use crate::freeze::{FreezeOutput, FreezeState};
use crate::messages::{ticket_input, witness_message, MessageKind, WmvbaMessage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tessera_crypto::{BlsSignature, VrfProof};
use tessera_types::{BlockHash, BlsSignatureBytes, SignatureBytes};
use tracing::{debug, trace, warn};

/// The product of a successful round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WmvbaResult {
    /// The agreed block hash
    pub value: BlockHash,
    /// Witnessing parties, strictly ascending
    pub parties: Vec<PartyIndex>,
    /// Aggregate of their witness signatures
    pub aggregate: BlsSignatureBytes,
}

/// An action the round driver asks the orchestrator to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmvbaOutput {
    /// Broadcast a WMVBA message (orchestrator wraps and signs it)
    SendMessage(WmvbaMessage),
    /// The round completed: agreement, or `None` for a failed round
    Complete(Option<WmvbaResult>),
}

/// Collects witness-creator signatures per candidate value until one value
/// clears the corruption bound. Shared between active rounds and the
/// passive aggregator.
#[derive(Debug, Default)]
pub struct WitnessTally {
    /// value → party → (signature, weight)
    sigs: HashMap<BlockHash, BTreeMap<PartyIndex, (BlsSignatureBytes, u64)>>,
}

impl WitnessTally {
    /// Records a verified witness signature. Returns the completed result
    /// if this signature pushes its value strictly past `corrupt_weight`.
    pub fn add(
        &mut self,
        party: PartyIndex,
        weight: u64,
        value: BlockHash,
        signature: BlsSignatureBytes,
        corrupt_weight: u64,
    ) -> Option<WmvbaResult> {
        let entry = self.sigs.entry(value).or_default();
        if entry.contains_key(&party) {
            return None;
        }
        entry.insert(party, (signature, weight));
        let total: u64 = entry.values().map(|(_, w)| *w).sum();
        if total > corrupt_weight {
            Self::assemble(value, entry)
        } else {
            None
        }
    }

    fn assemble(
        value: BlockHash,
        entry: &BTreeMap<PartyIndex, (BlsSignatureBytes, u64)>,
    ) -> Option<WmvbaResult> {
        let mut parsed = Vec::with_capacity(entry.len());
        for (signature, _) in entry.values() {
            parsed.push(BlsSignature::from_bytes(signature).ok()?);
        }
        let refs: Vec<&BlsSignature> = parsed.iter().collect();
        let aggregate = BlsSignature::aggregate(&refs).ok()?;
        Some(WmvbaResult {
            value,
            parties: entry.keys().copied().collect(),
            aggregate: aggregate.to_bytes(),
        })
    }

    /// The signatures collected so far for a value.
    pub fn witnesses(&self, value: &BlockHash) -> Vec<(PartyIndex, BlsSignatureBytes)> {
        self.sigs
            .get(value)
            .map(|entry| entry.iter().map(|(p, (s, _))| (*p, *s)).collect())
            .unwrap_or_default()
    }
}

/// State of one WMVBA round.
pub struct Wmvba {
    baid: Vec<u8>,
    committee: Arc<FinalizationCommittee>,
    me: Option<PartyIndex>,
    keys: Option<Arc<FinalizationKeys>>,

    freeze: FreezeState,
    abba: AbbaState,
    witness: WitnessTally,
    witness_value: Option<BlockHash>,
    my_witness_sent: bool,

    equivocators: HashSet<PartyIndex>,
    /// Latest recorded message per (party, kind); equivocating seconds are
    /// kept alongside in `equivocation_evidence`
    records: HashMap<(PartyIndex, MessageKind), (WmvbaMessage, SignatureBytes)>,
    equivocation_evidence: Vec<(PartyIndex, WmvbaMessage, SignatureBytes)>,
    /// Messages for phases we have not reached yet
    future: Vec<(PartyIndex, WmvbaMessage, SignatureBytes)>,
    /// party → envelope signature on its `WeAreDone(false)`
    done_false: BTreeMap<PartyIndex, SignatureBytes>,

    my_input: Option<BlockHash>,
    completed: bool,
}

impl Wmvba {
    /// Creates a round driver.
    ///
    /// `me`/`keys` are `None` when the local node merely observes (it still
    /// tracks the round for catch-up and witness aggregation).
    pub fn new(
        baid: Vec<u8>,
        committee: Arc<FinalizationCommittee>,
        me: Option<PartyIndex>,
        keys: Option<Arc<FinalizationKeys>>,
    ) -> Self {
        let total = committee.total_weight();
        let corrupt = committee.corrupt_weight();
        Self {
            baid,
            committee,
            me,
            keys,
            freeze: FreezeState::new(total, corrupt),
            abba: AbbaState::new(total, corrupt),
            witness: WitnessTally::default(),
            witness_value: None,
            my_witness_sent: false,
            equivocators: HashSet::new(),
            records: HashMap::new(),
            equivocation_evidence: Vec::new(),
            future: Vec::new(),
            done_false: BTreeMap::new(),
            my_input: None,
            completed: false,
        }
    }

    /// Whether the round has completed (either way).
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// The nominated input, if we started the round actively.
    pub fn input(&self) -> Option<BlockHash> {
        self.my_input
    }

    /// Failure evidence: party → signature on `WeAreDone(false)`.
    pub fn done_false_signatures(&self) -> Vec<(PartyIndex, SignatureBytes)> {
        self.done_false
            .iter()
            .map(|(p, s)| (*p, *s))
            .collect()
    }

    /// Every recorded message with its envelope signature, for catch-up
    /// summaries. Includes equivocation evidence.
    pub fn summary_messages(&self) -> Vec<(PartyIndex, WmvbaMessage, SignatureBytes)> {
        let mut messages: Vec<(PartyIndex, WmvbaMessage, SignatureBytes)> = self
            .records
            .iter()
            .map(|((party, _), (message, signature))| (*party, message.clone(), *signature))
            .collect();
        messages.extend(self.equivocation_evidence.iter().cloned());
        messages
    }

    /// Starts the round by proposing `input`. The orchestrator must loop
    /// our own signed proposal back through [`Wmvba::receive`].
    pub fn start(&mut self, input: BlockHash) -> Vec<WmvbaOutput> {
        if self.my_input.is_some() || self.completed {
            return Vec::new();
        }
        self.my_input = Some(input);
        debug!(input = %input.short(), "WMVBA round starting");
        vec![WmvbaOutput::SendMessage(WmvbaMessage::Proposal(input))]
    }

    /// Marks a value as a justified round input.
    pub fn justify_input(&mut self, value: BlockHash) -> Vec<WmvbaOutput> {
        let outputs = self.freeze.justify(value);
        self.apply_freeze_outputs(outputs)
    }

    /// Whether a value is already justified.
    pub fn is_justified(&self, value: &BlockHash) -> bool {
        self.freeze.is_justified(value)
    }

    /// Handles a committee member's message. `signature` is the verified
    /// envelope signature (kept for summaries and failure evidence).
    pub fn receive(
        &mut self,
        party: PartyIndex,
        message: WmvbaMessage,
        signature: SignatureBytes,
    ) -> Vec<WmvbaOutput> {
        if self.completed {
            return Vec::new();
        }

        match self.record(party, &message, &signature) {
            Recorded::Duplicate => return Vec::new(),
            Recorded::Equivocation => {
                // Both messages stay recorded; the party no longer counts
                // toward any justification threshold.
                warn!(party, kind = ?message.kind(), "Equivocation detected");
                self.equivocators.insert(party);
                if let WmvbaMessage::WeAreDone(false) = message {
                    self.done_false.insert(party, signature);
                }
                return Vec::new();
            }
            Recorded::Fresh => {}
        }

        self.dispatch(party, message, signature)
    }

    fn dispatch(
        &mut self,
        party: PartyIndex,
        message: WmvbaMessage,
        signature: SignatureBytes,
    ) -> Vec<WmvbaOutput> {
        let weight = if self.equivocators.contains(&party) {
            0
        } else {
            self.committee.weight(party)
        };

        let mut outputs = Vec::new();
        match message {
            WmvbaMessage::Proposal(value) => {
                if weight > 0 {
                    let freeze_outputs = self.freeze.receive_proposal(party, weight, value);
                    outputs.extend(self.apply_freeze_outputs(freeze_outputs));
                }
            }
            WmvbaMessage::Vote(value) => {
                if weight > 0 {
                    let freeze_outputs = self.freeze.receive_vote(party, weight, value);
                    outputs.extend(self.apply_freeze_outputs(freeze_outputs));
                }
            }
            WmvbaMessage::AbbaInput { phase, bit, ticket } => {
                if phase > self.abba.current_phase() || !self.abba.started() {
                    trace!(party, phase, "Buffering future-phase input");
                    self.future.push((
                        party,
                        WmvbaMessage::AbbaInput { phase, bit, ticket },
                        signature,
                    ));
                    return outputs;
                }
                let Some(ticket_output) = self.verify_ticket(party, phase, &ticket) else {
                    warn!(party, phase, "Invalid ABBA coin ticket");
                    return outputs;
                };
                if weight > 0 {
                    let abba_outputs =
                        self.abba.receive_input(party, weight, phase, bit, ticket_output);
                    outputs.extend(self.apply_abba_outputs(abba_outputs));
                }
            }
            WmvbaMessage::CssSeen { .. } => {
                // Seen reports are gossip: they are recorded for summaries
                // but the core forms from done-reports alone.
            }
            WmvbaMessage::CssDoneReporting { phase, pairs } => {
                if phase > self.abba.current_phase() || !self.abba.started() {
                    self.future.push((
                        party,
                        WmvbaMessage::CssDoneReporting { phase, pairs },
                        signature,
                    ));
                    return outputs;
                }
                if weight > 0 {
                    let abba_outputs = self.abba.receive_done_reporting(party, weight, phase, pairs);
                    outputs.extend(self.apply_abba_outputs(abba_outputs));
                }
            }
            WmvbaMessage::WeAreDone(bit) => {
                if !bit {
                    // Usable as failure evidence even from equivocators
                    self.done_false.insert(party, signature);
                }
                if weight > 0 {
                    let abba_outputs = self.abba.receive_we_are_done(party, weight, bit);
                    outputs.extend(self.apply_abba_outputs(abba_outputs));
                }
            }
            WmvbaMessage::WitnessCreator { value, signature: bls } => {
                outputs.extend(self.receive_witness(party, value, bls));
            }
        }
        outputs
    }

    fn receive_witness(
        &mut self,
        party: PartyIndex,
        value: BlockHash,
        signature: BlsSignatureBytes,
    ) -> Vec<WmvbaOutput> {
        let Some(member) = self.committee.party(party) else {
            return Vec::new();
        };
        let Ok(parsed) = BlsSignature::from_bytes(&signature) else {
            return Vec::new();
        };
        if !parsed.verify(&witness_message(&self.baid, &value), &member.bls_key) {
            warn!(party, "Invalid witness signature");
            return Vec::new();
        }
        // Witness signatures are absorbed whatever the round's phase; a
        // round we fell behind on can still complete through them.
        let weight = self.committee.weight(party);
        let corrupt = self.committee.corrupt_weight();
        if self.abba.decided() == Some(true) || self.abba.decided().is_none() {
            if let Some(result) = self.witness.add(party, weight, value, signature, corrupt) {
                if self.abba.decided() == Some(true) {
                    return self.complete(Some(result));
                }
                // Hold the assembled result until ABBA confirms the bit
                self.witness_value = Some(result.value);
            }
        }
        Vec::new()
    }

    fn verify_ticket(
        &self,
        party: PartyIndex,
        phase: u32,
        ticket: &tessera_types::VrfProofBytes,
    ) -> Option<[u8; 64]> {
        let member = self.committee.party(party)?;
        let proof = VrfProof::from_bytes(ticket);
        member
            .vrf_key
            .verify(&ticket_input(&self.baid, phase), &proof)
            .map(|output| *output.as_bytes())
    }

    fn apply_freeze_outputs(&mut self, freeze_outputs: Vec<FreezeOutput>) -> Vec<WmvbaOutput> {
        let mut outputs = Vec::new();
        for output in freeze_outputs {
            match output {
                FreezeOutput::SendVote(value) => {
                    outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::Vote(value)));
                }
                FreezeOutput::Frozen(value) => {
                    if let Some(value) = value {
                        self.witness_value = Some(value);
                    }
                    let abba_outputs = self.abba.start(value.is_some());
                    outputs.extend(self.apply_abba_outputs(abba_outputs));
                    outputs.extend(self.replay_future());
                }
            }
        }
        outputs
    }

    fn apply_abba_outputs(&mut self, abba_outputs: Vec<AbbaOutput>) -> Vec<WmvbaOutput> {
        let mut outputs = Vec::new();
        for output in abba_outputs {
            match output {
                AbbaOutput::SendInput { phase, bit } => {
                    if let Some(ticket) = self.make_ticket(phase) {
                        outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::AbbaInput {
                            phase,
                            bit,
                            ticket,
                        }));
                    }
                    outputs.extend(self.replay_future());
                }
                AbbaOutput::SendSeen { phase, pairs } => {
                    outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::CssSeen {
                        phase,
                        pairs,
                    }));
                }
                AbbaOutput::SendDoneReporting { phase, pairs } => {
                    outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::CssDoneReporting {
                        phase,
                        pairs,
                    }));
                }
                AbbaOutput::SendWeAreDone(bit) => {
                    outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::WeAreDone(bit)));
                }
                AbbaOutput::Decided(bit) => {
                    outputs.extend(self.on_decided(bit));
                }
            }
        }
        outputs
    }

    fn on_decided(&mut self, bit: bool) -> Vec<WmvbaOutput> {
        if !bit {
            debug!("WMVBA round failed (ABBA decided 0)");
            return self.complete(None);
        }

        let mut outputs = Vec::new();
        if let (Some(value), Some(keys), false) =
            (self.witness_value, self.keys.clone(), self.my_witness_sent)
        {
            self.my_witness_sent = true;
            let bls = keys.bls.sign(&witness_message(&self.baid, &value));
            outputs.push(WmvbaOutput::SendMessage(WmvbaMessage::WitnessCreator {
                value,
                signature: bls.to_bytes(),
            }));
        }

        // Witnesses may already have crossed the bound before the decision
        if let Some(value) = self.witness_value {
            let collected = self.witness.witnesses(&value);
            let weight: u64 = collected
                .iter()
                .map(|(p, _)| self.committee.weight(*p))
                .sum();
            if weight > self.committee.corrupt_weight() {
                let mut tally = WitnessTally::default();
                let mut result = None;
                for (party, signature) in collected {
                    result = tally.add(
                        party,
                        self.committee.weight(party),
                        value,
                        signature,
                        self.committee.corrupt_weight(),
                    );
                }
                if let Some(result) = result {
                    outputs.extend(self.complete(Some(result)));
                    return outputs;
                }
            }
        }
        outputs
    }

    fn complete(&mut self, result: Option<WmvbaResult>) -> Vec<WmvbaOutput> {
        if self.completed {
            return Vec::new();
        }
        self.completed = true;
        vec![WmvbaOutput::Complete(result)]
    }

    fn make_ticket(&self, phase: u32) -> Option<tessera_types::VrfProofBytes> {
        let keys = self.keys.as_ref()?;
        let (_, proof) = keys.vrf.prove(&ticket_input(&self.baid, phase));
        Some(proof.to_bytes())
    }

    /// Replays buffered messages whose phase is now reachable.
    fn replay_future(&mut self) -> Vec<WmvbaOutput> {
        if !self.abba.started() {
            return Vec::new();
        }
        let current = self.abba.current_phase();
        let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.future)
            .into_iter()
            .partition(|(_, message, _)| message.phase().is_some_and(|p| p <= current));
        self.future = later;
        let mut outputs = Vec::new();
        for (party, message, signature) in ready {
            outputs.extend(self.dispatch(party, message, signature));
        }
        outputs
    }

    fn record(
        &mut self,
        party: PartyIndex,
        message: &WmvbaMessage,
        signature: &SignatureBytes,
    ) -> Recorded {
        let key = (party, message.kind());
        let Some((existing, _)) = self.records.get(&key) else {
            self.records.insert(key, (message.clone(), *signature));
            return Recorded::Fresh;
        };
        if existing == message {
            return Recorded::Duplicate;
        }
        // Cumulative Seen reports legitimately grow; only a conflicting
        // pair is equivocation.
        if let (
            WmvbaMessage::CssSeen { pairs: new, .. },
            WmvbaMessage::CssSeen { pairs: old, .. },
        ) = (message, existing)
        {
            let grows = !old
                .iter()
                .any(|(p, b)| new.iter().any(|(p2, b2)| p2 == p && b2 != b));
            if grows {
                self.records.insert(key, (message.clone(), *signature));
                return Recorded::Fresh;
            }
        }
        self.equivocation_evidence
            .push((party, message.clone(), *signature));
        Recorded::Equivocation
    }
}

enum Recorded {
    Fresh,
    Duplicate,
    Equivocation,
}
