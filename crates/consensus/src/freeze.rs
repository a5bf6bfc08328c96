//! The Freeze sub-protocol of WMVBA.
//!
//! Parties propose their nominated block hash and then vote on what they
//! saw. The round *freezes* either a unique value (enough weight voted for
//! it) or ⊥ (no value could gather the weight). The frozen outcome is the
//! input to ABBA: "is there a freeze value?"
//!
//! Only justified values are counted: a proposal for a block the tree has
//! not justified is parked until [`FreezeState::justify`] unlocks it.

use crate::committee::PartyIndex;
use std::collections::{HashMap, HashSet};
use tessera_types::BlockHash;
use tracing::{debug, trace};

/// An action the freeze stage asks its driver to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeOutput {
    /// Broadcast our vote
    SendVote(Option<BlockHash>),
    /// The stage decided
    Frozen(Option<BlockHash>),
}

/// State of one freeze stage.
#[derive(Debug)]
pub struct FreezeState {
    total_weight: u64,
    corrupt_weight: u64,

    /// Values the tree state has justified as round inputs
    justified: HashSet<BlockHash>,
    /// Weight and proposers per justified value
    proposals: HashMap<BlockHash, (u64, Vec<PartyIndex>)>,
    /// Proposals parked until their value is justified
    unjustified: HashMap<BlockHash, Vec<(PartyIndex, u64)>>,
    /// Parties whose proposal has been counted or parked
    proposers: HashSet<PartyIndex>,
    /// Weight of counted proposals
    proposal_weight: u64,

    /// Weight per vote value (`None` = ⊥)
    votes: HashMap<Option<BlockHash>, u64>,
    voters: HashSet<PartyIndex>,
    vote_weight: u64,

    my_vote_sent: bool,
    outcome: Option<Option<BlockHash>>,
}

impl FreezeState {
    /// Creates a freeze stage for a committee with the given weights.
    pub fn new(total_weight: u64, corrupt_weight: u64) -> Self {
        Self {
            total_weight,
            corrupt_weight,
            justified: HashSet::new(),
            proposals: HashMap::new(),
            unjustified: HashMap::new(),
            proposers: HashSet::new(),
            proposal_weight: 0,
            votes: HashMap::new(),
            voters: HashSet::new(),
            vote_weight: 0,
            my_vote_sent: false,
            outcome: None,
        }
    }

    /// The frozen outcome, once decided.
    pub fn outcome(&self) -> Option<Option<BlockHash>> {
        self.outcome
    }

    /// Whether we have already voted (used when replaying state).
    pub fn vote_sent(&self) -> bool {
        self.my_vote_sent
    }

    /// Marks a value as a justified round input, releasing any parked
    /// proposals for it.
    pub fn justify(&mut self, value: BlockHash) -> Vec<FreezeOutput> {
        if !self.justified.insert(value) {
            return Vec::new();
        }
        if let Some(parked) = self.unjustified.remove(&value) {
            for (party, weight) in parked {
                self.count_proposal(party, weight, value);
            }
        }
        self.step()
    }

    /// Whether a value is justified.
    pub fn is_justified(&self, value: &BlockHash) -> bool {
        self.justified.contains(value)
    }

    /// Handles a proposal from a party with the given weight.
    pub fn receive_proposal(
        &mut self,
        party: PartyIndex,
        weight: u64,
        value: BlockHash,
    ) -> Vec<FreezeOutput> {
        if self.outcome.is_some() || !self.proposers.insert(party) {
            return Vec::new();
        }
        if self.justified.contains(&value) {
            self.count_proposal(party, weight, value);
            self.step()
        } else {
            trace!(party, value = %value.short(), "Parking unjustified proposal");
            self.unjustified.entry(value).or_default().push((party, weight));
            Vec::new()
        }
    }

    fn count_proposal(&mut self, party: PartyIndex, weight: u64, value: BlockHash) {
        let entry = self.proposals.entry(value).or_insert((0, Vec::new()));
        entry.0 += weight;
        entry.1.push(party);
        self.proposal_weight += weight;
    }

    /// Handles a vote from a party with the given weight.
    pub fn receive_vote(
        &mut self,
        party: PartyIndex,
        weight: u64,
        value: Option<BlockHash>,
    ) -> Vec<FreezeOutput> {
        if self.outcome.is_some() || !self.voters.insert(party) {
            return Vec::new();
        }
        *self.votes.entry(value).or_insert(0) += weight;
        self.vote_weight += weight;
        self.step()
    }

    /// Progress rule: vote once enough proposals are in, freeze once enough
    /// votes are in.
    fn step(&mut self) -> Vec<FreezeOutput> {
        let mut outputs = Vec::new();
        let progress = self.total_weight - self.corrupt_weight;

        if !self.my_vote_sent && self.proposal_weight >= progress {
            // Vote for the heaviest proposal if it clears the corruption
            // bound, otherwise for ⊥.
            let best = self
                .proposals
                .iter()
                .max_by_key(|(value, (weight, _))| (*weight, std::cmp::Reverse(*value)))
                .filter(|(_, (weight, _))| *weight > self.corrupt_weight)
                .map(|(value, _)| *value);
            self.my_vote_sent = true;
            debug!(vote = ?best.map(|v| v.short()), "Freeze stage voting");
            outputs.push(FreezeOutput::SendVote(best));
        }

        if self.outcome.is_none() && self.vote_weight >= progress {
            let frozen = self
                .votes
                .iter()
                .filter_map(|(value, weight)| value.map(|v| (v, *weight)))
                .find(|(_, weight)| *weight >= progress)
                .map(|(value, _)| value);
            self.outcome = Some(frozen);
            debug!(frozen = ?frozen.map(|v| v.short()), "Freeze stage decided");
            outputs.push(FreezeOutput::Frozen(frozen));
        }

        outputs
    }
}
