//! Phase-indexed ABBA: binary agreement on "is there a freeze value?".
//!
//! Each phase runs Core-Set Selection (CSS) over the parties' input bits:
//! inputs are gossiped, every party reports what it has *Seen*, and once a
//! party has seen the progress threshold of weight it sends
//! *DoneReporting* with the final set of pairs it saw. When done-reports
//! carrying the threshold weight are in, the union of their backed pairs
//! forms the phase's core set.
//!
//! If one bit owns the whole threshold inside the core the party keeps it
//! and announces `WeAreDone(bit)`; otherwise it adopts the phase coin (the
//! parity of the heaviest verified VRF ticket among core members) and
//! starts the next phase. ABBA decides a bit once `WeAreDone` messages for
//! it carry the progress threshold of weight.

use crate::committee::PartyIndex;
use crate::messages::Phase;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

/// Hard cap on phases; a round that runs this long is considered wedged and
/// stops progressing (the orchestrator will fail it via catch-up instead).
const MAX_PHASE: Phase = 1_000;

/// An action the ABBA stage asks its driver to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbbaOutput {
    /// Broadcast our input bit for a phase (driver attaches the ticket)
    SendInput {
        /// The phase
        phase: Phase,
        /// Our bit for it
        bit: bool,
    },
    /// Broadcast our cumulative Seen report for a phase
    SendSeen {
        /// The phase
        phase: Phase,
        /// Every `(party, bit)` input seen so far
        pairs: Vec<(PartyIndex, bool)>,
    },
    /// Broadcast DoneReporting for a phase
    SendDoneReporting {
        /// The phase
        phase: Phase,
        /// The final set of pairs we saw
        pairs: Vec<(PartyIndex, bool)>,
    },
    /// Broadcast that we consider the round decided with this bit
    SendWeAreDone(bool),
    /// ABBA has decided
    Decided(bool),
}

#[derive(Debug, Default)]
struct PhaseState {
    /// party → (bit, weight, verified ticket output)
    inputs: HashMap<PartyIndex, (bool, u64, [u8; 64])>,
    input_weight: u64,
    /// Done-reports counted toward the core
    done_reporting: HashMap<PartyIndex, Vec<(PartyIndex, bool)>>,
    dr_weight: u64,
    /// Done-reports listing inputs we have not yet received
    parked_dr: Vec<(PartyIndex, u64, Vec<(PartyIndex, bool)>)>,
    core: Option<Vec<(PartyIndex, bool)>>,
    my_dr_sent: bool,
}

impl PhaseState {
    fn seen_pairs(&self) -> Vec<(PartyIndex, bool)> {
        let mut pairs: Vec<(PartyIndex, bool)> =
            self.inputs.iter().map(|(p, (b, _, _))| (*p, *b)).collect();
        pairs.sort_unstable();
        pairs
    }

    fn backed(&self, pairs: &[(PartyIndex, bool)]) -> bool {
        pairs
            .iter()
            .all(|(party, bit)| self.inputs.get(party).is_some_and(|(b, _, _)| b == bit))
    }
}

/// State of one ABBA stage.
#[derive(Debug)]
pub struct AbbaState {
    total_weight: u64,
    corrupt_weight: u64,

    phases: BTreeMap<Phase, PhaseState>,
    current_phase: Phase,
    current_bit: bool,
    started: bool,

    done_weight: [u64; 2],
    done_parties: HashSet<PartyIndex>,
    my_done_sent: bool,
    decided: Option<bool>,
}

impl AbbaState {
    /// Creates an ABBA stage for a committee with the given weights.
    pub fn new(total_weight: u64, corrupt_weight: u64) -> Self {
        Self {
            total_weight,
            corrupt_weight,
            phases: BTreeMap::new(),
            current_phase: 0,
            current_bit: false,
            started: false,
            done_weight: [0, 0],
            done_parties: HashSet::new(),
            my_done_sent: false,
            decided: None,
        }
    }

    fn progress(&self) -> u64 {
        self.total_weight - self.corrupt_weight
    }

    /// The decided bit, once agreement is reached.
    pub fn decided(&self) -> Option<bool> {
        self.decided
    }

    /// The phase the local party is currently in.
    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    /// Whether the stage has been started.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Starts the stage with our input bit for phase 0.
    pub fn start(&mut self, bit: bool) -> Vec<AbbaOutput> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        self.current_bit = bit;
        debug!(bit, "ABBA starting");
        vec![AbbaOutput::SendInput { phase: 0, bit }]
    }

    /// Handles a party's input bit for a phase; `ticket_output` is its
    /// verified coin ticket.
    pub fn receive_input(
        &mut self,
        party: PartyIndex,
        weight: u64,
        phase: Phase,
        bit: bool,
        ticket_output: [u8; 64],
    ) -> Vec<AbbaOutput> {
        if self.decided.is_some() || phase > MAX_PHASE {
            return Vec::new();
        }
        let state = self.phases.entry(phase).or_default();
        if state.inputs.contains_key(&party) {
            return Vec::new();
        }
        state.inputs.insert(party, (bit, weight, ticket_output));
        state.input_weight += weight;
        trace!(party, phase, bit, "ABBA input recorded");

        let mut outputs = Vec::new();

        // Gossip what we now see (cumulative; a newer Seen supersedes an
        // older buffered one).
        let pairs = state.seen_pairs();
        outputs.push(AbbaOutput::SendSeen { phase, pairs });

        // Retry parked done-reports that may now be backed
        let parked = std::mem::take(&mut self.phases.get_mut(&phase).expect("entry").parked_dr);
        for (dr_party, dr_weight, dr_pairs) in parked {
            outputs.extend(self.receive_done_reporting(dr_party, dr_weight, phase, dr_pairs));
        }

        outputs.extend(self.step_phase(phase));
        outputs
    }

    /// Handles a party's DoneReporting for a phase.
    pub fn receive_done_reporting(
        &mut self,
        party: PartyIndex,
        weight: u64,
        phase: Phase,
        pairs: Vec<(PartyIndex, bool)>,
    ) -> Vec<AbbaOutput> {
        if self.decided.is_some() || phase > MAX_PHASE {
            return Vec::new();
        }
        let state = self.phases.entry(phase).or_default();
        if state.done_reporting.contains_key(&party) {
            return Vec::new();
        }
        if !state.backed(&pairs) {
            // Listing an input we have not seen: park until it arrives
            trace!(party, phase, "Parking done-report awaiting inputs");
            state.parked_dr.push((party, weight, pairs));
            return Vec::new();
        }
        state.done_reporting.insert(party, pairs);
        state.dr_weight += weight;
        self.step_phase(phase)
    }

    /// Handles a party's `WeAreDone`.
    pub fn receive_we_are_done(
        &mut self,
        party: PartyIndex,
        weight: u64,
        bit: bool,
    ) -> Vec<AbbaOutput> {
        if self.decided.is_some() || !self.done_parties.insert(party) {
            return Vec::new();
        }
        self.done_weight[usize::from(bit)] += weight;
        if self.done_weight[usize::from(bit)] >= self.progress() {
            self.decided = Some(bit);
            debug!(bit, "ABBA decided");
            return vec![AbbaOutput::Decided(bit)];
        }
        Vec::new()
    }

    /// Phase progress: send DoneReporting once enough input weight is in,
    /// form the core once enough done-report weight is in, then grade.
    fn step_phase(&mut self, phase: Phase) -> Vec<AbbaOutput> {
        let progress = self.progress();
        let mut outputs = Vec::new();

        let state = self.phases.entry(phase).or_default();
        if !state.my_dr_sent && state.input_weight >= progress {
            state.my_dr_sent = true;
            outputs.push(AbbaOutput::SendDoneReporting {
                phase,
                pairs: state.seen_pairs(),
            });
        }

        if state.core.is_none() && state.dr_weight >= progress {
            let mut core: Vec<(PartyIndex, bool)> = state
                .done_reporting
                .values()
                .flatten()
                .copied()
                .collect();
            core.sort_unstable();
            core.dedup();
            state.core = Some(core);
            debug!(phase, "CSS core determined");
            outputs.extend(self.grade(phase));
        }

        outputs
    }

    /// Grades the finished phase and either announces `WeAreDone` or moves
    /// to the next phase with the kept or coin-determined bit.
    fn grade(&mut self, phase: Phase) -> Vec<AbbaOutput> {
        let progress = self.progress();
        let state = self.phases.get(&phase).expect("graded phase exists");
        let core = state.core.clone().expect("core determined");

        let mut weight = [0u64, 0u64];
        for (party, bit) in &core {
            if let Some((input_bit, party_weight, _)) = state.inputs.get(party) {
                if input_bit == bit {
                    weight[usize::from(*bit)] += party_weight;
                }
            }
        }

        let mut outputs = Vec::new();
        let next_bit = if weight[1] >= progress {
            if !self.my_done_sent {
                self.my_done_sent = true;
                outputs.push(AbbaOutput::SendWeAreDone(true));
            }
            true
        } else if weight[0] >= progress {
            if !self.my_done_sent {
                self.my_done_sent = true;
                outputs.push(AbbaOutput::SendWeAreDone(false));
            }
            false
        } else {
            self.coin(phase, &core)
        };

        // Only the local party's view advances; phases we merely observe
        // (via replayed messages) do not move our cursor.
        if phase == self.current_phase && self.decided.is_none() && phase < MAX_PHASE {
            self.current_phase = phase + 1;
            self.current_bit = next_bit;
            outputs.push(AbbaOutput::SendInput {
                phase: self.current_phase,
                bit: next_bit,
            });
        }

        outputs
    }

    /// The phase coin: parity of the heaviest verified ticket output among
    /// core members.
    fn coin(&self, phase: Phase, core: &[(PartyIndex, bool)]) -> bool {
        let state = self.phases.get(&phase).expect("phase exists");
        let best = core
            .iter()
            .filter_map(|(party, _)| state.inputs.get(party).map(|(_, _, t)| t))
            .max();
        match best {
            Some(ticket) => ticket[63] & 1 == 1,
            // No verified tickets in the core; deterministic fallback
            None => phase % 2 == 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Four equal-weight parties: total 4, corrupt 1, progress threshold 3.
    fn state() -> AbbaState {
        AbbaState::new(4, 1)
    }

    fn ticket(n: u8) -> [u8; 64] {
        [n; 64]
    }

    #[test]
    fn unanimous_inputs_decide() {
        let mut abba = state();
        let outputs = abba.start(true);
        assert_eq!(
            outputs,
            vec![AbbaOutput::SendInput { phase: 0, bit: true }]
        );

        let mut done = 0;
        for party in 0..4u32 {
            let outputs = abba.receive_input(party, 1, 0, true, ticket(party as u8));
            if outputs
                .iter()
                .any(|o| matches!(o, AbbaOutput::SendDoneReporting { .. }))
            {
                done += 1;
            }
        }
        assert!(done >= 1);

        // All four parties report the same view
        let pairs: Vec<(PartyIndex, bool)> = (0..4u32).map(|p| (p, true)).collect();
        let mut graded = Vec::new();
        for party in 0..4u32 {
            graded.extend(abba.receive_done_reporting(party, 1, 0, pairs.clone()));
        }
        assert!(graded.contains(&AbbaOutput::SendWeAreDone(true)));

        let mut decided = Vec::new();
        for party in 0..4u32 {
            decided.extend(abba.receive_we_are_done(party, 1, true));
        }
        assert!(decided.contains(&AbbaOutput::Decided(true)));
        assert_eq!(abba.decided(), Some(true));
    }

    #[test]
    fn zero_decision() {
        let mut abba = state();
        abba.start(false);
        for party in 0..4u32 {
            abba.receive_we_are_done(party, 1, false);
        }
        assert_eq!(abba.decided(), Some(false));
    }

    #[test]
    fn done_report_parks_until_input_arrives() {
        let mut abba = state();
        abba.start(true);
        // Done-report lists party 3 whose input we have not seen
        let pairs = vec![(3u32, true)];
        let outputs = abba.receive_done_reporting(0, 1, 0, pairs);
        assert!(outputs.is_empty());

        // The input arrives; the parked report is retried and counted
        let outputs = abba.receive_input(3, 1, 0, true, ticket(3));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, AbbaOutput::SendSeen { .. })));
    }

    #[test]
    fn split_core_adopts_coin() {
        let mut abba = state();
        abba.start(true);
        abba.receive_input(0, 1, 0, true, ticket(1));
        abba.receive_input(1, 1, 0, true, ticket(2));
        abba.receive_input(2, 1, 0, false, ticket(0xff));
        abba.receive_input(3, 1, 0, false, ticket(4));

        let pairs = vec![(0, true), (1, true), (2, false), (3, false)];
        let mut outputs = Vec::new();
        for party in 0..3u32 {
            outputs.extend(abba.receive_done_reporting(party, 1, 0, pairs.clone()));
        }
        // Neither bit had threshold weight in the core: the coin (heaviest
        // ticket is 0xff.., parity 1) picks the next input
        assert!(outputs.contains(&AbbaOutput::SendInput { phase: 1, bit: true }));
        assert_eq!(abba.current_phase(), 1);
    }
}
