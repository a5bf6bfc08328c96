//! Tests for the WMVBA round driver: four equal-weight parties reaching
//! agreement, failing a round, and handling equivocation.

use std::collections::VecDeque;
use std::sync::Arc;
use tessera_consensus::{
    FinalizationCommittee, FinalizationKeys, Wmvba, WmvbaMessage, WmvbaOutput,
};
use tessera_crypto::{BlsSecretKey, SignKeypair, VrfSecretKey};
use tessera_types::{
    BakerInfo, GenesisData, Hash, SignatureBytes, VrfProofBytes,
};

struct Fixture {
    committee: Arc<FinalizationCommittee>,
    keys: Vec<Arc<FinalizationKeys>>,
}

fn seed(tag: u8, index: u8) -> [u8; 32] {
    let mut seed = [tag; 32];
    seed[31] = index;
    seed
}

impl Fixture {
    fn new() -> Self {
        let mut bakers = Vec::new();
        let mut keys = Vec::new();
        for id in 0..4u64 {
            let sign = SignKeypair::from_seed(&seed(1, id as u8));
            let vrf = VrfSecretKey::from_seed(&seed(2, id as u8));
            let bls = BlsSecretKey::from_seed(&seed(3, id as u8));
            bakers.push(BakerInfo {
                id,
                sign_key: sign.public_key().to_bytes(),
                vrf_key: vrf.public_key().to_bytes(),
                bls_key: bls.public_key().to_bytes(),
                stake: 1_000,
                finalizer: true,
            });
            keys.push(Arc::new(FinalizationKeys { sign, vrf, bls }));
        }
        let genesis = GenesisData {
            time_ms: 0,
            slot_duration_ms: 1_000,
            election_difficulty: 0.5,
            epoch_length: 1_000,
            min_skip: 1,
            leadership_election_nonce: Hash::sha256(b"seed"),
            bakers,
        };
        let committee = Arc::new(FinalizationCommittee::from_genesis(&genesis).unwrap());
        Self { committee, keys }
    }

    fn instances(&self, baid: &[u8]) -> Vec<Wmvba> {
        (0..4u32)
            .map(|party| {
                Wmvba::new(
                    baid.to_vec(),
                    Arc::clone(&self.committee),
                    Some(party),
                    Some(Arc::clone(&self.keys[party as usize])),
                )
            })
            .collect()
    }
}

/// Delivers every sent message to every party (including the sender, which
/// mirrors how the orchestrator loops its own messages back).
fn run_to_quiescence(
    instances: &mut [Wmvba],
    initial: Vec<(u32, WmvbaOutput)>,
) -> Vec<(u32, Option<tessera_consensus::WmvbaResult>)> {
    let mut queue: VecDeque<(u32, WmvbaOutput)> = initial.into();
    let mut completions = Vec::new();
    let mut steps = 0usize;
    while let Some((from, output)) = queue.pop_front() {
        steps += 1;
        assert!(steps < 100_000, "message storm; protocol not converging");
        match output {
            WmvbaOutput::SendMessage(message) => {
                for (party, instance) in instances.iter_mut().enumerate() {
                    for next in
                        instance.receive(from, message.clone(), SignatureBytes::default())
                    {
                        queue.push_back((party as u32, next));
                    }
                }
            }
            WmvbaOutput::Complete(result) => completions.push((from, result)),
        }
    }
    completions
}

#[test]
fn four_honest_parties_agree() {
    let fixture = Fixture::new();
    let mut instances = fixture.instances(b"baid-agree");
    let value = Hash::sha256(b"the nominated block");

    let mut initial = Vec::new();
    for (party, instance) in instances.iter_mut().enumerate() {
        instance.justify_input(value);
        for output in instance.start(value) {
            initial.push((party as u32, output));
        }
    }

    let completions = run_to_quiescence(&mut instances, initial);
    assert_eq!(completions.len(), 4, "every party completes");
    for (_, result) in completions {
        let result = result.expect("round succeeds");
        assert_eq!(result.value, value);
        // Weight strictly above the corruption bound: at least two of the
        // four equal parties
        assert!(result.parties.len() >= 2);
        assert!(result.parties.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn done_false_quorum_fails_the_round() {
    let fixture = Fixture::new();
    let mut instances = fixture.instances(b"baid-fail");
    let observer = &mut instances[0];

    let mut completions = Vec::new();
    for party in 1..4u32 {
        let signature = SignatureBytes([party as u8; 64]);
        for output in observer.receive(party, WmvbaMessage::WeAreDone(false), signature) {
            if let WmvbaOutput::Complete(result) = output {
                completions.push(result);
            }
        }
    }

    assert_eq!(completions, vec![None], "round failed exactly once");
    assert!(observer.completed());
    // The failure evidence carries all three signatures
    let evidence = observer.done_false_signatures();
    assert_eq!(evidence.len(), 3);
}

#[test]
fn equivocating_proposals_are_recorded() {
    let fixture = Fixture::new();
    let mut instances = fixture.instances(b"baid-equiv");
    let observer = &mut instances[0];
    let a = Hash::sha256(b"value a");
    let b = Hash::sha256(b"value b");
    observer.justify_input(a);
    observer.justify_input(b);

    observer.receive(1, WmvbaMessage::Proposal(a), SignatureBytes([1u8; 64]));
    observer.receive(1, WmvbaMessage::Proposal(b), SignatureBytes([2u8; 64]));

    // Both messages are retained for evidence
    let from_party_1 = observer
        .summary_messages()
        .into_iter()
        .filter(|(party, message, _)| {
            *party == 1 && matches!(message, WmvbaMessage::Proposal(_))
        })
        .count();
    assert_eq!(from_party_1, 2);
}

#[test]
fn duplicate_message_is_ignored() {
    let fixture = Fixture::new();
    let mut instances = fixture.instances(b"baid-dup");
    let observer = &mut instances[0];
    let value = Hash::sha256(b"value");
    observer.justify_input(value);

    let first = observer.receive(1, WmvbaMessage::Proposal(value), SignatureBytes::default());
    let second = observer.receive(1, WmvbaMessage::Proposal(value), SignatureBytes::default());
    assert!(second.is_empty());
    drop(first);
}

#[test]
fn invalid_ticket_is_dropped() {
    let fixture = Fixture::new();
    let baid = b"baid-ticket";
    let mut instances = fixture.instances(baid);
    let value = Hash::sha256(b"value");

    // Drive the observer's freeze stage to completion so ABBA is running
    let observer = &mut instances[0];
    observer.justify_input(value);
    for party in 1..4u32 {
        observer.receive(party, WmvbaMessage::Proposal(value), SignatureBytes::default());
    }
    for party in 1..4u32 {
        observer.receive(
            party,
            WmvbaMessage::Vote(Some(value)),
            SignatureBytes::default(),
        );
    }

    let garbage = WmvbaMessage::AbbaInput {
        phase: 0,
        bit: true,
        ticket: VrfProofBytes([0xEE; 80]),
    };
    let outputs = observer.receive(1, garbage, SignatureBytes::default());
    assert!(outputs.is_empty(), "forged ticket produces nothing");

    // A genuine ticket from another party is acknowledged with a Seen
    let input = tessera_consensus::messages::ticket_input(baid, 0);
    let (_, proof) = fixture.keys[2].vrf.prove(&input);
    let genuine = WmvbaMessage::AbbaInput {
        phase: 0,
        bit: true,
        ticket: proof.to_bytes(),
    };
    let outputs = observer.receive(2, genuine, SignatureBytes::default());
    assert!(outputs
        .iter()
        .any(|o| matches!(o, WmvbaOutput::SendMessage(WmvbaMessage::CssSeen { .. }))));
}
