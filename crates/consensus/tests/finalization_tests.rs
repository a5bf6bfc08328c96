//! End-to-end finalization tests: four committee members exchanging WMVBA
//! messages over an in-process network until records settle.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use tessera_consensus::{
    BakeOutcome, BakerCredentials, BlockExecutor, ChainMetadata, ChainParameters, ConsensusEvent,
    ExecutionOutcome, ExecutionState, FinalizationKeys, FinalizationMessage,
    FinalizationMessageHeader, FinalizationSettings, SkovState, UpdateResult, WmvbaMessage,
};
use tessera_crypto::{BlsSecretKey, SignKeypair, VrfSecretKey};
use tessera_types::{BakerInfo, BlockHash, GenesisData, Hash, Serial};

#[derive(Debug)]
struct Tally;

impl ExecutionState for Tally {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CountingExecutor;

impl BlockExecutor for CountingExecutor {
    fn genesis_state(&self, _genesis: &GenesisData) -> Arc<dyn ExecutionState> {
        Arc::new(Tally)
    }

    fn execute(
        &self,
        _parent_state: &Arc<dyn ExecutionState>,
        transactions: &[tessera_types::Transaction],
        _meta: &ChainMetadata,
    ) -> Result<ExecutionOutcome, String> {
        Ok(ExecutionOutcome {
            results: transactions.iter().map(|tx| (tx.hash(), true)).collect(),
            new_state: Arc::new(Tally),
            energy_used: transactions.iter().map(|tx| tx.energy).sum(),
            failed: Vec::new(),
            unprocessed: Vec::new(),
        })
    }
}

struct BakerKeys {
    credentials: BakerCredentials,
    finalization: FinalizationKeys,
}

fn seed(tag: u8, index: u8) -> [u8; 32] {
    let mut seed = [tag; 32];
    seed[31] = index;
    seed
}

fn make_keys(id: u64) -> BakerKeys {
    let sign = SignKeypair::from_seed(&seed(50, id as u8));
    let vrf = VrfSecretKey::from_seed(&seed(60, id as u8));
    let bls = BlsSecretKey::from_seed(&seed(70, id as u8));
    BakerKeys {
        credentials: BakerCredentials {
            id,
            sign: sign.clone(),
            vrf: vrf.clone(),
        },
        finalization: FinalizationKeys { sign, vrf, bls },
    }
}

fn make_committee() -> (Vec<BakerKeys>, GenesisData) {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let genesis = GenesisData {
        time_ms: 0,
        slot_duration_ms: 1_000,
        election_difficulty: 0.999_999,
        epoch_length: 100_000,
        min_skip: 1,
        leadership_election_nonce: Hash::sha256(b"finalization seed"),
        bakers: keys
            .iter()
            .map(|k| BakerInfo {
                id: k.credentials.id,
                sign_key: k.credentials.sign.public_key().to_bytes(),
                vrf_key: k.credentials.vrf.public_key().to_bytes(),
                bls_key: k.finalization.bls.public_key().to_bytes(),
                stake: 1_000,
                finalizer: true,
            })
            .collect(),
    };
    (keys, genesis)
}

fn make_nodes(keys: &[BakerKeys], genesis: &GenesisData) -> Vec<SkovState> {
    (0..keys.len())
        .map(|i| {
            let params = ChainParameters::new(genesis, 1_048_576, 3_000_000, 1_000, 600, 1_000);
            SkovState::new(
                genesis.clone(),
                params,
                Box::new(CountingExecutor),
                Some(keys[i].credentials.id),
                Some(keys[i].finalization.clone()),
                FinalizationSettings::default(),
            )
            .unwrap()
        })
        .collect()
}

fn slot_time(slot: u64) -> u64 {
    slot * 1_000 + 1
}

/// Delivers all broadcast events to all other nodes until the network is
/// quiet, flushing Seen buffers between waves.
fn run_network(
    nodes: &mut [SkovState],
    mut queue: VecDeque<(usize, ConsensusEvent)>,
    now: u64,
) {
    let mut steps = 0usize;
    loop {
        while let Some((from, event)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 200_000, "network does not quiesce");
            let bytes = match &event {
                ConsensusEvent::BroadcastFinalizationMessage(bytes)
                | ConsensusEvent::BroadcastFinalizationRecord(bytes)
                | ConsensusEvent::BroadcastCatchUpStatus(bytes) => bytes.clone(),
                _ => continue,
            };
            for (target, node) in nodes.iter_mut().enumerate() {
                if target == from {
                    continue;
                }
                let (_, events) = match &event {
                    ConsensusEvent::BroadcastFinalizationMessage(_) => {
                        node.receive_finalization_message(&bytes, now)
                    }
                    ConsensusEvent::BroadcastFinalizationRecord(_) => {
                        node.receive_finalization_record(&bytes, now)
                    }
                    ConsensusEvent::BroadcastCatchUpStatus(_) => {
                        node.receive_catch_up_status(&bytes, now)
                    }
                    _ => unreachable!(),
                };
                for produced in events {
                    queue.push_back((target, produced));
                }
            }
        }

        // Flush every node's Seen buffer; another wave may follow
        let mut quiet = true;
        for (target, node) in nodes.iter_mut().enumerate() {
            for event in node.on_buffer_deadline(u64::MAX) {
                if matches!(event, ConsensusEvent::BroadcastFinalizationMessage(_)) {
                    quiet = false;
                }
                queue.push_back((target, event));
            }
        }
        if quiet && queue.is_empty() {
            return;
        }
    }
}

/// Bakes a chain of `count` blocks on node 0 and delivers each block to
/// every node, returning the produced hashes and the queued events.
fn grow_chain(
    nodes: &mut [SkovState],
    keys: &[BakerKeys],
    count: usize,
) -> (Vec<BlockHash>, VecDeque<(usize, ConsensusEvent)>, u64) {
    let mut queue = VecDeque::new();
    let mut hashes = Vec::new();
    let mut slot = 1;
    let mut now = slot_time(1);
    for _ in 0..count {
        let (bytes, hash, baked_slot) = loop {
            let (outcome, events) =
                nodes[0].try_bake(&keys[0].credentials, slot, slot_time(slot));
            for event in events {
                queue.push_back((0, event));
            }
            match outcome {
                BakeOutcome::Baked { bytes, hash, slot } => break (bytes, hash, slot),
                BakeOutcome::WaitUntil(_) => slot += 1,
            }
        };
        now = slot_time(baked_slot);
        for (target, node) in nodes.iter_mut().enumerate().skip(1) {
            let (result, events) = node.receive_block(&bytes, now);
            assert_eq!(result, UpdateResult::Success);
            for event in events {
                queue.push_back((target, event));
            }
        }
        hashes.push(hash);
        slot = baked_slot + 1;
    }
    (hashes, queue, now)
}

fn seed_round_start(nodes: &mut [SkovState], now: u64) -> VecDeque<(usize, ConsensusEvent)> {
    let mut queue = VecDeque::new();
    for (target, node) in nodes.iter_mut().enumerate() {
        for event in node.start_finalization(now) {
            queue.push_back((target, event));
        }
    }
    queue
}

#[test]
fn committee_finalizes_the_target_height() {
    let (keys, genesis) = make_committee();
    let mut nodes = make_nodes(&keys, &genesis);

    let mut queue = seed_round_start(&mut nodes, slot_time(1));
    // Height 3 puts the best block one delta past the target height 2
    let (hashes, grown, now) = grow_chain(&mut nodes, &keys, 3);
    queue.extend(grown);

    run_network(&mut nodes, queue, now);

    for node in &nodes {
        assert_eq!(node.data.tree.next_finalization_index(), 2);
        let record = node.data.tree.record(1).unwrap();
        assert_eq!(record.block, hashes[1], "the height-2 ancestor settles");
        assert_eq!(record.delay, 1);
        assert_eq!(node.finalization.current_index(), 2);
        assert!(node.finalization.verify_record_proof(record), "P6 holds");
    }

    // All four saw the same record bytes
    let reference = nodes[0].data.tree.record(1).unwrap().to_bytes();
    for node in &nodes[1..] {
        assert_eq!(node.data.tree.record(1).unwrap().to_bytes(), reference);
    }
}

#[test]
fn failed_round_doubles_delta_and_recovers() {
    let (keys, genesis) = make_committee();
    let mut nodes = make_nodes(&keys, &genesis);
    let session = nodes[0].genesis_hash();

    let mut queue = seed_round_start(&mut nodes, slot_time(1));
    // Deep enough for a delta-2 nomination (target 2 + delta 2)
    let (_hashes, grown, now) = grow_chain(&mut nodes, &keys, 4);
    queue.extend(grown);

    // Force the delta-1 round to fail everywhere: a quorum of signed
    // WeAreDone(false) from the other three parties
    for target in 0..nodes.len() {
        for sender in 0..4u32 {
            if sender as usize == target {
                continue;
            }
            let message = FinalizationMessage::sign(
                FinalizationMessageHeader {
                    session,
                    index: 1,
                    delta: 1,
                    sender,
                },
                WmvbaMessage::WeAreDone(false),
                &keys[sender as usize].finalization.sign,
            );
            let (result, events) =
                nodes[target].receive_finalization_message(&message.to_bytes(), now);
            assert_ne!(result, UpdateResult::Invalid);
            for event in events {
                queue.push_back((target, event));
            }
        }
        assert_eq!(
            nodes[target].finalization.round_delta(),
            2,
            "node {target} doubled its delta"
        );
    }

    run_network(&mut nodes, queue, now);

    for node in &nodes {
        let record = node.data.tree.record(1).expect("index 1 settled");
        assert_eq!(record.delay, 2, "the successful round ran at delta 2");
        assert_eq!(node.finalization.current_index(), 2);
        // The next index starts back at delta max(1, 2/2) = 1
        assert_eq!(node.finalization.round_delta(), 1);
    }
}

#[test]
fn ingress_window_results() {
    let (keys, genesis) = make_committee();
    let mut nodes = make_nodes(&keys, &genesis);
    let session = nodes[0].genesis_hash();
    let now = slot_time(1);

    let sign = |index: u64, sender: u32| {
        FinalizationMessage::sign(
            FinalizationMessageHeader {
                session,
                index,
                delta: 1,
                sender,
            },
            WmvbaMessage::WeAreDone(true),
            &keys[sender as usize].finalization.sign,
        )
    };

    // Wrong session
    let mut foreign = sign(1, 1);
    foreign.header.session = Hash::sha256(b"another chain");
    let (result, _) = nodes[0].receive_finalization_message(&foreign.to_bytes(), now);
    assert_eq!(result, UpdateResult::IncorrectSession);

    // Beyond the window
    let (result, _) = nodes[0].receive_finalization_message(&sign(3, 1).to_bytes(), now);
    assert_eq!(result, UpdateResult::Invalid);

    // Next index: buffered
    let next = sign(2, 1);
    let (result, _) = nodes[0].receive_finalization_message(&next.to_bytes(), now);
    assert_eq!(result, UpdateResult::PendingFinalization);
    let (result, _) = nodes[0].receive_finalization_message(&next.to_bytes(), now);
    assert_eq!(result, UpdateResult::Duplicate);

    // A sender outside the committee
    let mut outsider = sign(1, 1);
    outsider.header.sender = 99;
    let (result, _) = nodes[0].receive_finalization_message(&outsider.to_bytes(), now);
    assert_eq!(result, UpdateResult::Invalid);

    // A tampered envelope signature
    let mut forged = sign(1, 2);
    forged.signature.0[0] ^= 0xFF;
    let (result, _) = nodes[0].receive_finalization_message(&forged.to_bytes(), now);
    assert_eq!(result, UpdateResult::Invalid);
}

#[test]
fn lagging_peer_is_served_records() {
    let (keys, genesis) = make_committee();
    let mut nodes = make_nodes(&keys, &genesis);

    let mut queue = seed_round_start(&mut nodes, slot_time(1));
    let (_hashes, grown, now) = grow_chain(&mut nodes, &keys, 3);
    queue.extend(grown);
    run_network(&mut nodes, queue, now);

    // Node 1 falls back to a fresh state that has the blocks but no records
    let mut lagging = {
        let params = ChainParameters::new(&genesis, 1_048_576, 3_000_000, 1_000, 600, 1_000);
        SkovState::new(
            genesis.clone(),
            params,
            Box::new(CountingExecutor),
            Some(keys[1].credentials.id),
            Some(keys[1].finalization.clone()),
            FinalizationSettings::default(),
        )
        .unwrap()
    };
    for idx in 0..3 {
        let bytes = {
            let tree = &nodes[0].data.tree;
            let ptr = tree.finalized_at_height(idx + 1);
            match ptr {
                Some(p) => p.block.to_bytes(),
                None => {
                    // Above the finalized horizon: take the live chain
                    let best = tree.best_block();
                    let member = tree.ancestor_at_height(best, idx + 1);
                    tree.pointer(member).block.to_bytes()
                }
            }
        };
        let (result, _) = lagging.receive_block(&bytes, now);
        assert_eq!(result, UpdateResult::Success);
    }
    assert_eq!(lagging.data.tree.next_finalization_index(), 1);

    // The lagging node announces its summary; the up-to-date node serves
    // the missing records point-to-point
    let generation = lagging.replay_generation();
    let announce = lagging.on_replay_timer(generation, now);
    let catch_up_bytes = announce
        .iter()
        .find_map(|event| match event {
            ConsensusEvent::BroadcastCatchUpStatus(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .expect("replay broadcasts a catch-up status");

    let (result, events) = nodes[0].receive_catch_up_status(&catch_up_bytes, now);
    assert_eq!(result, UpdateResult::Success, "peer is behind, not us");
    let records: Vec<Vec<u8>> = events
        .iter()
        .filter_map(|event| match event {
            ConsensusEvent::DirectedFinalizationRecord(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .collect();
    assert!(!records.is_empty());

    for bytes in records {
        let (result, _) = lagging.receive_finalization_record(&bytes, now);
        assert_ne!(result, UpdateResult::Invalid);
    }
    assert_eq!(
        lagging.data.tree.next_finalization_index(),
        nodes[0].data.tree.next_finalization_index()
    );
}
