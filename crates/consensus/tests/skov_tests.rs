//! Tests for the Skov driver: block ingress statuses, baking, synthetic
//! finalization and fork pruning.

use std::any::Any;
use std::sync::Arc;
use tessera_consensus::messages::{make_baid, witness_message};
use tessera_consensus::{
    BakeOutcome, BakerCredentials, BlockExecutor, BlockStatus, ChainMetadata, ChainParameters,
    ConsensusEvent, ExecutionOutcome, ExecutionState, FinalizationKeys, FinalizationSettings,
    ProtocolUpdate, SkovState, TransactionStatus, UpdateResult,
};
use tessera_crypto::{BlsSecretKey, BlsSignature, SignKeypair, VrfSecretKey};
use tessera_types::{
    BakerInfo, BlockHash, FinalizationProof, FinalizationRecord, GenesisData, Hash, Serial,
    SignatureBytes, Transaction,
};

#[derive(Debug)]
struct Tally {
    height: u64,
}

impl ExecutionState for Tally {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CountingExecutor;

impl BlockExecutor for CountingExecutor {
    fn genesis_state(&self, _genesis: &GenesisData) -> Arc<dyn ExecutionState> {
        Arc::new(Tally { height: 0 })
    }

    fn execute(
        &self,
        parent_state: &Arc<dyn ExecutionState>,
        transactions: &[Transaction],
        _meta: &ChainMetadata,
    ) -> Result<ExecutionOutcome, String> {
        let parent = parent_state
            .as_any()
            .downcast_ref::<Tally>()
            .ok_or("wrong state type")?;
        Ok(ExecutionOutcome {
            results: transactions.iter().map(|tx| (tx.hash(), true)).collect(),
            new_state: Arc::new(Tally {
                height: parent.height + 1,
            }),
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
    let sign = SignKeypair::from_seed(&seed(10, id as u8));
    let vrf = VrfSecretKey::from_seed(&seed(20, id as u8));
    let bls = BlsSecretKey::from_seed(&seed(30, id as u8));
    BakerKeys {
        credentials: BakerCredentials {
            id,
            sign: sign.clone(),
            vrf: vrf.clone(),
        },
        finalization: FinalizationKeys { sign, vrf, bls },
    }
}

fn test_genesis(keys: &[BakerKeys]) -> GenesisData {
    GenesisData {
        time_ms: 0,
        slot_duration_ms: 1_000,
        // High difficulty: each baker wins almost every slot, so the tests
        // find winning slots quickly and deterministically
        election_difficulty: 0.999_999,
        epoch_length: 100_000,
        min_skip: 1,
        leadership_election_nonce: Hash::sha256(b"lottery seed"),
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
    }
}

fn make_state(keys: &[BakerKeys], me: Option<usize>) -> SkovState {
    let genesis = test_genesis(keys);
    let params = ChainParameters::new(&genesis, 1_048_576, 3_000_000, 30, 600, 1_000);
    SkovState::new(
        genesis,
        params,
        Box::new(CountingExecutor),
        me.map(|i| keys[i].credentials.id),
        me.map(|i| keys[i].finalization.clone()),
        FinalizationSettings::default(),
    )
    .unwrap()
}

fn slot_time(slot: u64) -> u64 {
    slot * 1_000 + 1
}

/// Bakes the next winning block at or after `start_slot`.
fn bake_next(
    state: &mut SkovState,
    credentials: &BakerCredentials,
    start_slot: u64,
) -> (Vec<u8>, BlockHash, u64) {
    for slot in start_slot..start_slot + 400 {
        let (outcome, _events) = state.try_bake(credentials, slot, slot_time(slot));
        if let BakeOutcome::Baked { bytes, hash, slot } = outcome {
            return (bytes, hash, slot);
        }
    }
    panic!("no winning slot in 400 attempts");
}

fn synthetic_record(
    session: Hash,
    index: u64,
    block: BlockHash,
    delay: u64,
    keys: &[BakerKeys],
    parties: &[u32],
) -> FinalizationRecord {
    let baid = make_baid(&session, index, delay);
    let message = witness_message(&baid, &block);
    let signatures: Vec<BlsSignature> = parties
        .iter()
        .map(|&p| keys[p as usize].finalization.bls.sign(&message))
        .collect();
    let refs: Vec<&BlsSignature> = signatures.iter().collect();
    let aggregate = BlsSignature::aggregate(&refs).unwrap();
    FinalizationRecord {
        index,
        block,
        proof: FinalizationProof {
            parties: parties.to_vec(),
            signature: aggregate.to_bytes(),
        },
        delay,
    }
}

fn account_transaction(seed_tag: u8, nonce: u64) -> Transaction {
    let keypair = SignKeypair::from_seed(&seed(40, seed_tag));
    let mut tx = Transaction {
        sender: tessera_types::AccountAddress(keypair.public_key().to_bytes().0),
        nonce,
        energy: 1_000,
        payload: vec![seed_tag],
        signature: SignatureBytes::default(),
    };
    tx.signature = keypair.sign(&tx.signable_bytes());
    tx
}

#[test]
fn baked_block_is_duplicate_on_replay() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);

    let (bytes, hash, slot) = bake_next(&mut baker, &keys[0].credentials, 1);
    let (result, _) = observer.receive_block(&bytes, slot_time(slot));
    assert_eq!(result, UpdateResult::Success);
    assert!(matches!(
        observer.data.tree.status(&hash),
        Some(BlockStatus::Alive(_))
    ));

    // Receiving the same block twice is idempotent
    let (result, _) = observer.receive_block(&bytes, slot_time(slot));
    assert_eq!(result, UpdateResult::Duplicate);
    assert_eq!(observer.best_block_hash(), hash);
}

#[test]
fn child_pends_until_parent_arrives() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);

    let (b1_bytes, b1, s1) = bake_next(&mut baker, &keys[0].credentials, 1);
    let (b2_bytes, b2, s2) = bake_next(&mut baker, &keys[0].credentials, s1 + 1);

    // Child first: parked, not alive
    let (result, _) = observer.receive_block(&b2_bytes, slot_time(s2));
    assert_eq!(result, UpdateResult::PendingBlock);
    assert!(matches!(
        observer.data.tree.status(&b2),
        Some(BlockStatus::Pending { .. })
    ));

    // Parent arrives: both become alive without re-delivery
    let (result, _) = observer.receive_block(&b1_bytes, slot_time(s2));
    assert_eq!(result, UpdateResult::Success);
    assert!(matches!(observer.data.tree.status(&b1), Some(BlockStatus::Alive(_))));
    assert!(matches!(observer.data.tree.status(&b2), Some(BlockStatus::Alive(_))));
    assert_eq!(observer.best_block_hash(), b2);
}

#[test]
fn early_blocks_are_not_stored() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);

    let (bytes, hash, slot) = bake_next(&mut baker, &keys[0].credentials, 500);
    // The observer's clock is still at slot 1
    let (result, _) = observer.receive_block(&bytes, slot_time(1));
    assert_eq!(result, UpdateResult::EarlyBlock);
    assert!(observer.data.tree.status(&hash).is_none());
    let _ = slot;
}

#[test]
fn tampered_block_is_invalid() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);

    let (mut bytes, _, slot) = bake_next(&mut baker, &keys[0].credentials, 1);
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let (result, _) = observer.receive_block(&bytes, slot_time(slot));
    assert_eq!(result, UpdateResult::Invalid);
}

#[test]
fn synthetic_quorum_finalizes_block() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);
    let session = observer.genesis_hash();

    // Start at slot 10 so a competing branch baked from slot 1 lands below
    // the finalized horizon afterwards
    let (b1_bytes, b1, s1) = bake_next(&mut baker, &keys[0].credentials, 10);
    observer.receive_block(&b1_bytes, slot_time(s1));

    let record = synthetic_record(session, 1, b1, 1, &keys, &[0, 1, 2]);
    let (result, _events) = observer.receive_finalization_record(&record.to_bytes(), slot_time(s1));
    assert_eq!(result, UpdateResult::Success);

    assert!(matches!(
        observer.data.tree.status(&b1),
        Some(BlockStatus::Finalized { .. })
    ));
    assert_eq!(observer.data.tree.finalized_at_height(1).unwrap().hash, b1);
    assert_eq!(observer.data.tree.next_finalization_index(), 2);
    assert_eq!(observer.finalization.current_index(), 2);

    // A replay of the record is now stale
    let (result, _) = observer.receive_finalization_record(&record.to_bytes(), slot_time(s1));
    assert_eq!(result, UpdateResult::Stale);

    // A fork block below the finalized slot is stale
    let mut other = make_state(&keys, Some(1));
    let (late_bytes, _, late_slot) = bake_next(&mut other, &keys[1].credentials, 1);
    assert!(late_slot < s1, "fork slot {late_slot} should precede {s1}");
    let (result, _) = observer.receive_block(&late_bytes, slot_time(s1));
    assert_eq!(result, UpdateResult::Stale);
}

#[test]
fn underweight_record_is_invalid() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);
    let session = observer.genesis_hash();

    let (b1_bytes, b1, s1) = bake_next(&mut baker, &keys[0].credentials, 1);
    observer.receive_block(&b1_bytes, slot_time(s1));

    // One party of four is at most the corruption bound
    let record = synthetic_record(session, 1, b1, 1, &keys, &[0]);
    let (result, _) = observer.receive_finalization_record(&record.to_bytes(), slot_time(s1));
    assert_eq!(result, UpdateResult::Invalid);
    assert!(matches!(
        observer.data.tree.status(&b1),
        Some(BlockStatus::Alive(_))
    ));
}

#[test]
fn fork_pruning_reverts_transactions() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker_a = make_state(&keys, Some(0));
    let mut baker_b = make_state(&keys, Some(1));
    let mut observer = make_state(&keys, None);
    let session = observer.genesis_hash();

    // Branch A: an empty block from baker 0
    let (a_bytes, a_hash, a_slot) = bake_next(&mut baker_a, &keys[0].credentials, 1);

    // Branch B: a later block from baker 1 carrying a transaction
    let tx = account_transaction(1, 1);
    assert_eq!(
        baker_b.receive_transaction(&tx.to_bytes(), slot_time(a_slot)),
        UpdateResult::Success
    );
    let (b_bytes, b_hash, b_slot) = bake_next(&mut baker_b, &keys[1].credentials, a_slot + 1);

    let now = slot_time(b_slot);
    assert_eq!(observer.receive_block(&a_bytes, now).0, UpdateResult::Success);
    assert_eq!(observer.receive_block(&b_bytes, now).0, UpdateResult::Success);

    // The observer saw the transaction only through branch B
    assert!(matches!(
        observer.data.table.get(&tx.hash()).unwrap().1,
        TransactionStatus::Committed { .. }
    ));

    // Finalize branch A; branch B dies and its transaction reverts
    let record = synthetic_record(session, 1, a_hash, 1, &keys, &[0, 1, 2]);
    let (result, _) = observer.receive_finalization_record(&record.to_bytes(), now);
    assert_eq!(result, UpdateResult::Success);

    assert!(matches!(
        observer.data.tree.status(&a_hash),
        Some(BlockStatus::Finalized { .. })
    ));
    assert_eq!(observer.data.tree.status(&b_hash), Some(BlockStatus::Dead));
    assert!(matches!(
        observer.data.table.get(&tx.hash()).unwrap().1,
        TransactionStatus::Received { .. }
    ));
}

#[test]
fn transaction_ingress_statuses() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut state = make_state(&keys, None);

    let tx = account_transaction(2, 1);
    assert_eq!(
        state.receive_transaction(&tx.to_bytes(), slot_time(1)),
        UpdateResult::Success
    );
    assert_eq!(
        state.receive_transaction(&tx.to_bytes(), slot_time(2)),
        UpdateResult::Duplicate
    );

    let mut forged = tx.clone();
    forged.payload.push(0xFF);
    assert_eq!(
        state.receive_transaction(&forged.to_bytes(), slot_time(2)),
        UpdateResult::Invalid
    );
}

#[test]
fn elapsed_protocol_update_triggers_regenesis() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let mut baker = make_state(&keys, Some(0));
    let mut observer = make_state(&keys, None);
    let session = observer.genesis_hash();

    let (b1_bytes, b1, s1) = bake_next(&mut baker, &keys[0].credentials, 1);
    observer.receive_block(&b1_bytes, slot_time(s1));

    // Scheduled long ago; it must take effect at the next finalization
    observer.enqueue_protocol_update(ProtocolUpdate {
        effective_time_ms: 0,
        payload: vec![7],
    });

    let record = synthetic_record(session, 1, b1, 1, &keys, &[0, 1, 2]);
    let (result, events) = observer.receive_finalization_record(&record.to_bytes(), slot_time(s1));
    assert_eq!(result, UpdateResult::Success);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConsensusEvent::Regenesis { payload } if payload == &vec![7u8])));
    assert!(observer.data.updates.effective().is_some());

    // A later update cannot override the effective one
    observer.enqueue_protocol_update(ProtocolUpdate {
        effective_time_ms: 0,
        payload: vec![8],
    });
    assert_eq!(observer.data.updates.effective().unwrap().payload, vec![7]);
}
