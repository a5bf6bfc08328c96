//! Integration tests for the node runner: the baker thread end to end,
//! block import, and the no-win quiet chain.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tessera_config::Config;
use tessera_consensus::{
    BakeOutcome, BakerCredentials, BlockExecutor, ChainMetadata, ChainParameters,
    ExecutionOutcome, ExecutionState, FinalizationKeys, FinalizationSettings, SkovState,
    UpdateResult,
};
use tessera_crypto::{BlsSecretKey, SignKeypair, VrfSecretKey};
use tessera_node::{Clock, Node, OutboundKind, OutboundSink, SystemClock};
use tessera_storage::BlockImportWriter;
use tessera_types::{BakerInfo, GenesisData, Hash};

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

/// Captures everything the node sends.
#[derive(Default)]
struct MemorySink {
    sent: Mutex<Vec<(OutboundKind, Vec<u8>)>>,
}

impl OutboundSink for MemorySink {
    fn broadcast(&self, kind: OutboundKind, bytes: &[u8]) {
        self.sent.lock().push((kind, bytes.to_vec()));
    }

    fn send_direct(&self, _peer: u64, kind: OutboundKind, bytes: &[u8]) {
        self.sent.lock().push((kind, bytes.to_vec()));
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
    let sign = SignKeypair::from_seed(&seed(80, id as u8));
    let vrf = VrfSecretKey::from_seed(&seed(90, id as u8));
    let bls = BlsSecretKey::from_seed(&seed(100, id as u8));
    BakerKeys {
        credentials: BakerCredentials {
            id,
            sign: sign.clone(),
            vrf: vrf.clone(),
        },
        finalization: FinalizationKeys { sign, vrf, bls },
    }
}

fn make_genesis(
    keys: &[BakerKeys],
    time_ms: u64,
    slot_duration_ms: u64,
    election_difficulty: f64,
) -> GenesisData {
    GenesisData {
        time_ms,
        slot_duration_ms,
        election_difficulty,
        epoch_length: 100_000,
        min_skip: 1,
        leadership_election_nonce: Hash::sha256(b"node test seed"),
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

fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.node.data_dir = data_dir.to_path_buf();
    config
}

#[test]
fn no_lottery_wins_leaves_only_genesis() {
    // With a vanishing election difficulty no baker can win a slot
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let genesis = make_genesis(&keys, 0, 1_000, 1e-9);
    let params = ChainParameters::new(&genesis, 1_048_576, 3_000_000, 30, 600, 1_000);
    let mut state = SkovState::new(
        genesis,
        params,
        Box::new(CountingExecutor),
        Some(0),
        Some(keys[0].finalization.clone()),
        FinalizationSettings::default(),
    )
    .unwrap();

    let genesis_hash = state.genesis_hash();
    for slot in 1..=3u64 {
        let (outcome, _) = state.try_bake(&keys[0].credentials, slot, slot * 1_000 + 1);
        assert!(matches!(outcome, BakeOutcome::WaitUntil(_)));
    }
    assert_eq!(state.best_block_hash(), genesis_hash);
    assert_eq!(state.last_finalized_hash(), genesis_hash);
    assert_eq!(state.data.tree.next_finalization_index(), 1);
}

#[test]
fn baker_thread_bakes_and_broadcasts() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let clock = Arc::new(SystemClock);
    // Short slots anchored at the current wall clock
    let genesis = make_genesis(&keys, SystemClock.now_ms(), 100, 0.999_999);

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut node = Node::new(
        &test_config(dir.path()),
        genesis,
        Box::new(CountingExecutor),
        Some(keys[0].credentials.clone()),
        Some(keys[0].finalization.clone()),
        Arc::clone(&sink) as Arc<dyn OutboundSink>,
        clock,
    )
    .unwrap();

    let genesis_hash = node.run_state_query(|state| state.genesis_hash());
    node.start();

    // A handful of 100ms slots is plenty at this difficulty
    std::thread::sleep(Duration::from_millis(1_500));
    node.stop();

    let blocks_sent = sink
        .sent
        .lock()
        .iter()
        .filter(|(kind, _)| *kind == OutboundKind::Block)
        .count();
    assert!(blocks_sent >= 1, "the baker broadcast at least one block");

    let best = node.run_state_query(|state| state.best_block_hash());
    assert_ne!(best, genesis_hash, "the chain grew");
}

#[test]
fn import_replays_blocks_through_the_receive_path() {
    let keys: Vec<BakerKeys> = (0..4).map(make_keys).collect();
    let genesis = make_genesis(&keys, 0, 1_000, 0.999_999);

    // Bake a small chain offline
    let params = ChainParameters::new(&genesis, 1_048_576, 3_000_000, 1_000_000, 600, 1_000);
    let mut source = SkovState::new(
        genesis.clone(),
        params,
        Box::new(CountingExecutor),
        Some(0),
        None,
        FinalizationSettings::default(),
    )
    .unwrap();
    let mut blocks = Vec::new();
    let mut slot = 1;
    while blocks.len() < 3 {
        let (outcome, _) = source.try_bake(&keys[0].credentials, slot, slot * 1_000 + 1);
        if let BakeOutcome::Baked { bytes, .. } = outcome {
            blocks.push(bytes);
        }
        slot += 1;
    }

    let dir = tempfile::tempdir().unwrap();
    let import_path = dir.path().join("blocks.mdb");
    let mut writer = BlockImportWriter::create(&import_path).unwrap();
    for bytes in &blocks {
        writer.append(bytes).unwrap();
    }
    writer.finish().unwrap();

    let sink = Arc::new(MemorySink::default());
    let node = Node::new(
        &test_config(dir.path()),
        genesis,
        Box::new(CountingExecutor),
        None,
        None,
        sink as Arc<dyn OutboundSink>,
        Arc::new(SystemClock),
    )
    .unwrap();

    assert_eq!(node.import_blocks(&import_path), UpdateResult::Success);
    let height = node.run_state_query(|state| {
        let best = state.data.tree.best_block();
        state.data.tree.pointer(best).height
    });
    assert_eq!(height, 3);

    // Re-importing the same file is idempotent
    assert_eq!(node.import_blocks(&import_path), UpdateResult::Success);

    // A missing file is reported distinctly
    assert_eq!(
        node.import_blocks(&dir.path().join("absent.mdb")),
        UpdateResult::MissingImportFile
    );
}
