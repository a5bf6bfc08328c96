//! The Tessera node runner.
//!
//! Owns the single consensus lock and every thread that touches it:
//!
//! - the **dispatch thread** drains the bounded inbound channels (consensus
//!   messages before transactions) and applies each message under the lock
//! - the **baker thread** runs the slot loop
//! - the **purge thread** sweeps the transaction table
//! - **timer threads** fire the finalization replay and the Seen-buffer
//!   flush
//!
//! Outbound callbacks never run with the lock held: consensus returns
//! [`ConsensusEvent`]s which are performed after release. Finalized blocks
//! are archived to the append-only blob store.

use crate::baker::{run_baker_loop, run_purge_loop};
use crate::timers::{Clock, TimerHandle, TimerService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tessera_config::Config;
use tessera_consensus::{
    BakerCredentials, BlockExecutor, ChainParameters, ConsensusEvent, FinalizationKeys,
    FinalizationSettings, SkovError, SkovState, UpdateResult,
};
use tessera_storage::{BlobOffset, BlobStore, BlockImportReader, BufferedRef, StorageError};
use tessera_types::{Block, BlockHash, FinalizationIndex, GenesisData};
use tracing::{debug, error, info, warn};

/// Identity of a peer, assigned by the transport layer.
pub type PeerId = u64;

/// What kind of payload an outbound send carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    /// A serialized block
    Block,
    /// A serialized finalization message
    FinalizationMessage,
    /// A serialized finalization record
    FinalizationRecord,
    /// A serialized catch-up status
    CatchUpStatus,
}

/// The transport's send surface. Implementations must be thread-safe and
/// tolerate duplicate sends.
pub trait OutboundSink: Send + Sync {
    /// Broadcasts bytes to all peers.
    fn broadcast(&self, kind: OutboundKind, bytes: &[u8]);

    /// Sends bytes to one peer.
    fn send_direct(&self, peer: PeerId, kind: OutboundKind, bytes: &[u8]);
}

/// A message delivered by the transport.
#[derive(Debug)]
pub enum InboundMessage {
    /// A serialized block
    Block(PeerId, Vec<u8>),
    /// A serialized transaction
    Transaction(PeerId, Vec<u8>),
    /// A serialized finalization message
    FinalizationMessage(PeerId, Vec<u8>),
    /// A serialized finalization record
    FinalizationRecord(PeerId, Vec<u8>),
    /// A serialized catch-up status
    CatchUpStatus(PeerId, Vec<u8>),
    /// Stop the dispatch thread
    Shutdown,
}

/// Errors starting or running a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Consensus state construction failed
    #[error(transparent)]
    Skov(#[from] SkovError),

    /// The blob store could not be opened
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The consensus state behind its single lock.
pub type SharedState = Arc<Mutex<SkovState>>;

struct SinkInner {
    outbound: Arc<dyn OutboundSink>,
    timers: TimerService,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    replay_timer: Mutex<Option<TimerHandle>>,
    buffer_timer: Mutex<Option<TimerHandle>>,
    finalized_tx: Mutex<Vec<std::sync::mpsc::Sender<(BlockHash, FinalizationIndex)>>>,
    regenesis_tx: Mutex<Vec<std::sync::mpsc::Sender<Vec<u8>>>>,
    archive: Mutex<HashMap<BlockHash, BlobOffset>>,
    blob: Option<Arc<BlobStore>>,
}

/// Performs consensus events after the lock is released.
#[derive(Clone)]
pub(crate) struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub(crate) fn broadcast_block(&self, bytes: &[u8]) {
        self.inner.outbound.broadcast(OutboundKind::Block, bytes);
    }

    /// Performs a batch of events. `reply_to` is the peer whose message
    /// produced them, for the directed responses.
    pub(crate) fn dispatch(
        &self,
        state: &SharedState,
        events: Vec<ConsensusEvent>,
        reply_to: Option<PeerId>,
    ) {
        for event in events {
            match event {
                ConsensusEvent::BroadcastFinalizationMessage(bytes) => {
                    self.inner
                        .outbound
                        .broadcast(OutboundKind::FinalizationMessage, &bytes);
                }
                ConsensusEvent::BroadcastFinalizationRecord(bytes) => {
                    self.inner
                        .outbound
                        .broadcast(OutboundKind::FinalizationRecord, &bytes);
                }
                ConsensusEvent::BroadcastCatchUpStatus(bytes) => {
                    self.inner
                        .outbound
                        .broadcast(OutboundKind::CatchUpStatus, &bytes);
                }
                ConsensusEvent::DirectedFinalizationRecord(bytes) => {
                    if let Some(peer) = reply_to {
                        self.inner
                            .outbound
                            .send_direct(peer, OutboundKind::FinalizationRecord, &bytes);
                    }
                }
                ConsensusEvent::DirectedBlock(bytes) => {
                    if let Some(peer) = reply_to {
                        self.inner
                            .outbound
                            .send_direct(peer, OutboundKind::Block, &bytes);
                    }
                }
                ConsensusEvent::ResetReplayTimer { deadline_ms } => {
                    self.arm_replay_timer(state, deadline_ms);
                }
                ConsensusEvent::BufferDeadline { deadline_ms } => {
                    self.arm_buffer_timer(state, deadline_ms);
                }
                ConsensusEvent::BlockFinalized { hash, index } => {
                    self.on_block_finalized(state, hash, index);
                }
                ConsensusEvent::Regenesis { payload } => {
                    info!("Protocol update effective; firing regenesis callback");
                    self.inner
                        .regenesis_tx
                        .lock()
                        .retain(|tx| tx.send(payload.clone()).is_ok());
                }
            }
        }
    }

    /// Replaces the round's replay timer. The armed callback carries the
    /// current timer generation; a reset makes outstanding firings stale.
    fn arm_replay_timer(&self, state: &SharedState, deadline_ms: u64) {
        let generation = state.lock().replay_generation();
        let sink = self.clone();
        let state = Arc::clone(state);
        let shutdown = Arc::clone(&self.inner.shutdown);
        let clock = Arc::clone(&self.inner.clock);
        let handle = self.inner.timers.schedule(deadline_ms, move || {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = clock.now_ms();
            let events = state.lock().on_replay_timer(generation, now);
            sink.dispatch(&state, events, None);
        });
        if let Some(previous) = self.inner.replay_timer.lock().replace(handle) {
            previous.cancel();
        }
    }

    fn arm_buffer_timer(&self, state: &SharedState, deadline_ms: u64) {
        let sink = self.clone();
        let state = Arc::clone(state);
        let shutdown = Arc::clone(&self.inner.shutdown);
        let clock = Arc::clone(&self.inner.clock);
        let handle = self.inner.timers.schedule(deadline_ms, move || {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = clock.now_ms();
            let events = state.lock().on_buffer_deadline(now);
            sink.dispatch(&state, events, None);
        });
        if let Some(previous) = self.inner.buffer_timer.lock().replace(handle) {
            previous.cancel();
        }
    }

    /// Archives the finalized block to the blob store and notifies
    /// subscribers.
    fn on_block_finalized(&self, state: &SharedState, hash: BlockHash, index: FinalizationIndex) {
        info!(block = %hash.short(), index, "Finalized");
        if let Some(blob) = &self.inner.blob {
            let block: Option<Block> = {
                let guard = state.lock();
                guard
                    .data
                    .tree
                    .live_idx(&hash)
                    .map(|idx| (*guard.data.tree.pointer(idx).block).clone())
            };
            if let Some(block) = block {
                let mut buffered = BufferedRef::new(block);
                match buffered.flush(blob) {
                    Ok(offset) => {
                        self.inner.archive.lock().insert(hash, offset);
                    }
                    Err(err) => {
                        // The node keeps serving; only archival is degraded
                        error!(error = %err, "Failed to archive finalized block");
                    }
                }
            }
        }
        self.inner
            .finalized_tx
            .lock()
            .retain(|tx| tx.send((hash, index)).is_ok());
    }

    fn cancel_timers(&self) {
        if let Some(timer) = self.inner.replay_timer.lock().take() {
            timer.cancel();
        }
        if let Some(timer) = self.inner.buffer_timer.lock().take() {
            timer.cancel();
        }
    }
}

/// The full node.
pub struct Node {
    state: SharedState,
    sink: EventSink,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    high_tx: SyncSender<InboundMessage>,
    low_tx: SyncSender<InboundMessage>,
    channels: Option<(Receiver<InboundMessage>, Receiver<InboundMessage>)>,
    threads: Vec<JoinHandle<()>>,
    baker: Option<BakerCredentials>,
    purging_delay: Duration,
}

impl Node {
    /// Builds a node from configuration and genesis.
    pub fn new(
        config: &Config,
        genesis: GenesisData,
        executor: Box<dyn BlockExecutor>,
        baker: Option<BakerCredentials>,
        finalization_keys: Option<FinalizationKeys>,
        outbound: Arc<dyn OutboundSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        let params = ChainParameters::new(
            &genesis,
            config.baker.max_block_size,
            config.baker.max_block_energy,
            config.baker.early_block_threshold,
            config.transactions.keep_alive_slots,
            config.transactions.insertions_before_purge,
        );
        let settings = FinalizationSettings {
            replay_base_delay_ms: config.finalization.replay_base_delay_ms,
            replay_per_party_ms: config.finalization.replay_per_party_ms,
            seen_max_delay_ms: config.finalization.seen_max_delay_ms,
            seen_delay_step_ms: config.finalization.seen_delay_step_ms,
            dedup_window_ms: config.finalization.catch_up_dedup_window_secs * 1000,
        };
        let my_baker_id = baker.as_ref().map(|b| b.id).or(config.baker.baker_id);
        let state = SkovState::new(
            genesis,
            params,
            executor,
            my_baker_id,
            finalization_keys,
            settings,
        )?;

        std::fs::create_dir_all(&config.node.data_dir).map_err(StorageError::Io)?;
        let blob = Arc::new(BlobStore::open(config.node.data_dir.join("blocks.dat"))?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let (high_tx, high_rx) = sync_channel(4096);
        let (low_tx, low_rx) = sync_channel(16_384);
        let sink = EventSink {
            inner: Arc::new(SinkInner {
                outbound,
                timers: TimerService::new(Arc::clone(&clock)),
                clock: Arc::clone(&clock),
                shutdown: Arc::clone(&shutdown),
                replay_timer: Mutex::new(None),
                buffer_timer: Mutex::new(None),
                finalized_tx: Mutex::new(Vec::new()),
                regenesis_tx: Mutex::new(Vec::new()),
                archive: Mutex::new(HashMap::new()),
                blob: Some(blob),
            }),
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            sink,
            clock,
            shutdown,
            high_tx,
            low_tx,
            channels: Some((high_rx, low_rx)),
            threads: Vec::new(),
            baker,
            purging_delay: Duration::from_secs(config.transactions.purging_delay_secs),
        })
    }

    /// Starts the dispatch, baker and purge threads and the first
    /// finalization round.
    pub fn start(&mut self) {
        let (high_rx, low_rx) = self
            .channels
            .take()
            .expect("start may only be called once");

        // Kick off finalization before any message can arrive
        let now = self.clock.now_ms();
        let events = self.state.lock().start_finalization(now);
        self.sink.dispatch(&self.state, events, None);

        {
            let state = Arc::clone(&self.state);
            let sink = self.sink.clone();
            let clock = Arc::clone(&self.clock);
            let shutdown = Arc::clone(&self.shutdown);
            self.threads.push(std::thread::spawn(move || {
                run_dispatch_loop(state, sink, clock, shutdown, high_rx, low_rx);
            }));
        }

        if let Some(credentials) = self.baker.clone() {
            let state = Arc::clone(&self.state);
            let sink = self.sink.clone();
            let clock = Arc::clone(&self.clock);
            let shutdown = Arc::clone(&self.shutdown);
            self.threads.push(std::thread::spawn(move || {
                run_baker_loop(state, sink, credentials, clock, shutdown);
            }));
        }

        {
            let state = Arc::clone(&self.state);
            let clock = Arc::clone(&self.clock);
            let shutdown = Arc::clone(&self.shutdown);
            let delay = self.purging_delay;
            self.threads.push(std::thread::spawn(move || {
                run_purge_loop(state, clock, shutdown, delay);
            }));
        }
        info!("Node started");
    }

    fn queue(&self, high_priority: bool, message: InboundMessage) -> bool {
        let channel = if high_priority {
            &self.high_tx
        } else {
            &self.low_tx
        };
        match channel.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!(?dropped, "Inbound queue full; dropping message");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Enqueues a serialized block.
    pub fn send_block(&self, peer: PeerId, bytes: Vec<u8>) -> bool {
        self.queue(true, InboundMessage::Block(peer, bytes))
    }

    /// Enqueues a serialized transaction (low priority).
    pub fn send_transaction(&self, peer: PeerId, bytes: Vec<u8>) -> bool {
        self.queue(false, InboundMessage::Transaction(peer, bytes))
    }

    /// Enqueues a serialized finalization message.
    pub fn send_finalization_message(&self, peer: PeerId, bytes: Vec<u8>) -> bool {
        self.queue(true, InboundMessage::FinalizationMessage(peer, bytes))
    }

    /// Enqueues a serialized finalization record.
    pub fn send_finalization_record(&self, peer: PeerId, bytes: Vec<u8>) -> bool {
        self.queue(true, InboundMessage::FinalizationRecord(peer, bytes))
    }

    /// Enqueues a serialized catch-up status.
    pub fn send_catch_up_status(&self, peer: PeerId, bytes: Vec<u8>) -> bool {
        self.queue(true, InboundMessage::CatchUpStatus(peer, bytes))
    }

    /// Runs a read-only query against the state snapshot under the lock.
    pub fn run_state_query<R>(&self, query: impl FnOnce(&SkovState) -> R) -> R {
        let guard = self.state.lock();
        query(&guard)
    }

    /// Subscribes to finalized-block notifications.
    pub fn subscribe_finalized(
        &self,
    ) -> std::sync::mpsc::Receiver<(BlockHash, FinalizationIndex)> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.sink.inner.finalized_tx.lock().push(tx);
        rx
    }

    /// Subscribes to regenesis notifications (a protocol update took
    /// effect at a finalization).
    pub fn subscribe_regenesis(&self) -> std::sync::mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.sink.inner.regenesis_tx.lock().push(tx);
        rx
    }

    /// Schedules a chain-parameter update.
    pub fn schedule_protocol_update(&self, update: tessera_consensus::ProtocolUpdate) {
        self.state.lock().enqueue_protocol_update(update);
    }

    /// The blob-store offset a finalized block was archived at, if any.
    pub fn archived_offset(&self, hash: &BlockHash) -> Option<tessera_storage::BlobOffset> {
        self.sink.inner.archive.lock().get(hash).copied()
    }

    /// Replays a block-import file through the normal receive path.
    ///
    /// Stops at the first fatal error; duplicates and stale blocks are
    /// expected on re-import and do not stop the replay.
    pub fn import_blocks(&self, path: &Path) -> UpdateResult {
        let mut reader = match BlockImportReader::open(path) {
            Ok(reader) => reader,
            Err(StorageError::ImportFileMissing(path)) => {
                warn!(path = %path.display(), "Import file missing");
                return UpdateResult::MissingImportFile;
            }
            Err(err) => {
                error!(error = %err, "Failed to open import file");
                return UpdateResult::Invalid;
            }
        };
        let mut imported = 0u64;
        loop {
            match reader.next_block() {
                Ok(Some(bytes)) => {
                    let now = self.clock.now_ms();
                    let (result, events) = self.state.lock().receive_block(&bytes, now);
                    self.sink.dispatch(&self.state, events, None);
                    match result {
                        UpdateResult::Success
                        | UpdateResult::Duplicate
                        | UpdateResult::Stale
                        | UpdateResult::PendingBlock => imported += 1,
                        fatal => {
                            error!(?fatal, "Fatal error during block import");
                            return fatal;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "Corrupt import file");
                    return UpdateResult::Invalid;
                }
            }
        }
        info!(imported, "Block import complete");
        UpdateResult::Success
    }

    /// Stops every thread, cancels timers and syncs the blob store.
    pub fn stop(&mut self) {
        info!("Node shutting down");
        self.shutdown.store(true, Ordering::Release);
        let _ = self.high_tx.try_send(InboundMessage::Shutdown);
        self.sink.cancel_timers();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        if let Some(blob) = &self.sink.inner.blob {
            if let Err(err) = blob.sync() {
                warn!(error = %err, "Blob store sync failed during shutdown");
            }
        }
        info!("Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

/// The dispatch loop: consensus messages drain before transactions.
fn run_dispatch_loop(
    state: SharedState,
    sink: EventSink,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    high_rx: Receiver<InboundMessage>,
    low_rx: Receiver<InboundMessage>,
) {
    while !shutdown.load(Ordering::Acquire) {
        // High priority first; fall back to one low-priority message per
        // empty high poll
        let message = match high_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) => low_rx.try_recv().ok(),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(message) = message else {
            continue;
        };
        if matches!(message, InboundMessage::Shutdown) {
            break;
        }
        handle_message(&state, &sink, clock.as_ref(), message);
    }
    debug!("Dispatch loop stopped");
}

fn handle_message(
    state: &SharedState,
    sink: &EventSink,
    clock: &dyn Clock,
    message: InboundMessage,
) {
    let now = clock.now_ms();
    let (peer, result, events) = match message {
        InboundMessage::Block(peer, bytes) => {
            let (result, events) = state.lock().receive_block(&bytes, now);
            (peer, result, events)
        }
        InboundMessage::Transaction(peer, bytes) => {
            let result = state.lock().receive_transaction(&bytes, now);
            (peer, result, Vec::new())
        }
        InboundMessage::FinalizationMessage(peer, bytes) => {
            let (result, events) = state.lock().receive_finalization_message(&bytes, now);
            (peer, result, events)
        }
        InboundMessage::FinalizationRecord(peer, bytes) => {
            let (result, events) = state.lock().receive_finalization_record(&bytes, now);
            (peer, result, events)
        }
        InboundMessage::CatchUpStatus(peer, bytes) => {
            let (result, events) = state.lock().receive_catch_up_status(&bytes, now);
            (peer, result, events)
        }
        InboundMessage::Shutdown => return,
    };
    debug!(peer, ?result, "Processed inbound message");
    sink.dispatch(state, events, Some(peer));
}
