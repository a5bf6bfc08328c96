//! The chain-parameter update queue.
//!
//! Governance can schedule protocol updates that take effect at a given
//! time. The queue is consulted whenever a block is finalized: the first
//! enqueued update whose effective time has elapsed wins and is never
//! overridden by a later one; every other already-elapsed update is
//! dropped. Updates whose time has not come stay queued.
//!
//! When an update takes effect the runner fires its regenesis callback:
//! the chain continues under new parameters from the finalized block.

use tracing::info;

/// A scheduled chain-parameter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolUpdate {
    /// When the update becomes effective, ms since the Unix epoch
    pub effective_time_ms: u64,
    /// Opaque payload describing the new parameters
    pub payload: Vec<u8>,
}

/// Ordered queue of scheduled updates.
#[derive(Debug, Default)]
pub struct ProtocolUpdateQueue {
    pending: Vec<ProtocolUpdate>,
    effective: Option<ProtocolUpdate>,
}

impl ProtocolUpdateQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an update. Order of insertion breaks ties between updates
    /// that elapse in the same window.
    pub fn enqueue(&mut self, update: ProtocolUpdate) {
        self.pending.push(update);
    }

    /// The update currently in effect, if any.
    pub fn effective(&self) -> Option<&ProtocolUpdate> {
        self.effective.as_ref()
    }

    /// Number of updates still scheduled.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Called at finalization time: promotes the first elapsed update.
    ///
    /// The first elapsed update wins and is not overridden by later ones;
    /// the remaining elapsed updates are dropped. Returns the update if it
    /// just took effect.
    pub fn promote_elapsed(&mut self, now_ms: u64) -> Option<ProtocolUpdate> {
        if self.effective.is_some() {
            // Already regenesis-bound; later updates cannot override
            self.pending.retain(|u| u.effective_time_ms > now_ms);
            return None;
        }
        let position = self
            .pending
            .iter()
            .position(|u| u.effective_time_ms <= now_ms)?;
        let winner = self.pending.remove(position);
        let dropped = self.pending.len();
        self.pending.retain(|u| u.effective_time_ms > now_ms);
        let dropped = dropped - self.pending.len();
        if dropped > 0 {
            info!(dropped, "Dropped superseded elapsed protocol updates");
        }
        info!(
            effective_time_ms = winner.effective_time_ms,
            "Protocol update takes effect"
        );
        self.effective = Some(winner.clone());
        Some(winner)
    }
}
