//! The baker and purge loops.
//!
//! Both loops share the consensus lock with the ingress dispatcher: a bake
//! attempt inserts its block under the same critical section that
//! validates incoming blocks, and the broadcast only goes out after the
//! lock is released.

use crate::node::{EventSink, SharedState};
use crate::timers::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_consensus::{BakeOutcome, BakerCredentials};
use tracing::{debug, info};

/// Sleeps until `deadline_ms` in slices, bailing early on shutdown.
fn sleep_until(clock: &dyn Clock, shutdown: &AtomicBool, deadline_ms: u64) {
    while !shutdown.load(Ordering::Acquire) {
        let now = clock.now_ms();
        if now >= deadline_ms {
            return;
        }
        std::thread::sleep(Duration::from_millis((deadline_ms - now).min(50)));
    }
}

/// The baker loop: one `try_bake` per slot, forever.
pub(crate) fn run_baker_loop(
    state: SharedState,
    sink: EventSink,
    credentials: BakerCredentials,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
) {
    info!(baker = credentials.id, "Baker loop starting");
    let mut next_slot = 1;
    while !shutdown.load(Ordering::Acquire) {
        let now = clock.now_ms();
        let (outcome, events) = {
            let mut guard = state.lock();
            let slot = next_slot.max(guard.data.params.slot_of(now)).max(1);
            let slot_start = guard.data.params.slot_start_ms(slot);
            if slot_start > now {
                drop(guard);
                sleep_until(clock.as_ref(), &shutdown, slot_start);
                continue;
            }
            next_slot = slot + 1;
            guard.try_bake(&credentials, slot, now)
        };
        sink.dispatch(&state, events, None);
        match outcome {
            BakeOutcome::Baked { bytes, hash, slot } => {
                debug!(block = %hash.short(), slot, "Broadcasting baked block");
                sink.broadcast_block(&bytes);
            }
            BakeOutcome::WaitUntil(deadline_ms) => {
                sleep_until(clock.as_ref(), &shutdown, deadline_ms);
            }
        }
    }
    info!("Baker loop stopped");
}

/// The purge loop: periodically drops timed-out transactions.
pub(crate) fn run_purge_loop(
    state: SharedState,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    purging_delay: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        sleep_until(
            clock.as_ref(),
            &shutdown,
            clock.now_ms() + purging_delay.as_millis() as u64,
        );
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = clock.now_ms();
        let mut guard = state.lock();
        guard.purge_transactions(now);
    }
}
