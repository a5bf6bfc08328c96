//! Delayed broadcast of CSS *Seen* messages.
//!
//! Seen reports are cumulative, so broadcasting each tiny increment is
//! redundant. A Seen message is buffered for up to `delay_step` (total
//! at most `max_delay` from the first buffering), and a newer Seen for the
//! same round and phase supersedes the buffered one. A DoneReporting for
//! that `(header, phase)` flushes the buffered Seen immediately and
//! unconditionally.

use crate::messages::{Delta, FinalizationMessage, Phase, WmvbaMessage};
use std::collections::HashMap;
use tessera_types::FinalizationIndex;
use tracing::trace;

type BufferKey = (FinalizationIndex, Delta, Phase);

#[derive(Debug)]
struct Buffered {
    message: FinalizationMessage,
    deadline_ms: u64,
    first_ms: u64,
}

/// The Seen output buffer.
#[derive(Debug)]
pub struct OutputBuffer {
    max_delay_ms: u64,
    delay_step_ms: u64,
    entries: HashMap<BufferKey, Buffered>,
}

impl OutputBuffer {
    /// Creates a buffer with the given delay parameters.
    pub fn new(max_delay_ms: u64, delay_step_ms: u64) -> Self {
        Self {
            max_delay_ms,
            delay_step_ms,
            entries: HashMap::new(),
        }
    }

    /// Buffers (or supersedes) a Seen message; returns the deadline at
    /// which a flush is due.
    ///
    /// Non-Seen messages are not buffered; the caller should send them
    /// directly.
    pub fn buffer_seen(&mut self, message: FinalizationMessage, now_ms: u64) -> Option<u64> {
        let WmvbaMessage::CssSeen { phase, .. } = &message.message else {
            return None;
        };
        let key = (message.header.index, message.header.delta, *phase);
        let first_ms = self
            .entries
            .get(&key)
            .map_or(now_ms, |buffered| buffered.first_ms);
        let deadline_ms = (now_ms + self.delay_step_ms).min(first_ms + self.max_delay_ms);
        trace!(
            index = message.header.index,
            delta = message.header.delta,
            phase,
            deadline_ms,
            "Buffered Seen message"
        );
        self.entries.insert(
            key,
            Buffered {
                message,
                deadline_ms,
                first_ms,
            },
        );
        Some(deadline_ms)
    }

    /// Flushes the buffered Seen matching a DoneReporting's round and
    /// phase. Flushing is unconditional: even a Seen buffered with a later
    /// stamp goes out now.
    pub fn flush_for_done_reporting(
        &mut self,
        index: FinalizationIndex,
        delta: Delta,
        phase: Phase,
    ) -> Option<FinalizationMessage> {
        self.entries
            .remove(&(index, delta, phase))
            .map(|buffered| buffered.message)
    }

    /// Takes every buffered message whose deadline has passed.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<FinalizationMessage> {
        let due: Vec<BufferKey> = self
            .entries
            .iter()
            .filter(|(_, buffered)| buffered.deadline_ms <= now_ms)
            .map(|(key, _)| *key)
            .collect();
        due.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|buffered| buffered.message)
            .collect()
    }

    /// The earliest pending deadline, if anything is buffered.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries
            .values()
            .map(|buffered| buffered.deadline_ms)
            .min()
    }

    /// Drops everything buffered for a finalization index (called when the
    /// index settles).
    pub fn clear_index(&mut self, index: FinalizationIndex) {
        self.entries.retain(|(i, _, _), _| *i != index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FinalizationMessageHeader;
    use tessera_types::{Hash, SignatureBytes};

    fn seen(index: u64, phase: Phase, pairs: Vec<(u32, bool)>) -> FinalizationMessage {
        FinalizationMessage {
            header: FinalizationMessageHeader {
                session: Hash::sha256(b"session"),
                index,
                delta: 1,
                sender: 0,
            },
            message: WmvbaMessage::CssSeen { phase, pairs },
            signature: SignatureBytes::default(),
        }
    }

    #[test]
    fn newer_seen_supersedes() {
        let mut buffer = OutputBuffer::new(10_000, 1_000);
        buffer.buffer_seen(seen(1, 0, vec![(0, true)]), 0);
        buffer.buffer_seen(seen(1, 0, vec![(0, true), (1, true)]), 100);

        let due = buffer.take_due(1_100);
        assert_eq!(due.len(), 1);
        match &due[0].message {
            WmvbaMessage::CssSeen { pairs, .. } => assert_eq!(pairs.len(), 2),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn max_delay_caps_deferral() {
        let mut buffer = OutputBuffer::new(10_000, 1_000);
        // Keep superseding every 900ms; the deadline must never exceed
        // first_buffered + max_delay
        let mut now = 0;
        for i in 0..20u32 {
            buffer.buffer_seen(seen(1, 0, vec![(i, true)]), now);
            now += 900;
        }
        assert!(buffer.next_deadline().unwrap() <= 10_000);
    }

    #[test]
    fn done_reporting_flushes_immediately() {
        let mut buffer = OutputBuffer::new(10_000, 1_000);
        buffer.buffer_seen(seen(1, 2, vec![(0, true)]), 0);
        let flushed = buffer.flush_for_done_reporting(1, 1, 2);
        assert!(flushed.is_some());
        assert!(buffer.take_due(u64::MAX).is_empty());
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut buffer = OutputBuffer::new(10_000, 1_000);
        buffer.buffer_seen(seen(1, 0, vec![(0, true)]), 0);
        assert!(buffer.take_due(500).is_empty());
        assert_eq!(buffer.take_due(1_000).len(), 1);
    }
}
