//! Named one-shot timers driving the connection's periodic work.
//!
//! Timers carry a typed event rather than a callback; the orchestrator
//! matches on the event when the timer fires, which keeps all mutable
//! state with the orchestrator (no closures reaching back into
//! components). Firing is exactly-once and cancellation is idempotent.

use crate::sequence::SeqNumber;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Timer categories, for inspection and per-kind cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    Keepalive,
    Ack,
    Nak,
    Handshake,
}

/// What to do when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The retransmission timeout for one sequence elapsed.
    Retransmit(SeqNumber),
    /// Send a keepalive if the link has been silent.
    Keepalive,
    /// Periodic cumulative ACK emission.
    AckTick,
    /// Re-scan the loss list and emit NAKs.
    NakTick,
    /// Re-send the current handshake packet.
    HandshakeRetry,
}

impl TimerEvent {
    pub fn kind(&self) -> TimerKind {
        match self {
            TimerEvent::Retransmit(_) => TimerKind::Retransmit,
            TimerEvent::Keepalive => TimerKind::Keepalive,
            TimerEvent::AckTick => TimerKind::Ack,
            TimerEvent::NakTick => TimerKind::Nak,
            TimerEvent::HandshakeRetry => TimerKind::Handshake,
        }
    }
}

#[derive(Debug, Clone)]
struct TimerEntry {
    expires_at: Instant,
    event: TimerEvent,
}

/// Collection of pending timers keyed by name.
#[derive(Debug, Default)]
pub struct TimerSet {
    entries: HashMap<String, TimerEntry>,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            entries: HashMap::new(),
        }
    }

    /// Arms (or re-arms) the timer named `id`. Re-scheduling an existing
    /// id replaces its deadline and event.
    pub fn schedule(&mut self, id: impl Into<String>, delay: Duration, event: TimerEvent, now: Instant) {
        self.entries.insert(
            id.into(),
            TimerEntry {
                expires_at: now + delay,
                event,
            },
        );
    }

    /// Disarms `id`; unknown ids are ignored.
    pub fn cancel(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Disarms every timer of the given kind.
    pub fn cancel_kind(&mut self, kind: TimerKind) {
        self.entries.retain(|_, e| e.event.kind() != kind);
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every expired timer, ordered by deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, e)| (e.expires_at, id.clone()))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(_, id)| self.entries.remove(&id))
            .map(|e| e.event)
            .collect()
    }

    /// Time until the earliest deadline; `None` when nothing is armed.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|e| e.expires_at.saturating_duration_since(now))
            .min()
    }
}
