//! Send engine: fragmentation, unacked tracking, retransmission.
//!
//! Messages are fragmented into sequenced chunks and staged on a pending
//! queue; the orchestrator drains the queue as the flow and congestion
//! gates allow. Every emitted chunk is retained until a cumulative ACK
//! covers it, a NAK-or-timeout driven retransmission budget is exhausted,
//! or its time-to-live passes.

use crate::packet::PacketPosition;
use crate::sequence::{MessageNumber, SeqNumber};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Window has no room for the whole message; retry after ACKs arrive.
    #[error("send window full, retry later")]
    WouldBlock,

    #[error("message of {len} bytes cannot be fragmented (empty)")]
    EmptyMessage { len: usize },
}

/// Engine tunables, lifted from the connection configuration.
#[derive(Debug, Clone)]
pub struct SendConfig {
    pub max_payload: usize,
    pub send_window: u32,
    pub max_retransmits: u32,
    pub rto_max: Duration,
    /// Entries older than this are abandoned regardless of ACK state;
    /// `None` keeps them until the retransmission budget runs out.
    pub ttl: Option<Duration>,
}

/// A fragmented chunk staged for first transmission.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub seq: SeqNumber,
    pub message: MessageNumber,
    pub position: PacketPosition,
    pub ordered: bool,
    pub payload: Bytes,
}

/// A chunk rebuilt for retransmission.
#[derive(Debug, Clone, PartialEq)]
pub struct RetransmitChunk {
    pub seq: SeqNumber,
    pub message: MessageNumber,
    pub position: PacketPosition,
    pub ordered: bool,
    pub payload: Bytes,
    /// Wire timestamp of the first transmission. Replays carry it
    /// unchanged so the receiver's delivery clock sees origin time.
    pub origin_timestamp: u32,
    /// Delay until the next retransmission timer for this sequence.
    pub next_timeout: Duration,
}

struct UnackedEntry {
    message: MessageNumber,
    position: PacketPosition,
    ordered: bool,
    payload: Bytes,
    first_sent: Instant,
    origin_timestamp: u32,
    retransmits: u32,
    /// Timeout used for the most recent (re)arm, grows 1.5x per attempt.
    current_rto: Duration,
}

/// Counters of the send engine. Monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendStats {
    pub messages_accepted: u64,
    pub packets_emitted: u64,
    pub packets_retransmitted: u64,
    pub packets_abandoned: u64,
    pub would_block: u64,
}

impl SendStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("send.messages_accepted", self.messages_accepted),
            ("send.packets_emitted", self.packets_emitted),
            ("send.packets_retransmitted", self.packets_retransmitted),
            ("send.packets_abandoned", self.packets_abandoned),
            ("send.would_block", self.would_block),
        ]
    }
}

pub struct SendEngine {
    config: SendConfig,
    next_seq: SeqNumber,
    next_message: MessageNumber,
    /// Highest sequence the peer has cumulatively acknowledged.
    acked_through: SeqNumber,
    pending: VecDeque<PendingChunk>,
    unacked: HashMap<u32, UnackedEntry>,
    stats: SendStats,
}

impl SendEngine {
    pub fn new(initial_seq: SeqNumber, config: SendConfig) -> Self {
        SendEngine {
            config,
            next_seq: initial_seq,
            next_message: MessageNumber::new(0),
            acked_through: initial_seq - 1,
            pending: VecDeque::new(),
            unacked: HashMap::new(),
            stats: SendStats::default(),
        }
    }

    /// Packets occupying window space: staged plus unacknowledged.
    pub fn window_usage(&self) -> u32 {
        (self.pending.len() + self.unacked.len()) as u32
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn acked_through(&self) -> SeqNumber {
        self.acked_through
    }

    pub fn stats(&self) -> SendStats {
        self.stats
    }

    /// Fragments one message onto the pending queue.
    ///
    /// All-or-nothing: if the window cannot hold every chunk the call
    /// returns `WouldBlock` and stages none of them.
    pub fn enqueue_message(&mut self, payload: Bytes, ordered: bool) -> Result<u32, SendError> {
        if payload.is_empty() {
            return Err(SendError::EmptyMessage { len: 0 });
        }
        let chunk_count = payload.len().div_ceil(self.config.max_payload) as u32;
        if self.window_usage() + chunk_count > self.config.send_window {
            self.stats.would_block += 1;
            return Err(SendError::WouldBlock);
        }

        let message = self.next_message;
        self.next_message = self.next_message.next();

        let mut offset = 0;
        let mut index = 0u32;
        while offset < payload.len() {
            let end = (offset + self.config.max_payload).min(payload.len());
            let position = match (chunk_count, index) {
                (1, _) => PacketPosition::Only,
                (_, 0) => PacketPosition::First,
                (n, i) if i == n - 1 => PacketPosition::Last,
                _ => PacketPosition::Middle,
            };
            self.pending.push_back(PendingChunk {
                seq: self.next_seq,
                message,
                position,
                ordered,
                payload: payload.slice(offset..end),
            });
            self.next_seq = self.next_seq.next();
            offset = end;
            index += 1;
        }

        self.stats.messages_accepted += 1;
        trace!(%message, chunks = chunk_count, "message staged");
        Ok(chunk_count)
    }

    /// Wire size of the next staged chunk, for admission checks.
    pub fn peek_pending_size(&self) -> Option<usize> {
        self.pending
            .front()
            .map(|chunk| crate::packet::HEADER_LEN + chunk.payload.len())
    }

    /// Commits the next staged chunk to the wire: moves it into the
    /// unacked ledger and hands it to the caller for encryption and
    /// serialization. `rto` arms the entry's first retransmission timer;
    /// `origin_timestamp` is the wire timestamp this transmission carries
    /// and every replay will repeat.
    pub fn pop_pending(
        &mut self,
        now: Instant,
        rto: Duration,
        origin_timestamp: u32,
    ) -> Option<PendingChunk> {
        let chunk = self.pending.pop_front()?;
        self.unacked.insert(
            chunk.seq.raw(),
            UnackedEntry {
                message: chunk.message,
                position: chunk.position,
                ordered: chunk.ordered,
                payload: chunk.payload.clone(),
                first_sent: now,
                origin_timestamp,
                retransmits: 0,
                current_rto: rto,
            },
        );
        self.stats.packets_emitted += 1;
        Some(chunk)
    }

    /// Cumulative ACK: every sequence up to and including `through` is
    /// confirmed. Returns the newly covered sequences so the orchestrator
    /// can cancel their timers.
    pub fn on_ack(&mut self, through: SeqNumber) -> Vec<SeqNumber> {
        if !self.acked_through.precedes(through) {
            return Vec::new();
        }
        // an ack beyond anything we sent is a protocol violation; ignore
        if (self.next_seq - 1).precedes(through) {
            return Vec::new();
        }
        let newly: Vec<SeqNumber> = self
            .acked_through
            .next()
            .through(through)
            .filter(|seq| self.unacked.remove(&seq.raw()).is_some())
            .collect();
        self.acked_through = through;
        newly
    }

    /// True when the sequence is still awaiting acknowledgement.
    pub fn is_unacked(&self, seq: SeqNumber) -> bool {
        self.unacked.contains_key(&seq.raw())
    }

    /// Rebuilds `seq` for retransmission, or reports it abandoned.
    ///
    /// `Ok(chunk)` carries the exponential-backoff delay for the next
    /// timer; `Err(true)` means the retransmission budget is exhausted and
    /// the entry was dropped (a send-loss event); `Err(false)` means the
    /// sequence is no longer tracked (already acknowledged).
    pub fn retransmit(&mut self, seq: SeqNumber) -> Result<RetransmitChunk, bool> {
        let entry = match self.unacked.get_mut(&seq.raw()) {
            Some(entry) => entry,
            None => return Err(false),
        };

        if entry.retransmits >= 1 {
            entry.current_rto = Duration::from_secs_f64(entry.current_rto.as_secs_f64() * 1.5)
                .min(self.config.rto_max);
        }
        if entry.retransmits >= self.config.max_retransmits {
            debug!(%seq, attempts = entry.retransmits, "retransmission budget exhausted");
            self.unacked.remove(&seq.raw());
            self.stats.packets_abandoned += 1;
            return Err(true);
        }

        entry.retransmits += 1;
        self.stats.packets_retransmitted += 1;
        Ok(RetransmitChunk {
            seq,
            message: entry.message,
            position: entry.position,
            ordered: entry.ordered,
            payload: entry.payload.clone(),
            origin_timestamp: entry.origin_timestamp,
            next_timeout: entry.current_rto,
        })
    }

    /// Abandons entries older than the configured TTL. Returns the dropped
    /// sequences (send-loss events).
    pub fn expire_ttl(&mut self, now: Instant) -> Vec<SeqNumber> {
        let Some(ttl) = self.config.ttl else {
            return Vec::new();
        };
        let expired: Vec<SeqNumber> = self
            .unacked
            .iter()
            .filter(|(_, e)| now.duration_since(e.first_sent) > ttl)
            .map(|(&raw, _)| SeqNumber::new(raw))
            .collect();
        for seq in &expired {
            self.unacked.remove(&seq.raw());
            self.stats.packets_abandoned += 1;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "stale unacked entries expired");
        }
        expired
    }
}
