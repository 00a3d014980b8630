//! Receive engine: reordering, reassembly, loss detection, ACK cadence.
//!
//! Arriving packets land in a sparse window buffer indexed by sequence.
//! The contiguous prefix drains in order into per-message builders, so the
//! application can never observe a duplicate or a skip. Gaps between the
//! drain point and the highest sequence seen are the loss list for NAKs.

use crate::control::NakBody;
use crate::packet::{DataHeader, PacketPosition};
use crate::sequence::{MessageNumber, SeqNumber};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::{trace, warn};

/// Engine tunables, lifted from the connection configuration.
#[derive(Debug, Clone)]
pub struct RecvConfig {
    pub recv_window: u32,
    /// Emit a cumulative ACK every this many accepted packets.
    pub ack_frequency: u32,
    /// Cap on loss entries per NAK packet.
    pub max_nak_entries: usize,
}

/// Why an arriving packet was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Already delivered or already buffered.
    Duplicate,
    /// Beyond the high edge of the receive window.
    WindowOverflow,
}

/// A fully reassembled message ready for delivery scheduling.
#[derive(Debug, Clone)]
pub struct ReadyMessage {
    /// Sequence of the message's first packet.
    pub seq: SeqNumber,
    /// Origin timestamp of the message's first packet.
    pub timestamp: u32,
    pub ordered: bool,
    pub payload: Bytes,
}

/// Data for one cumulative ACK emission.
#[derive(Debug, Clone, Copy)]
pub struct AckSnapshot {
    /// Everything up to and including this sequence has been received.
    pub ack_seq: SeqNumber,
    /// Monotone ACK number, echoed back by AckAck.
    pub ack_number: u32,
    /// Origin timestamp of the newest in-order packet, echoed for RTT.
    pub echo_timestamp: u32,
}

struct BufferedPacket {
    position: PacketPosition,
    ordered: bool,
    message: MessageNumber,
    timestamp: u32,
    payload: Bytes,
}

struct MessageBuilder {
    first_seq: SeqNumber,
    timestamp: u32,
    ordered: bool,
    parts: Vec<Bytes>,
}

/// Counters of the receive engine. Monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvStats {
    pub packets_accepted: u64,
    pub duplicates: u64,
    pub window_overflow: u64,
    pub messages_completed: u64,
    pub orphan_chunks: u64,
    pub acks_emitted: u64,
    pub losses_detected: u64,
}

impl RecvStats {
    pub fn as_map(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("recv.packets_accepted", self.packets_accepted),
            ("recv.duplicates", self.duplicates),
            ("recv.window_overflow", self.window_overflow),
            ("recv.messages_completed", self.messages_completed),
            ("recv.orphan_chunks", self.orphan_chunks),
            ("recv.acks_emitted", self.acks_emitted),
            ("recv.losses_detected", self.losses_detected),
        ]
    }
}

pub struct ReceiveEngine {
    config: RecvConfig,
    /// Next sequence the in-order drain is waiting for.
    expected: SeqNumber,
    /// Value of the last cumulative ACK actually emitted.
    last_ack: SeqNumber,
    /// Highest sequence observed; `None` until the first packet.
    max_received: Option<SeqNumber>,
    buffer: HashMap<u32, BufferedPacket>,
    builders: HashMap<u32, MessageBuilder>,
    ready: VecDeque<ReadyMessage>,
    accepted_since_ack: u32,
    ack_number: u32,
    /// Origin timestamp of the newest drained packet, for the ACK echo.
    newest_origin_ts: u32,
    stats: RecvStats,
}

impl ReceiveEngine {
    pub fn new(initial_seq: SeqNumber, config: RecvConfig) -> Self {
        ReceiveEngine {
            expected: initial_seq,
            last_ack: initial_seq - 1,
            max_received: None,
            buffer: HashMap::new(),
            builders: HashMap::new(),
            ready: VecDeque::new(),
            accepted_since_ack: 0,
            ack_number: 0,
            newest_origin_ts: 0,
            config,
            stats: RecvStats::default(),
        }
    }

    pub fn stats(&self) -> RecvStats {
        self.stats
    }

    pub fn expected(&self) -> SeqNumber {
        self.expected
    }

    /// Stores one decrypted data packet and drains whatever became
    /// contiguous. Returns how it was disposed.
    pub fn accept(&mut self, header: DataHeader, payload: Bytes) -> Result<(), Reject> {
        let seq = header.seq;

        if seq.precedes(self.expected) || self.buffer.contains_key(&seq.raw()) {
            self.stats.duplicates += 1;
            trace!(%seq, "duplicate data packet dropped");
            return Err(Reject::Duplicate);
        }
        if self.expected.offset_to(seq) >= self.config.recv_window as i32 {
            self.stats.window_overflow += 1;
            warn!(%seq, expected = %self.expected, "receive window overflow");
            return Err(Reject::WindowOverflow);
        }

        match self.max_received {
            Some(max) if !max.precedes(seq) => {}
            _ => self.max_received = Some(seq),
        }

        self.buffer.insert(
            seq.raw(),
            BufferedPacket {
                position: header.position,
                ordered: header.ordered,
                message: header.message,
                timestamp: header.timestamp,
                payload,
            },
        );
        self.stats.packets_accepted += 1;
        self.accepted_since_ack += 1;

        self.drain();
        Ok(())
    }

    /// Advances the in-order prefix, feeding message builders.
    fn drain(&mut self) {
        while let Some(packet) = self.buffer.remove(&self.expected.raw()) {
            let seq = self.expected;
            self.newest_origin_ts = packet.timestamp;
            self.feed_builder(seq, packet);
            self.expected = self.expected.next();
        }
    }

    fn feed_builder(&mut self, seq: SeqNumber, packet: BufferedPacket) {
        match packet.position {
            PacketPosition::Only => {
                self.complete(ReadyMessage {
                    seq,
                    timestamp: packet.timestamp,
                    ordered: packet.ordered,
                    payload: packet.payload,
                });
            }
            PacketPosition::First => {
                // a fresh First for a message already being built replaces
                // the stale builder (sender restarted the message)
                self.builders.insert(
                    packet.message.raw(),
                    MessageBuilder {
                        first_seq: seq,
                        timestamp: packet.timestamp,
                        ordered: packet.ordered,
                        parts: vec![packet.payload],
                    },
                );
            }
            PacketPosition::Middle => {
                match self.builders.get_mut(&packet.message.raw()) {
                    Some(builder) => builder.parts.push(packet.payload),
                    None => {
                        self.stats.orphan_chunks += 1;
                        warn!(%seq, message = %packet.message, "chunk without a message start");
                    }
                }
            }
            PacketPosition::Last => match self.builders.remove(&packet.message.raw()) {
                Some(mut builder) => {
                    builder.parts.push(packet.payload);
                    let mut whole = BytesMut::with_capacity(
                        builder.parts.iter().map(Bytes::len).sum(),
                    );
                    for part in &builder.parts {
                        whole.extend_from_slice(part);
                    }
                    self.complete(ReadyMessage {
                        seq: builder.first_seq,
                        timestamp: builder.timestamp,
                        ordered: builder.ordered,
                        payload: whole.freeze(),
                    });
                }
                None => {
                    self.stats.orphan_chunks += 1;
                    warn!(%seq, message = %packet.message, "message end without a start");
                }
            },
        }
    }

    fn complete(&mut self, message: ReadyMessage) {
        self.stats.messages_completed += 1;
        self.ready.push_back(message);
    }

    /// Next reassembled message, in sequence order.
    pub fn pop_message(&mut self) -> Option<ReadyMessage> {
        self.ready.pop_front()
    }

    pub fn ready_messages(&self) -> usize {
        self.ready.len()
    }

    /// Cumulative ACK if one is due. Counter-driven unless `force` (the
    /// periodic ACK timer), but never regressive: both paths require the
    /// drain point to have advanced past the last emitted ACK.
    pub fn ack_due(&mut self, force: bool) -> Option<AckSnapshot> {
        let ack_seq = self.expected - 1;
        if !self.last_ack.precedes(ack_seq) {
            return None;
        }
        if !force && self.accepted_since_ack < self.config.ack_frequency {
            return None;
        }
        self.last_ack = ack_seq;
        self.accepted_since_ack = 0;
        self.ack_number = self.ack_number.wrapping_add(1);
        self.stats.acks_emitted += 1;
        Some(AckSnapshot {
            ack_seq,
            ack_number: self.ack_number,
            echo_timestamp: self.newest_origin_ts,
        })
    }

    /// Sequences missing between the drain point and the newest arrival,
    /// coalesced and capped per NAK packet. Repeated calls return the same
    /// gaps until they fill; the caller paces emission with a timer.
    pub fn nak_due(&mut self) -> Vec<NakBody> {
        let Some(max) = self.max_received else {
            return Vec::new();
        };
        if !self.expected.precedes_eq(max) {
            return Vec::new();
        }

        let lost: Vec<SeqNumber> = self
            .expected
            .through(max)
            .filter(|seq| !self.buffer.contains_key(&seq.raw()))
            .collect();
        if lost.is_empty() {
            return Vec::new();
        }
        self.stats.losses_detected += lost.len() as u64;

        let all = NakBody::from_sorted(&lost);
        all.entries
            .chunks(self.config.max_nak_entries)
            .map(|chunk| NakBody::new(chunk.to_vec()))
            .collect()
    }
}
