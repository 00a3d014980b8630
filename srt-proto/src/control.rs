//! Typed control packet bodies.
//!
//! ACK and NAK carry structured bodies; KeepAlive, Shutdown and AckAck are
//! header-only. The handshake body lives in [`crate::handshake`].

use crate::packet::CodecError;
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const RANGE_FLAG: u32 = 0x8000_0000;

/// Optional measurement block of an ACK packet.
///
/// The cumulative ack sequence itself travels in the header info word; a
/// full ACK appends this body so the sender can compute RTT from the echoed
/// origin timestamp. A minimal ACK (empty body) is also valid on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    /// Origin timestamp of the newest packet covered by the cumulative ack,
    /// echoed verbatim for RTT measurement.
    pub echo_timestamp: u32,
    /// Receiver's current smoothed RTT estimate, microseconds.
    pub rtt_us: u32,
    /// Receiver's RTT variation, microseconds.
    pub rtt_var_us: u32,
    /// Receive rate observed since the last ACK, bytes per second.
    pub recv_rate_bps: u32,
}

impl AckBody {
    pub const WIRE_LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u32(self.echo_timestamp);
        buf.put_u32(self.rtt_us);
        buf.put_u32(self.rtt_var_us);
        buf.put_u32(self.recv_rate_bps);
        buf.freeze()
    }

    /// Decodes the body of an ACK packet; `None` for a minimal ACK.
    pub fn decode(mut body: &[u8]) -> Result<Option<Self>, CodecError> {
        if body.is_empty() {
            return Ok(None);
        }
        if body.len() < Self::WIRE_LEN {
            return Err(CodecError::ShortBody {
                context: "ack",
                need: Self::WIRE_LEN,
                have: body.len(),
            });
        }
        Ok(Some(AckBody {
            echo_timestamp: body.get_u32(),
            rtt_us: body.get_u32(),
            rtt_var_us: body.get_u32(),
            recv_rate_bps: body.get_u32(),
        }))
    }
}

/// One entry of a NAK loss report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossEntry {
    Single(SeqNumber),
    /// Inclusive range, `lo` through `hi` in modular order.
    Range(SeqNumber, SeqNumber),
}

impl LossEntry {
    /// Number of sequences the entry covers.
    pub fn count(&self) -> u32 {
        match *self {
            LossEntry::Single(_) => 1,
            LossEntry::Range(lo, hi) => lo.offset_to(hi) as u32 + 1,
        }
    }

    /// Iterates every sequence the entry names.
    pub fn sequences(&self) -> impl Iterator<Item = SeqNumber> {
        let (lo, hi) = match *self {
            LossEntry::Single(seq) => (seq, seq),
            LossEntry::Range(lo, hi) => (lo, hi),
        };
        lo.through(hi)
    }
}

/// NAK body: a list of lost singletons and ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NakBody {
    pub entries: Vec<LossEntry>,
}

impl NakBody {
    pub fn new(entries: Vec<LossEntry>) -> Self {
        NakBody { entries }
    }

    /// Builds coalesced entries from an ascending run of lost sequences.
    pub fn from_sorted(lost: &[SeqNumber]) -> Self {
        let mut entries = Vec::new();
        let mut run: Option<(SeqNumber, SeqNumber)> = None;

        for &seq in lost {
            run = match run {
                Some((lo, hi)) if hi.next() == seq => Some((lo, seq)),
                Some((lo, hi)) => {
                    entries.push(Self::entry(lo, hi));
                    Some((seq, seq))
                }
                None => Some((seq, seq)),
            };
        }
        if let Some((lo, hi)) = run {
            entries.push(Self::entry(lo, hi));
        }
        NakBody { entries }
    }

    fn entry(lo: SeqNumber, hi: SeqNumber) -> LossEntry {
        if lo == hi {
            LossEntry::Single(lo)
        } else {
            LossEntry::Range(lo, hi)
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.entries.len() * 8);
        for entry in &self.entries {
            match *entry {
                LossEntry::Single(seq) => buf.put_u32(seq.raw()),
                LossEntry::Range(lo, hi) => {
                    buf.put_u32(lo.raw() | RANGE_FLAG);
                    buf.put_u32(hi.raw());
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let mut entries = Vec::new();
        while body.remaining() >= 4 {
            let word = body.get_u32();
            if word & RANGE_FLAG != 0 {
                if body.remaining() < 4 {
                    return Err(CodecError::ShortBody {
                        context: "nak range",
                        need: 4,
                        have: body.remaining(),
                    });
                }
                let lo = SeqNumber::new(word);
                let hi = SeqNumber::new(body.get_u32());
                entries.push(LossEntry::Range(lo, hi));
            } else {
                entries.push(LossEntry::Single(SeqNumber::new(word)));
            }
        }
        if body.has_remaining() {
            return Err(CodecError::ShortBody {
                context: "nak",
                need: 4,
                have: body.remaining(),
            });
        }
        Ok(NakBody { entries })
    }

    /// Total sequences reported lost.
    pub fn loss_count(&self) -> u32 {
        self.entries.iter().map(LossEntry::count).sum()
    }
}
