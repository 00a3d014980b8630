//! SRT wire packet codec.
//!
//! Every packet starts with a 16-byte header of four big-endian 32-bit
//! words. Bit 31 of word 0 selects the shape: 0 for data (word 0 carries
//! the sequence number), 1 for control (word 0 carries the control kind and
//! subtype). Word 1 holds the data flags and message number, or the
//! control type-specific info. Words 2 and 3 are the timestamp
//! (microseconds from session origin, wrapping) and destination socket id
//! in both shapes.

use crate::sequence::{MessageNumber, SeqNumber};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header length in bytes: four 32-bit words.
pub const HEADER_LEN: usize = 16;

/// Default MSS; payload budget per packet is `mss - HEADER_LEN`.
pub const DEFAULT_MSS: usize = 1500;

const F_CONTROL: u32 = 0x8000_0000;

/// Decoding and validation failures for the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    ShortHeader(usize),

    #[error("expected a {expected} packet, header F bit says {found}")]
    WrongShape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown control type {0}")]
    UnknownControlKind(u16),

    #[error("{field} value {value} exceeds maximum {max}")]
    FieldRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{context} body truncated: need {need} bytes, have {have}")]
    ShortBody {
        context: &'static str,
        need: usize,
        have: usize,
    },
}

/// Placement of a data packet inside its message (word 1, bits 31-30).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketPosition {
    /// Interior packet of a multi-packet message.
    Middle = 0b00,
    /// Final packet of a multi-packet message.
    Last = 0b01,
    /// Opening packet of a multi-packet message.
    First = 0b10,
    /// Message fits in this single packet.
    Only = 0b11,
}

impl PacketPosition {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => PacketPosition::Middle,
            0b01 => PacketPosition::Last,
            0b10 => PacketPosition::First,
            _ => PacketPosition::Only,
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Which session key encrypted the payload (word 1, bits 28-27).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum KeyFlag {
    /// Payload travels in the clear.
    #[default]
    None = 0b00,
    Even = 0b01,
    Odd = 0b10,
    /// Both keys valid (key-refresh overlap window).
    Both = 0b11,
}

impl KeyFlag {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => KeyFlag::None,
            0b01 => KeyFlag::Even,
            0b10 => KeyFlag::Odd,
            _ => KeyFlag::Both,
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Control packet kinds (word 0, bits 30-16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlKind {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    CongestionWarning = 4,
    Shutdown = 5,
    AckAck = 6,
    DropRequest = 7,
    PeerError = 8,
}

impl ControlKind {
    pub fn from_raw(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => ControlKind::Handshake,
            1 => ControlKind::KeepAlive,
            2 => ControlKind::Ack,
            3 => ControlKind::Nak,
            4 => ControlKind::CongestionWarning,
            5 => ControlKind::Shutdown,
            6 => ControlKind::AckAck,
            7 => ControlKind::DropRequest,
            8 => ControlKind::PeerError,
            other => return Err(CodecError::UnknownControlKind(other)),
        })
    }

    #[inline]
    pub fn raw(self) -> u16 {
        self as u16
    }
}

/// Parsed header of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub seq: SeqNumber,
    pub position: PacketPosition,
    /// In-order delivery requested for this message.
    pub ordered: bool,
    pub key_flag: KeyFlag,
    /// Set on every retransmission of the original sequence.
    pub retransmitted: bool,
    pub message: MessageNumber,
    /// Microseconds since session origin, wrapping at 2^32.
    pub timestamp: u32,
    pub dest_socket_id: u32,
}

impl DataHeader {
    fn flags_word(&self) -> u32 {
        let mut w = self.message.raw();
        w |= (self.position.bits() as u32) << 30;
        if self.ordered {
            w |= 1 << 29;
        }
        w |= (self.key_flag.bits() as u32) << 27;
        if self.retransmitted {
            w |= 1 << 26;
        }
        w
    }

    fn from_words(w0: u32, w1: u32, w2: u32, w3: u32) -> Self {
        DataHeader {
            seq: SeqNumber::new(w0),
            position: PacketPosition::from_bits((w1 >> 30) as u8),
            ordered: w1 & (1 << 29) != 0,
            key_flag: KeyFlag::from_bits((w1 >> 27) as u8),
            retransmitted: w1 & (1 << 26) != 0,
            message: MessageNumber::new(w1),
            timestamp: w2,
            dest_socket_id: w3,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq.raw());
        buf.put_u32(self.flags_word());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket_id);
    }
}

/// Parsed header of a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub kind: ControlKind,
    pub subtype: u16,
    /// 32-bit type-specific info word (cumulative ack seq for ACK, ack
    /// number for AckAck, zero otherwise).
    pub info: u32,
    pub timestamp: u32,
    pub dest_socket_id: u32,
}

impl ControlHeader {
    pub fn new(kind: ControlKind, info: u32, timestamp: u32, dest_socket_id: u32) -> Self {
        ControlHeader {
            kind,
            subtype: 0,
            info,
            timestamp,
            dest_socket_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(F_CONTROL | ((self.kind.raw() as u32) << 16) | self.subtype as u32);
        buf.put_u32(self.info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket_id);
    }

    fn from_words(w0: u32, w1: u32, w2: u32, w3: u32) -> Result<Self, CodecError> {
        Ok(ControlHeader {
            kind: ControlKind::from_raw(((w0 >> 16) & 0x7FFF) as u16)?,
            subtype: (w0 & 0xFFFF) as u16,
            info: w1,
            timestamp: w2,
            dest_socket_id: w3,
        })
    }
}

/// A data packet: header plus (possibly encrypted) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub header: DataHeader,
    pub payload: Bytes,
}

impl DataPacket {
    /// Wire size of the packet.
    pub fn size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        match Packet::decode(datagram)? {
            Packet::Data(p) => Ok(p),
            Packet::Control(_) => Err(CodecError::WrongShape {
                expected: "data",
                found: "control",
            }),
        }
    }
}

/// A control packet: header plus kind-specific body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub header: ControlHeader,
    pub body: Bytes,
}

impl ControlPacket {
    pub fn size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        match Packet::decode(datagram)? {
            Packet::Control(p) => Ok(p),
            Packet::Data(_) => Err(CodecError::WrongShape {
                expected: "control",
                found: "data",
            }),
        }
    }
}

/// Either wire shape, discriminated by the F bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < HEADER_LEN {
            return Err(CodecError::ShortHeader(datagram.len()));
        }
        let mut head = &datagram[..HEADER_LEN];
        let w0 = head.get_u32();
        let w1 = head.get_u32();
        let w2 = head.get_u32();
        let w3 = head.get_u32();
        let rest = Bytes::copy_from_slice(&datagram[HEADER_LEN..]);

        if w0 & F_CONTROL == 0 {
            Ok(Packet::Data(DataPacket {
                header: DataHeader::from_words(w0, w1, w2, w3),
                payload: rest,
            }))
        } else {
            Ok(Packet::Control(ControlPacket {
                header: ControlHeader::from_words(w0, w1, w2, w3)?,
                body: rest,
            }))
        }
    }

    pub fn encode(&self) -> BytesMut {
        match self {
            Packet::Data(p) => p.encode(),
            Packet::Control(p) => p.encode(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Packet::Data(p) => p.size(),
            Packet::Control(p) => p.size(),
        }
    }

    pub fn timestamp(&self) -> u32 {
        match self {
            Packet::Data(p) => p.header.timestamp,
            Packet::Control(p) => p.header.timestamp,
        }
    }

    pub fn dest_socket_id(&self) -> u32 {
        match self {
            Packet::Data(p) => p.header.dest_socket_id,
            Packet::Control(p) => p.header.dest_socket_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data_header() -> DataHeader {
        DataHeader {
            seq: SeqNumber::new(1234),
            position: PacketPosition::Only,
            ordered: true,
            key_flag: KeyFlag::Even,
            retransmitted: false,
            message: MessageNumber::new(5678),
            timestamp: 1000,
            dest_socket_id: 999,
        }
    }

    #[test]
    fn data_header_roundtrip() {
        let packet = DataPacket {
            header: sample_data_header(),
            payload: Bytes::from_static(b"payload"),
        };
        let wire = packet.encode();
        assert_eq!(wire.len(), HEADER_LEN + 7);

        let back = DataPacket::decode(&wire).unwrap();
        assert_eq!(back, packet);
    }

    #[test]
    fn control_header_roundtrip() {
        let packet = ControlPacket {
            header: ControlHeader::new(ControlKind::Ack, 12345, 2000, 888),
            body: Bytes::new(),
        };
        let wire = packet.encode();
        let back = ControlPacket::decode(&wire).unwrap();
        assert_eq!(back.header.kind, ControlKind::Ack);
        assert_eq!(back.header.info, 12345);
        assert_eq!(back.header.timestamp, 2000);
        assert_eq!(back.header.dest_socket_id, 888);
    }

    #[test]
    fn short_datagram_rejected() {
        let err = Packet::decode(&[0u8; 7]).unwrap_err();
        assert_eq!(err, CodecError::ShortHeader(7));
    }

    #[test]
    fn unknown_control_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(F_CONTROL | (0x1234 << 16));
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        assert_eq!(
            Packet::decode(&buf).unwrap_err(),
            CodecError::UnknownControlKind(0x1234)
        );
    }

    #[test]
    fn wrong_shape_reported() {
        let data = DataPacket {
            header: sample_data_header(),
            payload: Bytes::new(),
        }
        .encode();
        assert!(matches!(
            ControlPacket::decode(&data).unwrap_err(),
            CodecError::WrongShape { expected: "control", .. }
        ));
    }

    #[test]
    fn all_positions_and_key_flags_roundtrip() {
        for position in [
            PacketPosition::Middle,
            PacketPosition::Last,
            PacketPosition::First,
            PacketPosition::Only,
        ] {
            for key_flag in [KeyFlag::None, KeyFlag::Even, KeyFlag::Odd, KeyFlag::Both] {
                let mut header = sample_data_header();
                header.position = position;
                header.key_flag = key_flag;
                let wire = DataPacket {
                    header,
                    payload: Bytes::new(),
                }
                .encode();
                let back = DataPacket::decode(&wire).unwrap();
                assert_eq!(back.header.position, position);
                assert_eq!(back.header.key_flag, key_flag);
            }
        }
    }

    #[test]
    fn retransmit_and_ordered_bits_independent() {
        let mut header = sample_data_header();
        header.ordered = false;
        header.retransmitted = true;
        let back = DataPacket::decode(
            &DataPacket {
                header,
                payload: Bytes::new(),
            }
            .encode(),
        )
        .unwrap();
        assert!(back.header.retransmitted);
        assert!(!back.header.ordered);
        assert_eq!(back.header.message.raw(), 5678);
    }
}
