//! Property tests: codec round trips hold for all valid field values.

use bytes::Bytes;
use proptest::prelude::*;
use srt_proto::sequence::{MSG_MAX, SEQ_MAX};
use srt_proto::{
    ControlHeader, ControlKind, ControlPacket, DataHeader, DataPacket, KeyFlag, LossEntry,
    MessageNumber, NakBody, Packet, PacketPosition, SeqNumber,
};

fn seq_strategy() -> impl Strategy<Value = SeqNumber> {
    (0..=SEQ_MAX).prop_map(SeqNumber::new)
}

fn position_strategy() -> impl Strategy<Value = PacketPosition> {
    prop_oneof![
        Just(PacketPosition::Middle),
        Just(PacketPosition::Last),
        Just(PacketPosition::First),
        Just(PacketPosition::Only),
    ]
}

fn key_flag_strategy() -> impl Strategy<Value = KeyFlag> {
    prop_oneof![
        Just(KeyFlag::None),
        Just(KeyFlag::Even),
        Just(KeyFlag::Odd),
        Just(KeyFlag::Both),
    ]
}

fn control_kind_strategy() -> impl Strategy<Value = ControlKind> {
    prop_oneof![
        Just(ControlKind::Handshake),
        Just(ControlKind::KeepAlive),
        Just(ControlKind::Ack),
        Just(ControlKind::Nak),
        Just(ControlKind::CongestionWarning),
        Just(ControlKind::Shutdown),
        Just(ControlKind::AckAck),
        Just(ControlKind::DropRequest),
        Just(ControlKind::PeerError),
    ]
}

fn payload_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=512).prop_map(Bytes::from)
}

proptest! {
    #[test]
    fn data_packet_roundtrip(
        seq in seq_strategy(),
        position in position_strategy(),
        ordered in any::<bool>(),
        key_flag in key_flag_strategy(),
        retransmitted in any::<bool>(),
        message in 0..=MSG_MAX,
        timestamp in any::<u32>(),
        dest in any::<u32>(),
        payload in payload_strategy(),
    ) {
        let packet = DataPacket {
            header: DataHeader {
                seq,
                position,
                ordered,
                key_flag,
                retransmitted,
                message: MessageNumber::new(message),
                timestamp,
                dest_socket_id: dest,
            },
            payload,
        };
        let back = DataPacket::decode(&packet.encode()).unwrap();
        prop_assert_eq!(back, packet);
    }

    #[test]
    fn control_packet_roundtrip(
        kind in control_kind_strategy(),
        subtype in any::<u16>(),
        info in any::<u32>(),
        timestamp in any::<u32>(),
        dest in any::<u32>(),
        body in payload_strategy(),
    ) {
        let mut header = ControlHeader::new(kind, info, timestamp, dest);
        header.subtype = subtype;
        let packet = ControlPacket { header, body };
        let back = ControlPacket::decode(&packet.encode()).unwrap();
        prop_assert_eq!(back, packet);
    }

    #[test]
    fn shape_detection_matches_construction(
        seq in seq_strategy(),
        info in any::<u32>(),
    ) {
        let data = DataPacket {
            header: DataHeader {
                seq,
                position: PacketPosition::Only,
                ordered: false,
                key_flag: KeyFlag::None,
                retransmitted: false,
                message: MessageNumber::new(0),
                timestamp: 0,
                dest_socket_id: 0,
            },
            payload: Bytes::new(),
        };
        prop_assert!(matches!(
            Packet::decode(&data.encode()).unwrap(),
            Packet::Data(_)
        ));

        let control = ControlPacket {
            header: ControlHeader::new(ControlKind::KeepAlive, info, 0, 0),
            body: Bytes::new(),
        };
        prop_assert!(matches!(
            Packet::decode(&control.encode()).unwrap(),
            Packet::Control(_)
        ));
    }

    #[test]
    fn nak_body_roundtrip(raw_entries in prop::collection::vec((0..=SEQ_MAX, 0u32..64), 0..32)) {
        let entries: Vec<LossEntry> = raw_entries
            .into_iter()
            .map(|(lo, span)| {
                let lo = SeqNumber::new(lo);
                if span == 0 {
                    LossEntry::Single(lo)
                } else {
                    LossEntry::Range(lo, lo + span)
                }
            })
            .collect();
        let body = NakBody::new(entries);
        prop_assert_eq!(NakBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn sequence_offset_antisymmetric(a in 0..=SEQ_MAX, b in 0..=SEQ_MAX) {
        let a = SeqNumber::new(a);
        let b = SeqNumber::new(b);
        let forward = a.offset_to(b);
        let backward = b.offset_to(a);
        // the two direction measurements cancel unless they meet exactly
        // halfway around the circle, where both directions tie
        const HALF: i32 = 1 << 30;
        if forward.abs() != HALF {
            prop_assert_eq!(forward, -backward);
        }
    }

    #[test]
    fn sequence_add_then_offset(a in 0..=SEQ_MAX, step in 0u32..1_000_000) {
        let a = SeqNumber::new(a);
        let b = a + step;
        prop_assert_eq!(a.offset_to(b), step as i32);
        if step > 0 {
            prop_assert!(a.precedes(b));
            prop_assert!(b.follows(a));
        }
    }
}
