//! Wire-level round trips across the packet, control and handshake codecs.

use bytes::Bytes;
use srt_crypt::{derive_key, CipherKind, CipherSession};
use srt_proto::handshake::{Extension, HandshakeBody, HandshakeType, EXT_MAGIC, SRT_VERSION};
use srt_proto::{
    AckBody, CodecError, ControlKind, ControlPacket, DataHeader, DataPacket, KeyFlag, LossEntry,
    MessageNumber, NakBody, Packet, PacketPosition, SeqNumber, HEADER_LEN,
};

#[test]
fn data_header_field_for_field_roundtrip() {
    let header = DataHeader {
        seq: SeqNumber::new(1234),
        position: PacketPosition::Only,
        ordered: true,
        key_flag: KeyFlag::Even,
        retransmitted: false,
        message: MessageNumber::new(5678),
        timestamp: 1000,
        dest_socket_id: 999,
    };
    let wire = DataPacket {
        header,
        payload: Bytes::new(),
    }
    .encode();
    assert_eq!(wire.len(), 16);

    let back = DataPacket::decode(&wire).unwrap();
    assert_eq!(back.header.seq.raw(), 1234);
    assert_eq!(back.header.position, PacketPosition::Only);
    assert!(back.header.ordered);
    assert_eq!(back.header.key_flag, KeyFlag::Even);
    assert!(!back.header.retransmitted);
    assert_eq!(back.header.message.raw(), 5678);
    assert_eq!(back.header.timestamp, 1000);
    assert_eq!(back.header.dest_socket_id, 999);
}

#[test]
fn ack_control_roundtrip() {
    let packet = ControlPacket {
        header: srt_proto::packet::ControlHeader::new(ControlKind::Ack, 12345, 2000, 888),
        body: Bytes::new(),
    };
    let wire = packet.encode();

    let Packet::Control(back) = Packet::decode(&wire).unwrap() else {
        panic!("control flag lost in transit");
    };
    assert_eq!(back.header.kind, ControlKind::Ack);
    assert_eq!(back.header.info, 12345);
    assert_eq!(back.header.timestamp, 2000);
    assert_eq!(back.header.dest_socket_id, 888);
}

#[test]
fn crypto_identity_under_shared_passphrase() {
    let salt = [0x42u8; 16];
    let key = derive_key("my_secret_passphrase", &salt, CipherKind::Aes256).unwrap();
    let mut sender = CipherSession::new("my_secret_passphrase".into(), key.clone(), 1_000_000);
    let mut receiver = CipherSession::new("my_secret_passphrase".into(), key, 1_000_000);

    let plaintext = b"Hello, SRT World!";
    let mut buf = plaintext.to_vec();
    let parity = sender.encrypt(12345, &mut buf).unwrap();

    assert_eq!(buf.len(), plaintext.len());
    assert_ne!(&buf[..], plaintext);

    receiver.decrypt(12345, parity, &mut buf).unwrap();
    assert_eq!(&buf[..], plaintext);
}

#[test]
fn short_datagrams_rejected_with_typed_error() {
    for len in 0..HEADER_LEN {
        let datagram = vec![0u8; len];
        assert_eq!(
            Packet::decode(&datagram).unwrap_err(),
            CodecError::ShortHeader(len)
        );
    }
}

#[test]
fn nak_singletons_and_ranges_roundtrip() {
    let body = NakBody::new(vec![
        LossEntry::Single(SeqNumber::new(4)),
        LossEntry::Range(SeqNumber::new(7), SeqNumber::new(11)),
    ]);
    let decoded = NakBody::decode(&body.encode()).unwrap();
    assert_eq!(decoded, body);
    assert_eq!(decoded.loss_count(), 6);
}

#[test]
fn ack_body_carries_echo_for_rtt() {
    let body = AckBody {
        echo_timestamp: 555_555,
        rtt_us: 30_000,
        rtt_var_us: 4_000,
        recv_rate_bps: 2_000_000,
    };
    let decoded = AckBody::decode(&body.encode()).unwrap().unwrap();
    assert_eq!(decoded.echo_timestamp, 555_555);
}

#[test]
fn handshake_body_survives_the_wire() {
    let body = HandshakeBody {
        version: SRT_VERSION,
        encryption_field: 2,
        extension_field: EXT_MAGIC,
        initial_seq: SeqNumber::new(777),
        mtu: 1500,
        max_flow_window: 8192,
        handshake_type: HandshakeType::Conclusion,
        socket_id: 31337,
        peer_ip: [0u8; 16],
        extensions: vec![
            Extension::SrtVersion(SRT_VERSION),
            Extension::Flags(1),
            Extension::TsbpdDelay(150_000),
            Extension::PeerLatency(150_000),
            Extension::KeySalt([7u8; 16]),
        ],
    };
    let back = HandshakeBody::decode(&body.encode()).unwrap();
    assert_eq!(back, body);
    assert_eq!(back.tsbpd_delay_us(), Some(150_000));
    assert_eq!(back.key_salt(), Some([7u8; 16]));
}

#[test]
fn payload_bytes_pass_through_untouched() {
    let payload = Bytes::from((0u8..=255).collect::<Vec<u8>>());
    let packet = DataPacket {
        header: DataHeader {
            seq: SeqNumber::new(1),
            position: PacketPosition::Only,
            ordered: false,
            key_flag: KeyFlag::None,
            retransmitted: false,
            message: MessageNumber::new(1),
            timestamp: 0,
            dest_socket_id: 0,
        },
        payload: payload.clone(),
    };
    let back = DataPacket::decode(&packet.encode()).unwrap();
    assert_eq!(back.payload, payload);
}
