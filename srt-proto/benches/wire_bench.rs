use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use srt_proto::handshake::{Extension, HandshakeBody, HandshakeType, SRT_VERSION};
use srt_proto::{DataHeader, DataPacket, KeyFlag, MessageNumber, Packet, PacketPosition, SeqNumber};

fn sample_packet() -> DataPacket {
    DataPacket {
        header: DataHeader {
            seq: SeqNumber::new(1000),
            position: PacketPosition::Only,
            ordered: true,
            key_flag: KeyFlag::None,
            retransmitted: false,
            message: MessageNumber::new(100),
            timestamp: 5000,
            dest_socket_id: 9999,
        },
        payload: Bytes::from(vec![0u8; 1316]),
    }
}

fn bench_data_encode(c: &mut Criterion) {
    let packet = sample_packet();
    let mut group = c.benchmark_group("data_packet");
    group.throughput(Throughput::Bytes(packet.size() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(black_box(&packet).encode()));
    });
    group.finish();
}

fn bench_data_decode(c: &mut Criterion) {
    let wire = sample_packet().encode();
    c.bench_function("data_packet_decode", |b| {
        b.iter(|| black_box(Packet::decode(black_box(&wire)).unwrap()));
    });
}

fn bench_handshake_codec(c: &mut Criterion) {
    let body = HandshakeBody {
        version: SRT_VERSION,
        encryption_field: 2,
        extension_field: 0,
        initial_seq: SeqNumber::new(42),
        mtu: 1500,
        max_flow_window: 8192,
        handshake_type: HandshakeType::Conclusion,
        socket_id: 7,
        peer_ip: [0u8; 16],
        extensions: vec![
            Extension::SrtVersion(SRT_VERSION),
            Extension::Flags(1),
            Extension::TsbpdDelay(120_000),
            Extension::PeerLatency(120_000),
            Extension::KeySalt([9u8; 16]),
        ],
    };

    c.bench_function("handshake_encode", |b| {
        b.iter(|| black_box(black_box(&body).encode()));
    });
    let wire = body.encode();
    c.bench_function("handshake_decode", |b| {
        b.iter(|| black_box(HandshakeBody::decode(black_box(&wire)).unwrap()));
    });
}

fn bench_sequence_ops(c: &mut Criterion) {
    let a = SeqNumber::new(0x7FFF_FFF0);
    let b_seq = SeqNumber::new(16);
    c.bench_function("seq_offset_across_wrap", |b| {
        b.iter(|| black_box(black_box(a).offset_to(black_box(b_seq))));
    });
}

criterion_group!(
    benches,
    bench_data_encode,
    bench_data_decode,
    bench_handshake_codec,
    bench_sequence_ops
);
criterion_main!(benches);
