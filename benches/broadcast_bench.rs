// Gossip hot-path benchmarks: broadcast queue churn and wire codec

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use rusty_mesh::broadcast::TransmitLimitedQueue;
use rusty_mesh::net::codec::{
    encode_message, make_compound, parse_compound, PacketCodec,
};
use rusty_mesh::net::{Alive, MessageKind};
use std::sync::Arc;

fn sample_alive(i: u32) -> Alive {
    Alive {
        incarnation: i,
        node: format!("node-{}", i),
        addr: vec![10, 0, 0, (i % 250) as u8],
        port: 7946,
        meta: vec![0u8; 64],
        vsn: [0, 2, 2, 0, 0, 0],
    }
}

fn bench_queue_churn(c: &mut Criterion) {
    c.bench_function("queue_broadcast_and_drain", |b| {
        let queue = TransmitLimitedQueue::new(4, Arc::new(|| 50));
        let payloads: Vec<Bytes> = (0..32)
            .map(|i| encode_message(MessageKind::Alive, &sample_alive(i)).unwrap())
            .collect();

        b.iter(|| {
            for (i, payload) in payloads.iter().enumerate() {
                queue.queue_broadcast(Some(format!("node-{}", i)), payload.clone(), None);
            }
            while queue.num_queued() > 0 {
                black_box(queue.get_broadcasts(2, 1400));
            }
        });
    });
}

fn bench_codec(c: &mut Criterion) {
    c.bench_function("encode_decode_alive", |b| {
        let alive = sample_alive(7);
        b.iter(|| {
            let encoded = encode_message(MessageKind::Alive, &alive).unwrap();
            let decoded: Alive = rusty_mesh::net::codec::decode_body(&encoded[1..]).unwrap();
            black_box(decoded);
        });
    });

    c.bench_function("compound_pack_unpack", |b| {
        let msgs: Vec<Bytes> = (0..8)
            .map(|i| encode_message(MessageKind::Alive, &sample_alive(i)).unwrap())
            .collect();
        b.iter(|| {
            let compound = make_compound(&msgs).unwrap();
            let (parts, _) = parse_compound(&compound[1..]).unwrap();
            black_box(parts);
        });
    });

    c.bench_function("seal_open_encrypted", |b| {
        let codec = PacketCodec::new(Some([9u8; 16].as_slice())).unwrap();
        let raw = encode_message(MessageKind::Alive, &sample_alive(3)).unwrap();
        b.iter(|| {
            let sealed = codec.seal(&raw).unwrap();
            black_box(codec.open(&sealed).unwrap());
        });
    });
}

criterion_group!(benches, bench_queue_churn, bench_codec);
criterion_main!(benches);
