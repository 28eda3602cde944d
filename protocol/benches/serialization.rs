use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use protocol::{Packet, PacketKind, PacketRegistry, PeerId, decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Chat {
    message: String,
}

impl PacketKind for Chat {
    const KIND: &'static str = "Chat";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Move {
    x: u16,
    y: u16,
    direction: u8,
}

impl PacketKind for Move {
    const KIND: &'static str = "Move";
}

fn registry() -> PacketRegistry {
    let mut registry = PacketRegistry::new();
    registry.register::<Chat>();
    registry.register::<Move>();
    registry
}

fn bench_encode(c: &mut Criterion) {
    let registry = registry();
    let chat = Packet::broadcast(
        &registry,
        PeerId::random(),
        true,
        Chat {
            message: "the quick brown fox".to_string(),
        },
    )
    .unwrap();
    let movement = Packet::to_peer(
        &registry,
        PeerId::random(),
        PeerId::random(),
        Move {
            x: 124,
            y: 118,
            direction: 2,
        },
    )
    .unwrap();

    c.bench_with_input(BenchmarkId::new("encode", "chat"), &chat, |b, packet| {
        b.iter(|| encode(&registry, black_box(packet)).unwrap());
    });

    c.bench_with_input(BenchmarkId::new("encode", "move"), &movement, |b, packet| {
        b.iter(|| encode(&registry, black_box(packet)).unwrap());
    });
}

fn bench_decode(c: &mut Criterion) {
    let registry = registry();
    let packet = Packet::broadcast(
        &registry,
        PeerId::random(),
        false,
        Chat {
            message: "the quick brown fox".to_string(),
        },
    )
    .unwrap();
    let bytes = encode(&registry, &packet).unwrap();

    c.bench_with_input(BenchmarkId::new("decode", "chat"), &bytes, |b, bytes| {
        b.iter(|| decode(&registry, black_box(bytes)).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
