use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::hint::black_box;
use tabula_collab::{BroadcastGroup, CompressedSnapshot, Envelope, SyncProtocol};
use tabula_core::{CellPatch, Document, Origin, ReplicaId};

fn populated(rows: u32) -> Document {
    let mut doc = Document::new();
    doc.set_cells((0..rows).map(|r| (r, 0, CellPatch::value(format!("row {r}")))));
    doc
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("Envelope");
    let update = populated(20).encode_state();
    let envelope = Envelope::Update { update };
    let text = envelope.encode().unwrap();
    group.throughput(Throughput::Bytes(text.len() as u64));

    group.bench_function("encode_update", |b| {
        b.iter(|| black_box(envelope.encode().unwrap()))
    });
    group.bench_function("decode_update", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&text)).unwrap()))
    });
    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let server = populated(1_000);
    c.bench_function("handshake_1k_cells", |b| {
        b.iter_batched(
            || (Document::new(), server.encode_state()),
            |(mut client, state)| {
                let mut room = Document::new();
                room.apply_update(&state).unwrap();
                let mut initiator = SyncProtocol::initiator();
                let mut responder = SyncProtocol::responder();
                let origin = Origin::Remote(ReplicaId::NIL);
                let step1 = initiator.start(&client);
                let step2 = responder.handle(&mut room, step1, origin).unwrap().replies.remove(0);
                let step3 = initiator.handle(&mut client, step2, origin).unwrap().replies.remove(0);
                responder.handle(&mut room, step3, origin).unwrap();
                black_box(client)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("BroadcastGroup");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("1000_frames_to_100_peers", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let room = BroadcastGroup::new(1_024);
                let mut receivers = Vec::with_capacity(100);
                for conn in 0..100 {
                    receivers.push(room.add_peer(conn).await);
                }
                for i in 0..1_000u64 {
                    room.broadcast(i % 100, "{\"type\":\"update\",\"update\":[1,2,3]}".into());
                }
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
            })
        })
    });
    group.finish();
}

fn bench_snapshot_compression(c: &mut Criterion) {
    let state = populated(10_000).encode_state();
    let mut group = c.benchmark_group("CompressedSnapshot");
    group.throughput(Throughput::Bytes(state.len() as u64));
    group.bench_function("compress_10k_cells", |b| {
        b.iter(|| black_box(CompressedSnapshot::compress("bench", black_box(&state))))
    });
    let compressed = CompressedSnapshot::compress("bench", &state);
    group.bench_function("decompress_10k_cells", |b| {
        b.iter(|| black_box(compressed.decompress().unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope,
    bench_handshake,
    bench_fan_out,
    bench_snapshot_compression
);
criterion_main!(benches);
