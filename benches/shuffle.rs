//! Benchmarks for the shuffle hot paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use record_shuffle::config::ShuffleConfig;
use record_shuffle::envelope;
use record_shuffle::nexus::StaticNexus;
use record_shuffle::placement::Placement;
use record_shuffle::shuffler::{Delivery, Shuffle};
use record_shuffle::transport::Mesh;

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_roundtrip");

    for payload_len in [8, 64, 255].iter() {
        let payload = vec![0xabu8; *payload_len];
        group.throughput(Throughput::Bytes(
            envelope::encoded_len("particle-000123", &payload) as u64,
        ));

        group.bench_with_input(
            BenchmarkId::from_parameter(payload_len),
            payload_len,
            |b, _| {
                let mut buf = [0u8; envelope::MAX_FRAME];
                b.iter(|| {
                    let n = envelope::encode(
                        &mut buf,
                        3,
                        17,
                        black_box("particle-000123"),
                        black_box(&payload),
                        42,
                    )
                    .unwrap();
                    black_box(envelope::decode(&buf[..n], 3, 17).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");

    for world in [16u32, 256, 4096].iter() {
        let cfg = ShuffleConfig::new().with_virtual_factor(64);
        let placement = Placement::from_config(&cfg, *world).unwrap();

        group.bench_with_input(
            BenchmarkId::new("ring", world),
            world,
            |b, _| {
                let mut i = 0u64;
                b.iter(|| {
                    i = i.wrapping_add(1);
                    black_box(placement.place(black_box(&format!("p{}", i))));
                });
            },
        );
    }

    let cfg = ShuffleConfig::new().with_bypass_placement(true);
    let bypass = Placement::from_config(&cfg, 256).unwrap();
    group.bench_function("bypass_256", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            black_box(bypass.place(black_box(&format!("p{}", i))));
        });
    });

    group.finish();
}

fn bench_write_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_throughput");
    let size = 1000u64;
    group.throughput(Throughput::Elements(size));

    group.bench_function("two_rank_direct", |b| {
        b.iter(|| {
            let cfg = ShuffleConfig::new().with_virtual_factor(32);
            let mesh = Mesh::new();
            let sink: Arc<dyn Delivery> =
                Arc::new(|_: &str, _: &[u8], _: u16| Ok(()));
            let ranks: Vec<Shuffle> = (0..2)
                .map(|rank| {
                    let nexus = Arc::new(
                        StaticNexus::single_node(rank, 2, "bmi+tcp", "127.0.0.1")
                            .unwrap(),
                    );
                    Shuffle::new(
                        cfg.clone(),
                        nexus,
                        Arc::new(mesh.endpoint(rank)),
                        Arc::clone(&sink),
                    )
                    .unwrap()
                })
                .collect();

            for i in 0..size {
                ranks[0]
                    .write(&format!("p{}", i), black_box(b"0123456789abcdef"), 0)
                    .unwrap();
            }
            for rank in &ranks {
                rank.epoch_end(0).unwrap();
            }
            for rank in ranks {
                rank.finalize().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_roundtrip,
    bench_placement,
    bench_write_throughput
);
criterion_main!(benches);
