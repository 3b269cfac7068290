// Intent signing & verification benchmarks.
//
// Covers device keypair generation, canonical serialization, intent signing,
// full verification, and conflict resolution over growing conflict groups.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use toss_protocol::clock::ManualClock;
use toss_protocol::crypto::keys::DeviceKeypair;
use toss_protocol::intent::{canonical_bytes, IntentCodec, IntentExtras};
use toss_protocol::reconcile::resolve;

const NOW: u64 = 1_700_000_000;

fn codec() -> IntentCodec {
    IntentCodec::new(Arc::new(ManualClock::new(NOW)))
}

fn bench_keypair_generation(c: &mut Criterion) {
    c.bench_function("ed25519/keypair_generate", |b| {
        b.iter(DeviceKeypair::generate);
    });
}

fn bench_canonical_bytes(c: &mut Criterion) {
    let codec = codec();
    let alice = DeviceKeypair::generate();
    let intent = codec
        .create(
            &alice,
            DeviceKeypair::generate().public_key(),
            1_000_000,
            5,
            NOW + 3600,
            IntentExtras::default(),
        )
        .unwrap();

    c.bench_function("intent/canonical_bytes", |b| {
        b.iter(|| canonical_bytes(&intent));
    });
}

fn bench_sign_intent(c: &mut Criterion) {
    let codec = codec();
    let alice = DeviceKeypair::generate();
    let intent = codec
        .create(
            &alice,
            DeviceKeypair::generate().public_key(),
            1_000_000,
            5,
            NOW + 3600,
            IntentExtras::default(),
        )
        .unwrap();

    c.bench_function("intent/sign", |b| {
        b.iter(|| codec.sign(&intent, &alice));
    });
}

fn bench_verify_intent(c: &mut Criterion) {
    let codec = codec();
    let alice = DeviceKeypair::generate();
    let intent = codec
        .create(
            &alice,
            DeviceKeypair::generate().public_key(),
            1_000_000,
            5,
            NOW + 3600,
            IntentExtras::default(),
        )
        .unwrap();

    c.bench_function("intent/verify", |b| {
        b.iter(|| codec.verify(&intent));
    });
}

fn bench_resolve_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict/resolve");
    let codec = codec();
    let alice = DeviceKeypair::generate();
    let bob = DeviceKeypair::generate().public_key();

    for size in [2, 10, 50, 200] {
        let intents: Vec<_> = (0..size)
            .map(|i| {
                codec
                    .create(&alice, bob, 500, (i % 7) as u64 + 1, NOW + 3600, IntentExtras::default())
                    .unwrap()
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &intents, |b, intents| {
            b.iter(|| resolve(intents));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_keypair_generation,
    bench_canonical_bytes,
    bench_sign_intent,
    bench_verify_intent,
    bench_resolve_conflicts,
);
criterion_main!(benches);
