//! Benchmarks for the delivery receipt table.
//!
//! Run with: cargo bench --bench receipts

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use xmpp_smsd::address::Jid;
use xmpp_smsd::gateway::ReceiptTracker;
use xmpp_smsd::xmpp::{Message, Stanza};

fn receipt(n: usize) -> Stanza {
    Message::receipt(
        Jid::new("5551230000", "sms.example.com"),
        Jid::new("alice", "example.com"),
        format!("msg-{}", n),
    )
    .into()
}

fn bench_register_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("receipts/register_resolve");

    for capacity in [10, 1000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let tracker = ReceiptTracker::new(capacity);
                let stanza = receipt(0);
                b.iter(|| {
                    tracker.register("SM123", stanza.clone());
                    black_box(tracker.resolve(black_box("SM123")))
                })
            },
        );
    }

    group.finish();
}

fn bench_overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("receipts/overflow");
    let stanzas: Vec<Stanza> = (0..100).map(receipt).collect();

    group.throughput(Throughput::Elements(stanzas.len() as u64));
    group.bench_function("fill_and_wrap_capacity_10", |b| {
        let tracker = ReceiptTracker::new(10);
        b.iter(|| {
            for (i, stanza) in stanzas.iter().enumerate() {
                tracker.register(format!("SM{}", i), stanza.clone());
            }
            black_box(tracker.len())
        })
    });

    group.finish();
}

fn bench_resolve_miss(c: &mut Criterion) {
    let tracker = ReceiptTracker::new(1000);
    for i in 0..500 {
        tracker.register(format!("SM{}", i), receipt(i));
    }

    c.bench_function("receipts/resolve_miss", |b| {
        b.iter(|| black_box(tracker.resolve(black_box("SM-unknown"))))
    });
}

criterion_group!(benches, bench_register_resolve, bench_overflow, bench_resolve_miss);

criterion_main!(benches);
