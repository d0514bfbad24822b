//! Decay and recall-fusion benchmarks.
//!
//! Run with: cargo bench -p agentdock-memory

use agentdock_memory::decay::{decay, decay_batch, DecayConfig};
use agentdock_memory::record::{MemoryRecord, MemoryType};
use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn aged_record(days: i64) -> MemoryRecord {
    let mut r = MemoryRecord::new("bench-user", "bench-agent", MemoryType::Episodic, "benchmark payload text", 0.6);
    let past = Utc::now() - Duration::days(days) - Duration::hours(1);
    r.updated_at = past;
    r.last_accessed_at = past;
    r
}

fn bench_single_decay(c: &mut Criterion) {
    let record = aged_record(5);
    let config = DecayConfig::default();
    let now = Utc::now();

    c.bench_function("decay_single_record", |b| {
        b.iter(|| black_box(decay(black_box(&record), now, &config)));
    });
}

fn bench_decay_batch_1000(c: &mut Criterion) {
    let records: Vec<MemoryRecord> = (0..1000).map(|i| aged_record(i % 60)).collect();
    let config = DecayConfig::default();
    let now = Utc::now();

    c.bench_function("decay_batch_1000", |b| {
        b.iter(|| black_box(decay_batch(&records, now, &config)));
    });
}

criterion_group!(benches, bench_single_decay, bench_decay_batch_1000);
criterion_main!(benches);
