//! Hot path benchmarks
//!
//! Per-packet accounting and steering against a populated registry.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mqnic_control::{FlowKey, ManualClock, QueueRegistry};
use std::sync::Arc;

fn registry(queues: u32, flows: u32) -> QueueRegistry {
    let reg = QueueRegistry::new(queues as usize, 4096, Arc::new(ManualClock::new(0)));
    for id in 0..queues {
        reg.register_queue(id, 0).unwrap();
    }
    for flow in 0..flows {
        reg.record_tx(flow % queues, flow, 64).unwrap();
    }
    reg
}

fn bench_flow_key(c: &mut Criterion) {
    let key = FlowKey::new(0xC0A80101, 0x08080808, 12345, 443, 6);
    c.bench_function("flow_key_flow_id", |b| b.iter(|| black_box(key).flow_id()));
}

fn bench_record_tx(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_tx");
    group.throughput(Throughput::Elements(1));

    for flows in [64u32, 1024, 8192].iter() {
        group.bench_with_input(BenchmarkId::new("existing_flow", flows), flows, |b, &flows| {
            let reg = registry(32, flows);
            let mut flow = 0u32;
            b.iter(|| {
                flow = (flow + 1) % flows;
                reg.record_tx(black_box(flow % 32), black_box(flow), 1500).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_steer(c: &mut Criterion) {
    let reg = registry(32, 1024);
    let mut group = c.benchmark_group("steer");

    group.bench_function("known_flow", |b| b.iter(|| reg.steer(black_box(513)).unwrap()));
    group.bench_function("new_flow", |b| b.iter(|| reg.steer(black_box(40_000)).unwrap()));
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let reg = registry(32, 4096);
    c.bench_function("snapshot_all_queues", |b| b.iter(|| black_box(reg.snapshots())));
}

criterion_group!(benches, bench_flow_key, bench_record_tx, bench_steer, bench_snapshot);
criterion_main!(benches);
