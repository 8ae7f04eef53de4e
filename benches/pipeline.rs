//! Dispatch-pipeline throughput benchmarks.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, Criterion};
use stagepipe::buffer::EventBuffer;
use stagepipe::dispatcher::{DemandDispatcher, Dispatcher};
use stagepipe::runtime::SubscriptionRef;
use stagepipe::types::{BufferConfig, BufferKeep, SubscriptionOptions};

fn bench_buffer_push_bounded_last(c: &mut Criterion) {
    c.bench_function("EventBuffer::push_events bounded/keep=last", |b| {
        b.iter(|| {
            let mut buf: EventBuffer<u64> = EventBuffer::new(BufferConfig::bounded(1000, BufferKeep::Last));
            for chunk in 0..10 {
                let events: Vec<u64> = (0..200).map(|i| chunk * 200 + i).collect();
                buf.push_events(events);
            }
            buf
        });
    });
}

fn bench_buffer_drain(c: &mut Criterion) {
    c.bench_function("EventBuffer::drain 500-at-a-time", |b| {
        b.iter(|| {
            let mut buf: EventBuffer<u64> = EventBuffer::new(BufferConfig::unbounded());
            buf.push_events((0..5000).collect());
            let mut total = 0;
            while total < 5000 {
                let drained = buf.drain(500);
                total += drained.len();
            }
            total
        });
    });
}

fn bench_demand_dispatch_single_subscriber(c: &mut Criterion) {
    c.bench_function("DemandDispatcher::dispatch single subscriber", |b| {
        b.iter(|| {
            let mut d = DemandDispatcher::new();
            let sub = SubscriptionRef::new();
            let opts = SubscriptionOptions::default();
            Dispatcher::<u64>::subscribe(&mut d, sub, &opts);
            Dispatcher::<u64>::ask(&mut d, sub, 1000);
            let events: Vec<u64> = (0..1000).collect();
            Dispatcher::<u64>::dispatch(&mut d, events)
        });
    });
}

fn bench_demand_dispatch_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("demand_dispatch_fanout");
    for consumers in [2, 10, 50] {
        group.bench_function(format!("{consumers} consumers"), |b| {
            b.iter(|| {
                let mut d = DemandDispatcher::new();
                let opts = SubscriptionOptions::default();
                let subs: Vec<SubscriptionRef> = (0..consumers)
                    .map(|_| {
                        let sub = SubscriptionRef::new();
                        Dispatcher::<u64>::subscribe(&mut d, sub, &opts);
                        Dispatcher::<u64>::ask(&mut d, sub, 100);
                        sub
                    })
                    .collect();
                let _ = &subs;
                let events: Vec<u64> = (0..(consumers as u64) * 100).collect();
                Dispatcher::<u64>::dispatch(&mut d, events)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_push_bounded_last,
    bench_buffer_drain,
    bench_demand_dispatch_single_subscriber,
    bench_demand_dispatch_fanout,
);
criterion_main!(benches);
