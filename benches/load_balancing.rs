use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use replica_router::backends::MemoryPool;
use replica_router::core::{LagAware, LoadBalancingAlgorithm, Node, RoundRobin};
use std::sync::Arc;

fn replicas(count: usize) -> Vec<Arc<Node>> {
    (0..count)
        .map(|i| {
            let name = format!("replica-{}", i + 1);
            let node = Arc::new(Node::replica(name.clone(), Arc::new(MemoryPool::new(name))));
            node.set_lag((i as u64 * 37) % 500, 0);
            node
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer");

    for count in [2, 8, 32] {
        let candidates = replicas(count);

        let round_robin = RoundRobin::new();
        group.bench_with_input(BenchmarkId::new("round_robin", count), &candidates, |b, nodes| {
            b.iter(|| black_box(round_robin.select_backend(black_box(nodes))))
        });

        let lag_aware = LagAware::new();
        group.bench_with_input(BenchmarkId::new("lag_aware", count), &candidates, |b, nodes| {
            b.iter(|| black_box(lag_aware.select_backend(black_box(nodes))))
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
