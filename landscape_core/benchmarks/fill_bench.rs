use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use landscape_core::{
    fill_depressions, Communicator, FlowGraph, GlobalMesh, Halo, SimulationConfig,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn bench_fill(c: &mut Criterion) {
    let config = SimulationConfig::builtin();
    let mut group = c.benchmark_group("priority_flood");

    for size in [32usize, 64, 128] {
        let mesh = GlobalMesh::regular_grid(size, size, 50.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let mut rng = SmallRng::seed_from_u64(7);
        let elevation: Vec<f64> = (0..part.len()).map(|_| rng.gen_range(0.0..100.0)).collect();
        let pending = FlowGraph::resolve(&part, &elevation, -1.0, config.flow())
            .expect("flow")
            .pending()
            .len();

        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, _| {
            b.iter_batched(
                Communicator::solo,
                |mut comm| {
                    let mut halo = Halo::new(&part, &mut comm);
                    fill_depressions(&mut halo, &elevation, -1.0, config.fill(), pending)
                        .expect("fill")
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(fill_benches, bench_fill);
criterion_main!(fill_benches);
