use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use landscape_core::{run_simulation, GlobalMesh, RunOptions, SimulationConfig};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const SINGLE_STEP: &str = r#"{
    "time": { "start": 0.0, "end": 1000.0, "dt": 1000.0 },
    "forcing": { "uplift": 0.001, "sea_level": -50.0 }
}"#;

fn terrain(mesh: &GlobalMesh, seed: u64) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..mesh.len() as u64)
        .map(|id| {
            let [x, y, _] = mesh.coord(id);
            0.01 * (x + y) + rng.gen_range(0.0..5.0)
        })
        .collect()
}

/// Column stripes, one per partition.
fn stripes(size: usize, partitions: usize) -> Vec<usize> {
    (0..size * size)
        .map(|id| (id % size) * partitions / size)
        .collect()
}

fn bench_step(c: &mut Criterion) {
    // RUST_LOG=landscape=info shows per-step commits while benchmarking.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let config = Arc::new(SimulationConfig::from_json_str(SINGLE_STEP).expect("bench config"));
    let options = RunOptions::new(config);
    let mut group = c.benchmark_group("step");

    for size in [16usize, 32, 64] {
        let mesh = GlobalMesh::regular_grid(size, size, 100.0).expect("grid");
        let elevation = terrain(&mesh, size as u64);
        for partitions in [1usize, 4] {
            let meshes = mesh
                .partition(&stripes(size, partitions))
                .expect("partition");
            group.bench_with_input(
                BenchmarkId::new(format!("partitions_{partitions}"), size),
                &meshes,
                |b, meshes| {
                    b.iter_batched(
                        || elevation.clone(),
                        |elevation| run_simulation(meshes, &elevation, &options).expect("step"),
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    group.finish();
}

criterion_group!(step_benches, bench_step);
criterion_main!(step_benches);
