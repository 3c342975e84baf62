#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use landscape_core::{
    run_simulation, GlobalMesh, PartitionMesh, PartitionReport, RunOptions, SimulationConfig,
};
use landscape_proto::StepFrame;

pub fn config(json: &str) -> Arc<SimulationConfig> {
    Arc::new(SimulationConfig::from_json_str(json).expect("test config"))
}

/// Asymmetric valley draining toward the `y = 0` edge, with a small
/// deterministic roughness that leaves a few closed pits.
pub fn valley(nx: usize, ny: usize, spacing: f64) -> (GlobalMesh, Vec<f64>) {
    let mesh = GlobalMesh::regular_grid(nx, ny, spacing).expect("grid");
    let axis = (nx as f64 - 1.0) * spacing * 0.4;
    let elevation = (0..mesh.len() as u64)
        .map(|id| {
            let [x, y, _] = mesh.coord(id);
            let flank = if x < axis { 0.05 * (axis - x) } else { 0.07 * (x - axis) };
            let roughness = ((id * 7919) % 13) as f64 * 0.15;
            20.0 + 0.02 * y + flank + roughness
        })
        .collect();
    (mesh, elevation)
}

/// Vertical stripes of columns, one per partition.
pub fn column_stripes(nx: usize, ny: usize, partitions: usize) -> Vec<usize> {
    (0..nx * ny).map(|id| (id % nx) * partitions / nx).collect()
}

/// Horizontal bands of rows, one per partition.
pub fn row_bands(nx: usize, ny: usize, partitions: usize) -> Vec<usize> {
    (0..nx * ny).map(|id| (id / nx) * partitions / ny).collect()
}

pub fn split(mesh: &GlobalMesh, assignment: &[usize]) -> Vec<PartitionMesh> {
    mesh.partition(assignment).expect("partition")
}

/// Run and collect every frame the partitions published.
pub fn run_with_frames(
    meshes: &[PartitionMesh],
    elevation: &[f64],
    options: RunOptions,
) -> (Vec<PartitionReport>, Vec<StepFrame>) {
    let (sender, receiver) = unbounded();
    let options = options.with_frames(sender);
    let reports = run_simulation(meshes, elevation, &options).expect("simulation run");
    drop(options);
    (reports, receiver.try_iter().collect())
}

/// Owned values from every partition report, keyed by global id.
pub fn final_elevation(reports: &[PartitionReport]) -> BTreeMap<u64, f64> {
    reports
        .iter()
        .flat_map(|report| report.global_ids.iter().copied().zip(report.elevation.iter().copied()))
        .collect()
}

pub fn final_drainage_area(reports: &[PartitionReport]) -> BTreeMap<u64, f64> {
    reports
        .iter()
        .flat_map(|report| {
            report
                .global_ids
                .iter()
                .copied()
                .zip(report.drainage_area.iter().copied())
        })
        .collect()
}

pub fn assert_close(left: &BTreeMap<u64, f64>, right: &BTreeMap<u64, f64>, tolerance: f64) {
    assert_eq!(left.len(), right.len());
    for ((id, a), (other, b)) in left.iter().zip(right) {
        assert_eq!(id, other);
        let scale = a.abs().max(b.abs()).max(1.0);
        assert!(
            (a - b).abs() <= tolerance * scale,
            "vertex {id}: {a} vs {b}"
        );
    }
}
