//! Spreads sediment delivered to the sea over the submerged part of the mesh.

use crate::comm::Halo;
use crate::config::MarineConfig;
use crate::error::{LandscapeError, MassConservationViolation};
use crate::solver::{solve_collectively, LinearSolver, SolveError, SparseSystem};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarineOutcome {
    /// Deposit thickness per owned vertex.
    pub thickness: Vec<f64>,
    pub delivered: f64,
    pub deposited: f64,
    pub iterations: u32,
    /// False when the solve failed and deposits stayed where they arrived.
    pub diffused: bool,
    pub violation: Option<MassConservationViolation>,
}

#[derive(Debug, Clone)]
pub struct MarineRouter {
    ocean_k: f64,
    mass_tolerance: f64,
}

impl MarineRouter {
    pub fn new(config: &MarineConfig) -> Self {
        Self {
            ocean_k: config.ocean_k(),
            mass_tolerance: config.mass_tolerance(),
        }
    }

    /// Diffuse `delivery` (volume per owned vertex) over submerged vertices.
    /// Links to subaerial vertices carry no flux.
    #[allow(clippy::too_many_arguments)]
    pub fn distribute(
        &self,
        halo: &mut Halo<'_>,
        elevation: &[f64],
        sea_level: f64,
        delivery: &[f64],
        dt: f64,
        step: u64,
        solver: &dyn LinearSolver,
    ) -> Result<MarineOutcome, LandscapeError> {
        let mesh = halo.mesh();
        let owned = mesh.owned_count();
        let local_delivered: f64 = delivery.iter().take(owned).sum();
        let delivered = halo.sum_all(local_delivered)?;
        if delivered == 0.0 {
            return Ok(MarineOutcome {
                thickness: vec![0.0; owned],
                diffused: true,
                ..MarineOutcome::default()
            });
        }

        let submerged = |v: usize| elevation[v] < sea_level;
        let mut initial = vec![0.0; mesh.len()];
        for v in 0..owned {
            initial[v] = delivery[v] / mesh.cell_area(v);
        }

        let mut system = SparseSystem::new(initial.clone());
        for v in 0..owned {
            if !submerged(v) {
                system.push_fixed_row(initial[v]);
                continue;
            }
            let area = mesh.cell_area(v);
            let links: Vec<(u32, f64)> = mesh
                .neighbors(v)
                .iter()
                .filter(|n| n.conductance > 0.0 && submerged(n.index as usize))
                .map(|n| (n.index, dt * self.ocean_k * n.conductance / area))
                .collect();
            let diagonal = 1.0 + links.iter().map(|(_, w)| w).sum::<f64>();
            let mut row = Vec::with_capacity(links.len() + 1);
            row.push((v as u32, diagonal));
            row.extend(links.iter().map(|&(j, w)| (j, -w)));
            system.push_row(row, initial[v]);
        }

        let (thickness, iterations, diffused) = match solve_collectively(solver, &system, halo) {
            Ok(solution) => (solution.values, solution.iterations, true),
            Err(SolveError::Exchange(err)) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    target: "landscape::marine",
                    rank = mesh.rank(),
                    step,
                    error = %err,
                    "marine.undiffused"
                );
                (initial, 0, false)
            }
        };
        let mut thickness = thickness;
        thickness.truncate(owned);

        let local_deposited: f64 = (0..owned).map(|v| thickness[v] * mesh.cell_area(v)).sum();
        let deposited = halo.sum_all(local_deposited)?;
        let relative_error = (deposited - delivered).abs() / delivered.abs();
        let violation = (relative_error > self.mass_tolerance).then(|| {
            let violation = MassConservationViolation {
                step,
                delivered,
                deposited,
                relative_error,
            };
            tracing::warn!(
                target: "landscape::marine",
                rank = mesh.rank(),
                %violation,
                "marine.mass_violation"
            );
            violation
        });

        Ok(MarineOutcome {
            thickness,
            delivered,
            deposited,
            iterations,
            diffused,
            violation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{launch, Communicator};
    use crate::mesh::GlobalMesh;
    use crate::solver::GaussSeidelSolver;

    fn router() -> MarineRouter {
        MarineRouter {
            ocean_k: 2.0,
            mass_tolerance: 1e-8,
        }
    }

    fn solver() -> GaussSeidelSolver {
        GaussSeidelSolver {
            tolerance: 1e-14,
            max_iterations: 2000,
            local_sweeps: 2,
        }
    }

    /// Left three columns under water.
    fn basin(id: u64) -> f64 {
        if id % 6 < 3 {
            -10.0
        } else {
            10.0
        }
    }

    #[test]
    fn delivered_volume_is_conserved_and_stays_offshore() {
        let mesh = GlobalMesh::regular_grid(6, 6, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let h: Vec<f64> = (0..36).map(basin).collect();
        let mut delivery = vec![0.0; 36];
        delivery[14] = 3.0;
        let mut comm = Communicator::solo();
        let mut halo = Halo::new(&part, &mut comm);
        let outcome = router()
            .distribute(&mut halo, &h, 0.0, &delivery, 1.0, 1, &solver())
            .expect("marine");

        assert!(outcome.diffused);
        assert!(outcome.violation.is_none());
        assert!((outcome.deposited - 3.0).abs() < 1e-9);
        assert!(outcome.thickness[14] < 3.0 / part.cell_area(14));
        assert!(outcome.thickness[13] > 0.0);
        for v in 0..36 {
            if h[v] > 0.0 {
                assert_eq!(outcome.thickness[v], 0.0);
            }
            assert!(outcome.thickness[v] >= 0.0);
        }
    }

    #[test]
    fn nothing_delivered_is_skipped() {
        let mesh = GlobalMesh::regular_grid(4, 4, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let h = vec![-1.0; 16];
        let mut comm = Communicator::solo();
        let mut halo = Halo::new(&part, &mut comm);
        let outcome = router()
            .distribute(&mut halo, &h, 0.0, &[0.0; 16], 1.0, 1, &solver())
            .expect("marine");
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.deposited, 0.0);
        assert_eq!(outcome.thickness, vec![0.0; 16]);
    }

    #[test]
    fn failed_solve_leaves_deposits_in_place() {
        let mesh = GlobalMesh::regular_grid(6, 6, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let h: Vec<f64> = (0..36).map(basin).collect();
        let mut delivery = vec![0.0; 36];
        delivery[14] = 3.0;
        let stubborn = GaussSeidelSolver {
            tolerance: 1e-300,
            max_iterations: 1,
            local_sweeps: 1,
        };
        let mut comm = Communicator::solo();
        let mut halo = Halo::new(&part, &mut comm);
        let outcome = router()
            .distribute(&mut halo, &h, 0.0, &delivery, 1.0, 1, &stubborn)
            .expect("marine");
        assert!(!outcome.diffused);
        assert_eq!(outcome.thickness[14] * part.cell_area(14), 3.0);
        assert!(outcome.violation.is_none());
    }

    #[test]
    fn partitioned_spreading_conserves_mass() {
        let mesh = GlobalMesh::regular_grid(6, 6, 1.0).expect("grid");
        let h: Vec<f64> = (0..36).map(basin).collect();
        let assignment: Vec<usize> = (0..36).map(|id| usize::from(id / 6 >= 3)).collect();
        let parts = mesh.partition(&assignment).expect("partition");
        let results = launch(parts.len(), |mut comm| {
            let part = &parts[comm.rank()];
            let local: Vec<f64> = part.global_ids().iter().map(|&id| h[id as usize]).collect();
            let delivery: Vec<f64> = (0..part.owned_count())
                .map(|v| if part.global_id(v) == 14 { 3.0 } else { 0.0 })
                .collect();
            let mut halo = Halo::new(part, &mut comm);
            router().distribute(&mut halo, &local, 0.0, &delivery, 1.0, 1, &solver())
        })
        .expect("launch");
        for outcome in results {
            let outcome = outcome.expect("marine");
            assert!((outcome.deposited - 3.0).abs() < 1e-9);
            assert!((outcome.delivered - 3.0).abs() < 1e-15);
        }
    }
}
