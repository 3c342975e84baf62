//! Implicit stream-power erosion with hillslope diffusion.
//!
//! Each free row solves
//!
//! ```text
//! h' + dt * sum_r c_r (h' - h'_r) + dt * sum_j d_j (h' - h'_j) = h + dt * U
//! ```
//!
//! where `c_r` is the linearised stream-power coefficient towards flow
//! receiver `r` and `d_j` the diffusion coefficient towards mesh neighbor
//! `j`. Boundary rows are fixed. The eroded volume is then routed down the
//! flow graph as sediment, filling lakes on the way.

use crate::accumulate::{descending_order, route, RoutingField};
use crate::comm::Halo;
use crate::config::{AccumulationConfig, HillslopeConfig, SimulationConfig, StreamPowerConfig};
use crate::error::LandscapeError;
use crate::flow::FlowGraph;
use crate::mesh::PartitionMesh;
use crate::solver::{solve_collectively, LinearSolver, SolveError, SparseSystem};

/// Per-step fields the erosion solve reads. Slices cover owned and ghost
/// vertices unless noted.
#[derive(Debug, Clone, Copy)]
pub struct ErosionInputs<'s> {
    pub elevation: &'s [f64],
    pub filled: &'s [f64],
    pub routing: &'s [f64],
    pub discharge: &'s [f64],
    /// Owned vertices only.
    pub uplift: &'s [f64],
    /// Owned vertices only.
    pub erodibility: &'s [f64],
    pub sea_level: f64,
    /// Resolved on the routing surface.
    pub graph: &'s FlowGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    Land,
    Stream,
    Ocean,
}

/// Assembled system plus the coefficients needed for mass accounting.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub system: SparseSystem,
    /// Fluvial coefficients `(receiver, c_r)` per owned row.
    pub fluvial: Vec<Vec<(u32, f64)>>,
    /// Diffusion coefficients `(neighbor, d_j)` per owned row.
    pub diffusion: Vec<Vec<(u32, f64)>>,
    pub dt: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImplicitStep {
    pub elevation: Vec<f64>,
    pub dt: f64,
    pub halved: bool,
    pub iterations: u32,
    pub residual: f64,
    /// Fluvial volume removed per owned vertex, never negative.
    pub eroded: Vec<f64>,
    /// Net diffusive volume lost through fixed rows on this partition.
    pub diffused_out: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SedimentBudget {
    pub lake_deposit: Vec<f64>,
    pub marine_delivery: Vec<f64>,
    /// Volume leaving through subaerial boundary sinks on this partition.
    pub exited: f64,
    pub rounds: u32,
}

#[derive(Debug, Clone)]
pub struct ErosionModel {
    stream_power: StreamPowerConfig,
    hillslope: HillslopeConfig,
    accumulation: AccumulationConfig,
}

impl ErosionModel {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            stream_power: config.stream_power().clone(),
            hillslope: config.hillslope().clone(),
            accumulation: config.accumulation().clone(),
        }
    }

    fn regime(&self, inputs: &ErosionInputs<'_>, v: usize) -> Regime {
        if inputs.elevation[v] < inputs.sea_level {
            Regime::Ocean
        } else if inputs.discharge[v] >= self.hillslope.stream_discharge_threshold() {
            Regime::Stream
        } else {
            Regime::Land
        }
    }

    fn diffusivity(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Land => self.hillslope.land(),
            Regime::Stream => self.hillslope.stream(),
            Regime::Ocean => self.hillslope.ocean(),
        }
    }

    /// Lake vertices sit below their spill level and take no fluvial term.
    pub fn is_lake(inputs: &ErosionInputs<'_>, v: usize) -> bool {
        inputs.filled[v] > inputs.elevation[v]
    }

    /// Linearised stream-power coefficients for one owned vertex.
    fn fluvial_row(&self, inputs: &ErosionInputs<'_>, v: usize) -> Vec<(u32, f64)> {
        let subaerial = inputs.elevation[v] >= inputs.sea_level;
        if !subaerial || Self::is_lake(inputs, v) || inputs.graph.is_sink(v) {
            return Vec::new();
        }
        let sp = &self.stream_power;
        let discharge = inputs.discharge[v].max(0.0);
        let power = inputs.erodibility[v] * discharge.powf(sp.m());
        inputs
            .graph
            .receivers(v)
            .iter()
            .map(|edge| {
                let slope = if sp.n() < 1.0 {
                    edge.slope.max(sp.min_slope())
                } else {
                    edge.slope
                };
                let c = power * edge.weight / edge.edge_length * slope.powf(sp.n() - 1.0);
                (edge.receiver, c)
            })
            .collect()
    }

    pub fn assemble(&self, mesh: &PartitionMesh, inputs: &ErosionInputs<'_>, dt: f64) -> Assembly {
        let owned = mesh.owned_count();
        let regimes: Vec<Regime> = (0..mesh.len()).map(|v| self.regime(inputs, v)).collect();
        let mut system = SparseSystem::new(inputs.elevation.to_vec());
        let mut fluvial = Vec::with_capacity(owned);
        let mut diffusion = Vec::with_capacity(owned);

        for v in 0..owned {
            if mesh.boundary_flag(v) {
                system.push_fixed_row(inputs.elevation[v]);
                fluvial.push(Vec::new());
                diffusion.push(Vec::new());
                continue;
            }

            let stream = self.fluvial_row(inputs, v);
            let area = mesh.cell_area(v);
            let kappa_v = self.diffusivity(regimes[v]);
            let hill: Vec<(u32, f64)> = mesh
                .neighbors(v)
                .iter()
                .filter(|n| n.conductance > 0.0)
                .map(|n| {
                    let kappa = 0.5 * (kappa_v + self.diffusivity(regimes[n.index as usize]));
                    (n.index, kappa * n.conductance / area)
                })
                .collect();

            let diagonal = 1.0
                + dt * stream.iter().map(|(_, c)| c).sum::<f64>()
                + dt * hill.iter().map(|(_, d)| d).sum::<f64>();
            let mut row = Vec::with_capacity(1 + stream.len() + hill.len());
            row.push((v as u32, diagonal));
            row.extend(stream.iter().map(|&(r, c)| (r, -dt * c)));
            row.extend(hill.iter().map(|&(j, d)| (j, -dt * d)));
            system.push_row(row, inputs.elevation[v] + dt * inputs.uplift[v]);

            fluvial.push(stream);
            diffusion.push(hill);
        }

        let mut sweep = descending_order(mesh, inputs.routing);
        sweep.reverse();
        system.set_sweep_order(sweep);

        Assembly {
            system,
            fluvial,
            diffusion,
            dt,
        }
    }

    /// Solve one implicit step at `dt`, retrying once at `dt / 2` when the
    /// linear solver does not converge on some partition.
    pub fn solve(
        &self,
        halo: &mut Halo<'_>,
        inputs: &ErosionInputs<'_>,
        dt: f64,
        step: u64,
        solver: &dyn LinearSolver,
    ) -> Result<ImplicitStep, LandscapeError> {
        match self.solve_at(halo, inputs, dt, solver) {
            Ok(result) => Ok(result),
            Err(SolveError::Exchange(err)) => Err(err),
            Err(SolveError::NonConvergence { residual, iterations }) => {
                tracing::warn!(
                    target: "landscape::erosion",
                    rank = halo.mesh().rank(),
                    step,
                    dt,
                    residual,
                    iterations,
                    "erosion.retry_half_step"
                );
                match self.solve_at(halo, inputs, 0.5 * dt, solver) {
                    Ok(result) => Ok(ImplicitStep {
                        halved: true,
                        ..result
                    }),
                    Err(SolveError::Exchange(err)) => Err(err),
                    Err(SolveError::NonConvergence { residual, .. }) => {
                        Err(LandscapeError::StepFailure {
                            step,
                            dt: 0.5 * dt,
                            residual,
                            retries: 0,
                        })
                    }
                }
            }
        }
    }

    fn solve_at(
        &self,
        halo: &mut Halo<'_>,
        inputs: &ErosionInputs<'_>,
        dt: f64,
        solver: &dyn LinearSolver,
    ) -> Result<ImplicitStep, SolveError> {
        let mesh = halo.mesh();
        let assembly = self.assemble(mesh, inputs, dt);
        let solution = solve_collectively(solver, &assembly.system, halo)?;
        let x = &solution.values;

        let mut eroded = vec![0.0; mesh.owned_count()];
        let mut diffused_out = 0.0;
        for v in 0..mesh.owned_count() {
            let area = mesh.cell_area(v);
            let incision: f64 = assembly.fluvial[v]
                .iter()
                .map(|&(r, c)| c * (x[v] - x[r as usize]))
                .sum();
            eroded[v] = (area * dt * incision).max(0.0);
            for &(j, d) in &assembly.diffusion[v] {
                if mesh.boundary_flag(j as usize) {
                    diffused_out += area * dt * d * (x[v] - x[j as usize]);
                }
            }
        }

        Ok(ImplicitStep {
            elevation: solution.values,
            dt,
            halved: false,
            iterations: solution.iterations,
            residual: solution.residual,
            eroded,
            diffused_out,
        })
    }

    /// Route the eroded volume downstream. Lake vertices retain sediment up
    /// to the depression volume left above the solved surface; whatever
    /// reaches a sink is delivered to the sea or leaves the mesh.
    pub fn route_sediment(
        &self,
        halo: &mut Halo<'_>,
        inputs: &ErosionInputs<'_>,
        solved: &ImplicitStep,
    ) -> Result<SedimentBudget, LandscapeError> {
        let mesh = halo.mesh();
        let owned = mesh.owned_count();
        let capacity: Vec<f64> = (0..owned)
            .map(|v| {
                if Self::is_lake(inputs, v) {
                    (inputs.filled[v] - solved.elevation[v]).max(0.0) * mesh.cell_area(v)
                } else {
                    0.0
                }
            })
            .collect();
        let order = descending_order(mesh, inputs.routing);
        let outcome = route(
            halo,
            inputs.graph,
            &order,
            &[RoutingField {
                source: &solved.eroded,
                capacity: Some(&capacity),
            }],
            &self.accumulation,
        )?;
        let rounds = outcome.rounds;
        let routed = outcome.fields.into_iter().next().unwrap_or_default();

        let mut lake_deposit = routed.captured;
        lake_deposit.resize(owned, 0.0);
        let mut marine_delivery = vec![0.0; owned];
        let mut exited = 0.0;
        for (v, &amount) in routed.terminal.iter().enumerate() {
            if amount <= 0.0 {
                continue;
            }
            if inputs.elevation[v] < inputs.sea_level {
                marine_delivery[v] += amount;
            } else if inputs.graph.is_sink(v) {
                exited += amount;
            } else {
                // Undrained vertex: sediment settles in place.
                lake_deposit[v] += amount;
            }
        }

        Ok(SedimentBudget {
            lake_deposit,
            marine_delivery,
            exited,
            rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::accumulate_drainage;
    use crate::comm::Communicator;
    use crate::config::SimulationConfig;
    use crate::fill::fill_depressions;
    use crate::mesh::GlobalMesh;
    use crate::solver::GaussSeidelSolver;

    struct Prepared {
        filled: Vec<f64>,
        routing: Vec<f64>,
        discharge: Vec<f64>,
        graph: FlowGraph,
    }

    fn prepare(part: &PartitionMesh, comm: &mut Communicator, h: &[f64], config: &SimulationConfig) -> Prepared {
        let sea = config.forcing().sea_level();
        let first = FlowGraph::resolve(part, h, sea, config.flow()).expect("flow");
        let mut halo = Halo::new(part, comm);
        let fill = fill_depressions(&mut halo, h, sea, config.fill(), first.pending().len())
            .expect("fill");
        let graph = FlowGraph::resolve(part, &fill.routing, sea, config.flow()).expect("flow");
        let precipitation = vec![config.forcing().precipitation(); part.len()];
        let drainage = accumulate_drainage(
            &mut halo,
            &graph,
            &fill.routing,
            &precipitation,
            config.accumulation(),
        )
        .expect("drainage");
        Prepared {
            filled: fill.filled,
            routing: fill.routing,
            discharge: drainage.discharge,
            graph,
        }
    }

    fn inputs<'s>(h: &'s [f64], p: &'s Prepared, zeros: &'s [f64], ke: &'s [f64], sea: f64) -> ErosionInputs<'s> {
        ErosionInputs {
            elevation: h,
            filled: &p.filled,
            routing: &p.routing,
            discharge: &p.discharge,
            uplift: zeros,
            erodibility: ke,
            sea_level: sea,
            graph: &p.graph,
        }
    }

    #[test]
    fn single_receiver_matches_closed_form() {
        let config = SimulationConfig::from_json_str(
            r#"{ "hillslope": { "land": 0.0, "stream": 0.0, "ocean": 0.0 },
                 "forcing": { "sea_level": -100.0 },
                 "solver": { "tolerance": 1e-14 } }"#,
        )
        .expect("config");
        let mesh = GlobalMesh::regular_grid(3, 3, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let mut h = vec![0.0; 9];
        h[4] = 10.0;
        let mut comm = Communicator::solo();
        let prepared = prepare(&part, &mut comm, &h, &config);
        let zeros = vec![0.0; 9];
        let ke = vec![1e-3; 9];
        let inputs = inputs(&h, &prepared, &zeros, &ke, -100.0);

        let model = ErosionModel::new(&config);
        let solver = GaussSeidelSolver::from_config(config.solver());
        let mut halo = Halo::new(&part, &mut comm);
        let dt = 100.0;
        let step = model.solve(&mut halo, &inputs, dt, 1, &solver).expect("solve");

        // Vertex 4 drains to boundary vertex 1 along a unit edge; discharge is
        // its own unit cell, so c = Ke.
        let c = 1e-3;
        let expected = (10.0 + dt * c * 0.0) / (1.0 + dt * c);
        assert!((step.elevation[4] - expected).abs() < 1e-10);
        assert!((step.eroded[4] - (10.0 - step.elevation[4])).abs() < 1e-10);
        assert!(!step.halved);
        for v in [0, 1, 2, 3, 5, 6, 7, 8] {
            assert_eq!(step.elevation[v], 0.0);
        }
    }

    #[test]
    fn flat_surface_is_unchanged() {
        let config = SimulationConfig::from_json_str(r#"{ "forcing": { "sea_level": -100.0 } }"#)
            .expect("config");
        let mesh = GlobalMesh::regular_grid(6, 6, 10.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let h = vec![5.0; 36];
        let mut comm = Communicator::solo();
        let prepared = prepare(&part, &mut comm, &h, &config);
        let zeros = vec![0.0; 36];
        let ke = vec![config.stream_power().erodibility(); 36];
        let inputs = inputs(&h, &prepared, &zeros, &ke, -100.0);

        let model = ErosionModel::new(&config);
        let solver = GaussSeidelSolver::from_config(config.solver());
        let mut halo = Halo::new(&part, &mut comm);
        let step = model.solve(&mut halo, &inputs, 1000.0, 1, &solver).expect("solve");
        for v in 0..36 {
            assert!((step.elevation[v] - 5.0).abs() < 1e-9);
        }
        let budget = model.route_sediment(&mut halo, &inputs, &step).expect("sediment");
        let total: f64 = step.eroded.iter().sum();
        assert!(total < 1e-9);
        assert!(budget.exited <= total + 1e-12);
    }

    #[test]
    fn lakes_take_no_fluvial_term() {
        let config = SimulationConfig::from_json_str(r#"{ "forcing": { "sea_level": -100.0 } }"#)
            .expect("config");
        let mesh = GlobalMesh::regular_grid(5, 5, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let mut h: Vec<f64> = (0..25).map(|v| 10.0 + (v % 5) as f64).collect();
        h[12] = 1.0;
        let mut comm = Communicator::solo();
        let prepared = prepare(&part, &mut comm, &h, &config);
        let zeros = vec![0.0; 25];
        let ke = vec![1e-4; 25];
        let inputs = inputs(&h, &prepared, &zeros, &ke, -100.0);

        assert!(ErosionModel::is_lake(&inputs, 12));
        let model = ErosionModel::new(&config);
        let assembly = model.assemble(&part, &inputs, 10.0);
        assert!(assembly.fluvial[12].is_empty());
        assert!(!assembly.fluvial[13].is_empty());
        assert_eq!(assembly.system.rows(), 25);
        // Boundary rows are identity.
        assert_eq!(assembly.system.row(0), &[crate::solver::Triplet { row: 0, col: 0, value: 1.0 }]);
    }

    #[test]
    fn sediment_fills_lake_before_passing_on() {
        let config = SimulationConfig::from_json_str(
            r#"{ "hillslope": { "land": 0.0, "stream": 0.0, "ocean": 0.0 },
                 "forcing": { "sea_level": -100.0 } }"#,
        )
        .expect("config");
        let mesh = GlobalMesh::regular_grid(5, 3, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        // Middle row: 8 drains through 7 into the pit at 6, which spills at
        // 3 m over boundary vertex 5.
        let mut h = vec![20.0; 15];
        h[5] = 3.0;
        h[6] = 2.0;
        h[7] = 5.0;
        h[8] = 9.0;
        let mut comm = Communicator::solo();
        let prepared = prepare(&part, &mut comm, &h, &config);
        let zeros = vec![0.0; 15];
        let ke = vec![0.0; 15];
        let inputs = inputs(&h, &prepared, &zeros, &ke, -100.0);
        let model = ErosionModel::new(&config);

        let mut eroded = vec![0.0; 15];
        eroded[8] = 1.5;
        let solved = ImplicitStep {
            elevation: h.clone(),
            dt: 1.0,
            halved: false,
            iterations: 0,
            residual: 0.0,
            eroded,
            diffused_out: 0.0,
        };
        let mut halo = Halo::new(&part, &mut comm);
        let budget = model.route_sediment(&mut halo, &inputs, &solved).expect("sediment");
        assert!((budget.lake_deposit[6] - 1.0).abs() < 1e-12);
        assert!((budget.exited - 0.5).abs() < 1e-12);
        assert!(budget.marine_delivery.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn persistent_non_convergence_is_a_step_failure() {
        let config = SimulationConfig::from_json_str(
            r#"{ "forcing": { "sea_level": -100.0 },
                 "solver": { "tolerance": 1e-300, "max_iterations": 1, "local_sweeps": 1 } }"#,
        )
        .expect("config");
        let mesh = GlobalMesh::regular_grid(6, 6, 1.0).expect("grid");
        let part = mesh.single_partition().expect("partition");
        let h: Vec<f64> = (0..36).map(|v| ((v * 37) % 11) as f64).collect();
        let mut comm = Communicator::solo();
        let prepared = prepare(&part, &mut comm, &h, &config);
        let uplift = vec![1e-3; 36];
        let ke = vec![1e-3; 36];
        let inputs = inputs(&h, &prepared, &uplift, &ke, -100.0);

        let model = ErosionModel::new(&config);
        let solver = GaussSeidelSolver::from_config(config.solver());
        let mut halo = Halo::new(&part, &mut comm);
        let err = model.solve(&mut halo, &inputs, 1000.0, 7, &solver).unwrap_err();
        assert!(matches!(
            err,
            LandscapeError::StepFailure { step: 7, dt, .. } if dt == 500.0
        ));
    }
}
