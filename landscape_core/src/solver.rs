//! Linear-solver seam for the implicit steps.
//!
//! Systems are distributed by row: each partition assembles the rows of its
//! owned vertices, with column indices in its local numbering (ghost columns
//! included). A [`LinearSolver`] returns the solution for owned and ghost
//! entries, refreshing ghosts through the [`Halo`].

use thiserror::Error;

use crate::comm::{Halo, Reduce};
use crate::config::SolverConfig;
use crate::error::LandscapeError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    pub row: u32,
    pub col: u32,
    pub value: f64,
}

/// Row-major triplets plus right-hand side and initial guess.
#[derive(Debug, Clone, Default)]
pub struct SparseSystem {
    triplets: Vec<Triplet>,
    row_offsets: Vec<usize>,
    rhs: Vec<f64>,
    guess: Vec<f64>,
    sweep_order: Option<Vec<u32>>,
}

impl SparseSystem {
    /// `guess` covers owned and ghost vertices.
    pub fn new(guess: Vec<f64>) -> Self {
        Self {
            triplets: Vec::new(),
            row_offsets: vec![0],
            rhs: Vec::new(),
            guess,
            sweep_order: None,
        }
    }

    /// Append the next row. Repeated columns are summed when applied.
    pub fn push_row(&mut self, entries: impl IntoIterator<Item = (u32, f64)>, rhs: f64) {
        let row = self.rhs.len() as u32;
        self.triplets.extend(
            entries
                .into_iter()
                .map(|(col, value)| Triplet { row, col, value }),
        );
        self.row_offsets.push(self.triplets.len());
        self.rhs.push(rhs);
    }

    /// Identity row: keeps the value at `rhs`.
    pub fn push_fixed_row(&mut self, rhs: f64) {
        let row = self.rhs.len() as u32;
        self.push_row([(row, 1.0)], rhs);
    }

    /// Rows are relaxed in this order instead of ascending index.
    pub fn set_sweep_order(&mut self, order: Vec<u32>) {
        self.sweep_order = Some(order);
    }

    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    pub fn row(&self, row: usize) -> &[Triplet] {
        &self.triplets[self.row_offsets[row]..self.row_offsets[row + 1]]
    }

    pub fn triplets(&self) -> &[Triplet] {
        &self.triplets
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn guess(&self) -> &[f64] {
        &self.guess
    }

    pub fn sweep_order(&self) -> Option<&[u32]> {
        self.sweep_order.as_deref()
    }

    /// `b - A x` for one row.
    pub fn row_residual(&self, row: usize, x: &[f64]) -> f64 {
        let applied: f64 = self
            .row(row)
            .iter()
            .map(|t| t.value * x[t.col as usize])
            .sum();
        self.rhs[row] - applied
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Owned and ghost values, ghosts refreshed.
    pub values: Vec<f64>,
    pub iterations: u32,
    /// Global max relative residual at return.
    pub residual: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveError {
    #[error("linear solve did not converge: residual {residual:e} after {iterations} iterations")]
    NonConvergence { residual: f64, iterations: u32 },
    #[error(transparent)]
    Exchange(#[from] LandscapeError),
}

/// Every partition calls `solve` for the same system, and implementations
/// must issue the same sequence of halo and collective calls on every rank.
/// The convergence verdict may still be local; [`solve_collectively`]
/// settles it across partitions.
pub trait LinearSolver: Send + Sync {
    fn solve(&self, system: &SparseSystem, halo: &mut Halo<'_>) -> Result<Solution, SolveError>;
}

/// Run `solver` and vote on the outcome. A non-convergence on any partition
/// fails the solve on all of them, reporting the worst residual.
pub fn solve_collectively(
    solver: &dyn LinearSolver,
    system: &SparseSystem,
    halo: &mut Halo<'_>,
) -> Result<Solution, SolveError> {
    let local = solver.solve(system, halo);
    let (failed, residual, iterations) = match &local {
        Ok(solution) => (0.0, solution.residual, solution.iterations),
        Err(SolveError::NonConvergence {
            residual,
            iterations,
        }) => (1.0, *residual, *iterations),
        Err(SolveError::Exchange(err)) => return Err(SolveError::Exchange(err.clone())),
    };
    let verdict = halo
        .comm()
        .all_reduce_many(&[failed, residual, f64::from(iterations)], Reduce::Max)?;
    if verdict[0] > 0.5 {
        return Err(SolveError::NonConvergence {
            residual: verdict[1],
            iterations: verdict[2] as u32,
        });
    }
    local
}

/// Distributed block Gauss-Seidel: local sweeps over owned rows, then a halo
/// refresh and a global residual check per outer iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussSeidelSolver {
    pub tolerance: f64,
    pub max_iterations: u32,
    pub local_sweeps: u32,
}

impl GaussSeidelSolver {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            tolerance: config.tolerance(),
            max_iterations: config.max_iterations(),
            local_sweeps: config.local_sweeps(),
        }
    }

    fn sweep(&self, system: &SparseSystem, x: &mut [f64]) {
        let mut relax = |row: usize| {
            let mut diagonal = 0.0;
            let mut off = 0.0;
            for t in system.row(row) {
                if t.col as usize == row {
                    diagonal += t.value;
                } else {
                    off += t.value * x[t.col as usize];
                }
            }
            if diagonal != 0.0 {
                x[row] = (system.rhs[row] - off) / diagonal;
            }
        };
        match system.sweep_order() {
            Some(order) => order.iter().for_each(|&row| relax(row as usize)),
            None => (0..system.rows()).for_each(relax),
        }
    }
}

impl Default for GaussSeidelSolver {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

impl LinearSolver for GaussSeidelSolver {
    fn solve(&self, system: &SparseSystem, halo: &mut Halo<'_>) -> Result<Solution, SolveError> {
        let mut x = system.guess.clone();
        halo.refresh(&mut [&mut x])?;

        let mut residual = relative_residual(system, &x, halo)?;
        if residual == 0.0 {
            return Ok(Solution {
                values: x,
                iterations: 0,
                residual,
            });
        }

        for iteration in 1..=self.max_iterations {
            for _ in 0..self.local_sweeps {
                self.sweep(system, &mut x);
            }
            halo.refresh(&mut [&mut x])?;
            residual = relative_residual(system, &x, halo)?;
            if residual <= self.tolerance {
                return Ok(Solution {
                    values: x,
                    iterations: iteration,
                    residual,
                });
            }
        }

        Err(SolveError::NonConvergence {
            residual,
            iterations: self.max_iterations,
        })
    }
}

/// Max row residual over the max right-hand side (floored at 1), reduced
/// over every partition.
pub fn relative_residual(
    system: &SparseSystem,
    x: &[f64],
    halo: &mut Halo<'_>,
) -> Result<f64, LandscapeError> {
    let mut worst: f64 = 0.0;
    let mut scale: f64 = 0.0;
    for row in 0..system.rows() {
        let r = system.row_residual(row, x).abs();
        worst = if r.is_finite() { worst.max(r) } else { f64::INFINITY };
        scale = scale.max(system.rhs[row].abs());
    }
    let reduced = halo.comm().all_reduce_many(&[worst, scale], Reduce::Max)?;
    Ok(reduced[0] / reduced[1].max(1.0))
}
