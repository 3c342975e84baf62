use serde::Serialize;

/// Global figures for one committed step, reduced over all partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    pub step: u64,
    pub time: f64,
    pub dt: f64,
    pub retries: u32,
    pub halved: bool,
    pub pending_vertices: u64,
    pub fill_rounds: u32,
    pub depressed_vertices: u64,
    pub depressions: u64,
    pub lake_volume: f64,
    pub accumulation_rounds: u32,
    pub sediment_rounds: u32,
    pub solver_iterations: u32,
    pub solver_residual: f64,
    pub eroded: f64,
    pub lake_deposited: f64,
    pub marine_delivered: f64,
    pub marine_deposited: f64,
    pub exited: f64,
    pub diffused_out: f64,
    pub mass_warnings: u32,
}

impl StepMetrics {
    /// Eroded volume not accounted for by lake and marine deposition or by
    /// sediment leaving the mesh.
    pub fn sediment_imbalance(&self) -> f64 {
        self.eroded - self.lake_deposited - self.marine_deposited - self.exited
    }
}

/// Running totals over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationMetrics {
    pub steps: u64,
    pub retries: u32,
    pub halved_steps: u32,
    pub eroded: f64,
    pub deposited: f64,
    pub exited: f64,
    pub mass_warnings: u32,
    pub max_fill_rounds: u32,
    pub max_accumulation_rounds: u32,
}

impl SimulationMetrics {
    pub fn record(&mut self, step: &StepMetrics) {
        self.steps += 1;
        self.retries += step.retries;
        self.halved_steps += u32::from(step.halved);
        self.eroded += step.eroded;
        self.deposited += step.lake_deposited + step.marine_deposited;
        self.exited += step.exited;
        self.mass_warnings += step.mass_warnings;
        self.max_fill_rounds = self.max_fill_rounds.max(step.fill_rounds);
        self.max_accumulation_rounds = self.max_accumulation_rounds.max(step.accumulation_rounds);
    }
}
