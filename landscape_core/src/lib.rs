//! Drainage-network and erosion-deposition core for long-term landscape
//! evolution on a partitioned unstructured mesh.
//!
//! Each partition runs on its own thread and talks to its neighbors only
//! through [`comm::Communicator`]. A time step resolves flow directions,
//! fills depressions with a parallel priority-flood, accumulates drainage
//! area, solves the implicit stream-power and diffusion system and spreads
//! marine sediment, then commits the new surface on every partition at once.
//! Use [`run_simulation`] to drive a whole run.

pub mod accumulate;
pub mod comm;
pub mod config;
pub mod erosion;
pub mod error;
pub mod fill;
pub mod flow;
pub mod forcing;
pub mod hashing;
pub mod log_capture;
pub mod marine;
pub mod mesh;
pub mod metrics;
pub mod simulation;
pub mod solver;

pub use accumulate::{accumulate_drainage, Drainage};
pub use comm::{launch, Communicator, Halo, Reduce};
pub use config::{
    load_simulation_config_from_env, ConfigError, FlowMode, SimulationConfig,
    SimulationConfigMetadata,
};
pub use error::{ExchangeComponent, LandscapeError, MassConservationViolation};
pub use fill::{fill_depressions, Depression, FillOutcome};
pub use flow::{FlowEdge, FlowGraph, VertexRole};
pub use forcing::{Forcing, UniformForcing};
pub use log_capture::{LogForwardLayer, LogRecord};
pub use mesh::{GlobalMesh, MeshError, Neighbor, PartitionMesh, VertexFlags};
pub use metrics::{SimulationMetrics, StepMetrics};
pub use simulation::{
    run_simulation, PartitionReport, PartitionWorker, Progress, RunOptions, SimulationError,
    StepPhase,
};
pub use solver::{
    solve_collectively, GaussSeidelSolver, LinearSolver, Solution, SolveError, SparseSystem,
};
