//! Time-step orchestration.
//!
//! Every partition runs a [`PartitionWorker`] on its own thread. A step walks
//! the phases in [`StepPhase`] order; phases that can fail locally end with a
//! collective vote so that every partition takes the same branch. The new
//! elevation is built in a tentative buffer and only swapped in once every
//! partition has voted to commit.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use landscape_proto::{FrameHeader, StepFrame};
use thiserror::Error;

use crate::accumulate::accumulate_drainage;
use crate::comm::{launch, Communicator, Halo, Reduce};
use crate::config::SimulationConfig;
use crate::erosion::{ErosionInputs, ErosionModel};
use crate::error::LandscapeError;
use crate::fill::fill_depressions;
use crate::flow::FlowGraph;
use crate::forcing::{Forcing, ForcingSample, UniformForcing};
use crate::hashing::field_checksum;
use crate::marine::MarineRouter;
use crate::mesh::PartitionMesh;
use crate::metrics::{SimulationMetrics, StepMetrics};
use crate::solver::{GaussSeidelSolver, LinearSolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StepPhase {
    #[default]
    Idle,
    ForcingApplied,
    FlowResolved,
    Filled,
    Accumulated,
    Solved,
    Stepped,
}

impl StepPhase {
    const ALL: [StepPhase; 7] = [
        StepPhase::Idle,
        StepPhase::ForcingApplied,
        StepPhase::FlowResolved,
        StepPhase::Filled,
        StepPhase::Accumulated,
        StepPhase::Solved,
        StepPhase::Stepped,
    ];

    fn from_u8(raw: u8) -> Self {
        Self::ALL.get(raw as usize).copied().unwrap_or_default()
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepPhase::Idle => "idle",
            StepPhase::ForcingApplied => "forcing-applied",
            StepPhase::FlowResolved => "flow-resolved",
            StepPhase::Filled => "filled",
            StepPhase::Accumulated => "accumulated",
            StepPhase::Solved => "solved",
            StepPhase::Stepped => "stepped",
        };
        f.write_str(name)
    }
}

/// Fatal failure of a run. `phase` is the last phase the partition completed
/// before the failure.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("step {step} failed after phase {phase} on partition {partition}: {source}")]
pub struct SimulationError {
    pub step: u64,
    pub phase: StepPhase,
    pub partition: usize,
    #[source]
    pub source: LandscapeError,
}

/// Step and phase a partition is working on. Shared with the launcher so a
/// partition that dies mid-step can still be located.
#[derive(Debug, Default)]
pub struct Progress {
    step: AtomicU64,
    phase: AtomicU8,
}

impl Progress {
    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> StepPhase {
        StepPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    fn begin(&self, step: u64) {
        self.step.store(step, Ordering::Relaxed);
        self.enter(StepPhase::Idle);
    }

    fn enter(&self, phase: StepPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }
}

/// Everything a run needs besides the mesh and the initial surface.
#[derive(Clone)]
pub struct RunOptions {
    pub config: Arc<SimulationConfig>,
    pub forcing: Arc<dyn Forcing>,
    pub solver: Arc<dyn LinearSolver>,
    /// Erodibility by global id; the configured default when absent.
    pub erodibility: Option<Arc<Vec<f64>>>,
    /// Receives one frame per partition per committed step.
    pub frames: Option<Sender<StepFrame>>,
}

impl RunOptions {
    pub fn new(config: Arc<SimulationConfig>) -> Self {
        Self {
            forcing: Arc::new(UniformForcing::from_config(config.forcing())),
            solver: Arc::new(GaussSeidelSolver::from_config(config.solver())),
            config,
            erodibility: None,
            frames: None,
        }
    }

    pub fn with_forcing(mut self, forcing: Arc<dyn Forcing>) -> Self {
        self.forcing = forcing;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn LinearSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_erodibility(mut self, erodibility: Vec<f64>) -> Self {
        self.erodibility = Some(Arc::new(erodibility));
        self
    }

    pub fn with_frames(mut self, frames: Sender<StepFrame>) -> Self {
        self.frames = Some(frames);
        self
    }
}

/// Final state of one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionReport {
    pub rank: usize,
    pub time: f64,
    pub steps: u64,
    /// Owned vertices only, aligned with `global_ids`.
    pub global_ids: Vec<u64>,
    pub elevation: Vec<f64>,
    pub drainage_area: Vec<f64>,
    pub discharge: Vec<f64>,
    /// Erosion/deposition of the last step, uplift excluded.
    pub erosion_deposition: Vec<f64>,
    pub metrics: Vec<StepMetrics>,
    pub totals: SimulationMetrics,
}

/// Run the configured time span over `meshes`, one thread per partition.
/// `elevation` is indexed by global vertex id.
pub fn run_simulation(
    meshes: &[PartitionMesh],
    elevation: &[f64],
    options: &RunOptions,
) -> Result<Vec<PartitionReport>, SimulationError> {
    let progress: Vec<Arc<Progress>> = meshes.iter().map(|_| Arc::default()).collect();
    let outcomes = launch(meshes.len(), |comm| {
        let rank = comm.rank();
        let progress = Arc::clone(&progress[rank]);
        PartitionWorker::tracked(&meshes[rank], comm, options, elevation, progress)?.run()
    })
    .map_err(|source| {
        let partition = match &source {
            LandscapeError::PeerAbort { partition, .. } => *partition,
            _ => 0,
        };
        let (step, phase) = progress
            .get(partition)
            .map(|p| (p.step(), p.phase()))
            .unwrap_or_default();
        SimulationError {
            step,
            phase,
            partition,
            source,
        }
    })?;
    outcomes.into_iter().collect()
}

/// Per-partition state machine.
pub struct PartitionWorker<'a> {
    mesh: &'a PartitionMesh,
    comm: Communicator,
    config: Arc<SimulationConfig>,
    forcing: Arc<dyn Forcing>,
    solver: Arc<dyn LinearSolver>,
    frames: Option<Sender<StepFrame>>,
    erosion: ErosionModel,
    marine: MarineRouter,
    progress: Arc<Progress>,
    step: u64,
    time: f64,
    elevation: Vec<f64>,
    erodibility: Vec<f64>,
    area: Vec<f64>,
    discharge: Vec<f64>,
    delta: Vec<f64>,
    metrics: Vec<StepMetrics>,
    totals: SimulationMetrics,
}

/// Result of a step that every partition voted to commit.
struct Tentative {
    elevation: Vec<f64>,
    area: Vec<f64>,
    discharge: Vec<f64>,
    delta: Vec<f64>,
    metrics: StepMetrics,
}

impl<'a> PartitionWorker<'a> {
    pub fn new(
        mesh: &'a PartitionMesh,
        comm: Communicator,
        options: &RunOptions,
        elevation: &[f64],
    ) -> Result<Self, SimulationError> {
        Self::tracked(mesh, comm, options, elevation, Arc::default())
    }

    /// As [`PartitionWorker::new`], publishing every phase change to
    /// `progress`.
    pub fn tracked(
        mesh: &'a PartitionMesh,
        comm: Communicator,
        options: &RunOptions,
        elevation: &[f64],
        progress: Arc<Progress>,
    ) -> Result<Self, SimulationError> {
        progress.begin(1);
        let config = Arc::clone(&options.config);
        let owned = mesh.owned_count();
        let default_ke = config.stream_power().erodibility();
        let mut worker = Self {
            mesh,
            comm,
            erosion: ErosionModel::new(&config),
            marine: MarineRouter::new(config.marine()),
            forcing: Arc::clone(&options.forcing),
            solver: Arc::clone(&options.solver),
            frames: options.frames.clone(),
            progress,
            step: 0,
            time: config.time().start(),
            elevation: vec![0.0; mesh.len()],
            erodibility: vec![default_ke; owned],
            area: vec![0.0; mesh.len()],
            discharge: vec![0.0; mesh.len()],
            delta: vec![0.0; owned],
            metrics: Vec::new(),
            totals: SimulationMetrics::default(),
            config,
        };

        let status = worker.load_initial(elevation, options.erodibility.as_deref());
        let mut halo = Halo::new(worker.mesh, &mut worker.comm);
        let refreshed = halo
            .comm()
            .agree(status)
            .and_then(|()| halo.refresh(&mut [&mut worker.elevation]));
        if let Err(source) = refreshed {
            return Err(worker.fail(source));
        }
        Ok(worker)
    }

    fn load_initial(
        &mut self,
        elevation: &[f64],
        erodibility: Option<&Vec<f64>>,
    ) -> Result<(), LandscapeError> {
        for v in 0..self.mesh.owned_count() {
            let id = self.mesh.global_id(v) as usize;
            match elevation.get(id) {
                Some(&h) if h.is_finite() => self.elevation[v] = h,
                _ => return Err(self.mesh.integrity_error(v, "missing or non-finite initial elevation")),
            }
            if let Some(field) = erodibility {
                match field.get(id) {
                    Some(&ke) if ke.is_finite() && ke >= 0.0 => self.erodibility[v] = ke,
                    _ => return Err(self.mesh.integrity_error(v, "missing or invalid erodibility")),
                }
            }
        }
        Ok(())
    }

    pub fn phase(&self) -> StepPhase {
        self.progress.phase()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Owned plus ghost elevation.
    pub fn elevation(&self) -> &[f64] {
        &self.elevation
    }

    fn finished(&self) -> bool {
        let end = self.config.time().end();
        end - self.time <= 1e-9 * end.abs().max(1.0)
    }

    fn fail(&mut self, source: LandscapeError) -> SimulationError {
        self.comm.abort(&source.to_string());
        SimulationError {
            step: self.step + 1,
            phase: self.progress.phase(),
            partition: match &source {
                LandscapeError::MeshIntegrity { partition, .. }
                | LandscapeError::FillDivergence { partition, .. }
                | LandscapeError::PeerAbort { partition, .. } => *partition,
                LandscapeError::StepFailure { .. } => self.mesh.rank(),
            },
            source,
        }
    }

    /// Step until the configured end time.
    pub fn run(mut self) -> Result<PartitionReport, SimulationError> {
        while !self.finished() {
            self.advance()?;
        }
        tracing::info!(
            target: "landscape::step",
            rank = self.mesh.rank(),
            steps = self.step,
            time = self.time,
            eroded = self.totals.eroded,
            deposited = self.totals.deposited,
            "simulation.completed"
        );
        Ok(self.into_report())
    }

    /// Advance one committed step, halving the step on recoverable failures.
    pub fn advance(&mut self) -> Result<StepMetrics, SimulationError> {
        let time = self.config.time();
        let mut dt = time.dt().min(time.end() - self.time);
        let max_retries = time.max_step_retries();
        let mut retries = 0;
        loop {
            match self.try_step(dt) {
                Ok(mut tentative) => {
                    tentative.metrics.retries = retries;
                    return match self.commit(tentative) {
                        Ok(metrics) => Ok(metrics),
                        Err(err) => Err(self.fail(err)),
                    };
                }
                Err(err) if err.is_recoverable() && retries < max_retries => {
                    retries += 1;
                    // Halve the smallest step that already failed.
                    if let LandscapeError::StepFailure { dt: failed, .. } = err {
                        dt = dt.min(failed);
                    }
                    dt *= 0.5;
                    tracing::warn!(
                        target: "landscape::step",
                        rank = self.mesh.rank(),
                        step = self.step + 1,
                        retry = retries,
                        dt,
                        error = %err,
                        "step.retry"
                    );
                    self.progress.enter(StepPhase::Idle);
                }
                Err(err) => {
                    let err = match err {
                        LandscapeError::StepFailure {
                            step, dt, residual, ..
                        } => LandscapeError::StepFailure {
                            step,
                            dt,
                            residual,
                            retries,
                        },
                        other => other,
                    };
                    return Err(self.fail(err));
                }
            }
        }
    }

    fn try_step(&mut self, dt: f64) -> Result<Tentative, LandscapeError> {
        let mesh = self.mesh;
        let owned = mesh.owned_count();
        let step = self.step + 1;
        let config = Arc::clone(&self.config);
        self.progress.begin(step);

        let forcing = ForcingSample::sample(
            self.forcing.as_ref(),
            &mesh.global_ids()[..owned],
            |v| mesh.coord(v),
            self.time,
        );
        let sea_level = forcing.sea_level;
        self.progress.enter(StepPhase::ForcingApplied);

        let mut halo = Halo::new(mesh, &mut self.comm);
        let elevation = &self.elevation;

        let initial = FlowGraph::resolve(mesh, elevation, sea_level, config.flow());
        let pending = agree(&mut halo, initial)?.pending().len();
        self.progress.enter(StepPhase::FlowResolved);

        let fill = fill_depressions(&mut halo, elevation, sea_level, config.fill(), pending)?;
        let graph = agree(
            &mut halo,
            FlowGraph::resolve(mesh, &fill.routing, sea_level, config.flow()),
        )?;
        self.progress.enter(StepPhase::Filled);

        let drainage = accumulate_drainage(
            &mut halo,
            &graph,
            &fill.routing,
            &forcing.precipitation,
            config.accumulation(),
        )?;
        self.progress.enter(StepPhase::Accumulated);

        let inputs = ErosionInputs {
            elevation,
            filled: &fill.filled,
            routing: &fill.routing,
            discharge: &drainage.discharge,
            uplift: &forcing.uplift,
            erodibility: &self.erodibility,
            sea_level,
            graph: &graph,
        };
        let solved = self
            .erosion
            .solve(&mut halo, &inputs, dt, step, self.solver.as_ref())?;
        let sediment = self.erosion.route_sediment(&mut halo, &inputs, &solved)?;
        let marine = self.marine.distribute(
            &mut halo,
            elevation,
            sea_level,
            &sediment.marine_delivery,
            solved.dt,
            step,
            self.solver.as_ref(),
        )?;

        let mut tentative = vec![0.0; mesh.len()];
        let mut delta = vec![0.0; owned];
        for v in 0..owned {
            let area = mesh.cell_area(v);
            tentative[v] =
                solved.elevation[v] + sediment.lake_deposit[v] / area + marine.thickness[v];
            let uplifted = if mesh.boundary_flag(v) {
                0.0
            } else {
                solved.dt * forcing.uplift[v]
            };
            delta[v] = tentative[v] - elevation[v] - uplifted;
        }
        let status = match (0..owned).find(|&v| !tentative[v].is_finite()) {
            Some(_) => Err(LandscapeError::StepFailure {
                step,
                dt: solved.dt,
                residual: f64::INFINITY,
                retries: 0,
            }),
            None => Ok(()),
        };
        halo.comm().agree(status)?;
        self.progress.enter(StepPhase::Solved);

        let lake_local: f64 = sediment.lake_deposit.iter().sum();
        let eroded_local: f64 = solved.eroded.iter().sum();
        let totals = halo.comm().all_reduce_many(
            &[eroded_local, lake_local, sediment.exited, solved.diffused_out],
            Reduce::Sum,
        )?;
        let sediment_rounds = halo
            .comm()
            .all_reduce(f64::from(sediment.rounds), Reduce::Max)? as u32;

        let metrics = StepMetrics {
            step,
            time: self.time + solved.dt,
            dt: solved.dt,
            retries: 0,
            halved: solved.halved,
            pending_vertices: fill.pending_vertices,
            fill_rounds: fill.rounds,
            depressed_vertices: fill.depressed_vertices,
            depressions: fill.depressions.len() as u64,
            lake_volume: fill.lake_volume,
            accumulation_rounds: drainage.rounds,
            sediment_rounds,
            solver_iterations: solved.iterations,
            solver_residual: solved.residual,
            eroded: totals[0],
            lake_deposited: totals[1],
            marine_delivered: marine.delivered,
            marine_deposited: marine.deposited,
            exited: totals[2],
            diffused_out: totals[3],
            mass_warnings: u32::from(marine.violation.is_some()),
        };

        Ok(Tentative {
            elevation: tentative,
            area: drainage.area,
            discharge: drainage.discharge,
            delta,
            metrics,
        })
    }

    /// Swap in the voted buffer, refresh ghosts and publish the frame.
    fn commit(&mut self, tentative: Tentative) -> Result<StepMetrics, LandscapeError> {
        let Tentative {
            mut elevation,
            area,
            discharge,
            delta,
            metrics,
        } = tentative;
        let mut halo = Halo::new(self.mesh, &mut self.comm);
        halo.refresh(&mut [&mut elevation])?;

        self.elevation = elevation;
        self.area = area;
        self.discharge = discharge;
        self.delta = delta;
        self.step = metrics.step;
        self.time = metrics.time;
        self.progress.enter(StepPhase::Stepped);

        let owned = self.mesh.owned_count();
        let ids = &self.mesh.global_ids()[..owned];
        tracing::info!(
            target: "landscape::step",
            rank = self.mesh.rank(),
            step = self.step,
            time = self.time,
            dt = metrics.dt,
            retries = metrics.retries,
            eroded = metrics.eroded,
            checksum = field_checksum(ids.iter().copied().zip(&self.elevation[..owned])),
            "step.committed"
        );

        self.emit_frame(&metrics);
        self.totals.record(&metrics);
        self.metrics.push(metrics.clone());
        self.progress.begin(self.step + 1);
        Ok(metrics)
    }

    fn emit_frame(&mut self, metrics: &StepMetrics) {
        let Some(frames) = &self.frames else {
            return;
        };
        let owned = self.mesh.owned_count();
        let frame = StepFrame {
            header: FrameHeader::new(metrics.step, metrics.time, metrics.dt, self.mesh.rank(), owned),
            global_ids: self.mesh.global_ids()[..owned].to_vec(),
            elevation: self.elevation[..owned].to_vec(),
            drainage_area: self.area[..owned].to_vec(),
            discharge: self.discharge[..owned].to_vec(),
            erosion_deposition: self.delta.clone(),
        }
        .finalize();
        if frames.send(frame).is_err() {
            tracing::warn!(
                target: "landscape::step",
                rank = self.mesh.rank(),
                "step.frame_receiver_closed"
            );
            self.frames = None;
        }
    }

    fn into_report(self) -> PartitionReport {
        let owned = self.mesh.owned_count();
        PartitionReport {
            rank: self.mesh.rank(),
            time: self.time,
            steps: self.step,
            global_ids: self.mesh.global_ids()[..owned].to_vec(),
            elevation: self.elevation[..owned].to_vec(),
            drainage_area: self.area[..owned].to_vec(),
            discharge: self.discharge[..owned].to_vec(),
            erosion_deposition: self.delta,
            metrics: self.metrics,
            totals: self.totals,
        }
    }
}

/// Share a local result with every partition; all of them fail together.
fn agree<T>(halo: &mut Halo<'_>, local: Result<T, LandscapeError>) -> Result<T, LandscapeError> {
    match local {
        Ok(value) => {
            halo.comm().agree(Ok(()))?;
            Ok(value)
        }
        Err(err) => {
            halo.comm().agree(Err(err.clone()))?;
            Err(err)
        }
    }
}
