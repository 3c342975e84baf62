use std::fmt;

use thiserror::Error;

/// Round-based component that can fail to reach its fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeComponent {
    PriorityFlood,
    Accumulation,
}

impl fmt::Display for ExchangeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeComponent::PriorityFlood => write!(f, "priority-flood"),
            ExchangeComponent::Accumulation => write!(f, "drainage accumulation"),
        }
    }
}

/// Failures raised by the drainage and erosion core.
///
/// `MeshIntegrity` and `FillDivergence` are fatal and shared with every
/// partition through [`crate::comm::Communicator::agree`]. `StepFailure` is
/// recoverable by the orchestrator up to its retry budget.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LandscapeError {
    #[error("mesh integrity violated on partition {partition} at vertex {vertex}: {reason}")]
    MeshIntegrity {
        partition: usize,
        vertex: u64,
        reason: String,
    },
    #[error("{component} exchange on partition {partition} did not converge after {rounds} rounds")]
    FillDivergence {
        partition: usize,
        component: ExchangeComponent,
        rounds: usize,
    },
    #[error("implicit solve failed at dt={dt} (residual {residual:e}) after {retries} retries")]
    StepFailure {
        step: u64,
        dt: f64,
        residual: f64,
        retries: u32,
    },
    #[error("partition {partition} aborted the run: {reason}")]
    PeerAbort { partition: usize, reason: String },
}

impl LandscapeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LandscapeError::StepFailure { .. })
    }
}

/// Non-fatal accounting mismatch reported by the marine router.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassConservationViolation {
    pub step: u64,
    pub delivered: f64,
    pub deposited: f64,
    pub relative_error: f64,
}

impl fmt::Display for MassConservationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {}: marine deposition {:.6e} vs delivered {:.6e} (relative error {:.3e})",
            self.step, self.deposited, self.delivered, self.relative_error
        )
    }
}
