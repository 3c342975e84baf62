use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_SIMULATION_CONFIG: &str = include_str!("data/simulation_config.json");
pub const SIMULATION_CONFIG_ENV: &str = "LANDSCAPE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    time: TimeConfig,
    flow: FlowConfig,
    fill: FillConfig,
    accumulation: AccumulationConfig,
    stream_power: StreamPowerConfig,
    hillslope: HillslopeConfig,
    marine: MarineConfig,
    solver: SolverConfig,
    forcing: ForcingConfig,
}

impl SimulationConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_SIMULATION_CONFIG)
                .expect("builtin simulation config should parse"),
        )
    }

    /// Parse and validate. Missing sections and fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        SimulationConfig::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let time = &self.time;
        positive("time.dt", time.dt)?;
        if !(time.end >= time.start) {
            return Err(ConfigError::invalid("time.end", "must not precede time.start"));
        }
        positive("flow.slope_exponent", self.flow.slope_exponent)?;
        positive("fill.epsilon", self.fill.epsilon)?;
        nonzero("fill.max_exchange_rounds", self.fill.max_exchange_rounds)?;
        nonzero("accumulation.max_rounds", self.accumulation.max_rounds)?;
        non_negative("stream_power.erodibility", self.stream_power.erodibility)?;
        non_negative("stream_power.m", self.stream_power.m)?;
        positive("stream_power.n", self.stream_power.n)?;
        positive("stream_power.min_slope", self.stream_power.min_slope)?;
        non_negative("hillslope.land", self.hillslope.land)?;
        non_negative("hillslope.stream", self.hillslope.stream)?;
        non_negative("hillslope.ocean", self.hillslope.ocean)?;
        non_negative(
            "hillslope.stream_discharge_threshold",
            self.hillslope.stream_discharge_threshold,
        )?;
        non_negative("marine.ocean_k", self.marine.ocean_k)?;
        positive("marine.mass_tolerance", self.marine.mass_tolerance)?;
        positive("solver.tolerance", self.solver.tolerance)?;
        nonzero("solver.max_iterations", self.solver.max_iterations)?;
        nonzero("solver.local_sweeps", self.solver.local_sweeps)?;
        non_negative("forcing.precipitation", self.forcing.precipitation)?;
        if !self.forcing.uplift.is_finite() || !self.forcing.sea_level.is_finite() {
            return Err(ConfigError::invalid("forcing", "values must be finite"));
        }
        Ok(())
    }

    pub fn time(&self) -> &TimeConfig {
        &self.time
    }

    pub fn flow(&self) -> &FlowConfig {
        &self.flow
    }

    pub fn fill(&self) -> &FillConfig {
        &self.fill
    }

    pub fn accumulation(&self) -> &AccumulationConfig {
        &self.accumulation
    }

    pub fn stream_power(&self) -> &StreamPowerConfig {
        &self.stream_power
    }

    pub fn hillslope(&self) -> &HillslopeConfig {
        &self.hillslope
    }

    pub fn marine(&self) -> &MarineConfig {
        &self.marine
    }

    pub fn solver(&self) -> &SolverConfig {
        &self.solver
    }

    pub fn forcing(&self) -> &ForcingConfig {
        &self.forcing
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse simulation config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read simulation config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid simulation config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("expected a positive number, got {value}")))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("expected a non-negative number, got {value}")))
    }
}

fn nonzero<T: Into<u64> + Copy>(field: &'static str, value: T) -> Result<(), ConfigError> {
    if value.into() > 0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be at least 1"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    start: f64,
    end: f64,
    dt: f64,
    max_step_retries: u32,
}

impl TimeConfig {
    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn max_step_retries(&self) -> u32 {
        self.max_step_retries
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 100_000.0,
            dt: 1_000.0,
            max_step_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    /// Steepest descent to exactly one receiver.
    #[default]
    Single,
    /// Every descending neighbor, weighted by slope raised to the exponent.
    Multiple,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    mode: FlowMode,
    slope_exponent: f64,
}

impl FlowConfig {
    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn slope_exponent(&self) -> f64 {
        self.slope_exponent
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            mode: FlowMode::Single,
            slope_exponent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    epsilon: f64,
    max_exchange_rounds: u32,
}

impl FillConfig {
    /// Minimum drop imposed along flats on the routing surface, in metres.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn max_exchange_rounds(&self) -> u32 {
        self.max_exchange_rounds
    }
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            max_exchange_rounds: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccumulationConfig {
    max_rounds: u32,
}

impl AccumulationConfig {
    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self { max_rounds: 512 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamPowerConfig {
    erodibility: f64,
    m: f64,
    n: f64,
    min_slope: f64,
}

impl StreamPowerConfig {
    /// Default erodibility used when no per-vertex field is supplied.
    pub fn erodibility(&self) -> f64 {
        self.erodibility
    }

    pub fn m(&self) -> f64 {
        self.m
    }

    pub fn n(&self) -> f64 {
        self.n
    }

    pub fn min_slope(&self) -> f64 {
        self.min_slope
    }
}

impl Default for StreamPowerConfig {
    fn default() -> Self {
        Self {
            erodibility: 2e-6,
            m: 0.5,
            n: 1.0,
            min_slope: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HillslopeConfig {
    land: f64,
    stream: f64,
    ocean: f64,
    stream_discharge_threshold: f64,
}

impl HillslopeConfig {
    pub fn land(&self) -> f64 {
        self.land
    }

    pub fn stream(&self) -> f64 {
        self.stream
    }

    pub fn ocean(&self) -> f64 {
        self.ocean
    }

    pub fn stream_discharge_threshold(&self) -> f64 {
        self.stream_discharge_threshold
    }
}

impl Default for HillslopeConfig {
    fn default() -> Self {
        Self {
            land: 0.05,
            stream: 0.1,
            ocean: 0.5,
            stream_discharge_threshold: 1e6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarineConfig {
    ocean_k: f64,
    mass_tolerance: f64,
}

impl MarineConfig {
    pub fn ocean_k(&self) -> f64 {
        self.ocean_k
    }

    pub fn mass_tolerance(&self) -> f64 {
        self.mass_tolerance
    }
}

impl Default for MarineConfig {
    fn default() -> Self {
        Self {
            ocean_k: 0.5,
            mass_tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    tolerance: f64,
    max_iterations: u32,
    local_sweeps: u32,
}

impl SolverConfig {
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn local_sweeps(&self) -> u32 {
        self.local_sweeps
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 2000,
            local_sweeps: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForcingConfig {
    uplift: f64,
    precipitation: f64,
    sea_level: f64,
}

impl ForcingConfig {
    pub fn uplift(&self) -> f64 {
        self.uplift
    }

    pub fn precipitation(&self) -> f64 {
        self.precipitation
    }

    pub fn sea_level(&self) -> f64 {
        self.sea_level
    }
}

impl Default for ForcingConfig {
    fn default() -> Self {
        Self {
            uplift: 0.0,
            precipitation: 1.0,
            sea_level: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationConfigMetadata {
    path: Option<PathBuf>,
}

impl SimulationConfigMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// File the configuration was read from, `None` for the builtin.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

pub fn load_simulation_config_from_env() -> (Arc<SimulationConfig>, SimulationConfigMetadata) {
    let override_path = env::var(SIMULATION_CONFIG_ENV).ok().map(PathBuf::from);
    let default_path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/data/simulation_config.json");

    let candidates: Vec<PathBuf> = match override_path {
        Some(ref path) => vec![path.clone()],
        None => vec![default_path],
    };

    for path in candidates {
        match SimulationConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    target: "landscape::config",
                    path = %path.display(),
                    "simulation_config.loaded=file"
                );
                return (
                    Arc::new(config),
                    SimulationConfigMetadata::new(Some(path)),
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "landscape::config",
                    path = %path.display(),
                    error = %err,
                    "simulation_config.load_failed"
                );
            }
        }
    }

    let config = SimulationConfig::builtin();
    tracing::info!(
        target: "landscape::config",
        "simulation_config.loaded=builtin"
    );
    (config, SimulationConfigMetadata::new(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_parses_and_validates() {
        let config = SimulationConfig::builtin();
        config.validate().expect("builtin config valid");
        assert_eq!(config.flow().mode(), FlowMode::Single);
        assert_eq!(config.fill().epsilon(), 1e-6);
        assert_eq!(config.time().max_step_retries(), 3);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = SimulationConfig::from_json_str(
            r#"{ "flow": { "mode": "multiple", "slope_exponent": 1.5 }, "time": { "dt": 10.0 } }"#,
        )
        .expect("config");
        assert_eq!(config.flow().mode(), FlowMode::Multiple);
        assert_eq!(config.flow().slope_exponent(), 1.5);
        assert_eq!(config.time().dt(), 10.0);
        assert_eq!(config.time().end(), TimeConfig::default().end());
        assert_eq!(config.solver().local_sweeps(), 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SimulationConfig::from_json_str(r#"{ "fill": { "epsilon": 0.0 } }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "fill.epsilon",
                ..
            }
        ));
        let err = SimulationConfig::from_json_str(r#"{ "time": { "start": 5.0, "end": 1.0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "time.end", .. }));
        assert!(matches!(
            SimulationConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SimulationConfig::from_file(Path::new("/nonexistent/landscape.json")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }
}
