//! External forcing read by the step orchestrator.
//!
//! Uplift enters the erosion solve as an additive source, precipitation
//! scales discharge, and sea level decides which vertices are submerged.
//! Values are sampled once per step and stay fixed within it.

use crate::config::ForcingConfig;

pub trait Forcing: Send + Sync {
    /// Vertical displacement rate in m/yr.
    fn uplift_rate(&self, global_id: u64, coord: [f64; 3], time: f64) -> f64;

    /// Effective precipitation rate in m/yr.
    fn precipitation_rate(&self, global_id: u64, coord: [f64; 3], time: f64) -> f64;

    fn sea_level(&self, time: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformForcing {
    pub uplift: f64,
    pub precipitation: f64,
    pub sea_level: f64,
}

impl UniformForcing {
    pub fn from_config(config: &ForcingConfig) -> Self {
        Self {
            uplift: config.uplift(),
            precipitation: config.precipitation(),
            sea_level: config.sea_level(),
        }
    }
}

impl Default for UniformForcing {
    fn default() -> Self {
        Self::from_config(&ForcingConfig::default())
    }
}

impl Forcing for UniformForcing {
    fn uplift_rate(&self, _global_id: u64, _coord: [f64; 3], _time: f64) -> f64 {
        self.uplift
    }

    fn precipitation_rate(&self, _global_id: u64, _coord: [f64; 3], _time: f64) -> f64 {
        self.precipitation
    }

    fn sea_level(&self, _time: f64) -> f64 {
        self.sea_level
    }
}

/// Forcing sampled for the owned vertices of one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForcingSample {
    pub time: f64,
    pub sea_level: f64,
    pub uplift: Vec<f64>,
    pub precipitation: Vec<f64>,
}

impl ForcingSample {
    pub fn sample(
        forcing: &dyn Forcing,
        global_ids: &[u64],
        coords: impl Fn(usize) -> [f64; 3],
        time: f64,
    ) -> Self {
        let mut uplift = Vec::with_capacity(global_ids.len());
        let mut precipitation = Vec::with_capacity(global_ids.len());
        for (v, &id) in global_ids.iter().enumerate() {
            let coord = coords(v);
            uplift.push(forcing.uplift_rate(id, coord, time));
            precipitation.push(forcing.precipitation_rate(id, coord, time).max(0.0));
        }
        Self {
            time,
            sea_level: forcing.sea_level(time),
            uplift,
            precipitation,
        }
    }
}
