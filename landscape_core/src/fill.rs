//! Parallel priority-flood over an unstructured mesh.
//!
//! Two surfaces come out of every fill:
//!
//! * the filled surface `F`, the plain spill surface of every depression;
//! * the routing surface `R`, where flats and filled depressions are given a
//!   minimum drop of `epsilon` towards their outlet, so every non-sink vertex
//!   ends up with a strictly lower neighbor.
//!
//! Each partition floods its owned vertices from its own sinks and from the
//! ghost values published by neighboring partitions. Ghost values are then
//! refreshed and the flood repeats until no partition sees a ghost change.
//! The converged surfaces are the unique fixed point of
//! `S(v) = max(h(v), min_u S(u) + eps)`, so they do not depend on how the
//! mesh is split or on queue order.
//!
//! Flooded vertices are then grouped into depressions: connected vertices
//! sharing one spill level form a lake named after its lowest global id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use crate::comm::{Halo, Reduce};
use crate::config::FillConfig;
use crate::error::{ExchangeComponent, LandscapeError};
use crate::flow::is_sink;
use crate::mesh::PartitionMesh;

/// One lake of the filled surface, reduced over every partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Depression {
    /// Lowest global id among the flooded vertices.
    pub id: u64,
    pub spill_elevation: f64,
    pub volume: f64,
    pub vertices: u64,
    /// Unflooded vertex at spill level the lake drains through (lowest
    /// global id when several qualify) and the partition owning it.
    pub outlet: u64,
    pub outlet_partition: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillOutcome {
    pub filled: Vec<f64>,
    pub routing: Vec<f64>,
    /// Exchange rounds until convergence; zero when filling was skipped.
    pub rounds: u32,
    pub pending_vertices: u64,
    /// Vertices with `F > h` on the whole mesh.
    pub depressed_vertices: u64,
    pub lake_volume: f64,
    /// Depression id per owned and ghost vertex.
    pub depression: Vec<Option<u64>>,
    /// Ascending id, identical on every partition.
    pub depressions: Vec<Depression>,
}

impl FillOutcome {
    /// Routing nudge above the filled surface at `v`.
    pub fn nudge(&self, v: usize) -> f64 {
        self.routing[v] - self.filled[v]
    }

    /// Depth of the depression at `v` on the filled surface.
    pub fn lake_depth(&self, elevation: &[f64], v: usize) -> f64 {
        (self.filled[v] - elevation[v]).max(0.0)
    }
}

/// Fill `elevation` (owned plus refreshed ghosts). `local_pending` is the
/// number of owned vertices the flow resolver could not drain.
pub fn fill_depressions(
    halo: &mut Halo<'_>,
    elevation: &[f64],
    sea_level: f64,
    config: &FillConfig,
    local_pending: usize,
) -> Result<FillOutcome, LandscapeError> {
    let pending = halo
        .comm()
        .all_reduce(local_pending as f64, Reduce::Sum)? as u64;
    if pending == 0 {
        tracing::debug!(target: "landscape::fill", "fill.skipped");
        return Ok(FillOutcome {
            filled: elevation.to_vec(),
            routing: elevation.to_vec(),
            depression: vec![None; elevation.len()],
            ..FillOutcome::default()
        });
    }

    let mesh = halo.mesh();
    let rank = mesh.rank();
    let owned = mesh.owned_count();
    let sinks: Vec<bool> = (0..owned)
        .map(|v| is_sink(mesh, elevation[v], sea_level, v))
        .collect();

    let mut filled = vec![f64::INFINITY; mesh.len()];
    let mut routing = vec![f64::INFINITY; mesh.len()];
    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > config.max_exchange_rounds() {
            return Err(LandscapeError::FillDivergence {
                partition: rank,
                component: ExchangeComponent::PriorityFlood,
                rounds: rounds as usize - 1,
            });
        }
        flood(mesh, elevation, &sinks, &mut filled, 0.0);
        flood(mesh, elevation, &sinks, &mut routing, config.epsilon());

        let before: Vec<(u64, u64)> = (owned..mesh.len())
            .map(|v| (filled[v].to_bits(), routing[v].to_bits()))
            .collect();
        halo.refresh(&mut [&mut filled, &mut routing])?;
        let changed = before
            .iter()
            .zip(owned..)
            .any(|(&(f, r), v)| f != filled[v].to_bits() || r != routing[v].to_bits());
        if !halo.comm().any(changed)? {
            break;
        }
    }

    let unreached = (0..owned).find(|&v| !routing[v].is_finite() || !filled[v].is_finite());
    let status = match unreached {
        Some(v) => Err(mesh.integrity_error(v, "vertex not reached by the priority flood")),
        None => Ok(()),
    };
    halo.comm().agree(status)?;

    let mut depressed = 0.0;
    let mut volume = 0.0;
    for v in 0..owned {
        let depth = filled[v] - elevation[v];
        if depth > 0.0 {
            depressed += 1.0;
            volume += depth * mesh.cell_area(v);
        }
    }
    let totals = halo.comm().all_reduce_many(&[depressed, volume], Reduce::Sum)?;
    let (depression, depressions) =
        label_depressions(halo, elevation, &filled, config.max_exchange_rounds())?;

    tracing::debug!(
        target: "landscape::fill",
        rank,
        rounds,
        pending,
        depressed = totals[0],
        lake_volume = totals[1],
        depressions = depressions.len(),
        "fill.converged"
    );

    Ok(FillOutcome {
        filled,
        routing,
        rounds,
        pending_vertices: pending,
        depressed_vertices: totals[0] as u64,
        lake_volume: totals[1],
        depression,
        depressions,
    })
}

// id, spill, volume, vertices, outlet id, outlet partition
const RECORD_WIDTH: usize = 6;

/// Label every flooded vertex with the lowest global id of its lake and
/// gather the per-lake records from every partition.
fn label_depressions(
    halo: &mut Halo<'_>,
    elevation: &[f64],
    filled: &[f64],
    max_rounds: u32,
) -> Result<(Vec<Option<u64>>, Vec<Depression>), LandscapeError> {
    let mesh = halo.mesh();
    let rank = mesh.rank();
    let owned = mesh.owned_count();
    let flooded = |v: usize| filled[v] > elevation[v];

    let mut label: Vec<f64> = (0..mesh.len())
        .map(|v| {
            if flooded(v) {
                mesh.global_id(v) as f64
            } else {
                f64::INFINITY
            }
        })
        .collect();
    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > max_rounds {
            return Err(LandscapeError::FillDivergence {
                partition: rank,
                component: ExchangeComponent::PriorityFlood,
                rounds: rounds as usize - 1,
            });
        }
        spread_labels(mesh, filled, &flooded, &mut label);
        let before: Vec<u64> = label[owned..].iter().map(|l| l.to_bits()).collect();
        halo.refresh(&mut [&mut label])?;
        let changed = label[owned..]
            .iter()
            .zip(&before)
            .any(|(l, &b)| l.to_bits() != b);
        if !halo.comm().any(changed)? {
            break;
        }
    }

    let mut local: BTreeMap<u64, [f64; RECORD_WIDTH]> = BTreeMap::new();
    for v in (0..owned).filter(|&v| flooded(v)) {
        let id = label[v] as u64;
        let record = local
            .entry(id)
            .or_insert([label[v], filled[v], 0.0, 0.0, f64::INFINITY, 0.0]);
        record[2] += (filled[v] - elevation[v]) * mesh.cell_area(v);
        record[3] += 1.0;
        for n in mesh.neighbors(v) {
            let u = n.index as usize;
            let outlet = mesh.global_id(u) as f64;
            if !flooded(u) && filled[u] <= filled[v] && outlet < record[4] {
                record[4] = outlet;
                record[5] = mesh.ghost_owner(u).unwrap_or(rank) as f64;
            }
        }
    }

    let gathered = halo
        .comm()
        .all_gather(local.values().flatten().copied().collect())?;
    let mut merged: BTreeMap<u64, Depression> = BTreeMap::new();
    for record in gathered.iter().flat_map(|part| part.chunks_exact(RECORD_WIDTH)) {
        let id = record[0] as u64;
        let lake = merged.entry(id).or_insert(Depression {
            id,
            spill_elevation: record[1],
            volume: 0.0,
            vertices: 0,
            outlet: u64::MAX,
            outlet_partition: 0,
        });
        lake.volume += record[2];
        lake.vertices += record[3] as u64;
        if record[4].is_finite() && (record[4] as u64) < lake.outlet {
            lake.outlet = record[4] as u64;
            lake.outlet_partition = record[5] as usize;
        }
    }
    if let Some(lake) = merged.values().find(|lake| lake.outlet == u64::MAX) {
        return Err(LandscapeError::MeshIntegrity {
            partition: rank,
            vertex: lake.id,
            reason: "depression without a spill outlet".to_string(),
        });
    }

    let depression = label
        .iter()
        .map(|&l| l.is_finite().then_some(l as u64))
        .collect();
    Ok((depression, merged.into_values().collect()))
}

/// Lower each owned flooded label to the smallest label among flooded
/// neighbors at the same spill level, until nothing changes locally.
fn spread_labels(
    mesh: &PartitionMesh,
    filled: &[f64],
    flooded: &impl Fn(usize) -> bool,
    label: &mut [f64],
) {
    let owned = mesh.owned_count();
    let mut changed = true;
    while changed {
        changed = false;
        for v in (0..owned).filter(|&v| flooded(v)) {
            for n in mesh.neighbors(v) {
                let u = n.index as usize;
                if label[u] < label[v] && flooded(u) && filled[u] == filled[v] {
                    label[v] = label[u];
                    changed = true;
                }
            }
        }
    }
}

/// Local priority flood. Owned entries of `surface` are recomputed from the
/// owned sinks and from the ghost entries, which are left untouched.
fn flood(mesh: &PartitionMesh, elevation: &[f64], sinks: &[bool], surface: &mut [f64], eps: f64) {
    let owned = mesh.owned_count();
    let mut done = vec![false; mesh.len()];
    let mut heap = BinaryHeap::new();

    for v in 0..owned {
        if sinks[v] {
            surface[v] = elevation[v];
            heap.push(FloodEntry::new(mesh, elevation[v], v));
        } else {
            surface[v] = f64::INFINITY;
        }
    }
    for v in owned..mesh.len() {
        if surface[v].is_finite() {
            heap.push(FloodEntry::new(mesh, surface[v], v));
        }
    }

    while let Some(FloodEntry { key, index, .. }) = heap.pop() {
        if done[index] {
            continue;
        }
        done[index] = true;
        for n in mesh.neighbors(index) {
            let u = n.index as usize;
            if u >= owned || done[u] {
                continue;
            }
            let candidate = elevation[u].max(key + eps);
            if candidate < surface[u] {
                surface[u] = candidate;
                heap.push(FloodEntry::new(mesh, candidate, u));
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct FloodEntry {
    key: f64,
    global_id: u64,
    index: usize,
}

impl FloodEntry {
    fn new(mesh: &PartitionMesh, key: f64, index: usize) -> Self {
        Self {
            key,
            global_id: mesh.global_id(index),
            index,
        }
    }
}

impl PartialEq for FloodEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.global_id == other.global_id
    }
}

impl Eq for FloodEntry {}

impl PartialOrd for FloodEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodEntry {
    // Reversed so `BinaryHeap` pops the lowest key, then the lowest global id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .partial_cmp(&self.key)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.global_id.cmp(&self.global_id))
    }
}
