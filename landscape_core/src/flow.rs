//! Downslope receivers for every owned vertex.

use rayon::prelude::*;

use crate::config::{FlowConfig, FlowMode};
use crate::error::LandscapeError;
use crate::mesh::PartitionMesh;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexRole {
    Sink,
    /// No strictly lower neighbor on the resolved surface.
    Pending,
    Draining,
}

/// One weighted flow edge. `receiver` is a partition-local index and may be
/// a ghost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowEdge {
    pub receiver: u32,
    pub weight: f64,
    pub slope: f64,
    pub edge_length: f64,
}

/// Arena flow graph over the owned vertices of one partition.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    offsets: Vec<usize>,
    edges: Vec<FlowEdge>,
    roles: Vec<VertexRole>,
    pending: Vec<u32>,
}

enum Resolved {
    Sink,
    Pending,
    Edges(Vec<FlowEdge>),
}

impl FlowGraph {
    /// Resolve receivers on `surface`. Ghost entries of `surface` must hold
    /// the owners' current values.
    pub fn resolve(
        mesh: &PartitionMesh,
        surface: &[f64],
        sea_level: f64,
        config: &FlowConfig,
    ) -> Result<Self, LandscapeError> {
        let owned = mesh.owned_count();
        let resolved: Vec<Result<Resolved, LandscapeError>> = (0..owned)
            .into_par_iter()
            .map(|v| resolve_vertex(mesh, surface, sea_level, config, v))
            .collect();

        let mut graph = FlowGraph {
            offsets: Vec::with_capacity(owned + 1),
            edges: Vec::with_capacity(owned),
            roles: Vec::with_capacity(owned),
            pending: Vec::new(),
        };
        graph.offsets.push(0);
        for (v, entry) in resolved.into_iter().enumerate() {
            match entry? {
                Resolved::Sink => graph.roles.push(VertexRole::Sink),
                Resolved::Pending => {
                    graph.roles.push(VertexRole::Pending);
                    graph.pending.push(v as u32);
                }
                Resolved::Edges(edges) => {
                    graph.roles.push(VertexRole::Draining);
                    graph.edges.extend(edges);
                }
            }
            graph.offsets.push(graph.edges.len());
        }
        tracing::trace!(
            target: "landscape::flow",
            rank = mesh.rank(),
            edges = graph.edges.len(),
            pending = graph.pending.len(),
            "flow.resolved"
        );
        Ok(graph)
    }

    pub fn owned_count(&self) -> usize {
        self.roles.len()
    }

    pub fn receivers(&self, v: usize) -> &[FlowEdge] {
        &self.edges[self.offsets[v]..self.offsets[v + 1]]
    }

    pub fn role(&self, v: usize) -> VertexRole {
        self.roles[v]
    }

    pub fn is_sink(&self, v: usize) -> bool {
        self.roles[v] == VertexRole::Sink
    }

    /// Owned vertices left without a receiver, ascending local index.
    pub fn pending(&self) -> &[u32] {
        &self.pending
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// Sink test shared by every component: boundary or below sea level.
pub fn is_sink(mesh: &PartitionMesh, elevation: f64, sea_level: f64, v: usize) -> bool {
    mesh.boundary_flag(v) || elevation < sea_level
}

fn resolve_vertex(
    mesh: &PartitionMesh,
    surface: &[f64],
    sea_level: f64,
    config: &FlowConfig,
    v: usize,
) -> Result<Resolved, LandscapeError> {
    let neighbors = mesh.neighbors(v);
    if neighbors.is_empty() {
        return Err(mesh.integrity_error(v, "vertex has no neighbors"));
    }
    if is_sink(mesh, surface[v], sea_level, v) {
        return Ok(Resolved::Sink);
    }

    let here = surface[v];
    let descending = neighbors.iter().filter_map(|n| {
        let drop = here - surface[n.index as usize];
        (drop > 0.0).then(|| FlowEdge {
            receiver: n.index,
            weight: 0.0,
            slope: drop / n.edge_length,
            edge_length: n.edge_length,
        })
    });

    match config.mode() {
        FlowMode::Single => {
            let mut best: Option<FlowEdge> = None;
            for edge in descending {
                let better = match best {
                    None => true,
                    Some(current) => {
                        edge.slope > current.slope
                            || (edge.slope == current.slope
                                && mesh.global_id(edge.receiver as usize)
                                    < mesh.global_id(current.receiver as usize))
                    }
                };
                if better {
                    best = Some(edge);
                }
            }
            Ok(match best {
                Some(edge) => Resolved::Edges(vec![FlowEdge {
                    weight: 1.0,
                    ..edge
                }]),
                None => Resolved::Pending,
            })
        }
        FlowMode::Multiple => {
            let exponent = config.slope_exponent();
            let mut edges: Vec<FlowEdge> = descending
                .map(|edge| FlowEdge {
                    weight: edge.slope.powf(exponent),
                    ..edge
                })
                .collect();
            if edges.is_empty() {
                return Ok(Resolved::Pending);
            }
            let total: f64 = edges.iter().map(|e| e.weight).sum();
            if total > 0.0 {
                for edge in &mut edges {
                    edge.weight /= total;
                }
            } else {
                let share = 1.0 / edges.len() as f64;
                for edge in &mut edges {
                    edge.weight = share;
                }
            }
            Ok(Resolved::Edges(edges))
        }
    }
}
