//! Downstream routing of conserved quantities along the flow graph.
//!
//! [`route`] is the generic engine: every owned vertex contributes a source,
//! optionally retains part of what passes through it, and forwards the rest
//! to its receivers in proportion to the flow weights. Contributions that
//! leave the partition are collected on ghost slots and pushed to their
//! owners, which fold them into an external inflow and recompute. Rounds
//! repeat until no partition's inflow changes.
//!
//! Drainage area, discharge and sediment flux all run through it.

use std::cmp::Ordering;

use crate::comm::Halo;
use crate::config::AccumulationConfig;
use crate::error::{ExchangeComponent, LandscapeError};
use crate::flow::FlowGraph;
use crate::mesh::PartitionMesh;

/// One quantity to route.
#[derive(Debug, Clone, Copy)]
pub struct RoutingField<'s> {
    /// Per owned vertex contribution.
    pub source: &'s [f64],
    /// Per owned vertex retention capacity; `None` routes everything.
    pub capacity: Option<&'s [f64]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routed {
    /// Everything arriving at each vertex, own source included. Ghost slots
    /// are zero unless refreshed by the caller.
    pub through: Vec<f64>,
    pub captured: Vec<f64>,
    /// Amount leaving the landscape at owned vertices without receivers.
    pub terminal: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingOutcome {
    pub fields: Vec<Routed>,
    pub rounds: u32,
}

/// Owned vertices sorted by descending `surface`, ties by ascending global
/// id, so every donor precedes its receivers.
pub fn descending_order(mesh: &PartitionMesh, surface: &[f64]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..mesh.owned_count() as u32).collect();
    order.sort_by(|&a, &b| {
        surface[b as usize]
            .partial_cmp(&surface[a as usize])
            .unwrap_or(Ordering::Equal)
            .then_with(|| mesh.global_id(a as usize).cmp(&mesh.global_id(b as usize)))
    });
    order
}

/// Route `fields` down `graph`, visiting owned vertices in `order`
/// (see [`descending_order`]).
pub fn route(
    halo: &mut Halo<'_>,
    graph: &FlowGraph,
    order: &[u32],
    fields: &[RoutingField<'_>],
    config: &AccumulationConfig,
) -> Result<RoutingOutcome, LandscapeError> {
    let mesh = halo.mesh();
    let owned = mesh.owned_count();
    let mut inflow = vec![vec![0.0; owned]; fields.len()];
    let mut rounds = 0;

    loop {
        rounds += 1;
        if rounds > config.max_rounds() {
            return Err(LandscapeError::FillDivergence {
                partition: mesh.rank(),
                component: ExchangeComponent::Accumulation,
                rounds: rounds as usize - 1,
            });
        }

        let passes: Vec<Routed> = fields
            .iter()
            .zip(&inflow)
            .map(|(field, inflow)| local_pass(mesh, graph, order, field, inflow))
            .collect();
        let partials: Vec<&[f64]> = passes.iter().map(|p| p.through.as_slice()).collect();
        let received = halo.push_to_owners(&partials)?;

        let changed = received
            .iter()
            .zip(&inflow)
            .any(|(new, old)| new.iter().zip(old).any(|(a, b)| a.to_bits() != b.to_bits()));
        inflow = received;

        if !halo.comm().any(changed)? {
            let fields = passes
                .into_iter()
                .map(|mut pass| {
                    for slot in pass.through.iter_mut().skip(owned) {
                        *slot = 0.0;
                    }
                    pass
                })
                .collect();
            return Ok(RoutingOutcome { fields, rounds });
        }
    }
}

fn local_pass(
    mesh: &PartitionMesh,
    graph: &FlowGraph,
    order: &[u32],
    field: &RoutingField<'_>,
    inflow: &[f64],
) -> Routed {
    let owned = mesh.owned_count();
    let mut through = vec![0.0; mesh.len()];
    for v in 0..owned {
        through[v] = field.source[v] + inflow[v];
    }
    let mut captured = vec![0.0; owned];
    let mut terminal = vec![0.0; owned];

    for &v in order {
        let v = v as usize;
        let mut out = through[v];
        if let Some(capacity) = field.capacity {
            let kept = out.min(capacity[v]).max(0.0);
            captured[v] = kept;
            out -= kept;
        }
        let receivers = graph.receivers(v);
        if receivers.is_empty() {
            terminal[v] = out;
            continue;
        }
        for edge in receivers {
            through[edge.receiver as usize] += edge.weight * out;
        }
    }

    Routed {
        through,
        captured,
        terminal,
    }
}

/// Contributing area and discharge of every vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drainage {
    /// Owned and ghost values; ghosts refreshed from their owners.
    pub area: Vec<f64>,
    pub discharge: Vec<f64>,
    pub rounds: u32,
}

/// Accumulate cell area and `area * precipitation` along `graph`, visiting
/// vertices in descending order of the routing surface.
pub fn accumulate_drainage(
    halo: &mut Halo<'_>,
    graph: &FlowGraph,
    routing_surface: &[f64],
    precipitation: &[f64],
    config: &AccumulationConfig,
) -> Result<Drainage, LandscapeError> {
    let mesh = halo.mesh();
    let owned = mesh.owned_count();
    let cell_area: Vec<f64> = (0..owned).map(|v| mesh.cell_area(v)).collect();
    let runoff: Vec<f64> = (0..owned).map(|v| cell_area[v] * precipitation[v]).collect();
    let order = descending_order(mesh, routing_surface);

    let outcome = route(
        halo,
        graph,
        &order,
        &[
            RoutingField {
                source: &cell_area,
                capacity: None,
            },
            RoutingField {
                source: &runoff,
                capacity: None,
            },
        ],
        config,
    )?;
    let rounds = outcome.rounds;
    let mut fields = outcome.fields.into_iter();
    let mut area = fields.next().map(|f| f.through).unwrap_or_default();
    let mut discharge = fields.next().map(|f| f.through).unwrap_or_default();
    halo.refresh(&mut [&mut area, &mut discharge])?;

    tracing::debug!(
        target: "landscape::accumulate",
        rank = mesh.rank(),
        rounds,
        "accumulate.converged"
    );

    Ok(Drainage {
        area,
        discharge,
        rounds,
    })
}
