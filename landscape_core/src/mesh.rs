//! Mesh topology adapter.
//!
//! A [`GlobalMesh`] is built once from a triangulation and split into
//! [`PartitionMesh`]es according to an externally computed assignment. Each
//! partition numbers its owned vertices first (ascending global id) followed
//! by its ghost mirrors (ascending global id), and carries the halo plan used
//! to refresh those mirrors.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitflags::bitflags;
use thiserror::Error;

use crate::error::LandscapeError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VertexFlags: u8 {
        /// Vertex lies on the outer edge of the triangulation.
        const BOUNDARY = 1 << 0;
        /// Read-only mirror of a vertex owned by another partition.
        const GHOST = 1 << 1;
    }
}

/// One entry of a vertex's ordered neighbor list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Partition-local index of the neighbor (global id inside [`GlobalMesh`]).
    pub index: u32,
    pub edge_length: f64,
    /// Dual-edge length over edge length (cotangent weight, clamped at zero).
    pub conductance: f64,
    pub ghost: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum MeshError {
    #[error("triangle {triangle} references vertex {vertex} but the mesh has {len} vertices")]
    InvalidTriangle {
        triangle: usize,
        vertex: u32,
        len: usize,
    },
    #[error("triangle {0} has zero area")]
    DegenerateTriangle(usize),
    #[error("partition assignment has {found} entries for {expected} vertices")]
    AssignmentLength { expected: usize, found: usize },
    #[error("partition {0} owns no vertices")]
    EmptyPartition(usize),
    #[error(transparent)]
    Integrity(#[from] LandscapeError),
}

#[derive(Debug, Clone)]
pub struct GlobalMesh {
    coords: Vec<[f64; 3]>,
    area: Vec<f64>,
    boundary: Vec<bool>,
    adjacency: Vec<Vec<Neighbor>>,
}

impl GlobalMesh {
    /// Build adjacency, barycentric dual areas and cotangent conductances.
    pub fn from_triangles(coords: Vec<[f64; 3]>, triangles: &[[u32; 3]]) -> Result<Self, MeshError> {
        let len = coords.len();
        let mut area = vec![0.0; len];
        // (lo, hi) -> (incident triangle count, accumulated half-cotangent)
        let mut edges: BTreeMap<(u32, u32), (u32, f64)> = BTreeMap::new();

        for (t, tri) in triangles.iter().enumerate() {
            for &vertex in tri {
                if vertex as usize >= len {
                    return Err(MeshError::InvalidTriangle {
                        triangle: t,
                        vertex,
                        len,
                    });
                }
            }
            let [a, b, c] = tri.map(|v| coords[v as usize]);
            let twice_area = norm(cross(sub(b, a), sub(c, a)));
            if twice_area <= f64::EPSILON {
                return Err(MeshError::DegenerateTriangle(t));
            }
            for &vertex in tri {
                area[vertex as usize] += twice_area / 6.0;
            }
            for k in 0..3 {
                let apex = coords[tri[k] as usize];
                let p = tri[(k + 1) % 3];
                let q = tri[(k + 2) % 3];
                let cot = dot(
                    sub(coords[p as usize], apex),
                    sub(coords[q as usize], apex),
                ) / twice_area;
                let entry = edges.entry((p.min(q), p.max(q))).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += 0.5 * cot;
            }
        }

        let mut boundary = vec![false; len];
        let mut adjacency: Vec<Vec<Neighbor>> = vec![Vec::new(); len];
        for (&(lo, hi), &(count, weight)) in &edges {
            if count == 1 {
                boundary[lo as usize] = true;
                boundary[hi as usize] = true;
            }
            let edge_length = norm(sub(coords[hi as usize], coords[lo as usize]));
            let conductance = weight.max(0.0);
            for (from, to) in [(lo, hi), (hi, lo)] {
                adjacency[from as usize].push(Neighbor {
                    index: to,
                    edge_length,
                    conductance,
                    ghost: false,
                });
            }
        }
        for list in &mut adjacency {
            list.sort_unstable_by_key(|n| n.index);
        }

        Ok(Self {
            coords,
            area,
            boundary,
            adjacency,
        })
    }

    /// Regular `nx` × `ny` lattice split into right triangles. Used as a
    /// fixture by tests and benches; real meshes come from the mesh reader.
    pub fn regular_grid(nx: usize, ny: usize, spacing: f64) -> Result<Self, MeshError> {
        let mut coords = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                coords.push([i as f64 * spacing, j as f64 * spacing, 0.0]);
            }
        }
        let mut triangles = Vec::with_capacity(2 * nx.saturating_sub(1) * ny.saturating_sub(1));
        for j in 0..ny.saturating_sub(1) {
            for i in 0..nx.saturating_sub(1) {
                let v00 = (j * nx + i) as u32;
                let v10 = v00 + 1;
                let v01 = v00 + nx as u32;
                let v11 = v01 + 1;
                triangles.push([v00, v10, v11]);
                triangles.push([v00, v11, v01]);
            }
        }
        Self::from_triangles(coords, &triangles)
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coord(&self, id: u64) -> [f64; 3] {
        self.coords[id as usize]
    }

    pub fn cell_area(&self, id: u64) -> f64 {
        self.area[id as usize]
    }

    pub fn boundary_flag(&self, id: u64) -> bool {
        self.boundary[id as usize]
    }

    pub fn neighbors(&self, id: u64) -> &[Neighbor] {
        &self.adjacency[id as usize]
    }

    /// Whole mesh as a single partition.
    pub fn single_partition(&self) -> Result<PartitionMesh, MeshError> {
        let mut parts = self.partition(&vec![0; self.len()])?;
        Ok(parts.remove(0))
    }

    /// Split the mesh following `assignment[global id] = partition`.
    pub fn partition(&self, assignment: &[usize]) -> Result<Vec<PartitionMesh>, MeshError> {
        if assignment.len() != self.len() {
            return Err(MeshError::AssignmentLength {
                expected: self.len(),
                found: assignment.len(),
            });
        }
        let partitions = assignment.iter().copied().max().map_or(0, |m| m + 1);
        let mut owned_by: Vec<Vec<u64>> = vec![Vec::new(); partitions];
        for (id, &part) in assignment.iter().enumerate() {
            owned_by[part].push(id as u64);
        }
        if let Some(empty) = owned_by.iter().position(Vec::is_empty) {
            return Err(MeshError::EmptyPartition(empty));
        }

        let mut meshes = Vec::with_capacity(partitions);
        for (rank, owned) in owned_by.iter().enumerate() {
            let mesh = self.extract(rank, partitions, owned, assignment);
            mesh.validate()?;
            meshes.push(mesh);
        }
        Ok(meshes)
    }

    fn extract(
        &self,
        rank: usize,
        partitions: usize,
        owned: &[u64],
        assignment: &[usize],
    ) -> PartitionMesh {
        let ghosts: BTreeSet<u64> = owned
            .iter()
            .flat_map(|&id| self.adjacency[id as usize].iter())
            .map(|n| n.index as u64)
            .filter(|&id| assignment[id as usize] != rank)
            .collect();

        let global_ids: Vec<u64> = owned.iter().copied().chain(ghosts.iter().copied()).collect();
        let local: HashMap<u64, u32> = global_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as u32))
            .collect();

        let mut offsets = Vec::with_capacity(global_ids.len() + 1);
        let mut links = Vec::new();
        offsets.push(0);
        for (i, &id) in global_ids.iter().enumerate() {
            let is_ghost = i >= owned.len();
            for n in &self.adjacency[id as usize] {
                let target = n.index as u64;
                let target_owner = assignment[target as usize];
                if is_ghost && target_owner != rank {
                    continue;
                }
                if let Some(&index) = local.get(&target) {
                    links.push(Neighbor {
                        index,
                        ghost: target_owner != rank,
                        ..*n
                    });
                }
            }
            offsets.push(links.len());
        }

        let mut flags = Vec::with_capacity(global_ids.len());
        let mut owner = Vec::with_capacity(global_ids.len());
        for (i, &id) in global_ids.iter().enumerate() {
            let mut f = VertexFlags::empty();
            if self.boundary[id as usize] {
                f |= VertexFlags::BOUNDARY;
            }
            if i >= owned.len() {
                f |= VertexFlags::GHOST;
            }
            flags.push(f);
            owner.push(assignment[id as usize]);
        }

        let mut peers: BTreeMap<usize, HaloPeer> = BTreeMap::new();
        for &id in &ghosts {
            let peer = assignment[id as usize];
            peers
                .entry(peer)
                .or_insert_with(|| HaloPeer::new(peer))
                .recv
                .push(local[&id]);
        }
        for &id in owned {
            let mut seen = BTreeSet::new();
            for n in &self.adjacency[id as usize] {
                let peer = assignment[n.index as usize];
                if peer != rank && seen.insert(peer) {
                    peers
                        .entry(peer)
                        .or_insert_with(|| HaloPeer::new(peer))
                        .send
                        .push(local[&id]);
                }
            }
        }

        PartitionMesh {
            rank,
            partitions,
            owned: owned.len(),
            coords: global_ids.iter().map(|&id| self.coords[id as usize]).collect(),
            area: global_ids.iter().map(|&id| self.area[id as usize]).collect(),
            global_ids,
            flags,
            owner,
            offsets,
            links,
            halo: HaloPlan {
                peers: peers.into_values().collect(),
            },
        }
    }
}

/// Vertices exchanged with one neighboring partition.
///
/// `send` lists owned vertices mirrored on the peer, `recv` lists local ghost
/// slots owned by the peer. Both are ordered by global id, so the peer's
/// `recv` is aligned with this side's `send` and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaloPeer {
    pub rank: usize,
    pub send: Vec<u32>,
    pub recv: Vec<u32>,
}

impl HaloPeer {
    fn new(rank: usize) -> Self {
        Self {
            rank,
            send: Vec::new(),
            recv: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaloPlan {
    pub peers: Vec<HaloPeer>,
}

#[derive(Debug, Clone)]
pub struct PartitionMesh {
    rank: usize,
    partitions: usize,
    owned: usize,
    global_ids: Vec<u64>,
    coords: Vec<[f64; 3]>,
    area: Vec<f64>,
    flags: Vec<VertexFlags>,
    owner: Vec<usize>,
    offsets: Vec<usize>,
    links: Vec<Neighbor>,
    halo: HaloPlan,
}

impl PartitionMesh {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Owned vertices occupy local indices `0..owned_count()`.
    pub fn owned_count(&self) -> usize {
        self.owned
    }

    /// Owned plus ghost vertices.
    pub fn len(&self) -> usize {
        self.global_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global_ids.is_empty()
    }

    pub fn is_owned(&self, v: usize) -> bool {
        v < self.owned
    }

    pub fn global_id(&self, v: usize) -> u64 {
        self.global_ids[v]
    }

    pub fn global_ids(&self) -> &[u64] {
        &self.global_ids
    }

    pub fn coord(&self, v: usize) -> [f64; 3] {
        self.coords[v]
    }

    pub fn cell_area(&self, v: usize) -> f64 {
        self.area[v]
    }

    pub fn flags(&self, v: usize) -> VertexFlags {
        self.flags[v]
    }

    /// Ordered neighbors of `v`. Ghost vertices only list their links back
    /// into owned vertices of this partition.
    pub fn neighbors(&self, v: usize) -> &[Neighbor] {
        &self.links[self.offsets[v]..self.offsets[v + 1]]
    }

    pub fn boundary_flag(&self, v: usize) -> bool {
        self.flags[v].contains(VertexFlags::BOUNDARY)
    }

    /// Owning partition of a ghost vertex, `None` for owned vertices.
    pub fn ghost_owner(&self, v: usize) -> Option<usize> {
        if self.flags[v].contains(VertexFlags::GHOST) {
            Some(self.owner[v])
        } else {
            None
        }
    }

    pub fn halo(&self) -> &HaloPlan {
        &self.halo
    }

    pub fn integrity_error(&self, v: usize, reason: impl Into<String>) -> LandscapeError {
        LandscapeError::MeshIntegrity {
            partition: self.rank,
            vertex: self.global_ids[v],
            reason: reason.into(),
        }
    }

    /// Check degree, link symmetry and ghost bookkeeping of owned vertices.
    pub fn validate(&self) -> Result<(), LandscapeError> {
        for v in 0..self.owned {
            let neighbors = self.neighbors(v);
            if neighbors.is_empty() {
                return Err(self.integrity_error(v, "isolated vertex"));
            }
            for n in neighbors {
                let u = n.index as usize;
                if u >= self.len() {
                    return Err(self.integrity_error(v, "neighbor index out of range"));
                }
                if n.ghost != self.ghost_owner(u).is_some() {
                    return Err(self.integrity_error(v, "ghost flag disagrees with ownership"));
                }
                if !self.neighbors(u).iter().any(|back| back.index as usize == v) {
                    return Err(self.integrity_error(v, "asymmetric adjacency"));
                }
            }
        }
        Ok(())
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_grid_geometry() {
        let mesh = GlobalMesh::regular_grid(4, 3, 2.0).expect("grid");
        assert_eq!(mesh.len(), 12);

        // Interior vertex: full dual cell, six neighbors.
        let interior = 5;
        assert!(!mesh.boundary_flag(interior));
        assert!((mesh.cell_area(interior) - 4.0).abs() < 1e-12);
        assert_eq!(mesh.neighbors(interior).len(), 6);

        // Axis-aligned edges carry unit conductance, diagonals none.
        for n in mesh.neighbors(interior) {
            let diagonal = (n.edge_length - 2.0 * 2f64.sqrt()).abs() < 1e-12;
            let expected = if diagonal { 0.0 } else { 1.0 };
            assert!((n.conductance - expected).abs() < 1e-12);
        }

        let total: f64 = (0..mesh.len() as u64).map(|id| mesh.cell_area(id)).sum();
        assert!((total - 24.0).abs() < 1e-9);
        assert!(mesh.boundary_flag(0));
        assert!(mesh.boundary_flag(11));
    }

    #[test]
    fn rejects_bad_triangles() {
        let coords = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert_eq!(
            GlobalMesh::from_triangles(coords.clone(), &[[0, 1, 2]]).unwrap_err(),
            MeshError::DegenerateTriangle(0)
        );
        assert!(matches!(
            GlobalMesh::from_triangles(coords, &[[0, 1, 5]]),
            Err(MeshError::InvalidTriangle { vertex: 5, .. })
        ));
    }

    #[test]
    fn partition_builds_aligned_halo() {
        let mesh = GlobalMesh::regular_grid(4, 4, 1.0).expect("grid");
        let assignment: Vec<usize> = (0..16).map(|id| usize::from(id % 4 >= 2)).collect();
        let parts = mesh.partition(&assignment).expect("partition");
        assert_eq!(parts.len(), 2);

        let (left, right) = (&parts[0], &parts[1]);
        assert_eq!(left.owned_count(), 8);
        assert_eq!(right.owned_count(), 8);

        let left_peer = &left.halo().peers[0];
        let right_peer = &right.halo().peers[0];
        assert_eq!(left_peer.rank, 1);
        assert_eq!(right_peer.rank, 0);

        let sent: Vec<u64> = left_peer.send.iter().map(|&v| left.global_id(v as usize)).collect();
        let mirrored: Vec<u64> = right_peer
            .recv
            .iter()
            .map(|&v| right.global_id(v as usize))
            .collect();
        assert_eq!(sent, mirrored);

        for &slot in &right_peer.recv {
            assert_eq!(right.ghost_owner(slot as usize), Some(0));
            assert!(!right.is_owned(slot as usize));
        }
    }

    #[test]
    fn empty_partitions_are_rejected() {
        let mesh = GlobalMesh::regular_grid(3, 3, 1.0).expect("grid");
        let assignment = vec![0, 0, 0, 0, 0, 0, 0, 0, 2];
        assert_eq!(
            mesh.partition(&assignment).unwrap_err(),
            MeshError::EmptyPartition(1)
        );
    }

    #[test]
    fn validate_reports_isolated_vertices() {
        let mesh = GlobalMesh::from_triangles(
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [5.0, 5.0, 0.0],
            ],
            &[[0, 1, 2]],
        )
        .expect("mesh");
        let err = mesh.single_partition().unwrap_err();
        assert!(matches!(
            err,
            MeshError::Integrity(LandscapeError::MeshIntegrity { vertex: 3, .. })
        ));
    }
}
