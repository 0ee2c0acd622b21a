//! Core mesh entities: node ids, canonical edges, tetrahedra.
//!
//! Two node-id spaces exist over the lifetime of a run: the *file* ids as
//! stored in the input mesh (zero-based), and the *linear* ids assigned by
//! the distributed renumbering so that each PE owns a contiguous range.
//! Both are carried by [`NodeId`]; which space a value lives in is a
//! property of the container holding it, and the per-work-unit old/new maps
//! translate between the two.

pub mod refine;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A mesh node index (file id or linear id, depending on context).
///
/// `repr(transparent)` over `u64`, so slices of `NodeId` can be cast to
/// byte buffers for the wire without copying.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        NodeId(raw)
    }

    /// The underlying index.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    #[inline]
    fn from(raw: u64) -> Self {
        NodeId(raw)
    }
}

impl From<NodeId> for u64 {
    #[inline]
    fn from(n: NodeId) -> Self {
        n.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId").field(&self.0).finish()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unordered pair of node ids, stored canonicalized: `lo() < hi()`.
///
/// `edge(a,b) == edge(b,a)` by construction, so edges can key maps and sets
/// regardless of the orientation they were discovered in.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct Edge {
    lo: NodeId,
    hi: NodeId,
}

impl Edge {
    /// Canonicalizing constructor. `a` and `b` must be distinct.
    #[inline]
    pub fn new(a: NodeId, b: NodeId) -> Self {
        debug_assert_ne!(a, b, "degenerate edge");
        if a < b {
            Edge { lo: a, hi: b }
        } else {
            Edge { lo: b, hi: a }
        }
    }

    #[inline]
    pub const fn lo(self) -> NodeId {
        self.lo
    }

    #[inline]
    pub const fn hi(self) -> NodeId {
        self.hi
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({}-{})", self.lo, self.hi)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// Tetrahedron connectivity: four node ids in fixed order.
pub type Tet = [NodeId; 4];

/// Local vertex index pairs forming the six edges of a tetrahedron, in the
/// order AB, AC, AD, BC, BD, CD.
pub const TET_EDGES: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// The six edges of a tetrahedron.
#[inline]
pub fn edges_of(t: &Tet) -> [Edge; 6] {
    TET_EDGES.map(|(i, j)| Edge::new(t[i], t[j]))
}

/// Sorted unique node ids referenced by a flat connectivity array.
pub fn unique_nodes(conn: &[NodeId]) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = conn.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Unique edges induced by a flat tet connectivity array (the node-to-node
/// star of the mesh chunk).
pub fn unique_edges(conn: &[NodeId]) -> BTreeSet<Edge> {
    let mut edges = BTreeSet::new();
    for tet in conn.chunks_exact(4) {
        for (i, j) in TET_EDGES {
            edges.insert(Edge::new(tet[i], tet[j]));
        }
    }
    edges
}

/// Midpoint of two coordinate triples.
#[inline]
pub fn midpoint(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        (a[0] + b[0]) / 2.0,
        (a[1] + b[1]) / 2.0,
        (a[2] + b[2]) / 2.0,
    ]
}

/// Centroid of a tetrahedron given its four vertex coordinates.
#[inline]
pub fn centroid(v: [[f64; 3]; 4]) -> [f64; 3] {
    [
        (v[0][0] + v[1][0] + v[2][0] + v[3][0]) / 4.0,
        (v[0][1] + v[1][1] + v[2][1] + v[3][1]) / 4.0,
        (v[0][2] + v[1][2] + v[2][2] + v[3][2]) / 4.0,
    ]
}
