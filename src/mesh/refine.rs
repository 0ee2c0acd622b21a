//! Uniform 1:8 tetrahedral refinement building blocks.
//!
//! Refinement inserts one node on each of a tetrahedron's six edges and
//! replaces the parent with eight children. The child template is fixed so
//! that every participant derives the same sub-connectivity from the same
//! edge-node assignment.

use crate::mesh::{edges_of, Edge, NodeId, Tet};
use std::collections::BTreeMap;

/// Edge-node ids keyed by the (canonical) parent edge.
pub type EdgeNodes = BTreeMap<Edge, NodeId>;

/// Assign provisional edge-node ids to every unique edge of `conn`.
///
/// Ids advance from `start` in canonical edge order, which makes the
/// assignment deterministic for a fixed connectivity. Provisional ids
/// collide between PEs by design; the distributed renumbering replaces
/// them with globally consistent linear ids.
pub fn synthesize_edge_nodes(conn: &[NodeId], start: u64) -> EdgeNodes {
    let mut next = start;
    let mut out = EdgeNodes::new();
    for edge in crate::mesh::unique_edges(conn) {
        out.insert(edge, NodeId::new(next));
        next += 1;
    }
    out
}

/// The eight children of `tet` under the fixed 1:8 template.
///
/// Returns `None` if any of the six edge-nodes is missing from
/// `edge_nodes`.
pub fn children(tet: &Tet, edge_nodes: &EdgeNodes) -> Option<[Tet; 8]> {
    let mut mids = [NodeId::new(0); 6];
    for (k, e) in edges_of(tet).into_iter().enumerate() {
        mids[k] = *edge_nodes.get(&e)?;
    }
    Some(template(*tet, mids))
}

/// The child template itself: four corners plus the six edge-nodes in
/// AB, AC, AD, BC, BD, CD order. Used directly when corners and edge-nodes
/// live in different id spaces than the parent connectivity.
pub fn template(corners: Tet, mids: [NodeId; 6]) -> [Tet; 8] {
    let [a, b, c, d] = corners;
    let [ab, ac, ad, bc, bd, cd] = mids;
    [
        [a, ab, ac, ad],
        [b, bc, ab, bd],
        [c, ac, bc, cd],
        [d, ad, cd, bd],
        [bc, cd, ac, bd],
        [ab, bd, ac, ad],
        [ab, bc, ac, bd],
        [ac, bd, cd, ad],
    ]
}
