//! Work-units: the chare-sized mesh pieces produced by the renumbering.
//!
//! A work-unit carries everything a PDE worker needs to contribute to the
//! distributed linear system: connectivity in linear ids, the old/new id
//! maps for boundary-condition lookup, the edge-node map from refinement,
//! the shared-boundary node sets per neighboring chare, and node
//! coordinates.

use crate::mesh::{unique_nodes, Edge, NodeId, Tet};
use std::collections::{BTreeMap, BTreeSet};

/// One chare's share of the mesh after renumbering.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    /// Dense chare id in `[0, nchare)`.
    pub id: u64,
    /// Tet connectivity in linear ids (eight children per original tet if
    /// refinement ran).
    pub conn: Vec<Tet>,
    /// Linear id to file id, for the original (non-edge) nodes.
    pub node_map: BTreeMap<NodeId, NodeId>,
    /// File id to linear id, the inverse of `node_map`.
    pub old_to_new: BTreeMap<NodeId, NodeId>,
    /// Linear ids of edge-nodes keyed by their generating file-id edge.
    pub edge_nodes: BTreeMap<Edge, NodeId>,
    /// Shared-boundary node sets (linear ids) per neighboring chare.
    pub surrounding: BTreeMap<u64, BTreeSet<NodeId>>,
    /// Coordinates per linear id.
    pub coords: BTreeMap<NodeId, [f64; 3]>,
}

impl WorkUnit {
    /// Sorted unique linear ids this work-unit contributes to.
    pub fn rows(&self) -> Vec<NodeId> {
        let flat: Vec<NodeId> = self.conn.iter().flatten().copied().collect();
        unique_nodes(&flat)
    }

    /// File id for a linear id (original nodes only).
    pub fn old_id(&self, new: NodeId) -> Option<NodeId> {
        self.node_map.get(&new).copied()
    }

    /// Linear id for a file id.
    pub fn new_id(&self, old: NodeId) -> Option<NodeId> {
        self.old_to_new.get(&old).copied()
    }
}
