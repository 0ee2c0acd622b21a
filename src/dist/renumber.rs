//! Distributed global node renumbering.
//!
//! Assigns every mesh node (and every refinement edge-node) a new linear id
//! such that each PE owns a contiguous id range. The assigner of an id is
//! the lowest-ranked PE whose local set contains it; the same rule applies
//! verbatim to edges, which gives edge-nodes inserted on a PE boundary the
//! same id on every PE touching the edge.
//!
//! Protocol, per PE:
//! 1. *Flatten*: collect the local id set and edge set from the owned
//!    chares.
//! 2. *Query/mask*: broadcast the local sets; every holder answers with the
//!    subset it also holds, plus the chare ids contributing to each node
//!    (from which the surrounding-chare maps are built). Replies from
//!    lower-ranked PEs, made unique by keeping only the lowest holder,
//!    become the communication maps.
//! 3. *Offset*: broadcast the uniquely-assigned count; the local start
//!    offset is the sum over lower ranks.
//! 4. *Assign*: number the locally-owned ids from the start offset, in
//!    sorted order.
//! 5. *Request/reply*: ask each communication-map PE for the new ids of
//!    the ids it assigns; merge the replies.
//! 6. *Bounds*: the exclusive upper bound travels to the next-higher PE as
//!    its lower bound.
//!
//! The result is deterministic for a fixed element-to-chare assignment.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::exchange::{exchange_all, recv_fixed, send_fixed};
use crate::comm::wire::{kind, ByteReader, ByteWriter};
use crate::dist::partitioner::MeshChunk;
use crate::dist::worker::WorkUnit;
use crate::dist::{tags, RowRange};
use crate::error::{InvariantViolation, TetPartError};
use crate::mesh::refine::template;
use crate::mesh::{Edge, NodeId, Tet};
use std::collections::{BTreeMap, BTreeSet};

/// Per-PE renumbering state machine.
pub struct Renumberer<'a, C: Communicator> {
    comm: &'a C,
    chunk: MeshChunk,
    /// Unique file ids the owned chares contribute to.
    nd: BTreeSet<NodeId>,
    /// Unique edges of the owned chares (empty without refinement).
    ed: BTreeSet<Edge>,
    /// Sorted unique chare ids contributing to each file id.
    cn: BTreeMap<NodeId, Vec<u64>>,
    /// Surrounding-chare map: owned chare -> neighbor chare -> shared
    /// boundary file ids.
    msum: BTreeMap<u64, BTreeMap<u64, BTreeSet<NodeId>>>,
    /// Node ids to be received from each lower-ranked PE.
    ncomm: BTreeMap<usize, BTreeSet<NodeId>>,
    /// Edges to be received from each lower-ranked PE.
    ecomm: BTreeMap<usize, BTreeSet<Edge>>,
    /// New linear id per file id.
    newnd: BTreeMap<NodeId, NodeId>,
    /// New linear id per refined edge.
    newed: BTreeMap<Edge, NodeId>,
    range: RowRange,
    feedback: bool,
}

impl<'a, C: Communicator> Renumberer<'a, C> {
    /// Flatten the chare-owned connectivity into the local id and edge sets.
    pub fn new(comm: &'a C, chunk: MeshChunk, feedback: bool) -> Self {
        let mut nd = BTreeSet::new();
        let mut cn: BTreeMap<NodeId, Vec<u64>> = BTreeMap::new();
        for (&chare, conn) in &chunk.node {
            for &id in conn {
                nd.insert(id);
                cn.entry(id).or_default().push(chare);
            }
        }
        for chares in cn.values_mut() {
            chares.sort_unstable();
            chares.dedup();
        }
        let ed: BTreeSet<Edge> = chunk.edgenodes.keys().copied().collect();
        Self {
            comm,
            chunk,
            nd,
            ed,
            cn,
            msum: BTreeMap::new(),
            ncomm: BTreeMap::new(),
            ecomm: BTreeMap::new(),
            newnd: BTreeMap::new(),
            newed: BTreeMap::new(),
            range: RowRange { lower: 0, upper: 0 },
            feedback,
        }
    }

    /// Run the reordering protocol to completion and return the owned
    /// linear-id range.
    pub fn reorder(&mut self) -> Result<RowRange, TetPartError> {
        self.query_and_mask()?;
        let start = self.offsets()?;
        self.assign(start);
        self.request_new_ids()?;
        self.bounds(start)?;
        if self.feedback {
            log::info!(
                "PE {}: reordered, rows [{}, {})",
                self.comm.rank(),
                self.range.lower,
                self.range.upper
            );
        }
        Ok(self.range)
    }

    /// Broadcast the local sets and fold everyone's ownership masks into
    /// the surrounding-chare map and the communication maps.
    fn query_and_mask(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        let size = self.comm.size();

        let query = {
            let ids: Vec<NodeId> = self.nd.iter().copied().collect();
            let edges: Vec<Edge> = self.ed.iter().copied().collect();
            let mut w = ByteWriter::message(kind::QUERY);
            w.put_pod_slice(&ids);
            w.put_pod_slice(&edges);
            w.finish()
        };
        let mut outgoing = vec![Vec::new(); size];
        for (peer, slot) in outgoing.iter_mut().enumerate() {
            if peer != me {
                *slot = query.clone();
            }
        }
        let queries = exchange_all(self.comm, ExchangeTags::from_base(tags::QUERY), &outgoing)?;

        // Answer every query, our own included, with the subset we hold.
        let mut replies = vec![Vec::new(); size];
        let mut own_reply = Vec::new();
        for peer in 0..size {
            let bytes = if peer == me { &query } else { &queries[peer] };
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::QUERY).map_err(fail)?;
            let ids: Vec<NodeId> = r.get_pod_vec().map_err(fail)?;
            let edges: Vec<Edge> = r.get_pod_vec().map_err(fail)?;
            r.done().map_err(fail)?;

            let mut w = ByteWriter::message(kind::MASK);
            let held: Vec<&NodeId> = ids.iter().filter(|id| self.nd.contains(id)).collect();
            w.put_u32(held.len() as u32);
            for id in held {
                w.put_u64(id.get());
                let chares = &self.cn[id];
                w.put_u32(chares.len() as u32);
                for &c in chares {
                    w.put_u64(c);
                }
            }
            let held_edges: Vec<Edge> = edges
                .into_iter()
                .filter(|e| self.ed.contains(e))
                .collect();
            w.put_pod_slice(&held_edges);
            let msg = w.finish();
            if peer == me {
                own_reply = msg;
            } else {
                replies[peer] = msg;
            }
        }
        let masks = exchange_all(self.comm, ExchangeTags::from_base(tags::MASK), &replies)?;

        // Fold the masks in ascending rank order. A node or edge is
        // received from the lowest-ranked fellow PE that also holds it.
        let mut seen_nodes: BTreeSet<NodeId> = BTreeSet::new();
        let mut seen_edges: BTreeSet<Edge> = BTreeSet::new();
        for peer in 0..size {
            let bytes = if peer == me { &own_reply } else { &masks[peer] };
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::MASK).map_err(fail)?;
            let nids = r.get_u32().map_err(fail)?;
            let mut ids = Vec::with_capacity(nids as usize);
            for _ in 0..nids {
                let id = NodeId::new(r.get_u64().map_err(fail)?);
                let nch = r.get_u32().map_err(fail)?;
                let mut chares = Vec::with_capacity(nch as usize);
                for _ in 0..nch {
                    chares.push(r.get_u64().map_err(fail)?);
                }
                ids.push((id, chares));
            }
            let edges: Vec<Edge> = r.get_pod_vec().map_err(fail)?;
            r.done().map_err(fail)?;

            for (id, surrounding) in &ids {
                if !self.nd.contains(id) {
                    return Err(InvariantViolation::UnknownNode { node: *id, rank: me }.into());
                }
                // Chares of ours holding this node border the chares the
                // replying PE reported for it.
                for &c in &self.cn[id] {
                    for &s in surrounding {
                        if s != c {
                            self.msum
                                .entry(c)
                                .or_default()
                                .entry(s)
                                .or_default()
                                .insert(*id);
                        }
                    }
                }
            }
            if peer < me {
                let fresh: BTreeSet<NodeId> = ids
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| seen_nodes.insert(*id))
                    .collect();
                if !fresh.is_empty() {
                    self.ncomm.insert(peer, fresh);
                }
                let mut fresh_edges = BTreeSet::new();
                for edge in &edges {
                    if !self.ed.contains(edge) {
                        return Err(InvariantViolation::UnknownEdge { edge: *edge, rank: me }.into());
                    }
                    if seen_edges.insert(*edge) {
                        fresh_edges.insert(*edge);
                    }
                }
                if !fresh_edges.is_empty() {
                    self.ecomm.insert(peer, fresh_edges);
                }
            }
        }
        if self.feedback {
            log::info!(
                "PE {}: communication maps built ({} node, {} edge entries)",
                me,
                self.ncomm.values().map(|s| s.len()).sum::<usize>(),
                self.ecomm.values().map(|s| s.len()).sum::<usize>()
            );
        }
        Ok(())
    }

    /// Broadcast the uniquely-assigned count and sum the lower ranks'
    /// counts into the local start offset.
    fn offsets(&mut self) -> Result<u64, TetPartError> {
        let nrecv: usize = self.ncomm.values().map(|s| s.len()).sum();
        let erecv: usize = self.ecomm.values().map(|s| s.len()).sum();
        let nuniq = (self.nd.len() - nrecv + self.ed.len() - erecv) as u64;

        let mut w = ByteWriter::message(kind::OFFSET);
        w.put_u64(nuniq);
        let all = crate::comm::exchange::allgather(
            self.comm,
            ExchangeTags::from_base(tags::OFFSET),
            w.finish(),
        )?;
        let mut start = 0u64;
        for (peer, bytes) in all.iter().enumerate() {
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::OFFSET).map_err(fail)?;
            let u = r.get_u64().map_err(fail)?;
            r.done().map_err(fail)?;
            if peer < self.comm.rank() {
                start += u;
            }
        }
        Ok(start)
    }

    /// Number the locally-assigned ids, nodes first then edges, from
    /// `start` in sorted order.
    fn assign(&mut self, start: u64) {
        let mut next = start;
        for &id in &self.nd {
            if !self.ncomm.values().any(|s| s.contains(&id)) {
                self.newnd.insert(id, NodeId::new(next));
                next += 1;
            }
        }
        for &edge in &self.ed {
            if !self.ecomm.values().any(|s| s.contains(&edge)) {
                self.newed.insert(edge, NodeId::new(next));
                next += 1;
            }
        }
        self.range = RowRange {
            lower: start,
            upper: next,
        };
    }

    /// Ask each communication-map PE for the new ids it assigned, answer
    /// the requests addressed to this PE, and merge the replies.
    fn request_new_ids(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        let size = self.comm.size();

        let mut outgoing = vec![Vec::new(); size];
        let peers: BTreeSet<usize> = self
            .ncomm
            .keys()
            .chain(self.ecomm.keys())
            .copied()
            .collect();
        for &peer in &peers {
            let ids: Vec<NodeId> = self
                .ncomm
                .get(&peer)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            let edges: Vec<Edge> = self
                .ecomm
                .get(&peer)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            let mut w = ByteWriter::message(kind::REQUEST);
            w.put_pod_slice(&ids);
            w.put_pod_slice(&edges);
            outgoing[peer] = w.finish();
        }
        let requests = exchange_all(self.comm, ExchangeTags::from_base(tags::REQUEST), &outgoing)?;

        // The assignment is complete, so every queued request can be
        // answered immediately.
        let mut replies = vec![Vec::new(); size];
        for (peer, bytes) in requests.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::REQUEST).map_err(fail)?;
            let ids: Vec<NodeId> = r.get_pod_vec().map_err(fail)?;
            let edges: Vec<Edge> = r.get_pod_vec().map_err(fail)?;
            r.done().map_err(fail)?;

            let mut w = ByteWriter::message(kind::NEW_ORDER);
            w.put_u32(ids.len() as u32);
            for id in ids {
                let new = self.newnd.get(&id).ok_or(if self.nd.contains(&id) {
                    InvariantViolation::Unreordered { node: id, rank: me }
                } else {
                    InvariantViolation::UnknownNode { node: id, rank: me }
                })?;
                w.put_u64(id.get());
                w.put_u64(new.get());
            }
            w.put_u32(edges.len() as u32);
            for edge in edges {
                let new = self.newed.get(&edge).ok_or(if self.ed.contains(&edge) {
                    InvariantViolation::UnreorderedEdge { edge, rank: me }
                } else {
                    InvariantViolation::UnknownEdge { edge, rank: me }
                })?;
                w.put_u64(edge.lo().get());
                w.put_u64(edge.hi().get());
                w.put_u64(new.get());
            }
            replies[peer] = w.finish();
        }
        let orders = exchange_all(self.comm, ExchangeTags::from_base(tags::NEW_ORDER), &replies)?;

        for (peer, bytes) in orders.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::NEW_ORDER).map_err(fail)?;
            let nids = r.get_u32().map_err(fail)?;
            for _ in 0..nids {
                let id = NodeId::new(r.get_u64().map_err(fail)?);
                let new = NodeId::new(r.get_u64().map_err(fail)?);
                if !self.nd.contains(&id) {
                    return Err(InvariantViolation::UnknownNode { node: id, rank: me }.into());
                }
                self.newnd.insert(id, new);
            }
            let nedges = r.get_u32().map_err(fail)?;
            for _ in 0..nedges {
                let lo = NodeId::new(r.get_u64().map_err(fail)?);
                let hi = NodeId::new(r.get_u64().map_err(fail)?);
                let new = NodeId::new(r.get_u64().map_err(fail)?);
                let edge = Edge::new(lo, hi);
                if !self.ed.contains(&edge) {
                    return Err(InvariantViolation::UnknownEdge { edge, rank: me }.into());
                }
                self.newed.insert(edge, new);
            }
            r.done().map_err(fail)?;
        }

        // All local ids must now carry a new id.
        if self.newnd.len() != self.nd.len() {
            let missing = self
                .nd
                .iter()
                .find(|id| !self.newnd.contains_key(id))
                .copied()
                .expect("some node is missing a new id");
            return Err(InvariantViolation::Unreordered {
                node: missing,
                rank: me,
            }
            .into());
        }
        if self.newed.len() != self.ed.len() {
            let missing = self
                .ed
                .iter()
                .find(|e| !self.newed.contains_key(e))
                .copied()
                .expect("some edge is missing a new id");
            return Err(InvariantViolation::UnreorderedEdge {
                edge: missing,
                rank: me,
            }
            .into());
        }
        Ok(())
    }

    /// Chain the exclusive upper bound to the next-higher PE as its lower
    /// bound.
    fn bounds(&mut self, start: u64) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        let size = self.comm.size();
        if me < size - 1 {
            let mut w = ByteWriter::message(kind::BOUNDS);
            w.put_u64(self.range.upper);
            send_fixed(self.comm, me + 1, tags::BOUNDS, &w.finish());
        }
        let lower = if me == 0 {
            0
        } else {
            let bytes = recv_fixed(self.comm, me - 1, tags::BOUNDS, 16)?;
            let fail = |what| InvariantViolation::WireDecode { peer: me - 1, what };
            let mut r = ByteReader::message(&bytes, kind::BOUNDS).map_err(fail)?;
            let lower = r.get_u64().map_err(fail)?;
            r.done().map_err(fail)?;
            lower
        };
        debug_assert_eq!(lower, start, "bound chain must agree with the offsets");
        self.range.lower = lower;
        Ok(())
    }

    /// New linear id of a file id (tests and diagnostics).
    pub fn new_id(&self, old: NodeId) -> Option<NodeId> {
        self.newnd.get(&old).copied()
    }

    /// New linear id of a refined edge (tests and diagnostics).
    pub fn edge_id(&self, edge: Edge) -> Option<NodeId> {
        self.newed.get(&edge).copied()
    }

    /// Rebuild the owned chares in linear-id space and release all
    /// renumbering state.
    ///
    /// With refinement, each parent tet becomes its eight children here;
    /// the surrounding-chare sets gain the edge-nodes whose endpoints both
    /// lie on the respective shared boundary.
    pub fn into_workers(mut self) -> Result<(Vec<WorkUnit>, RowRange), TetPartError> {
        let me = self.comm.rank();
        let refined = !self.chunk.edgenodes.is_empty();
        let node = std::mem::take(&mut self.chunk.node);
        let owned = self.chunk.dist.owned_by(me);
        let mut workers = Vec::with_capacity(node.len());

        for (chare, conn) in node {
            if !owned.contains(&chare) {
                return Err(InvariantViolation::ForeignChare { chare, rank: me }.into());
            }
            let mut node_map = BTreeMap::new();
            let mut old_to_new = BTreeMap::new();
            for &old in &conn {
                let new = *self
                    .newnd
                    .get(&old)
                    .ok_or(InvariantViolation::Unreordered { node: old, rank: me })?;
                node_map.insert(new, old);
                old_to_new.insert(old, new);
            }

            let mut edge_nodes = BTreeMap::new();
            if let Some(en) = self.chunk.chedgenodes.get(&chare) {
                for (&edge, _) in en {
                    let new = *self
                        .newed
                        .get(&edge)
                        .ok_or(InvariantViolation::UnreorderedEdge { edge, rank: me })?;
                    edge_nodes.insert(edge, new);
                }
            }

            let mut new_conn: Vec<Tet> = Vec::new();
            for tet in conn.chunks_exact(4) {
                let parent: Tet = [tet[0], tet[1], tet[2], tet[3]];
                let corners = parent.map(|old| old_to_new[&old]);
                if refined {
                    let mut mids = [NodeId::new(0); 6];
                    for (k, (i, j)) in crate::mesh::TET_EDGES.into_iter().enumerate() {
                        mids[k] = edge_nodes[&Edge::new(parent[i], parent[j])];
                    }
                    new_conn.extend(template(corners, mids));
                } else {
                    new_conn.push(corners);
                }
            }

            let mut surrounding = BTreeMap::new();
            if let Some(nbrs) = self.msum.get(&chare) {
                for (&nbr, shared_old) in nbrs {
                    let mut shared_new = BTreeSet::new();
                    for &old in shared_old {
                        shared_new.insert(*self.newnd.get(&old).ok_or(
                            InvariantViolation::Unreordered { node: old, rank: me },
                        )?);
                    }
                    // An edge whose endpoints both sit on this shared
                    // boundary puts its edge-node on the boundary too.
                    for (&edge, &new) in &edge_nodes {
                        if shared_old.contains(&edge.lo()) && shared_old.contains(&edge.hi()) {
                            shared_new.insert(new);
                        }
                    }
                    surrounding.insert(nbr, shared_new);
                }
            }

            let mut coords = BTreeMap::new();
            for (&new, &old) in &node_map {
                if let Some(&c) = self.chunk.coord.get(&old) {
                    coords.insert(new, c);
                }
            }
            for (&edge, &new) in &edge_nodes {
                if let Some(&c) = self.chunk.edge_coords.get(&edge) {
                    coords.insert(new, c);
                }
            }

            workers.push(WorkUnit {
                id: chare,
                conn: new_conn,
                node_map,
                old_to_new,
                edge_nodes,
                surrounding,
                coords,
            });
        }
        Ok((workers, self.range))
    }
}
