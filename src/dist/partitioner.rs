//! Per-PE partitioner branch: slab intake, element-to-chare partitioning,
//! ownership migration, and optional uniform refinement.
//!
//! One branch runs on every PE. The phases are driven in order by
//! [`crate::driver::setup`]; each phase completes a symmetric exchange with
//! the fellow branches before the next begins, so no arrival-order
//! assumptions are made anywhere.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::exchange::exchange_all;
use crate::comm::wire::{kind, ByteReader, ByteWriter};
use crate::config::Config;
use crate::dist::{tags, ChareDist};
use crate::error::{InvariantViolation, TetPartError};
use crate::io::TetFile;
use crate::mesh::refine::{synthesize_edge_nodes, EdgeNodes};
use crate::mesh::{centroid, midpoint, unique_nodes, Edge, NodeId, Tet};
use crate::partitioning::partition_mesh;
use std::collections::BTreeMap;

/// Chare-owned mesh state handed from the partitioner to the renumberer.
pub struct MeshChunk {
    /// Connectivity (file ids, four per tet) of every chare this PE owns.
    pub node: BTreeMap<u64, Vec<NodeId>>,
    /// Coordinates for every file id referenced by an owned chare.
    pub coord: BTreeMap<NodeId, [f64; 3]>,
    /// Provisional edge-node ids per unique local edge (empty when no
    /// refinement was performed).
    pub edgenodes: EdgeNodes,
    /// Midpoint coordinates per refined edge.
    pub edge_coords: BTreeMap<Edge, [f64; 3]>,
    /// Edge-node ids restricted to each owned chare's tets.
    pub chedgenodes: BTreeMap<u64, EdgeNodes>,
    /// Chare placement.
    pub dist: ChareDist,
}

/// Per-PE partitioner branch state.
pub struct Partitioner<'a, C: Communicator> {
    cfg: &'a Config,
    comm: &'a C,
    dist: ChareDist,
    nnode_file: u64,
    /// This PE's slab of tet connectivity, in file element order.
    tetinpoel: Vec<Tet>,
    /// Global element ids of the slab.
    gelemid: Vec<u64>,
    /// Connectivity of owned chares, keyed by chare id.
    node: BTreeMap<u64, Vec<NodeId>>,
    coord: BTreeMap<NodeId, [f64; 3]>,
    edgenodes: EdgeNodes,
    edge_coords: BTreeMap<Edge, [f64; 3]>,
    chedgenodes: BTreeMap<u64, EdgeNodes>,
}

impl<'a, C: Communicator> Partitioner<'a, C> {
    /// Read this PE's contiguous slab of the mesh graph from the file.
    ///
    /// The reader itself does not synchronize with peers.
    pub fn new(
        cfg: &'a Config,
        comm: &'a C,
        file: &mut TetFile,
        nchare: u64,
    ) -> Result<Self, TetPartError> {
        let (tetinpoel, gelemid) = file.read_slab(comm.rank(), comm.size())?;
        if cfg.feedback {
            log::info!(
                "PE {}: read {} elements of the mesh graph",
                comm.rank(),
                gelemid.len()
            );
        }
        Ok(Self {
            cfg,
            comm,
            dist: ChareDist::new(nchare, comm.size()),
            nnode_file: file.header().nnode,
            tetinpoel,
            gelemid,
            node: BTreeMap::new(),
            coord: BTreeMap::new(),
            edgenodes: EdgeNodes::new(),
            edge_coords: BTreeMap::new(),
            chedgenodes: BTreeMap::new(),
        })
    }

    /// Partition the slab into chares and group connectivity by chare id.
    ///
    /// Element centroids (for the geometric algorithms) are computed here
    /// and released as soon as the assignment is known.
    pub fn partition(&mut self, file: &mut TetFile) -> Result<(), TetPartError> {
        let centroids = if self.cfg.algorithm.geometric() {
            self.compute_centroids(file)?
        } else {
            Vec::new()
        };
        let che = partition_mesh(
            self.cfg.algorithm,
            &centroids,
            &self.tetinpoel,
            self.dist.nchare(),
            self.cfg.seed,
            tags::PARTITION,
            self.comm,
        )?;
        drop(centroids);
        debug_assert_eq!(che.len(), self.gelemid.len());
        if self.cfg.feedback {
            log::info!("PE {}: mesh partitioned", self.comm.rank());
        }

        // Categorize global mesh node ids of elements by chare.
        for (e, tet) in self.tetinpoel.iter().enumerate() {
            self.node.entry(che[e]).or_default().extend_from_slice(tet);
        }
        // Element connectivity and ids are no longer needed once grouped.
        self.tetinpoel = Vec::new();
        self.gelemid = Vec::new();
        Ok(())
    }

    fn compute_centroids(&mut self, file: &mut TetFile) -> Result<Vec<[f64; 3]>, TetPartError> {
        let flat: Vec<NodeId> = self.tetinpoel.iter().flatten().copied().collect();
        let gid = unique_nodes(&flat);
        let coords = file.read_coords(&gid)?;
        for (id, c) in gid.iter().zip(coords) {
            self.coord.insert(*id, c);
        }
        let mut out = Vec::with_capacity(self.tetinpoel.len());
        for tet in &self.tetinpoel {
            out.push(centroid([
                self.coord[&tet[0]],
                self.coord[&tet[1]],
                self.coord[&tet[2]],
                self.coord[&tet[3]],
            ]));
        }
        Ok(out)
    }

    /// Migrate chare connectivity to the PEs owning each chare.
    ///
    /// Entries for chares owned locally are kept; the rest are exported in
    /// one batched message per destination PE. The round completes when
    /// every peer has received its exports. Coordinates for the resulting
    /// owned node set are then read from the file.
    pub fn distribute(&mut self, file: &mut TetFile) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        let mut exports: BTreeMap<usize, Vec<(u64, Vec<NodeId>)>> = BTreeMap::new();
        let owned = self.dist.owned_by(me);
        let node = std::mem::take(&mut self.node);
        for (chare, ids) in node {
            if owned.contains(&chare) {
                self.node.insert(chare, ids);
            } else {
                exports
                    .entry(self.dist.pe_of(chare))
                    .or_default()
                    .push((chare, ids));
            }
        }

        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, chares) in exports {
            let mut w = ByteWriter::message(kind::CHARE_NODES);
            w.put_u32(chares.len() as u32);
            for (chare, ids) in chares {
                w.put_u64(chare);
                w.put_pod_slice(&ids);
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tags::CHARE_NODES), &outgoing)?;

        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::CHARE_NODES).map_err(fail)?;
            let nch = r.get_u32().map_err(fail)?;
            for _ in 0..nch {
                let chare = r.get_u64().map_err(fail)?;
                let ids: Vec<NodeId> = r.get_pod_vec().map_err(fail)?;
                if !owned.contains(&chare) {
                    return Err(InvariantViolation::ForeignChare { chare, rank: me }.into());
                }
                self.node.entry(chare).or_default().extend(ids);
            }
            r.done().map_err(fail)?;
        }
        if self.cfg.feedback {
            log::info!("PE {}: chare connectivity distributed", me);
        }

        // Coordinates for the owned node set; ids received from peers may
        // fall outside the slab read at startup.
        let flat: Vec<NodeId> = self.node.values().flatten().copied().collect();
        let missing: Vec<NodeId> = unique_nodes(&flat)
            .into_iter()
            .filter(|id| !self.coord.contains_key(id))
            .collect();
        let coords = file.read_coords(&missing)?;
        for (id, c) in missing.iter().zip(coords) {
            self.coord.insert(*id, c);
        }
        Ok(())
    }

    /// One pass of uniform 1:8 refinement over the owned chares.
    ///
    /// Synthesizes an edge-node with a provisional id for every unique
    /// local edge, starting the counter at the file node count, and records
    /// per-chare edge-node maps plus midpoint coordinates. Connectivity is
    /// rewritten to the eight-child template only after renumbering, when
    /// globally consistent ids are known.
    pub fn refine(&mut self) {
        let flat: Vec<NodeId> = self.node.values().flatten().copied().collect();
        self.edgenodes = synthesize_edge_nodes(&flat, self.nnode_file);
        for (&edge, _) in &self.edgenodes {
            self.edge_coords.insert(
                edge,
                midpoint(self.coord[&edge.lo()], self.coord[&edge.hi()]),
            );
        }
        for (&chare, conn) in &self.node {
            let en = self.chedgenodes.entry(chare).or_default();
            for tet in conn.chunks_exact(4) {
                for (i, j) in crate::mesh::TET_EDGES {
                    let e = Edge::new(tet[i], tet[j]);
                    en.insert(e, self.edgenodes[&e]);
                }
            }
        }
        if self.cfg.feedback {
            log::info!(
                "PE {}: uniform refinement added {} edge-nodes",
                self.comm.rank(),
                self.edgenodes.len()
            );
        }
    }

    /// Total number of original nodes in the mesh file.
    pub fn nnode_file(&self) -> u64 {
        self.nnode_file
    }

    /// Hand the chare-owned mesh state to the renumberer.
    pub fn into_chunk(self) -> MeshChunk {
        MeshChunk {
            node: self.node,
            coord: self.coord,
            edgenodes: self.edgenodes,
            edge_coords: self.edge_coords,
            chedgenodes: self.chedgenodes,
            dist: self.dist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::config::PartitionAlgorithm;

    fn n(i: u64) -> NodeId {
        NodeId::new(i)
    }

    fn write_two_tets(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("two.tet");
        let blocks = vec![vec![
            [n(0), n(1), n(2), n(3)],
            [n(1), n(2), n(3), n(4)],
        ]];
        let coords = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
        ];
        TetFile::create(&path, &blocks, &coords).unwrap();
        path
    }

    #[test]
    fn serial_partition_groups_all_elements() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_two_tets(dir.path());
        let cfg = Config::new(&path).validated().unwrap();
        let comm = NoComm;
        let mut file = TetFile::open(&path).unwrap();
        let mut part = Partitioner::new(&cfg, &comm, &mut file, 1).unwrap();
        part.partition(&mut file).unwrap();
        part.distribute(&mut file).unwrap();
        let chunk = part.into_chunk();
        assert_eq!(chunk.node.len(), 1);
        assert_eq!(chunk.node[&0].len(), 8);
        assert_eq!(chunk.coord.len(), 5);
    }

    #[test]
    fn serial_refine_synthesizes_nine_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_two_tets(dir.path());
        let mut cfg = Config::new(&path);
        cfg.refine = true;
        cfg.algorithm = PartitionAlgorithm::Graph;
        let cfg = cfg.validated().unwrap();
        let comm = NoComm;
        let mut file = TetFile::open(&path).unwrap();
        let mut part = Partitioner::new(&cfg, &comm, &mut file, 1).unwrap();
        part.partition(&mut file).unwrap();
        part.distribute(&mut file).unwrap();
        part.refine();
        let chunk = part.into_chunk();
        // Two tets sharing a face: 9 unique edges, provisional ids 5..14.
        assert_eq!(chunk.edgenodes.len(), 9);
        assert!(chunk.edgenodes.values().all(|v| v.get() >= 5 && v.get() < 14));
        // The shared-face tet edges appear in the single chare's map.
        assert_eq!(chunk.chedgenodes[&0].len(), 9);
        // Midpoint coordinate of edge 0-1.
        let e = Edge::new(n(0), n(1));
        assert_eq!(chunk.edge_coords[&e], [0.5, 0.0, 0.0]);
    }
}
