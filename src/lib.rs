//! # tet-part
//!
//! tet-part is a distributed mesh partitioner and linear-system merger for
//! unstructured-tetrahedral PDE codes. Given a tetrahedral mesh file and a
//! degree of over-decomposition, it reads a contiguous slab of the mesh on
//! each processing element (PE), partitions the elements into many more
//! work-units than PEs, migrates element/node ownership to the PE owning
//! each work-unit, optionally performs one pass of uniform 1:8 refinement
//! with consistent edge-node identity across PE boundaries, renumbers mesh
//! nodes so each PE owns a contiguous block of row ids, and merges
//! per-work-unit contributions into a row-partitioned sparse linear system
//! with Dirichlet boundary-condition enforcement.
//!
//! ## Features
//! - Pluggable communication backends (serial, intra-process threads) behind
//!   a non-blocking [`Communicator`](comm::communicator::Communicator) trait
//! - Geometric (RCB, RIB, HSFC) and graph partitioning of element slabs
//! - Distributed node reordering with request/reply resolution of ids owned
//!   by fellow PEs, for both mesh nodes and refinement edge-nodes
//! - Row-range linear-system merging with per-quantity import-map completion
//!   tracking and a dual high-order / low-order (flux-corrected transport)
//!   solve cycle
//! - Volume-weighted solution diagnostics (L2, L2-error, Linf-error)
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! tet-part = "0.1"
//! # Optional features:
//! # features = ["rayon"]
//! ```
//!
//! The per-PE entry point is [`driver::setup`], which runs the full
//! read-partition-distribute-refine-renumber pipeline and hands back the
//! work-units and owned row range for this PE. The PDE-specific kernels,
//! mesh writers, and the sparse solve itself are external collaborators;
//! the solver is consumed through the [`linsys::backend::SparseBackend`]
//! trait, which accepts 1-based row/column/value triplets.

pub mod comm;
pub mod config;
pub mod dist;
pub mod driver;
pub mod error;
pub mod io;
pub mod linsys;
pub mod mesh;
pub mod partitioning;

/// A convenient prelude importing the most-used types.
pub mod prelude {
    pub use crate::comm::communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};
    pub use crate::config::{BcPolicy, Config, PartitionAlgorithm};
    pub use crate::dist::worker::WorkUnit;
    pub use crate::dist::RowRange;
    pub use crate::driver::{setup, Setup};
    pub use crate::error::{ConfigError, InputError, InvariantViolation, SolverError, TetPartError};
    pub use crate::linsys::backend::{DenseBackend, SparseBackend};
    pub use crate::linsys::solver::SolverBranch;
    pub use crate::mesh::{Edge, NodeId, Tet};
}
