//! Unified error types for the tet-part public APIs.
//!
//! The taxonomy mirrors how failures are handled: [`InputError`] and
//! [`ConfigError`] are reported at startup and terminate the job before any
//! parallel work begins; [`InvariantViolation`] marks a programming error
//! detected at an observable synchronization point and is fatal;
//! [`SolverError`] is surfaced to the caller, which may retry with adjusted
//! parameters outside this crate.

use crate::mesh::{Edge, NodeId};
use thiserror::Error;

/// Top-level error type for tet-part operations.
#[derive(Debug, Error)]
pub enum TetPartError {
    /// Mesh file missing, corrupt, or inconsistent with declared counts.
    #[error(transparent)]
    Input(#[from] InputError),
    /// Configuration rejected before any parallel work began.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A distributed invariant was broken; this is a programming error.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// The external sparse solver failed.
    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Errors while reading the input mesh file.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("mesh i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a tet mesh file (bad magic)")]
    BadMagic,
    #[error("unsupported mesh file version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("mesh file truncated: {what}")]
    Truncated { what: &'static str },
    #[error("element block {block} out of range ({nblock} blocks in file)")]
    BlockOutOfRange { block: usize, nblock: usize },
    #[error("element range {from}..{till} out of range ({nelem} elements)")]
    ElemOutOfRange { from: u64, till: u64, nelem: u64 },
    #[error("connectivity references node {node} but the file declares {nnode} nodes")]
    NodeOutOfRange { node: NodeId, nnode: u64 },
}

/// Errors detected while validating the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("virtualization factor {0} outside [0,1]")]
    VirtualizationOutOfRange(f64),
    #[error("number of scalar components must be at least 1")]
    ZeroComponents,
    #[error(
        "over-decomposition: {nchare} work units requested for {nelem} mesh elements; \
         at least one work unit would have no elements. Decrease the virtualization \
         factor or the number of PEs"
    )]
    OverDecomposition { nchare: u64, nelem: u64 },
    #[error("partitioning algorithm {0:?} is not supported in this build")]
    UnsupportedAlgorithm(crate::config::PartitionAlgorithm),
}

/// A broken distributed invariant. Always fatal; never retried.
///
/// Each variant carries the offending datum and the PE that detected it.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("PE {rank} received a reply naming node {node} it does not hold")]
    UnknownNode { node: NodeId, rank: usize },
    #[error("PE {rank} received a reply naming edge {edge} it does not hold")]
    UnknownEdge { edge: Edge, rank: usize },
    #[error("PE {rank} was sent chare {chare} which it does not own")]
    ForeignChare { chare: u64, rank: usize },
    #[error("node {node} has no reordered id on PE {rank}")]
    Unreordered { node: NodeId, rank: usize },
    #[error("edge {edge} has no reordered id on PE {rank}")]
    UnreorderedEdge { edge: Edge, rank: usize },
    #[error("row ids incomplete on PE {rank}: expected {expected} owned rows, have {got}")]
    RowsIncomplete { expected: u64, got: u64, rank: usize },
    #[error("{quantity} import map incomplete on PE {rank}")]
    ImportIncomplete { quantity: &'static str, rank: usize },
    #[error("row {row} outside every PE row range (PE {rank})")]
    RowUnowned { row: NodeId, rank: usize },
    #[error("conflicting Dirichlet values for row {row} component {component}")]
    ConflictingBc { row: NodeId, component: usize },
    #[error("boundary-condition row {row} missing from lhs on PE {rank}")]
    BcRowMissing { row: NodeId, rank: usize },
    #[error("row key sets of rhs and low-order vectors differ on PE {rank}")]
    LowOrderKeyMismatch { rank: usize },
    #[error("malformed message from PE {peer}: {what}")]
    WireDecode { peer: usize, what: &'static str },
    #[error("communication with PE {peer} failed: {what}")]
    Comm { peer: usize, what: &'static str },
}

/// Failures reported by the external sparse solver.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("linear solve did not converge after {iterations} iterations (residual {residual})")]
    NotConverged { iterations: usize, residual: f64 },
    #[error("numerical breakdown: zero pivot at row {row}")]
    ZeroPivot { row: usize },
    #[error("solver buffers inconsistent: {what}")]
    Inconsistent { what: &'static str },
}

impl TetPartError {
    /// Error category, as printed in the single user-visible failure line.
    pub fn category(&self) -> &'static str {
        match self {
            TetPartError::Input(_) => "input",
            TetPartError::Config(_) => "config",
            TetPartError::Invariant(_) => "invariant",
            TetPartError::Solver(_) => "solver",
        }
    }
}

/// Emit the single user-visible failure line for `err` as detected on `rank`.
///
/// The embedding binary is expected to tear down all branches and exit
/// non-zero after calling this.
pub fn report_fatal(err: &TetPartError, rank: usize) {
    log::error!("[{}] PE {}: {}", err.category(), rank, err);
    eprintln!("tet-part error [{}] on PE {}: {}", err.category(), rank, err);
}
