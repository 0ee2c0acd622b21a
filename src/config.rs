//! Immutable run configuration.
//!
//! A [`Config`] is built once at process start, validated, and then only read.
//! There is no global mutable state; every component borrows the record.

use crate::error::{ConfigError, TetPartError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Mesh partitioning algorithm selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PartitionAlgorithm {
    /// Recursive coordinate bisection on element centroids.
    Rcb,
    /// Recursive inertial bisection on element centroids.
    Rib,
    /// Hilbert space-filling-curve ordering of element centroids.
    Hsfc,
    /// Greedy growing on the element face-adjacency graph.
    Graph,
}

impl PartitionAlgorithm {
    /// Whether the algorithm consumes element centroids (as opposed to the
    /// element adjacency graph).
    pub fn geometric(self) -> bool {
        !matches!(self, PartitionAlgorithm::Graph)
    }
}

/// Policy for the right-hand side at Dirichlet rows.
///
/// Solvers formulated for the full unknown put the boundary value into the
/// rhs; increment-form solvers put zero (no increment at a held node).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BcPolicy {
    /// `rhs[r][i] = bc_value[i]` at constrained components.
    Value,
    /// `rhs[r][i] = 0` at constrained components.
    Increment,
}

/// Immutable configuration record for a tet-part run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path of the input mesh file.
    pub mesh: PathBuf,
    /// Desired degree of virtualization, in `[0,1]`. Zero yields one work
    /// unit per PE; larger values yield proportionally more work units.
    pub virtualization: f64,
    /// Target number of work units per PE at full virtualization.
    pub chares_per_pe: f64,
    /// Partitioning algorithm.
    pub algorithm: PartitionAlgorithm,
    /// Seed for partitioners that make seeded choices. A fixed seed makes
    /// the element-to-chare assignment reproducible.
    pub seed: u64,
    /// Perform one pass of uniform 1:8 refinement after distribution.
    pub refine: bool,
    /// Number of scalar components per mesh node in the linear system.
    pub ncomp: usize,
    /// Right-hand-side policy at Dirichlet rows.
    pub bc_policy: BcPolicy,
    /// Emit per-phase progress reports through the `log` facade.
    pub feedback: bool,
}

impl Config {
    /// Configuration with defaults for everything but the mesh path.
    pub fn new(mesh: impl Into<PathBuf>) -> Self {
        Self {
            mesh: mesh.into(),
            virtualization: 0.0,
            chares_per_pe: 1.0,
            algorithm: PartitionAlgorithm::Rcb,
            seed: 0,
            refine: false,
            ncomp: 1,
            bc_policy: BcPolicy::Increment,
            feedback: false,
        }
    }

    /// Validate the record, consuming it.
    pub fn validated(self) -> Result<Self, TetPartError> {
        if !(0.0..=1.0).contains(&self.virtualization) {
            return Err(ConfigError::VirtualizationOutOfRange(self.virtualization).into());
        }
        if self.ncomp == 0 {
            return Err(ConfigError::ZeroComponents.into());
        }
        Ok(self)
    }

    /// Total number of work units for `npes` processing elements.
    ///
    /// `max(npes, round((1+u) * npes * chares_per_pe))`; at least one work
    /// unit per PE is always produced.
    pub fn nchare(&self, npes: usize) -> u64 {
        let want = ((1.0 + self.virtualization) * npes as f64 * self.chares_per_pe).round() as u64;
        want.max(npes as u64)
    }
}
