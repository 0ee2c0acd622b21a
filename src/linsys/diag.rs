//! Solution diagnostics: volume-weighted norms of the numerical solution
//! and of its error against an analytical solution.
//!
//! Per row the store keeps `(numerical, analytical, volume)`. Cross-PE
//! merge semantics at shared nodes: overwrite for the solutions (a single
//! chare contributes each row after renumbering), sum for the volumes.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::reduce::{allreduce_max, allreduce_sum};
use crate::dist::RowRange;
use crate::error::InvariantViolation;
use crate::mesh::NodeId;
use std::collections::BTreeMap;

/// One row's diagnostics contribution.
#[derive(Clone, Debug)]
pub struct DiagRow {
    pub num: Vec<f64>,
    pub ana: Vec<f64>,
    pub vol: f64,
}

/// Per-PE accumulator of diagnostics rows.
#[derive(Clone, Debug, Default)]
pub struct DiagStore {
    map: BTreeMap<NodeId, DiagRow>,
}

/// Final norms per component, identical on every PE after reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostics {
    /// L2 of the numerical solution.
    pub l2_sol: Vec<f64>,
    /// L2 of numerical minus analytical.
    pub l2_err: Vec<f64>,
    /// Linf of numerical minus analytical.
    pub linf_err: Vec<f64>,
}

impl DiagStore {
    /// Overwrite the solutions, sum the volume.
    pub fn update(&mut self, row: NodeId, num: Vec<f64>, ana: Vec<f64>, vol: f64) {
        let ncomp = num.len();
        let d = self.map.entry(row).or_insert_with(|| DiagRow {
            num: vec![0.0; ncomp],
            ana: vec![0.0; ncomp],
            vol: 0.0,
        });
        d.num = num;
        d.ana = ana;
        d.vol += vol;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &DiagRow)> {
        self.map.iter()
    }

    /// Reduce the norms across all PEs. Rows outside the owned range are
    /// skipped so every node counts exactly once globally.
    pub fn reduce<C: Communicator>(
        &self,
        comm: &C,
        sum_tags: ExchangeTags,
        max_tags: ExchangeTags,
        range: RowRange,
        ncomp: usize,
    ) -> Result<Diagnostics, InvariantViolation> {
        let mut l2_sol = vec![0.0; ncomp];
        let mut l2_err = vec![0.0; ncomp];
        let mut linf = vec![0.0; ncomp];
        for (row, d) in &self.map {
            if !range.contains(row.get()) {
                continue;
            }
            for c in 0..ncomp {
                l2_sol[c] += d.num[c] * d.num[c] * d.vol;
                l2_err[c] += (d.num[c] - d.ana[c]) * (d.num[c] - d.ana[c]) * d.vol;
                let err = (d.num[c] - d.ana[c]).abs();
                if err > linf[c] {
                    linf[c] = err;
                }
            }
        }
        let mut sums = l2_sol;
        sums.extend(l2_err);
        let sums = allreduce_sum(comm, sum_tags, &sums)?;
        let linf = allreduce_max(comm, max_tags, &linf)?;
        Ok(Diagnostics {
            l2_sol: sums[..ncomp].iter().map(|v| v.sqrt()).collect(),
            l2_err: sums[ncomp..].iter().map(|v| v.sqrt()).collect(),
            linf_err: linf,
        })
    }
}
