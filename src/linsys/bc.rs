//! Dirichlet boundary-condition table.
//!
//! Chares contribute `(active, value)` pairs per component at the rows they
//! can set conditions on; the tables are merged across all PEs with per-row
//! union so that every PE holds the identical, complete table. Two chares
//! claiming different values for the same active component is a programming
//! error.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::exchange::allgather;
use crate::comm::wire::{kind, ByteReader, ByteWriter};
use crate::error::InvariantViolation;
use crate::mesh::NodeId;
use std::collections::BTreeMap;

/// Per-row Dirichlet data: one `(active, value)` pair per component.
pub type BcRow = Vec<(bool, f64)>;

/// Replicated Dirichlet table keyed by linear row id.
#[derive(Clone, Debug, Default)]
pub struct BcTable {
    ncomp: usize,
    map: BTreeMap<NodeId, BcRow>,
}

impl BcTable {
    pub fn new(ncomp: usize) -> Self {
        Self {
            ncomp,
            map: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn get(&self, row: NodeId) -> Option<&BcRow> {
        self.map.get(&row)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &BcRow)> {
        self.map.iter()
    }

    /// Merge one row's pairs into the table.
    ///
    /// Per-component union: an inactive contribution never clears an active
    /// one, and two active contributions must agree on the value.
    pub fn insert(&mut self, row: NodeId, comps: &[(bool, f64)]) -> Result<(), InvariantViolation> {
        debug_assert_eq!(comps.len(), self.ncomp, "one pair per component");
        let entry = self
            .map
            .entry(row)
            .or_insert_with(|| vec![(false, 0.0); self.ncomp]);
        for (component, (have, give)) in entry.iter_mut().zip(comps).enumerate() {
            if give.0 {
                if have.0 && have.1 != give.1 {
                    return Err(InvariantViolation::ConflictingBc { row, component });
                }
                *have = *give;
            }
        }
        Ok(())
    }

    /// Merge every PE's table so each ends up with the identical union.
    pub fn allreduce<C: Communicator>(
        &self,
        comm: &C,
        tags: ExchangeTags,
    ) -> Result<BcTable, InvariantViolation> {
        let mut w = ByteWriter::message(kind::BC);
        w.put_u32(self.map.len() as u32);
        for (row, comps) in &self.map {
            w.put_u64(row.get());
            for &(active, value) in comps {
                w.put_u32(active as u32);
                w.put_f64(value);
            }
        }
        let all = allgather(comm, tags, w.finish())?;

        let mut merged = BcTable::new(self.ncomp);
        for (peer, bytes) in all.iter().enumerate() {
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::BC).map_err(fail)?;
            let nrows = r.get_u32().map_err(fail)?;
            for _ in 0..nrows {
                let row = NodeId::new(r.get_u64().map_err(fail)?);
                let mut comps = Vec::with_capacity(self.ncomp);
                for _ in 0..self.ncomp {
                    let active = r.get_u32().map_err(fail)? != 0;
                    let value = r.get_f64().map_err(fail)?;
                    comps.push((active, value));
                }
                merged.insert(row, &comps)?;
            }
            r.done().map_err(fail)?;
        }
        Ok(merged)
    }
}
