//! Per-PE row-range solver branch.
//!
//! One branch runs on every PE and owns the contiguous row range handed
//! over by the renumbering. Work-units contribute row-indexed values for
//! the solution, the lhs matrix, the rhs vector, and the two auxiliary
//! low-order vectors of the flux-corrected-transport system; rows outside
//! the local range are forwarded to the owning branch. Sum across
//! contributors is the merge semantic for lhs, rhs, lowrhs and lowlhs;
//! overwrite for the solution (one contributor per row after renumbering).
//!
//! Completion of each quantity is detected by comparing its import map
//! against the authoritative row import map built during the one-time row
//! exchange; a mismatch at an observable synchronization point is a
//! programming error and fatal.
//!
//! The per-time-step cycle is: contribute and exchange the five
//! quantities, merge and apply boundary conditions, fill and drive the
//! external sparse backend, solve the diagonal low-order system locally,
//! scatter both solutions back to the contributing work-units, and re-arm
//! with [`SolverBranch::enable_wait4rhs`] for the next step (which keeps
//! the lhs, the low-order lhs and the row partitioning).

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::exchange::exchange_all;
use crate::comm::wire::{kind, ByteReader, ByteWriter};
use crate::config::BcPolicy;
use crate::dist::{ChareDist, RowRange};
use crate::error::{InvariantViolation, SolverError, TetPartError};
use crate::linsys::backend::{SolveStats, SparseBackend};
use crate::linsys::bc::{BcRow, BcTable};
use crate::linsys::diag::{DiagStore, Diagnostics};
use crate::linsys::tags;
use crate::mesh::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Import map: row ids received per contributing chare.
type ImportMap = BTreeMap<u64, Vec<NodeId>>;
/// Row-keyed vector store (one value per component).
type VecStore = BTreeMap<NodeId, Vec<f64>>;
/// Row- and column-keyed matrix store.
type MatStore = BTreeMap<NodeId, BTreeMap<NodeId, Vec<f64>>>;

/// Buffered exports: destination PE -> chare -> entries.
type ExpVec = BTreeMap<usize, BTreeMap<u64, Vec<(NodeId, Vec<f64>)>>>;
type ExpMat = BTreeMap<usize, BTreeMap<u64, Vec<(NodeId, Vec<(NodeId, Vec<f64>)>)>>>;
type ExpRows = BTreeMap<usize, BTreeMap<u64, Vec<NodeId>>>;
type ExpDiag = BTreeMap<usize, BTreeMap<u64, Vec<(NodeId, Vec<f64>, Vec<f64>, f64)>>>;

/// Values scattered back to one work-unit: `(row, components)` pairs.
pub type ChareUpdate = Vec<(NodeId, Vec<f64>)>;

/// Per-PE linear-system merger branch.
pub struct SolverBranch<'a, C: Communicator> {
    comm: &'a C,
    ncomp: usize,
    bc_policy: BcPolicy,
    dist: ChareDist,
    range: RowRange,
    /// Row ranges of every PE, rank-indexed.
    div: Vec<RowRange>,
    /// Number of chares expected to check in on this PE.
    nchare_expected: usize,
    /// Chares that have contributed their rows.
    myworker: Vec<u64>,

    rowimport: ImportMap,
    solimport: ImportMap,
    lhsimport: ImportMap,
    rhsimport: ImportMap,
    lowrhsimport: ImportMap,
    lowlhsimport: ImportMap,
    diagimport: ImportMap,

    /// Owned global row ids.
    row: BTreeSet<NodeId>,
    sol: VecStore,
    lhs: MatStore,
    rhs: VecStore,
    lowrhs: VecStore,
    lowlhs: VecStore,
    /// Low-order solution, rebuilt each step.
    lowsol: VecStore,
    diag: DiagStore,
    bc: BcTable,

    exp_rows: ExpRows,
    exp_sol: ExpVec,
    exp_rhs: ExpVec,
    exp_lowrhs: ExpVec,
    exp_lowlhs: ExpVec,
    exp_lhs: ExpMat,
    exp_diag: ExpDiag,
}

impl<'a, C: Communicator> SolverBranch<'a, C> {
    pub fn new(
        comm: &'a C,
        ncomp: usize,
        bc_policy: BcPolicy,
        dist: ChareDist,
        range: RowRange,
    ) -> Self {
        Self {
            comm,
            ncomp,
            bc_policy,
            dist,
            range,
            div: Vec::new(),
            nchare_expected: 0,
            myworker: Vec::new(),
            rowimport: ImportMap::new(),
            solimport: ImportMap::new(),
            lhsimport: ImportMap::new(),
            rhsimport: ImportMap::new(),
            lowrhsimport: ImportMap::new(),
            lowlhsimport: ImportMap::new(),
            diagimport: ImportMap::new(),
            row: BTreeSet::new(),
            sol: VecStore::new(),
            lhs: MatStore::new(),
            rhs: VecStore::new(),
            lowrhs: VecStore::new(),
            lowlhs: VecStore::new(),
            lowsol: VecStore::new(),
            diag: DiagStore::default(),
            bc: BcTable::new(ncomp),
            exp_rows: ExpRows::new(),
            exp_sol: ExpVec::new(),
            exp_rhs: ExpVec::new(),
            exp_lowrhs: ExpVec::new(),
            exp_lowlhs: ExpVec::new(),
            exp_lhs: ExpMat::new(),
            exp_diag: ExpDiag::new(),
        }
    }

    /// Owned row range (node-granular).
    pub fn range(&self) -> RowRange {
        self.range
    }

    /// Exchange every PE's row bounds so any global row can be routed to
    /// its owner. Must run before any contribution is exchanged.
    pub fn exchange_bounds(&mut self) -> Result<(), TetPartError> {
        let mut w = ByteWriter::message(kind::BOUNDS);
        w.put_u64(self.range.lower);
        w.put_u64(self.range.upper);
        let all = crate::comm::exchange::allgather(
            self.comm,
            ExchangeTags::from_base(tags::DIV),
            w.finish(),
        )?;
        self.div = Vec::with_capacity(all.len());
        for (peer, bytes) in all.iter().enumerate() {
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::BOUNDS).map_err(fail)?;
            let lower = r.get_u64().map_err(fail)?;
            let upper = r.get_u64().map_err(fail)?;
            r.done().map_err(fail)?;
            self.div.push(RowRange { lower, upper });
        }
        // Ranges must chain: disjoint, covering [0, nnew).
        let mut expect = 0u64;
        for d in &self.div {
            if d.lower != expect || d.upper < d.lower {
                return Err(InvariantViolation::RowsIncomplete {
                    expected: expect,
                    got: d.lower,
                    rank: self.comm.rank(),
                }
                .into());
            }
            expect = d.upper;
        }
        Ok(())
    }

    /// Declare the owned degree-of-freedom range on the external backend.
    pub fn create_backend<B: SparseBackend>(&self, backend: &mut B) {
        backend.create(
            (self.range.lower as usize) * self.ncomp,
            (self.range.upper as usize) * self.ncomp,
        );
    }

    /// A work-unit registers on this PE.
    pub fn checkin(&mut self) {
        self.nchare_expected += 1;
    }

    fn pe_of_row(&self, row: NodeId) -> Result<usize, InvariantViolation> {
        for (pe, d) in self.div.iter().enumerate() {
            if d.contains(row.get()) {
                return Ok(pe);
            }
        }
        Err(InvariantViolation::RowUnowned {
            row,
            rank: self.comm.rank(),
        })
    }

    // --- row exchange (one-time setup) ------------------------------------

    /// A work-unit contributes its global row ids.
    pub fn chare_rows(&mut self, fromch: u64, rows: &[NodeId]) -> Result<(), TetPartError> {
        self.myworker.push(fromch);
        for &r in rows {
            if self.range.contains(r.get()) {
                self.rowimport.entry(fromch).or_default().push(r);
                self.row.insert(r);
            } else {
                let pe = self.pe_of_row(r)?;
                self.exp_rows
                    .entry(pe)
                    .or_default()
                    .entry(fromch)
                    .or_default()
                    .push(r);
            }
        }
        Ok(())
    }

    /// Forward non-owned rows and build the authoritative row import map.
    ///
    /// After this exchange the owned row set must cover the whole range.
    pub fn exchange_rows(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        if self.myworker.len() != self.nchare_expected {
            return Err(InvariantViolation::ImportIncomplete {
                quantity: "row",
                rank: me,
            }
            .into());
        }
        let exports = std::mem::take(&mut self.exp_rows);
        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, chares) in exports {
            let mut w = ByteWriter::message(kind::ROWS);
            w.put_u32(chares.len() as u32);
            for (chare, rows) in chares {
                w.put_u64(chare);
                w.put_pod_slice(&rows);
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tags::ROWS), &outgoing)?;
        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::ROWS).map_err(fail)?;
            let nch = r.get_u32().map_err(fail)?;
            for _ in 0..nch {
                let chare = r.get_u64().map_err(fail)?;
                let rows: Vec<NodeId> = r.get_pod_vec().map_err(fail)?;
                for row in rows {
                    self.rowimport.entry(chare).or_default().push(row);
                    self.row.insert(row);
                }
            }
            r.done().map_err(fail)?;
        }
        if self.row.len() as u64 != self.range.len() {
            return Err(InvariantViolation::RowsIncomplete {
                expected: self.range.len(),
                got: self.row.len() as u64,
                rank: me,
            }
            .into());
        }
        Ok(())
    }

    // --- per-quantity contributions ---------------------------------------

    /// Contribute solution values (overwrite semantics).
    pub fn chare_sol(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        vals: &[f64],
    ) -> Result<(), TetPartError> {
        self.contribute_vec(Quantity::Sol, fromch, rows, vals)
    }

    /// Contribute right-hand-side values (sum semantics).
    pub fn chare_rhs(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        vals: &[f64],
    ) -> Result<(), TetPartError> {
        self.contribute_vec(Quantity::Rhs, fromch, rows, vals)
    }

    /// Contribute low-order rhs values (sum semantics).
    pub fn chare_lowrhs(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        vals: &[f64],
    ) -> Result<(), TetPartError> {
        self.contribute_vec(Quantity::LowRhs, fromch, rows, vals)
    }

    /// Contribute low-order lhs values (sum semantics).
    pub fn chare_lowlhs(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        vals: &[f64],
    ) -> Result<(), TetPartError> {
        self.contribute_vec(Quantity::LowLhs, fromch, rows, vals)
    }

    fn contribute_vec(
        &mut self,
        q: Quantity,
        fromch: u64,
        rows: &[NodeId],
        vals: &[f64],
    ) -> Result<(), TetPartError> {
        debug_assert_eq!(vals.len(), rows.len() * self.ncomp);
        for (i, &row) in rows.iter().enumerate() {
            let v = &vals[i * self.ncomp..(i + 1) * self.ncomp];
            if self.range.contains(row.get()) {
                let (import, store, add) = self.vec_parts(q);
                import.entry(fromch).or_default().push(row);
                merge_vec(store, row, v, add);
            } else {
                let pe = self.pe_of_row(row)?;
                let exp = self.vec_exports(q);
                exp.entry(pe)
                    .or_default()
                    .entry(fromch)
                    .or_default()
                    .push((row, v.to_vec()));
            }
        }
        Ok(())
    }

    fn vec_parts(&mut self, q: Quantity) -> (&mut ImportMap, &mut VecStore, bool) {
        match q {
            Quantity::Sol => (&mut self.solimport, &mut self.sol, false),
            Quantity::Rhs => (&mut self.rhsimport, &mut self.rhs, true),
            Quantity::LowRhs => (&mut self.lowrhsimport, &mut self.lowrhs, true),
            Quantity::LowLhs => (&mut self.lowlhsimport, &mut self.lowlhs, true),
        }
    }

    fn vec_exports(&mut self, q: Quantity) -> &mut ExpVec {
        match q {
            Quantity::Sol => &mut self.exp_sol,
            Quantity::Rhs => &mut self.exp_rhs,
            Quantity::LowRhs => &mut self.exp_lowrhs,
            Quantity::LowLhs => &mut self.exp_lowlhs,
        }
    }

    /// Contribute lhs matrix entries: `cols[i]` lists the column values of
    /// `rows[i]` (sum semantics).
    pub fn chare_lhs(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        cols: &[Vec<(NodeId, Vec<f64>)>],
    ) -> Result<(), TetPartError> {
        debug_assert_eq!(rows.len(), cols.len());
        for (&row, row_cols) in rows.iter().zip(cols) {
            if self.range.contains(row.get()) {
                self.lhsimport.entry(fromch).or_default().push(row);
                let target = self.lhs.entry(row).or_default();
                for (col, v) in row_cols {
                    merge_vec(target, *col, v, true);
                }
            } else {
                let pe = self.pe_of_row(row)?;
                self.exp_lhs
                    .entry(pe)
                    .or_default()
                    .entry(fromch)
                    .or_default()
                    .push((row, row_cols.clone()));
            }
        }
        Ok(())
    }

    /// Contribute diagnostics rows: numerical solution, analytical
    /// solution, and nodal volume per row.
    pub fn chare_diag(
        &mut self,
        fromch: u64,
        rows: &[NodeId],
        num: &[f64],
        ana: &[f64],
        vol: &[f64],
    ) -> Result<(), TetPartError> {
        debug_assert_eq!(num.len(), rows.len() * self.ncomp);
        debug_assert_eq!(ana.len(), rows.len() * self.ncomp);
        debug_assert_eq!(vol.len(), rows.len());
        for (i, &row) in rows.iter().enumerate() {
            let u = num[i * self.ncomp..(i + 1) * self.ncomp].to_vec();
            let a = ana[i * self.ncomp..(i + 1) * self.ncomp].to_vec();
            if self.range.contains(row.get()) {
                self.diagimport.entry(fromch).or_default().push(row);
                self.diag.update(row, u, a, vol[i]);
            } else {
                let pe = self.pe_of_row(row)?;
                self.exp_diag
                    .entry(pe)
                    .or_default()
                    .entry(fromch)
                    .or_default()
                    .push((row, u, a, vol[i]));
            }
        }
        Ok(())
    }

    // --- per-quantity exchanges -------------------------------------------

    /// Forward buffered solution values; completes the solution quantity.
    pub fn exchange_sol(&mut self) -> Result<(), TetPartError> {
        self.exchange_vec(Quantity::Sol, tags::SOL, kind::SOL)?;
        self.check_complete("sol")
    }

    /// Forward buffered rhs values; completes the rhs quantity.
    pub fn exchange_rhs(&mut self) -> Result<(), TetPartError> {
        self.exchange_vec(Quantity::Rhs, tags::RHS, kind::RHS)?;
        self.check_complete("rhs")
    }

    /// Forward buffered low-order rhs values.
    pub fn exchange_lowrhs(&mut self) -> Result<(), TetPartError> {
        self.exchange_vec(Quantity::LowRhs, tags::LOW_RHS, kind::LOW_RHS)?;
        self.check_complete("lowrhs")
    }

    /// Forward buffered low-order lhs values.
    pub fn exchange_lowlhs(&mut self) -> Result<(), TetPartError> {
        self.exchange_vec(Quantity::LowLhs, tags::LOW_LHS, kind::LOW_LHS)?;
        self.check_complete("lowlhs")
    }

    fn exchange_vec(
        &mut self,
        q: Quantity,
        tag: crate::comm::communicator::CommTag,
        kindcode: u16,
    ) -> Result<(), TetPartError> {
        let ncomp = self.ncomp;
        let exports = std::mem::take(self.vec_exports(q));
        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, chares) in exports {
            let mut w = ByteWriter::message(kindcode);
            w.put_u32(chares.len() as u32);
            for (chare, entries) in chares {
                w.put_u64(chare);
                w.put_u32(entries.len() as u32);
                for (row, vals) in entries {
                    w.put_u64(row.get());
                    debug_assert_eq!(vals.len(), ncomp);
                    for v in vals {
                        w.put_f64(v);
                    }
                }
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tag), &outgoing)?;
        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kindcode).map_err(fail)?;
            let nch = r.get_u32().map_err(fail)?;
            for _ in 0..nch {
                let chare = r.get_u64().map_err(fail)?;
                let nrows = r.get_u32().map_err(fail)?;
                for _ in 0..nrows {
                    let row = NodeId::new(r.get_u64().map_err(fail)?);
                    let mut vals = Vec::with_capacity(ncomp);
                    for _ in 0..ncomp {
                        vals.push(r.get_f64().map_err(fail)?);
                    }
                    let (import, store, add) = self.vec_parts(q);
                    import.entry(chare).or_default().push(row);
                    merge_vec(store, row, &vals, add);
                }
            }
            r.done().map_err(fail)?;
        }
        Ok(())
    }

    /// Forward buffered matrix rows; completes the lhs quantity.
    pub fn exchange_lhs(&mut self) -> Result<(), TetPartError> {
        let ncomp = self.ncomp;
        let exports = std::mem::take(&mut self.exp_lhs);
        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, chares) in exports {
            let mut w = ByteWriter::message(kind::LHS);
            w.put_u32(chares.len() as u32);
            for (chare, entries) in chares {
                w.put_u64(chare);
                w.put_u32(entries.len() as u32);
                for (row, cols) in entries {
                    w.put_u64(row.get());
                    w.put_u32(cols.len() as u32);
                    for (col, vals) in cols {
                        w.put_u64(col.get());
                        debug_assert_eq!(vals.len(), ncomp);
                        for v in vals {
                            w.put_f64(v);
                        }
                    }
                }
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tags::LHS), &outgoing)?;
        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::LHS).map_err(fail)?;
            let nch = r.get_u32().map_err(fail)?;
            for _ in 0..nch {
                let chare = r.get_u64().map_err(fail)?;
                let nrows = r.get_u32().map_err(fail)?;
                for _ in 0..nrows {
                    let row = NodeId::new(r.get_u64().map_err(fail)?);
                    self.lhsimport.entry(chare).or_default().push(row);
                    let ncols = r.get_u32().map_err(fail)?;
                    let target = self.lhs.entry(row).or_default();
                    for _ in 0..ncols {
                        let col = NodeId::new(r.get_u64().map_err(fail)?);
                        let mut vals = Vec::with_capacity(ncomp);
                        for _ in 0..ncomp {
                            vals.push(r.get_f64().map_err(fail)?);
                        }
                        merge_vec(target, col, &vals, true);
                    }
                }
            }
            r.done().map_err(fail)?;
        }
        self.check_complete("lhs")?;
        Ok(())
    }

    /// Forward buffered diagnostics rows; completes the diag quantity.
    pub fn exchange_diag(&mut self) -> Result<(), TetPartError> {
        let ncomp = self.ncomp;
        let exports = std::mem::take(&mut self.exp_diag);
        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, chares) in exports {
            let mut w = ByteWriter::message(kind::DIAG);
            w.put_u32(chares.len() as u32);
            for (chare, entries) in chares {
                w.put_u64(chare);
                w.put_u32(entries.len() as u32);
                for (row, num, ana, vol) in entries {
                    w.put_u64(row.get());
                    for v in num {
                        w.put_f64(v);
                    }
                    for v in ana {
                        w.put_f64(v);
                    }
                    w.put_f64(vol);
                }
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tags::DIAG), &outgoing)?;
        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::DIAG).map_err(fail)?;
            let nch = r.get_u32().map_err(fail)?;
            for _ in 0..nch {
                let chare = r.get_u64().map_err(fail)?;
                let nrows = r.get_u32().map_err(fail)?;
                for _ in 0..nrows {
                    let row = NodeId::new(r.get_u64().map_err(fail)?);
                    let mut num = Vec::with_capacity(ncomp);
                    for _ in 0..ncomp {
                        num.push(r.get_f64().map_err(fail)?);
                    }
                    let mut ana = Vec::with_capacity(ncomp);
                    for _ in 0..ncomp {
                        ana.push(r.get_f64().map_err(fail)?);
                    }
                    let vol = r.get_f64().map_err(fail)?;
                    self.diagimport.entry(chare).or_default().push(row);
                    self.diag.update(row, num, ana, vol);
                }
            }
            r.done().map_err(fail)?;
        }
        if !import_complete(&self.diagimport, &self.rowimport) {
            return Err(InvariantViolation::ImportIncomplete {
                quantity: "diag",
                rank: self.comm.rank(),
            }
            .into());
        }
        Ok(())
    }

    fn check_complete(&self, quantity: &'static str) -> Result<(), TetPartError> {
        let import = match quantity {
            "sol" => &self.solimport,
            "lhs" => &self.lhsimport,
            "rhs" => &self.rhsimport,
            "lowrhs" => &self.lowrhsimport,
            "lowlhs" => &self.lowlhsimport,
            _ => &self.diagimport,
        };
        if import_complete(import, &self.rowimport) {
            Ok(())
        } else {
            Err(InvariantViolation::ImportIncomplete {
                quantity,
                rank: self.comm.rank(),
            }
            .into())
        }
    }

    // --- boundary conditions ----------------------------------------------

    /// A work-unit contributes the Dirichlet rows it can set.
    pub fn chare_bc(&mut self, rows: &BTreeMap<NodeId, BcRow>) -> Result<(), TetPartError> {
        for (row, comps) in rows {
            self.bc.insert(*row, comps)?;
        }
        Ok(())
    }

    /// All-reduce the BC tables so every PE holds the identical union.
    pub fn merge_bc(&mut self) -> Result<(), TetPartError> {
        self.bc = self
            .bc
            .allreduce(self.comm, ExchangeTags::from_base(tags::BC))?;
        Ok(())
    }

    /// The merged Dirichlet table.
    pub fn dirbc(&self) -> &BcTable {
        &self.bc
    }

    /// Zero the constrained rows of the lhs and put one on their diagonal.
    ///
    /// Idempotent, and the sparsity pattern is untouched, so the pattern
    /// symmetry of assembly survives.
    pub fn apply_lhs_bc(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        if !import_complete(&self.lhsimport, &self.rowimport) {
            return Err(InvariantViolation::ImportIncomplete {
                quantity: "lhs",
                rank: me,
            }
            .into());
        }
        for (row, comps) in self.bc.iter() {
            if !self.range.contains(row.get()) {
                continue;
            }
            let r = self
                .lhs
                .get_mut(row)
                .ok_or(InvariantViolation::BcRowMissing { row: *row, rank: me })?;
            for i in 0..self.ncomp {
                if comps[i].0 {
                    for vals in r.values_mut() {
                        vals[i] = 0.0;
                    }
                    let diag = r
                        .get_mut(row)
                        .ok_or(InvariantViolation::BcRowMissing { row: *row, rank: me })?;
                    diag[i] = 1.0;
                }
            }
        }
        Ok(())
    }

    /// Set the constrained rhs components per the configured policy.
    pub fn apply_rhs_bc(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        if !import_complete(&self.rhsimport, &self.rowimport) {
            return Err(InvariantViolation::ImportIncomplete {
                quantity: "rhs",
                rank: me,
            }
            .into());
        }
        for (row, comps) in self.bc.iter() {
            if !self.range.contains(row.get()) {
                continue;
            }
            let r = self
                .rhs
                .get_mut(row)
                .ok_or(InvariantViolation::BcRowMissing { row: *row, rank: me })?;
            for i in 0..self.ncomp {
                if comps[i].0 {
                    r[i] = match self.bc_policy {
                        BcPolicy::Value => comps[i].1,
                        BcPolicy::Increment => 0.0,
                    };
                }
            }
        }
        Ok(())
    }

    // --- solve sequence ---------------------------------------------------

    /// 1-based degree-of-freedom indices of the owned rows, in row order.
    fn backend_rows(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.row.len() * self.ncomp);
        for r in &self.row {
            for i in 0..self.ncomp {
                out.push((r.get() * self.ncomp as u64 + i as u64 + 1) as u32);
            }
        }
        out
    }

    /// Fill the external backend, assemble, solve the high-order system,
    /// and read the updated solution back into the local store.
    pub fn solve<B: SparseBackend>(&mut self, backend: &mut B) -> Result<SolveStats, TetPartError> {
        let me = self.comm.rank();
        for (quantity, ok) in [
            ("sol", import_complete(&self.solimport, &self.rowimport)),
            ("lhs", import_complete(&self.lhsimport, &self.rowimport)),
            ("rhs", import_complete(&self.rhsimport, &self.rowimport)),
        ] {
            if !ok {
                return Err(InvariantViolation::ImportIncomplete { quantity, rank: me }.into());
            }
        }
        let rows = self.backend_rows();

        let mut solbuf = Vec::with_capacity(rows.len());
        for vals in self.sol.values() {
            solbuf.extend_from_slice(vals);
        }
        let mut ncols = Vec::new();
        let mut colbuf = Vec::new();
        let mut matbuf = Vec::new();
        for cols in self.lhs.values() {
            for i in 0..self.ncomp {
                ncols.push(cols.len() as u32);
                for (col, vals) in cols {
                    colbuf.push((col.get() * self.ncomp as u64 + i as u64 + 1) as u32);
                    matbuf.push(vals[i]);
                }
            }
        }
        let mut rhsbuf = Vec::with_capacity(rows.len());
        for vals in self.rhs.values() {
            rhsbuf.extend_from_slice(vals);
        }
        if solbuf.len() != rows.len() || rhsbuf.len() != rows.len() {
            return Err(SolverError::Inconsistent {
                what: "vector buffers do not match the owned rows",
            }
            .into());
        }

        backend.set_sol(&rows, &solbuf)?;
        backend.set_lhs(&ncols, &rows, &colbuf, &matbuf)?;
        backend.set_rhs(&rows, &rhsbuf)?;
        backend.assemble_sol()?;
        backend.assemble_lhs()?;
        backend.assemble_rhs()?;
        let stats = backend.solve()?;

        let mut out = vec![0.0; rows.len()];
        backend.get_sol(&rows, &mut out)?;
        for (k, vals) in self.sol.values_mut().enumerate() {
            vals.copy_from_slice(&out[k * self.ncomp..(k + 1) * self.ncomp]);
        }
        Ok(stats)
    }

    /// Solve the diagonal low-order system in place:
    /// `x_low[r] = (rhs[r] + lowrhs[r]) / lowlhs[r]` componentwise, with
    /// `lowlhs = 1`, `lowrhs = 0` and the rhs taken as zero at constrained
    /// components.
    pub fn low_solve(&mut self) -> Result<(), TetPartError> {
        let me = self.comm.rank();
        for (quantity, ok) in [
            ("rhs", import_complete(&self.rhsimport, &self.rowimport)),
            ("lowrhs", import_complete(&self.lowrhsimport, &self.rowimport)),
            ("lowlhs", import_complete(&self.lowlhsimport, &self.rowimport)),
        ] {
            if !ok {
                return Err(InvariantViolation::ImportIncomplete { quantity, rank: me }.into());
            }
        }
        if !keys_equal(&self.rhs, &self.lowrhs) || !keys_equal(&self.rhs, &self.lowlhs) {
            return Err(InvariantViolation::LowOrderKeyMismatch { rank: me }.into());
        }
        // Dirichlet rows of the low-order system.
        for (row, comps) in self.bc.iter() {
            if !self.range.contains(row.get()) {
                continue;
            }
            let ll = self
                .lowlhs
                .get_mut(row)
                .ok_or(InvariantViolation::BcRowMissing { row: *row, rank: me })?;
            let lr = self
                .lowrhs
                .get_mut(row)
                .ok_or(InvariantViolation::BcRowMissing { row: *row, rank: me })?;
            for i in 0..self.ncomp {
                if comps[i].0 {
                    ll[i] = 1.0;
                    lr[i] = 0.0;
                }
            }
        }
        self.lowsol.clear();
        for (row, r) in &self.rhs {
            let d = &self.lowrhs[row];
            let m = &self.lowlhs[row];
            let bc = self.bc.get(*row);
            let mut x = Vec::with_capacity(self.ncomp);
            for i in 0..self.ncomp {
                let rhs_i = match bc {
                    Some(comps) if comps[i].0 => 0.0,
                    _ => r[i],
                };
                x.push((rhs_i + d[i]) / m[i]);
            }
            self.lowsol.insert(*row, x);
        }
        Ok(())
    }

    // --- scatter-back -----------------------------------------------------

    /// Send solved values back to the contributing work-units, keyed by
    /// chare id. Returns the updates for chares hosted on this PE.
    pub fn scatter_sol(&mut self) -> Result<BTreeMap<u64, ChareUpdate>, TetPartError> {
        self.scatter(tags::SCATTER_SOL, false)
    }

    /// Send the low-order solution back to the contributing work-units.
    pub fn scatter_low(&mut self) -> Result<BTreeMap<u64, ChareUpdate>, TetPartError> {
        self.scatter(tags::SCATTER_LOW, true)
    }

    fn scatter(
        &mut self,
        tag: crate::comm::communicator::CommTag,
        low: bool,
    ) -> Result<BTreeMap<u64, ChareUpdate>, TetPartError> {
        let me = self.comm.rank();
        let source = if low { &self.lowsol } else { &self.sol };
        let mut local: BTreeMap<u64, ChareUpdate> = BTreeMap::new();
        let mut exports: BTreeMap<usize, Vec<(u64, NodeId, Vec<f64>)>> = BTreeMap::new();
        for (&chare, rows) in &self.solimport {
            for &row in rows {
                let vals = source
                    .get(&row)
                    .ok_or(InvariantViolation::RowUnowned { row, rank: me })?
                    .clone();
                let dest = self.dist.pe_of(chare);
                if dest == me {
                    local.entry(chare).or_default().push((row, vals));
                } else {
                    exports.entry(dest).or_default().push((chare, row, vals));
                }
            }
        }
        let mut outgoing = vec![Vec::new(); self.comm.size()];
        for (pe, entries) in exports {
            let mut w = ByteWriter::message(kind::SCATTER);
            w.put_u32(entries.len() as u32);
            for (chare, row, vals) in entries {
                w.put_u64(chare);
                w.put_u64(row.get());
                for v in vals {
                    w.put_f64(v);
                }
            }
            outgoing[pe] = w.finish();
        }
        let incoming = exchange_all(self.comm, ExchangeTags::from_base(tag), &outgoing)?;
        for (peer, bytes) in incoming.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::SCATTER).map_err(fail)?;
            let n = r.get_u32().map_err(fail)?;
            for _ in 0..n {
                let chare = r.get_u64().map_err(fail)?;
                let row = NodeId::new(r.get_u64().map_err(fail)?);
                let mut vals = Vec::with_capacity(self.ncomp);
                for _ in 0..self.ncomp {
                    vals.push(r.get_f64().map_err(fail)?);
                }
                if self.dist.pe_of(chare) != me {
                    return Err(InvariantViolation::ForeignChare { chare, rank: me }.into());
                }
                local.entry(chare).or_default().push((row, vals));
            }
            r.done().map_err(fail)?;
        }
        Ok(local)
    }

    // --- diagnostics ------------------------------------------------------

    /// Reduce the diagnostics norms across all PEs.
    pub fn diagnostics(&self) -> Result<Diagnostics, TetPartError> {
        if !import_complete(&self.diagimport, &self.rowimport) {
            return Err(InvariantViolation::ImportIncomplete {
                quantity: "diag",
                rank: self.comm.rank(),
            }
            .into());
        }
        Ok(self.diag.reduce(
            self.comm,
            ExchangeTags::from_base(tags::DIAG_SUM),
            ExchangeTags::from_base(tags::DIAG_MAX),
            self.range,
            self.ncomp,
        )?)
    }

    // --- re-arming --------------------------------------------------------

    /// Reset only the per-step state so the next time step can rebuild the
    /// rhs-side quantities. The lhs (with boundary conditions already
    /// rewritten), the low-order lhs, the row partitioning, and the
    /// solution store survive.
    pub fn enable_wait4rhs(&mut self) {
        self.rhsimport.clear();
        self.lowrhsimport.clear();
        self.diagimport.clear();
        self.rhs.clear();
        self.lowrhs.clear();
        self.lowsol.clear();
        self.bc.clear();
        self.diag.clear();
        self.exp_rhs.clear();
        self.exp_lowrhs.clear();
        self.exp_diag.clear();
    }

    // --- introspection (tests, embedding drivers) -------------------------

    pub fn lhs_entry(&self, row: NodeId, col: NodeId) -> Option<&Vec<f64>> {
        self.lhs.get(&row)?.get(&col)
    }

    pub fn lhs_row(&self, row: NodeId) -> Option<&BTreeMap<NodeId, Vec<f64>>> {
        self.lhs.get(&row)
    }

    pub fn rhs_entry(&self, row: NodeId) -> Option<&Vec<f64>> {
        self.rhs.get(&row)
    }

    pub fn sol_entry(&self, row: NodeId) -> Option<&Vec<f64>> {
        self.sol.get(&row)
    }

    pub fn lowsol_entry(&self, row: NodeId) -> Option<&Vec<f64>> {
        self.lowsol.get(&row)
    }

    /// Owned rows, sorted.
    pub fn rows(&self) -> impl Iterator<Item = &NodeId> {
        self.row.iter()
    }
}

/// Which row-keyed vector quantity a contribution targets.
#[derive(Copy, Clone, Debug)]
enum Quantity {
    Sol,
    Rhs,
    LowRhs,
    LowLhs,
}

fn merge_vec(store: &mut VecStore, row: NodeId, vals: &[f64], add: bool) {
    match store.entry(row) {
        std::collections::btree_map::Entry::Vacant(e) => {
            e.insert(vals.to_vec());
        }
        std::collections::btree_map::Entry::Occupied(mut e) => {
            if add {
                for (a, v) in e.get_mut().iter_mut().zip(vals) {
                    *a += v;
                }
            } else {
                e.get_mut().copy_from_slice(vals);
            }
        }
    }
}

/// Import-map equality as a per-chare multiset of row ids.
///
/// Arrival order across senders is arbitrary, so the vectors are compared
/// sorted.
fn import_complete(import: &ImportMap, authoritative: &ImportMap) -> bool {
    if import.len() != authoritative.len() {
        return false;
    }
    for ((ca, va), (cb, vb)) in import.iter().zip(authoritative.iter()) {
        if ca != cb || va.len() != vb.len() {
            return false;
        }
        let mut sa = va.clone();
        let mut sb = vb.clone();
        sa.sort_unstable();
        sb.sort_unstable();
        if sa != sb {
            return false;
        }
    }
    true
}

fn keys_equal(a: &VecStore, b: &VecStore) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::linsys::backend::DenseBackend;

    fn n(i: u64) -> NodeId {
        NodeId::new(i)
    }

    fn serial_branch(comm: &NoComm, nrows: u64) -> SolverBranch<'_, NoComm> {
        let mut sb = SolverBranch::new(
            comm,
            1,
            BcPolicy::Increment,
            ChareDist::new(1, 1),
            RowRange {
                lower: 0,
                upper: nrows,
            },
        );
        sb.exchange_bounds().unwrap();
        sb
    }

    fn rows(n_: u64) -> Vec<NodeId> {
        (0..n_).map(n).collect()
    }

    #[test]
    fn import_multiset_equality() {
        let mut a = ImportMap::new();
        let mut b = ImportMap::new();
        a.insert(0, vec![n(2), n(1)]);
        b.insert(0, vec![n(1), n(2)]);
        assert!(import_complete(&a, &b));
        b.insert(1, vec![n(3)]);
        assert!(!import_complete(&a, &b));
    }

    #[test]
    fn serial_rhs_sums_across_contributions() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 3);
        sb.checkin();
        sb.checkin();
        sb.chare_rows(0, &[n(0), n(1)]).unwrap();
        sb.chare_rows(1, &[n(1), n(2)]).unwrap();
        sb.exchange_rows().unwrap();
        sb.chare_rhs(0, &[n(0), n(1)], &[1.0, 2.0]).unwrap();
        sb.chare_rhs(1, &[n(1), n(2)], &[10.0, 20.0]).unwrap();
        sb.exchange_rhs().unwrap();
        assert_eq!(sb.rhs_entry(n(1)).unwrap(), &vec![12.0]);
        assert_eq!(sb.rhs_entry(n(2)).unwrap(), &vec![20.0]);
    }

    #[test]
    fn incomplete_import_is_fatal_at_the_sync_point() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 3);
        sb.checkin();
        sb.checkin();
        sb.chare_rows(0, &[n(0), n(1)]).unwrap();
        sb.chare_rows(1, &[n(1), n(2)]).unwrap();
        sb.exchange_rows().unwrap();
        // chare 1 never contributes its rhs
        sb.chare_rhs(0, &[n(0), n(1)], &[1.0, 2.0]).unwrap();
        assert!(sb.exchange_rhs().is_err());
    }

    #[test]
    fn serial_sol_overwrites() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 2);
        sb.checkin();
        sb.chare_rows(0, &rows(2)).unwrap();
        sb.exchange_rows().unwrap();
        sb.chare_sol(0, &rows(2), &[5.0, 6.0]).unwrap();
        sb.exchange_sol().unwrap();
        assert_eq!(sb.sol_entry(n(1)).unwrap(), &vec![6.0]);
    }

    #[test]
    fn serial_high_order_solve_diagonal() {
        // Scenario: rhs {1..5}, lhs diagonal {2}, expect x = rhs / 2.
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 5);
        sb.checkin();
        sb.chare_rows(0, &rows(5)).unwrap();
        sb.exchange_rows().unwrap();
        sb.chare_sol(0, &rows(5), &[0.0; 5]).unwrap();
        sb.exchange_sol().unwrap();
        let cols: Vec<Vec<(NodeId, Vec<f64>)>> =
            (0..5).map(|i| vec![(n(i), vec![2.0])]).collect();
        sb.chare_lhs(0, &rows(5), &cols).unwrap();
        sb.exchange_lhs().unwrap();
        sb.chare_rhs(0, &rows(5), &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        sb.exchange_rhs().unwrap();
        sb.merge_bc().unwrap();
        sb.apply_lhs_bc().unwrap();
        sb.apply_rhs_bc().unwrap();

        let mut be = DenseBackend::new();
        sb.create_backend(&mut be);
        let stats = sb.solve(&mut be).unwrap();
        assert!(stats.residual < 1e-12);
        for (i, expect) in [0.5, 1.0, 1.5, 2.0, 2.5].into_iter().enumerate() {
            assert_eq!(sb.sol_entry(n(i as u64)).unwrap(), &vec![expect]);
        }
        let updates = sb.scatter_sol().unwrap();
        assert_eq!(updates[&0].len(), 5);
    }

    #[test]
    fn serial_bc_rewrites_row_and_rhs() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 2);
        sb.checkin();
        sb.chare_rows(0, &rows(2)).unwrap();
        sb.exchange_rows().unwrap();
        let cols: Vec<Vec<(NodeId, Vec<f64>)>> = vec![
            vec![(n(0), vec![4.0]), (n(1), vec![-1.0])],
            vec![(n(0), vec![-1.0]), (n(1), vec![4.0])],
        ];
        sb.chare_lhs(0, &rows(2), &cols).unwrap();
        sb.exchange_lhs().unwrap();
        sb.chare_rhs(0, &rows(2), &[1.0, 1.0]).unwrap();
        sb.exchange_rhs().unwrap();
        let mut bc = BTreeMap::new();
        bc.insert(n(0), vec![(true, 9.0)]);
        sb.chare_bc(&bc).unwrap();
        sb.merge_bc().unwrap();
        sb.apply_lhs_bc().unwrap();
        sb.apply_rhs_bc().unwrap();

        assert_eq!(sb.lhs_entry(n(0), n(0)).unwrap(), &vec![1.0]);
        assert_eq!(sb.lhs_entry(n(0), n(1)).unwrap(), &vec![0.0]);
        // pattern symmetry survives the rewrite
        assert!(sb.lhs_entry(n(1), n(0)).is_some());
        // increment policy zeroes the rhs at the constrained row
        assert_eq!(sb.rhs_entry(n(0)).unwrap(), &vec![0.0]);
        assert_eq!(sb.rhs_entry(n(1)).unwrap(), &vec![1.0]);

        // applying the BCs twice changes nothing
        sb.apply_lhs_bc().unwrap();
        sb.apply_rhs_bc().unwrap();
        assert_eq!(sb.lhs_entry(n(0), n(0)).unwrap(), &vec![1.0]);
        assert_eq!(sb.rhs_entry(n(0)).unwrap(), &vec![0.0]);
    }

    #[test]
    fn serial_low_order_solve() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 2);
        sb.checkin();
        sb.chare_rows(0, &rows(2)).unwrap();
        sb.exchange_rows().unwrap();
        sb.chare_rhs(0, &rows(2), &[1.0, 2.0]).unwrap();
        sb.exchange_rhs().unwrap();
        sb.chare_lowrhs(0, &rows(2), &[0.5, 1.0]).unwrap();
        sb.exchange_lowrhs().unwrap();
        sb.chare_lowlhs(0, &rows(2), &[3.0, 3.0]).unwrap();
        sb.exchange_lowlhs().unwrap();
        sb.merge_bc().unwrap();
        sb.low_solve().unwrap();
        assert_eq!(sb.lowsol_entry(n(0)).unwrap(), &vec![0.5]);
        assert_eq!(sb.lowsol_entry(n(1)).unwrap(), &vec![1.0]);
    }

    #[test]
    fn rearm_keeps_lhs_and_rows() {
        let comm = NoComm;
        let mut sb = serial_branch(&comm, 1);
        sb.checkin();
        sb.chare_rows(0, &rows(1)).unwrap();
        sb.exchange_rows().unwrap();
        let cols = vec![vec![(n(0), vec![2.0])]];
        sb.chare_lhs(0, &rows(1), &cols).unwrap();
        sb.exchange_lhs().unwrap();
        sb.chare_rhs(0, &rows(1), &[4.0]).unwrap();
        sb.exchange_rhs().unwrap();

        sb.enable_wait4rhs();
        assert!(sb.rhs_entry(n(0)).is_none());
        assert_eq!(sb.lhs_entry(n(0), n(0)).unwrap(), &vec![2.0]);
        // a fresh rhs completes again after re-arming
        sb.chare_rhs(0, &rows(1), &[8.0]).unwrap();
        sb.exchange_rhs().unwrap();
        assert_eq!(sb.rhs_entry(n(0)).unwrap(), &vec![8.0]);
    }
}
