//! Per-PE setup pipeline.
//!
//! Runs the phases in dependency order: slab read, partitioning, chare
//! distribution, optional uniform refinement, distributed renumbering, and
//! work-unit creation. Every PE calls [`setup`] with its communicator
//! endpoint; the phases synchronize internally.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::reduce::allreduce_sum;
use crate::config::Config;
use crate::dist::partitioner::Partitioner;
use crate::dist::renumber::Renumberer;
use crate::dist::worker::WorkUnit;
use crate::dist::{tags, ChareDist, RowRange};
use crate::error::{ConfigError, TetPartError};
use crate::io::TetFile;
use crate::linsys::solver::SolverBranch;

/// Everything a PE needs to start contributing to the linear system.
#[derive(Debug)]
pub struct Setup {
    /// Work-units hosted on this PE, in chare-id order.
    pub workers: Vec<WorkUnit>,
    /// Owned linear-id range.
    pub range: RowRange,
    /// Total number of work-units across all PEs.
    pub nchare: u64,
    /// Communication cost of merging the linear system for this PE: the
    /// fraction of contributed rows that are not locally owned.
    pub comm_cost: f64,
}

/// Run the full read-partition-distribute-refine-renumber pipeline.
pub fn setup<C: Communicator>(cfg: &Config, comm: &C) -> Result<Setup, TetPartError> {
    let mut file = TetFile::open(&cfg.mesh)?;
    let nchare = cfg.nchare(comm.size());
    let nelem = file.header().ntet_total();
    // Refuse over-decomposition before any chare state exists.
    if nchare > nelem {
        return Err(ConfigError::OverDecomposition { nchare, nelem }.into());
    }

    let mut partitioner = Partitioner::new(cfg, comm, &mut file, nchare)?;
    partitioner.partition(&mut file)?;
    partitioner.distribute(&mut file)?;
    if cfg.refine {
        partitioner.refine();
    }

    let mut renumberer = Renumberer::new(comm, partitioner.into_chunk(), cfg.feedback);
    renumberer.reorder()?;
    let (workers, range) = renumberer.into_workers()?;

    let contributed: std::collections::BTreeSet<u64> = workers
        .iter()
        .flat_map(|w| w.rows())
        .map(|r| r.get())
        .collect();
    let foreign = contributed.iter().filter(|r| !range.contains(**r)).count();
    let comm_cost = if contributed.is_empty() {
        0.0
    } else {
        foreign as f64 / contributed.len() as f64
    };
    if cfg.feedback {
        log::info!(
            "PE {}: setup complete, {} work-units, rows [{}, {}), comm cost {:.3}",
            comm.rank(),
            workers.len(),
            range.lower,
            range.upper,
            comm_cost
        );
    }

    Ok(Setup {
        workers,
        range,
        nchare,
        comm_cost,
    })
}

/// Average and standard deviation of the per-PE communication cost.
pub fn comm_cost_stats<C: Communicator>(
    comm: &C,
    cost: f64,
) -> Result<(f64, f64), TetPartError> {
    let npes = comm.size() as f64;
    let sum = allreduce_sum(comm, ExchangeTags::from_base(tags::COST), &[cost])?;
    let avg = sum[0] / npes;
    let var = allreduce_sum(
        comm,
        ExchangeTags::from_base(tags::COST.offset(2)),
        &[(cost - avg) * (cost - avg)],
    )?;
    Ok((avg, (var[0] / npes).sqrt()))
}

/// Construct the solver branch for a completed setup: exchange the row
/// bounds, register the local work-units, and run the one-time row
/// exchange that fixes the authoritative import map.
pub fn attach_solver<'a, C: Communicator>(
    cfg: &Config,
    comm: &'a C,
    setup: &Setup,
) -> Result<SolverBranch<'a, C>, TetPartError> {
    let dist = ChareDist::new(setup.nchare, comm.size());
    let mut branch = SolverBranch::new(comm, cfg.ncomp, cfg.bc_policy, dist, setup.range);
    branch.exchange_bounds()?;
    for _ in &setup.workers {
        branch.checkin();
    }
    for wu in &setup.workers {
        branch.chare_rows(wu.id, &wu.rows())?;
    }
    branch.exchange_rows()?;
    Ok(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::mesh::NodeId;

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
    fn serial_setup_identity_renumbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_two_tets(dir.path());
        let cfg = Config::new(&path).validated().unwrap();
        let comm = NoComm;
        let setup = setup(&cfg, &comm).unwrap();
        assert_eq!(setup.nchare, 1);
        assert_eq!(setup.range, RowRange { lower: 0, upper: 5 });
        assert_eq!(setup.workers.len(), 1);
        assert_eq!(setup.comm_cost, 0.0);
        let (avg, std) = comm_cost_stats(&comm, setup.comm_cost).unwrap();
        assert_eq!(avg, 0.0);
        assert_eq!(std, 0.0);
    }

    #[test]
    fn serial_overdecomposition_refused_before_partitioning() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_two_tets(dir.path());
        let mut cfg = Config::new(&path);
        cfg.virtualization = 1.0;
        cfg.chares_per_pe = 4.0; // nchare = 8 > 2 elements
        let cfg = cfg.validated().unwrap();
        let err = setup(&cfg, &NoComm).unwrap_err();
        assert!(matches!(
            err,
            TetPartError::Config(ConfigError::OverDecomposition { nchare: 8, nelem: 2 })
        ));
    }

    #[test]
    fn serial_attach_solver_builds_row_imports() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_two_tets(dir.path());
        let cfg = Config::new(&path).validated().unwrap();
        let comm = NoComm;
        let s = setup(&cfg, &comm).unwrap();
        let branch = attach_solver(&cfg, &comm, &s).unwrap();
        assert_eq!(branch.rows().count(), 5);
    }
}
