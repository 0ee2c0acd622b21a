//! End-to-end: one PE, one chare, two tets sharing a face, no boundary
//! conditions, no refinement. The renumbering is the identity permutation
//! and a diagonal high-order system solves to rhs / diag.

mod util;

use tet_part::comm::communicator::NoComm;
use tet_part::config::Config;
use tet_part::driver::{attach_solver, setup};
use tet_part::dist::RowRange;
use tet_part::linsys::backend::DenseBackend;
use tet_part::mesh::NodeId;
use util::{n, two_tets, write_mesh};

#[test]
fn two_tets_one_chare_diagonal_solve() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = two_tets();
    let path = write_mesh(dir.path(), "two.tet", &conn, &coords);
    let cfg = Config::new(&path).validated().unwrap();
    let comm = NoComm;

    let s = setup(&cfg, &comm).unwrap();
    assert_eq!(s.nchare, 1);
    assert_eq!(s.range, RowRange { lower: 0, upper: 5 });
    assert_eq!(s.workers.len(), 1);

    // Identity permutation: every file id keeps its index.
    let wu = &s.workers[0];
    for i in 0..5 {
        assert_eq!(wu.new_id(n(i)), Some(n(i)));
        assert_eq!(wu.old_id(n(i)), Some(n(i)));
    }
    assert_eq!(wu.conn, conn);

    let mut branch = attach_solver(&cfg, &comm, &s).unwrap();
    let rows = wu.rows();
    assert_eq!(rows, vec![n(0), n(1), n(2), n(3), n(4)]);

    branch.chare_sol(wu.id, &rows, &[0.0; 5]).unwrap();
    branch.exchange_sol().unwrap();
    let cols: Vec<Vec<(NodeId, Vec<f64>)>> = rows
        .iter()
        .map(|r| vec![(*r, vec![2.0])])
        .collect();
    branch.chare_lhs(wu.id, &rows, &cols).unwrap();
    branch.exchange_lhs().unwrap();
    branch
        .chare_rhs(wu.id, &rows, &[1.0, 2.0, 3.0, 4.0, 5.0])
        .unwrap();
    branch.exchange_rhs().unwrap();
    branch.merge_bc().unwrap();
    branch.apply_lhs_bc().unwrap();
    branch.apply_rhs_bc().unwrap();

    let mut backend = DenseBackend::new();
    branch.create_backend(&mut backend);
    let stats = branch.solve(&mut backend).unwrap();
    assert!(stats.residual < 1e-12);

    let updates = branch.scatter_sol().unwrap();
    let expect = [0.5, 1.0, 1.5, 2.0, 2.5];
    let update = &updates[&wu.id];
    assert_eq!(update.len(), 5);
    for (row, vals) in update {
        assert_eq!(vals, &vec![expect[row.get() as usize]]);
    }
}
