//! Uniform refinement end-to-end: child counts, midpoint coordinates, and
//! cross-PE identity of edge-nodes on a shared face.

mod util;

use tet_part::comm::communicator::{LocalComm, NoComm};
use tet_part::config::Config;
use tet_part::driver::setup;
use tet_part::mesh::{midpoint, Edge};
use util::{n, two_tets, write_mesh};

#[test]
fn one_tet_becomes_eight_with_midpoint_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let conn = vec![[n(0), n(1), n(2), n(3)]];
    let coords = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
    ];
    let path = write_mesh(dir.path(), "one.tet", &conn, &coords);
    let mut cfg = Config::new(&path);
    cfg.refine = true;
    let cfg = cfg.validated().unwrap();

    let s = setup(&cfg, &NoComm).unwrap();
    assert_eq!(s.workers.len(), 1);
    let wu = &s.workers[0];
    // 1 tet -> 8 children over 4 + 6 nodes.
    assert_eq!(wu.conn.len(), 8);
    assert_eq!(wu.rows().len(), 10);
    assert_eq!(s.range.len(), 10);

    // Every edge-node sits at the midpoint of its generating edge.
    assert_eq!(wu.edge_nodes.len(), 6);
    for (edge, new) in &wu.edge_nodes {
        let a = coords[edge.lo().get() as usize];
        let b = coords[edge.hi().get() as usize];
        assert_eq!(wu.coords[new], midpoint(a, b));
    }
}

#[test]
fn two_pe_shared_face_edge_nodes_match() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = two_tets();
    let path = write_mesh(dir.path(), "two.tet", &conn, &coords);

    let comms = LocalComm::cluster(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let mut cfg = Config::new(&path);
            cfg.refine = true;
            let cfg = cfg.validated().unwrap();
            std::thread::spawn(move || setup(&cfg, &comm).unwrap())
        })
        .collect();
    let setups: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // One chare per PE, one parent tet each, eight children each.
    for s in &setups {
        assert_eq!(s.workers.len(), 1);
        assert_eq!(s.workers[0].conn.len(), 8);
    }
    // 5 original + 9 unique edges globally.
    assert_eq!(setups[1].range.upper, 14);

    // The three edges of the shared face 1-2-3 must resolve to the same
    // linear id and the same coordinates on both PEs.
    let w0 = &setups[0].workers[0];
    let w1 = &setups[1].workers[0];
    let mut matched = 0;
    for (a, b) in [(1u64, 2u64), (1, 3), (2, 3)] {
        let edge = Edge::new(n(a), n(b));
        let id0 = w0.edge_nodes[&edge];
        let id1 = w1.edge_nodes[&edge];
        assert_eq!(id0, id1, "edge {edge} got different ids");
        assert_eq!(w0.coords[&id0], w1.coords[&id1]);
        matched += 1;
    }
    assert_eq!(matched, 3);

    // Corner nodes of the shared face agree as well.
    for i in [1u64, 2, 3] {
        assert_eq!(w0.new_id(n(i)), w1.new_id(n(i)));
    }
}

#[test]
fn refined_rows_cover_both_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = two_tets();
    let path = write_mesh(dir.path(), "two2.tet", &conn, &coords);

    let comms = LocalComm::cluster(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let mut cfg = Config::new(&path);
            cfg.refine = true;
            let cfg = cfg.validated().unwrap();
            std::thread::spawn(move || setup(&cfg, &comm).unwrap())
        })
        .collect();
    let setups: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(setups[0].range.lower, 0);
    assert_eq!(setups[0].range.upper, setups[1].range.lower);
    let nnew = setups[1].range.upper;
    let mut seen = vec![false; nnew as usize];
    for s in &setups {
        for wu in &s.workers {
            for r in wu.rows() {
                seen[r.get() as usize] = true;
            }
        }
    }
    assert!(seen.iter().all(|&s| s), "some linear id is never referenced");
}
