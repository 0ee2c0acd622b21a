//! Multi-PE renumbering: ownership partition, contiguity, coverage, and
//! determinism of the distributed reordering.

mod util;

use std::collections::BTreeMap;
use tet_part::comm::communicator::LocalComm;
use tet_part::config::{Config, PartitionAlgorithm};
use tet_part::driver::{setup, Setup};
use tet_part::mesh::NodeId;
use util::{tet_chain, write_mesh};

fn run_setup(path: &std::path::Path, npes: usize, alg: PartitionAlgorithm) -> Vec<Setup> {
    let _ = env_logger::builder().is_test(true).try_init();
    let comms = LocalComm::cluster(npes);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let mut cfg = Config::new(path);
            cfg.algorithm = alg;
            let cfg = cfg.validated().unwrap();
            std::thread::spawn(move || setup(&cfg, &comm).unwrap())
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Union of each PE's file-to-linear id maps, with cross-PE agreement
/// checked on the way.
fn global_map(setups: &[Setup]) -> BTreeMap<NodeId, NodeId> {
    let mut map: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    for s in setups {
        for wu in &s.workers {
            for (&old, &new) in &wu.old_to_new {
                if let Some(&prev) = map.get(&old) {
                    assert_eq!(prev, new, "file id {old} renumbered twice differently");
                } else {
                    map.insert(old, new);
                }
            }
        }
    }
    map
}

#[test]
fn two_pe_ranges_chain_and_cover() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = tet_chain(4);
    let path = write_mesh(dir.path(), "chain.tet", &conn, &coords);
    let setups = run_setup(&path, 2, PartitionAlgorithm::Rcb);

    // Ranges are disjoint, contiguous, and cover all seven nodes.
    assert_eq!(setups[0].range.lower, 0);
    assert_eq!(setups[0].range.upper, setups[1].range.lower);
    assert_eq!(setups[1].range.upper, 7);

    // The global file-to-linear map is a bijection onto 0..7.
    let map = global_map(&setups);
    assert_eq!(map.len(), 7);
    let mut new_ids: Vec<u64> = map.values().map(|v| v.get()).collect();
    new_ids.sort_unstable();
    new_ids.dedup();
    assert_eq!(new_ids, (0..7).collect::<Vec<_>>());

    // Ids assigned inside each PE's range belong to nodes that PE
    // holds.
    for s in &setups {
        let held: std::collections::BTreeSet<u64> = s
            .workers
            .iter()
            .flat_map(|w| w.rows())
            .map(|r| r.get())
            .collect();
        for r in s.range.lower..s.range.upper {
            assert!(held.contains(&r), "row {r} owned but never contributed");
        }
    }
}

#[test]
fn three_pe_coverage_with_graph_partitioner() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = tet_chain(9);
    let path = write_mesh(dir.path(), "chain9.tet", &conn, &coords);
    let setups = run_setup(&path, 3, PartitionAlgorithm::Graph);

    assert_eq!(setups[0].range.lower, 0);
    assert_eq!(setups[0].range.upper, setups[1].range.lower);
    assert_eq!(setups[1].range.upper, setups[2].range.lower);
    assert_eq!(setups[2].range.upper, 12);

    let map = global_map(&setups);
    assert_eq!(map.len(), 12);
}

#[test]
fn fixed_inputs_reproduce_the_same_decomposition() {
    // Read, partition, distribute with a fixed nchare and seed is
    // reproducible run to run.
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = tet_chain(6);
    let path = write_mesh(dir.path(), "chain6.tet", &conn, &coords);

    let first = run_setup(&path, 2, PartitionAlgorithm::Hsfc);
    let second = run_setup(&path, 2, PartitionAlgorithm::Hsfc);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.range, b.range);
        assert_eq!(a.workers.len(), b.workers.len());
        for (wa, wb) in a.workers.iter().zip(&b.workers) {
            assert_eq!(wa.id, wb.id);
            assert_eq!(wa.conn, wb.conn);
            assert_eq!(wa.old_to_new, wb.old_to_new);
        }
    }
}

#[test]
fn inverse_map_round_trips_every_file_id() {
    // Renumber then inverse-map yields the original file ids.
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = tet_chain(5);
    let path = write_mesh(dir.path(), "chain5.tet", &conn, &coords);
    let setups = run_setup(&path, 2, PartitionAlgorithm::Rib);
    for s in &setups {
        for wu in &s.workers {
            for (&old, &new) in &wu.old_to_new {
                assert_eq!(wu.old_id(new), Some(old));
            }
        }
    }
}

#[test]
fn surrounding_chare_maps_agree_across_pes() {
    let dir = tempfile::tempdir().unwrap();
    let (conn, coords) = tet_chain(4);
    let path = write_mesh(dir.path(), "chain4.tet", &conn, &coords);
    let setups = run_setup(&path, 2, PartitionAlgorithm::Rcb);

    // Collect every (chare, neighbor) -> shared set and require symmetry.
    let mut shared: BTreeMap<(u64, u64), std::collections::BTreeSet<u64>> = BTreeMap::new();
    for s in &setups {
        for wu in &s.workers {
            for (&nbr, set) in &wu.surrounding {
                shared.insert(
                    (wu.id, nbr),
                    set.iter().map(|r| r.get()).collect(),
                );
            }
        }
    }
    for (&(a, b), set) in &shared {
        let mirrored = shared
            .get(&(b, a))
            .unwrap_or_else(|| panic!("chare {b} missing neighbor {a}"));
        assert_eq!(set, mirrored, "boundary sets of {a} and {b} disagree");
    }
}
