//! Property tests for the distributed renumbering: for random small
//! meshes split over two PEs, the reordering is a bijection onto a
//! contiguous, disjoint, covering pair of ranges.

mod util;

use proptest::prelude::*;
use std::collections::BTreeMap;
use tet_part::comm::communicator::LocalComm;
use tet_part::config::{Config, PartitionAlgorithm};
use tet_part::driver::setup;
use tet_part::io::TetFile;
use tet_part::mesh::{NodeId, Tet};

const NNODE: u64 = 10;

fn arb_tet() -> impl Strategy<Value = Tet> {
    proptest::sample::subsequence((0..NNODE).collect::<Vec<u64>>(), 4)
        .prop_map(|v| [v[0], v[1], v[2], v[3]].map(NodeId::new))
}

fn arb_conn() -> impl Strategy<Value = Vec<Tet>> {
    proptest::collection::vec(arb_tet(), 2..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn two_pe_reordering_is_a_bijection(conn in arb_conn()) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.tet");
        let coords: Vec<[f64; 3]> = (0..NNODE)
            .map(|i| [(i % 3) as f64, ((i / 3) % 3) as f64, (i / 9) as f64])
            .collect();
        TetFile::create(&path, &[conn.clone()], &coords).unwrap();

        let comms = LocalComm::cluster(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let mut cfg = Config::new(&path);
                cfg.algorithm = PartitionAlgorithm::Hsfc;
                let cfg = cfg.validated().unwrap();
                std::thread::spawn(move || setup(&cfg, &comm).unwrap())
            })
            .collect();
        let setups: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Referenced file ids across the whole mesh.
        let mut referenced: Vec<NodeId> = conn.iter().flatten().copied().collect();
        referenced.sort_unstable();
        referenced.dedup();

        // Ranges chain from 0 and cover exactly the referenced nodes.
        prop_assert_eq!(setups[0].range.lower, 0);
        prop_assert_eq!(setups[0].range.upper, setups[1].range.lower);
        prop_assert_eq!(setups[1].range.upper, referenced.len() as u64);

        // Every referenced file id maps to exactly one linear id,
        // consistently across PEs, and the map is a bijection onto
        // [0, nnew).
        let mut map: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for s in &setups {
            for wu in &s.workers {
                for (&old, &new) in &wu.old_to_new {
                    if let Some(&prev) = map.get(&old) {
                        prop_assert_eq!(prev, new);
                    } else {
                        map.insert(old, new);
                    }
                }
            }
        }
        prop_assert_eq!(map.len(), referenced.len());
        let mut news: Vec<u64> = map.values().map(|v| v.get()).collect();
        news.sort_unstable();
        news.dedup();
        prop_assert_eq!(news.len() as u64, setups[1].range.upper);
    }
}
