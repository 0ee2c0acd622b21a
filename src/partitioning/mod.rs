//! Element-to-chare partitioning.
//!
//! The partitioner is consulted exactly once per run. Each PE contributes
//! its element slab (centroids for the geometric algorithms, connectivity
//! for the graph algorithm); the assignments come back as one chare id per
//! local element, drawn from `[0, nchare)`. The heavy general-purpose
//! partitioning problem is out of scope; these are compact deterministic
//! implementations behind the same adapter surface an external library
//! would plug into.

pub mod graph;
pub mod hsfc;
pub mod rcb;
pub mod rib;

use crate::comm::communicator::{CommTag, Communicator, ExchangeTags};
use crate::comm::exchange::exchange_all;
use crate::comm::wire::{cast_slice, cast_slice_from, kind, ByteReader, ByteWriter};
use crate::config::PartitionAlgorithm;
use crate::error::{ConfigError, InvariantViolation, TetPartError};
use crate::mesh::Tet;

/// Partition this PE's element slab into `nchare` work units.
///
/// `centroids` feeds the geometric algorithms; `conn` feeds the graph
/// algorithm; both are the local slab in file order. The returned vector
/// has one chare id per local element. Fails with
/// [`ConfigError::OverDecomposition`] on every PE if any chare would end
/// up with zero elements.
pub fn partition_mesh<C: Communicator>(
    alg: PartitionAlgorithm,
    centroids: &[[f64; 3]],
    conn: &[Tet],
    nchare: u64,
    seed: u64,
    base: CommTag,
    comm: &C,
) -> Result<Vec<u64>, TetPartError> {
    let me = comm.rank();
    let size = comm.size();
    let nlocal = if alg.geometric() {
        centroids.len()
    } else {
        conn.len()
    };

    // Ship the slab to rank 0, which partitions the full element set.
    let mut payload = ByteWriter::message(kind::GATHER);
    if alg.geometric() {
        payload.put_u32(centroids.len() as u32);
        let flat: &[f64] = cast_slice_from(cast_slice(centroids));
        payload.put_pod_raw(flat);
    } else {
        payload.put_u32(conn.len() as u32);
        payload.put_pod_raw(conn);
    }
    let payload = payload.finish();

    let gather_tags = ExchangeTags::from_base(base);
    let scatter_tags = ExchangeTags::from_base(base.offset(2));

    let mut outgoing = vec![Vec::new(); size];
    if me != 0 {
        outgoing[0] = payload.clone();
    }
    let incoming = exchange_all(comm, gather_tags, &outgoing)?;

    if me == 0 {
        // Assemble slabs in rank order (they are contiguous in file order).
        let mut counts = vec![0usize; size];
        let mut all_centroids: Vec<[f64; 3]> = Vec::new();
        let mut all_conn: Vec<Tet> = Vec::new();
        for peer in 0..size {
            let bytes = if peer == 0 { &payload } else { &incoming[peer] };
            let fail = |what| InvariantViolation::WireDecode { peer, what };
            let mut r = ByteReader::message(bytes, kind::GATHER).map_err(fail)?;
            let n = r.get_u32().map_err(fail)? as usize;
            counts[peer] = n;
            if alg.geometric() {
                let flat: Vec<f64> = r.get_pod_raw(3 * n).map_err(fail)?;
                all_centroids.extend(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]));
            } else {
                all_conn.extend(r.get_pod_raw::<Tet>(n).map_err(fail)?);
            }
            r.done().map_err(fail)?;
        }

        let nelem = counts.iter().map(|&c| c as u64).sum::<u64>();
        let che = if nchare > nelem {
            None
        } else {
            let che = match alg {
                PartitionAlgorithm::Rcb => rcb::partition(&all_centroids, nchare),
                PartitionAlgorithm::Rib => rib::partition(&all_centroids, nchare),
                PartitionAlgorithm::Hsfc => hsfc::partition(&all_centroids, nchare),
                PartitionAlgorithm::Graph => graph::partition(&all_conn, nchare, seed),
            };
            if chare_underflow(&che, nchare) {
                None
            } else {
                Some(che)
            }
        };

        // Scatter assignments (or the refusal) back, slab by slab.
        let mut outgoing = vec![Vec::new(); size];
        let mut offset = 0usize;
        for peer in 0..size {
            let mut w = ByteWriter::message(kind::SCATTER);
            match &che {
                Some(che) => {
                    w.put_u32(1);
                    w.put_u64(nelem);
                    w.put_pod_slice(&che[offset..offset + counts[peer]]);
                }
                None => {
                    w.put_u32(0);
                    w.put_u64(nelem);
                }
            }
            offset += counts[peer];
            outgoing[peer] = w.finish();
        }
        let own = std::mem::take(&mut outgoing[0]);
        exchange_all(comm, scatter_tags, &outgoing)?;
        decode_assignment(&own, 0, nchare, nlocal)
    } else {
        let outgoing = vec![Vec::new(); size];
        let incoming = exchange_all(comm, scatter_tags, &outgoing)?;
        decode_assignment(&incoming[0], 0, nchare, nlocal)
    }
}

fn decode_assignment(
    bytes: &[u8],
    peer: usize,
    nchare: u64,
    nlocal: usize,
) -> Result<Vec<u64>, TetPartError> {
    let fail = |what| InvariantViolation::WireDecode { peer, what };
    let mut r = ByteReader::message(bytes, kind::SCATTER).map_err(fail)?;
    let ok = r.get_u32().map_err(fail)?;
    let nelem = r.get_u64().map_err(fail)?;
    if ok == 0 {
        return Err(ConfigError::OverDecomposition { nchare, nelem }.into());
    }
    let che: Vec<u64> = r.get_pod_vec().map_err(fail)?;
    r.done().map_err(fail)?;
    if che.len() != nlocal {
        return Err(fail("assignment length does not match local slab").into());
    }
    Ok(che)
}

fn chare_underflow(che: &[u64], nchare: u64) -> bool {
    let mut seen = vec![false; nchare as usize];
    for &c in che {
        seen[c as usize] = true;
    }
    seen.iter().any(|&s| !s)
}

/// Balanced split points: part `p` covers `[cut(p), cut(p+1))` of `n` items.
pub(crate) fn balanced_cut(n: usize, nparts: u64, p: u64) -> usize {
    (n as u64 * p / nparts) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{LocalComm, NoComm};
    use crate::mesh::NodeId;

    fn grid_centroids(n: usize) -> Vec<[f64; 3]> {
        (0..n).map(|i| [i as f64, 0.0, 0.0]).collect()
    }

    #[test]
    fn serial_rcb_covers_all_chares() {
        let cents = grid_centroids(10);
        let che = partition_mesh(
            PartitionAlgorithm::Rcb,
            &cents,
            &[],
            4,
            0,
            CommTag::new(0x3000),
            &NoComm,
        )
        .unwrap();
        assert_eq!(che.len(), 10);
        let mut seen = vec![false; 4];
        for &c in &che {
            seen[c as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn serial_overdecomposition_refused() {
        let cents = grid_centroids(3);
        let err = partition_mesh(
            PartitionAlgorithm::Rcb,
            &cents,
            &[],
            5,
            0,
            CommTag::new(0x3010),
            &NoComm,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TetPartError::Config(ConfigError::OverDecomposition { nchare: 5, nelem: 3 })
        ));
    }

    #[test]
    fn two_rank_assignment_is_coherent() {
        let comms = LocalComm::cluster(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    // rank 0 holds x in 0..5, rank 1 holds x in 5..10
                    let cents: Vec<[f64; 3]> = (0..5)
                        .map(|i| [(comm.rank() * 5 + i) as f64, 0.0, 0.0])
                        .collect();
                    partition_mesh(
                        PartitionAlgorithm::Rcb,
                        &cents,
                        &[],
                        2,
                        0,
                        CommTag::new(0x3020),
                        &comm,
                    )
                    .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // RCB on a line: left half one chare, right half the other.
        assert!(results[0].iter().all(|&c| c == results[0][0]));
        assert!(results[1].iter().all(|&c| c == results[1][0]));
        assert_ne!(results[0][0], results[1][0]);
    }

    #[test]
    fn graph_partition_over_adapter() {
        let n = |i: u64| NodeId::new(i);
        // Chain of 4 tets sharing faces.
        let conn = vec![
            [n(0), n(1), n(2), n(3)],
            [n(1), n(2), n(3), n(4)],
            [n(2), n(3), n(4), n(5)],
            [n(3), n(4), n(5), n(6)],
        ];
        let che = partition_mesh(
            PartitionAlgorithm::Graph,
            &[],
            &conn,
            2,
            7,
            CommTag::new(0x3030),
            &NoComm,
        )
        .unwrap();
        assert_eq!(che.len(), 4);
        assert!(che.iter().any(|&c| c == 0));
        assert!(che.iter().any(|&c| c == 1));
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let cents = grid_centroids(20);
        for alg in [
            PartitionAlgorithm::Rcb,
            PartitionAlgorithm::Rib,
            PartitionAlgorithm::Hsfc,
        ] {
            let a = partition_mesh(alg, &cents, &[], 4, 3, CommTag::new(0x3040), &NoComm).unwrap();
            let b = partition_mesh(alg, &cents, &[], 4, 3, CommTag::new(0x3050), &NoComm).unwrap();
            assert_eq!(a, b, "{alg:?} must be deterministic");
        }
    }
}
