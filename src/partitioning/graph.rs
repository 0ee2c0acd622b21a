//! Greedy growing on the element face-adjacency graph.
//!
//! Two tetrahedra are adjacent when they share a triangular face. Parts
//! are grown one at a time by breadth-first search from a seeded start
//! element until the balanced size target is met; disconnected remainders
//! re-seed. A fixed seed reproduces the assignment exactly.

use crate::mesh::Tet;
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Assign `nparts` part ids by seeded greedy graph growing.
pub fn partition(conn: &[Tet], nparts: u64, seed: u64) -> Vec<u64> {
    let n = conn.len();
    let adj = face_adjacency(conn);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut part = vec![0u64; n];
    let mut visited = vec![false; n];
    let mut unvisited = n;

    for p in 0..nparts {
        let target = crate::partitioning::balanced_cut(n, nparts, p + 1)
            - crate::partitioning::balanced_cut(n, nparts, p);
        let mut grown = 0usize;
        let mut frontier: VecDeque<usize> = VecDeque::new();
        while grown < target {
            let e = match frontier.pop_front() {
                Some(e) if !visited[e] => e,
                Some(_) => continue,
                None => pick_seed(&visited, unvisited, &mut rng),
            };
            visited[e] = true;
            unvisited -= 1;
            part[e] = p;
            grown += 1;
            for &nb in &adj[e] {
                if !visited[nb] {
                    frontier.push_back(nb);
                }
            }
        }
    }
    part
}

/// The k-th unvisited element for a seeded random k.
fn pick_seed(visited: &[bool], unvisited: usize, rng: &mut StdRng) -> usize {
    debug_assert!(unvisited > 0);
    let k = rng.gen_range(0..unvisited);
    visited
        .iter()
        .enumerate()
        .filter(|(_, &v)| !v)
        .nth(k)
        .map(|(i, _)| i)
        .expect("unvisited element exists")
}

/// Face-neighbor lists, sorted for deterministic traversal order.
fn face_adjacency(conn: &[Tet]) -> Vec<Vec<usize>> {
    const FACES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    let mut by_face: HashMap<[u64; 3], Vec<usize>> = HashMap::with_capacity(conn.len() * 4);
    for (e, tet) in conn.iter().enumerate() {
        for (i, j, k) in FACES {
            let mut f = [tet[i].get(), tet[j].get(), tet[k].get()];
            f.sort_unstable();
            by_face.entry(f).or_default().push(e);
        }
    }
    let mut adj = vec![Vec::new(); conn.len()];
    for elems in by_face.values() {
        for &a in elems {
            for &b in elems {
                if a != b {
                    adj[a].push(b);
                }
            }
        }
    }
    for list in &mut adj {
        list.sort_unstable();
        list.dedup();
    }
    adj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::NodeId;

    fn n(i: u64) -> NodeId {
        NodeId::new(i)
    }

    fn chain(len: u64) -> Vec<Tet> {
        (0..len).map(|e| [n(e), n(e + 1), n(e + 2), n(e + 3)]).collect()
    }

    #[test]
    fn chain_adjacency_links_consecutive_tets() {
        let adj = face_adjacency(&chain(4));
        assert_eq!(adj[0], vec![1]);
        assert_eq!(adj[1], vec![0, 2]);
        assert_eq!(adj[3], vec![2]);
    }

    #[test]
    fn parts_are_balanced_and_cover() {
        let part = partition(&chain(10), 3, 1);
        let mut sizes = [0usize; 3];
        for &p in &part {
            sizes[p as usize] += 1;
        }
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|&s| s == 3 || s == 4));
    }

    #[test]
    fn fixed_seed_reproduces() {
        let conn = chain(12);
        assert_eq!(partition(&conn, 4, 9), partition(&conn, 4, 9));
    }

    #[test]
    fn grown_parts_are_contiguous_on_a_chain() {
        // With BFS growth on a chain every part is an interval.
        let part = partition(&chain(8), 2, 0);
        let first: Vec<usize> = (0..8).filter(|&e| part[e] == part[0]).collect();
        let lo = *first.first().unwrap();
        let hi = *first.last().unwrap();
        assert_eq!(first.len(), hi - lo + 1);
    }
}
